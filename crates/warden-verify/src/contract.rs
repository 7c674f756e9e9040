//! Named, versioned JSON Schema contracts for `llm` step responses.
//!
//! A contract id has the form `name.vN`. Each contract is a JSON Schema
//! document compiled once at registration; an optional migration upgrades
//! older payload shapes before validation.

use std::{collections::BTreeMap, fs, path::Path};

use serde_json::{json, Value};
use tracing::{debug, warn};

use warden_contracts::error::{ConfigErrorKind, WardenError, WardenResult};
use warden_core::traits::SchemaValidator;

pub const TIME_ENTRY_SUGGESTIONS_V1: &str = "time_entry_suggestions.v1";

/// Upgrades a payload of an older shape, or returns `None` to leave it as is.
pub type Migration = fn(&Value) -> Option<Value>;

struct Contract {
    schema: Value,
    validator: jsonschema::Validator,
    migration: Option<Migration>,
}

/// Registry of compiled schema contracts.
pub struct ContractRegistry {
    contracts: BTreeMap<String, Contract>,
}

impl ContractRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self { contracts: BTreeMap::new() }
    }

    /// A registry holding the built-in contracts.
    pub fn with_builtins() -> WardenResult<Self> {
        let mut registry = Self::new();
        registry.register_with_migration(
            TIME_ENTRY_SUGGESTIONS_V1,
            time_entry_suggestions_v1(),
            Some(migrate_time_entries),
        )?;
        Ok(registry)
    }

    /// Compile and add a contract. Re-registering an id replaces it.
    pub fn register(&mut self, schema_id: &str, schema: Value) -> WardenResult<()> {
        self.register_with_migration(schema_id, schema, None)
    }

    pub fn register_with_migration(
        &mut self,
        schema_id: &str,
        schema: Value,
        migration: Option<Migration>,
    ) -> WardenResult<()> {
        if !is_versioned_id(schema_id) {
            return Err(WardenError::config(
                ConfigErrorKind::InvalidFile,
                format!("contract id '{schema_id}' must look like 'name.vN'"),
            ));
        }
        let validator = jsonschema::validator_for(&schema).map_err(|e| {
            WardenError::config(ConfigErrorKind::InvalidFile, format!("contract '{schema_id}' is not a valid JSON Schema: {e}"))
        })?;
        debug!(schema_id, "contract registered");
        self.contracts.insert(schema_id.to_string(), Contract { schema, validator, migration });
        Ok(())
    }

    /// Load every `<name>.v<N>.json` file in `dir`, in name order.
    ///
    /// Files whose names do not follow the pattern are ignored. A file that
    /// is not a valid schema is an error.
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> WardenResult<usize> {
        let dir = dir.as_ref();
        let read_err = |e: std::io::Error| {
            WardenError::config(ConfigErrorKind::InvalidFile, format!("cannot read '{}': {e}", dir.display()))
        };
        let mut paths: Vec<_> = fs::read_dir(dir)
            .map_err(read_err)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let Some(schema_id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
                .filter(|id| is_versioned_id(id))
            else {
                continue;
            };
            let text = fs::read_to_string(&path).map_err(read_err)?;
            let schema: Value = serde_json::from_str(&text).map_err(|e| {
                WardenError::config(ConfigErrorKind::InvalidFile, format!("'{}' is not JSON: {e}", path.display()))
            })?;
            if self.contracts.contains_key(schema_id) {
                warn!(schema_id, path = %path.display(), "contract file replaces an existing contract");
            }
            self.register(schema_id, schema)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    pub fn contains(&self, schema_id: &str) -> bool {
        self.contracts.contains_key(schema_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.contracts.keys().map(String::as_str)
    }

    /// The raw schema document, e.g. for inclusion in a model prompt.
    pub fn schema(&self, schema_id: &str) -> Option<&Value> {
        self.contracts.get(schema_id).map(|c| &c.schema)
    }
}

impl Default for ContractRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaValidator for ContractRegistry {
    /// Validate `response` against `schema_id`, after any migration.
    ///
    /// Every schema violation is collected into the error reason.
    fn validate(&self, schema_id: &str, response: &Value) -> WardenResult<Value> {
        let contract = self.contracts.get(schema_id).ok_or_else(|| WardenError::SchemaValidation {
            schema_id: schema_id.to_string(),
            reason: "unknown schema contract".to_string(),
        })?;

        let candidate = contract
            .migration
            .and_then(|migrate| migrate(response))
            .unwrap_or_else(|| response.clone());

        let violations: Vec<String> = contract
            .validator
            .iter_errors(&candidate)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{path}: {e}")
                }
            })
            .collect();

        if violations.is_empty() {
            Ok(candidate)
        } else {
            warn!(schema_id, count = violations.len(), "response failed its contract");
            Err(WardenError::SchemaValidation { schema_id: schema_id.to_string(), reason: violations.join("; ") })
        }
    }
}

fn is_versioned_id(id: &str) -> bool {
    match id.rsplit_once(".v") {
        Some((name, version)) => {
            !name.is_empty()
                && !version.is_empty()
                && version.bytes().all(|b| b.is_ascii_digit())
                && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        }
        None => false,
    }
}

// ── time_entry_suggestions.v1 ────────────────────────────────────────────────

fn time_entry_suggestions_v1() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "additionalProperties": false,
        "required": ["schema_version", "suggestions"],
        "properties": {
            "schema_version": { "const": TIME_ENTRY_SUGGESTIONS_V1 },
            "suggestions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["matter_id", "duration_minutes", "narrative", "confidence"],
                    "properties": {
                        "matter_id": { "type": "string" },
                        "client_id": { "type": ["string", "null"] },
                        "duration_minutes": { "type": "integer", "exclusiveMinimum": 0 },
                        "narrative": { "type": "string" },
                        "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
                        "evidence_refs": { "type": "array", "items": { "type": "string" } }
                    }
                }
            }
        }
    })
}

/// Upgrade `{entries: [...]}` and bare `{suggestions: [...]}` payloads.
///
/// Legacy entries use `matter`/`minutes`/`description`/`evidence`/`client`;
/// missing values fall back to `UNASSIGNED`, 6 minutes, a generic narrative
/// and 0.5 confidence.
fn migrate_time_entries(payload: &Value) -> Option<Value> {
    let object = payload.as_object()?;
    if object.get("schema_version").and_then(Value::as_str) == Some(TIME_ENTRY_SUGGESTIONS_V1) {
        return None;
    }

    if let Some(entries) = object.get("entries") {
        let suggestions: Vec<Value> = entries
            .as_array()
            .map(|items| items.iter().map(legacy_entry).collect())
            .unwrap_or_default();
        return Some(json!({ "schema_version": TIME_ENTRY_SUGGESTIONS_V1, "suggestions": suggestions }));
    }

    object.get("suggestions").map(|suggestions| {
        json!({ "schema_version": TIME_ENTRY_SUGGESTIONS_V1, "suggestions": suggestions })
    })
}

fn legacy_entry(entry: &Value) -> Value {
    let pick = |keys: &[&str]| keys.iter().find_map(|k| entry.get(*k).filter(|v| !v.is_null())).cloned();

    let matter_id = pick(&["matter_id", "matter"]).unwrap_or_else(|| json!("UNASSIGNED"));
    let narrative = pick(&["narrative", "description"]).unwrap_or_else(|| {
        json!(format!("Matter {} legal work", matter_id.as_str().unwrap_or("UNASSIGNED")))
    });
    json!({
        "matter_id": matter_id,
        "client_id": pick(&["client_id", "client"]),
        "duration_minutes": pick(&["duration_minutes", "minutes"]).unwrap_or_else(|| json!(6)),
        "narrative": narrative,
        "confidence": pick(&["confidence"]).unwrap_or_else(|| json!(0.5)),
        "evidence_refs": pick(&["evidence_refs", "evidence"]).unwrap_or_else(|| json!([])),
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use warden_contracts::error::WardenError;
    use warden_core::traits::SchemaValidator;

    use super::{ContractRegistry, TIME_ENTRY_SUGGESTIONS_V1};

    fn suggestion() -> serde_json::Value {
        json!({
            "matter_id": "M-7",
            "client_id": null,
            "duration_minutes": 30,
            "narrative": "Reviewed filing",
            "confidence": 0.8,
            "evidence_refs": ["mail:1"]
        })
    }

    #[test]
    fn valid_envelope_passes_unchanged() {
        let registry = ContractRegistry::with_builtins().unwrap();
        let response = json!({ "schema_version": TIME_ENTRY_SUGGESTIONS_V1, "suggestions": [suggestion()] });
        assert_eq!(registry.validate(TIME_ENTRY_SUGGESTIONS_V1, &response).unwrap(), response);
    }

    #[test]
    fn violations_are_all_reported() {
        let registry = ContractRegistry::with_builtins().unwrap();
        let response = json!({
            "schema_version": TIME_ENTRY_SUGGESTIONS_V1,
            "suggestions": [{ "matter_id": "M-7", "duration_minutes": 0, "narrative": "x", "confidence": 1.5 }]
        });
        match registry.validate(TIME_ENTRY_SUGGESTIONS_V1, &response) {
            Err(WardenError::SchemaValidation { schema_id, reason }) => {
                assert_eq!(schema_id, TIME_ENTRY_SUGGESTIONS_V1);
                assert!(reason.contains("duration_minutes"), "{reason}");
                assert!(reason.contains("confidence"), "{reason}");
            }
            other => panic!("expected SchemaValidation, got {:?}", other),
        }
    }

    #[test]
    fn legacy_entries_are_migrated() {
        let registry = ContractRegistry::with_builtins().unwrap();
        let legacy = json!({ "entries": [{ "matter": "M-9", "minutes": 12, "description": "Call" }, {}] });
        let upgraded = registry.validate(TIME_ENTRY_SUGGESTIONS_V1, &legacy).unwrap();

        assert_eq!(upgraded["schema_version"], TIME_ENTRY_SUGGESTIONS_V1);
        assert_eq!(upgraded["suggestions"][0]["matter_id"], "M-9");
        assert_eq!(upgraded["suggestions"][0]["duration_minutes"], 12);
        assert_eq!(upgraded["suggestions"][1]["matter_id"], "UNASSIGNED");
        assert_eq!(upgraded["suggestions"][1]["narrative"], "Matter UNASSIGNED legal work");
        assert_eq!(upgraded["suggestions"][1]["confidence"], 0.5);
    }

    #[test]
    fn unrecognised_payload_and_unknown_id_fail() {
        let registry = ContractRegistry::with_builtins().unwrap();
        assert!(registry.validate(TIME_ENTRY_SUGGESTIONS_V1, &json!({ "rows": [] })).is_err());
        assert!(registry.validate(TIME_ENTRY_SUGGESTIONS_V1, &json!("text")).is_err());
        assert!(matches!(
            registry.validate("invoice.v2", &json!({})),
            Err(WardenError::SchemaValidation { .. })
        ));
    }

    #[test]
    fn loads_versioned_files_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("invoice.v2.json"), r#"{"type":"object","required":["total"]}"#).unwrap();
        fs::write(dir.path().join("README.json"), "{}").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut registry = ContractRegistry::with_builtins().unwrap();
        assert_eq!(registry.load_dir(dir.path()).unwrap(), 1);
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["invoice.v2", TIME_ENTRY_SUGGESTIONS_V1]);
        assert!(registry.validate("invoice.v2", &json!({ "total": 3 })).is_ok());
        assert!(registry.validate("invoice.v2", &json!({})).is_err());
    }

    #[test]
    fn invalid_ids_and_schemas_are_rejected() {
        let mut registry = ContractRegistry::new();
        assert!(registry.register("unversioned", json!({})).is_err());
        assert!(registry.register("bad.v1", json!({ "type": 12 })).is_err());
    }
}
