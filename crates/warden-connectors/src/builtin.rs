//! The two local connectors every installation ships with.
//!
//! - `fixtures` reads canned JSON documents from a directory, one file per
//!   operation. It stands in for mail, calendar and file-activity sources.
//! - `jsonl_export` appends approved rows to a JSONL file. It is the only
//!   built-in connector with a write operation.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use serde_json::{json, Value};
use tracing::debug;

use warden_contracts::{
    connector::{ConnectorManifest, PermissionMode},
    error::ConnectorError,
};
use warden_core::traits::Connector;

pub const FIXTURES_ID: &str = "fixtures";
pub const JSONL_EXPORT_ID: &str = "jsonl_export";

/// Operations `fixtures` always declares, whether or not a file backs them.
pub const FIXTURE_OPERATIONS: &[&str] = &["sent_emails", "calendar_events", "activity_metadata"];

pub const EXPORT_OPERATION: &str = "export_time_entries";

// ── fixtures ─────────────────────────────────────────────────────────────────

/// Serves `<root>/<operation>.json`.
pub struct FixtureConnector {
    manifest: ConnectorManifest,
    root: PathBuf,
}

impl FixtureConnector {
    /// Declares [`FIXTURE_OPERATIONS`] plus one read operation per `*.json`
    /// file present in `root` at construction.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mut manifest = ConnectorManifest::new(FIXTURES_ID, PermissionMode::Read)
            .with_description("Read canned JSON documents from a local directory");
        for op in FIXTURE_OPERATIONS {
            manifest = manifest.with_operation(*op, PermissionMode::Read);
        }
        for op in json_stems(&root) {
            manifest = manifest.with_operation(op, PermissionMode::Read);
        }
        Self { manifest, root }
    }

    /// A fixture source under a caller-supplied manifest.
    pub fn with_manifest(manifest: ConnectorManifest, root: impl Into<PathBuf>) -> Self {
        Self { manifest, root: root.into() }
    }
}

fn json_stems(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut stems: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
        .collect();
    stems.sort();
    stems
}

impl Connector for FixtureConnector {
    fn manifest(&self) -> &ConnectorManifest {
        &self.manifest
    }

    /// `params.limit` truncates an array document.
    fn invoke(&self, operation: &str, params: &Value) -> Result<Value, ConnectorError> {
        if self.manifest.mode_of(operation) != Some(PermissionMode::Read) {
            return Err(ConnectorError::permanent(format!(
                "{} does not support operation '{operation}'",
                self.manifest.connector_id
            )));
        }
        let path = self.root.join(format!("{operation}.json"));
        let text = fs::read_to_string(&path).map_err(|e| {
            ConnectorError::permanent(format!("fixture '{}' unreadable: {e}", path.display()))
        })?;
        let mut document: Value = serde_json::from_str(&text).map_err(|e| {
            ConnectorError::permanent(format!("fixture '{}' is not JSON: {e}", path.display()))
        })?;

        if let (Value::Array(items), Some(limit)) = (&mut document, params.get("limit").and_then(Value::as_u64)) {
            items.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }
        debug!(operation, path = %path.display(), "fixture served");
        Ok(document)
    }
}

// ── jsonl_export ─────────────────────────────────────────────────────────────

/// Appends one line per approved row.
pub struct JsonlExportConnector {
    manifest: ConnectorManifest,
    path: PathBuf,
}

impl JsonlExportConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let manifest = ConnectorManifest::new(JSONL_EXPORT_ID, PermissionMode::Write)
            .with_description("Append approved time entries to a local JSONL file")
            .with_operation(EXPORT_OPERATION, PermissionMode::Write);
        Self::with_manifest(manifest, path)
    }

    pub fn with_manifest(manifest: ConnectorManifest, path: impl Into<PathBuf>) -> Self {
        Self { manifest, path: path.into() }
    }
}

/// Rows carried by a write payload: an array, the `suggestions` of a
/// contract envelope, or a single object.
fn payload_rows(payload: &Value) -> Vec<Value> {
    match payload {
        Value::Null => Vec::new(),
        Value::Array(rows) => rows.clone(),
        Value::Object(map) => match map.get("suggestions") {
            Some(Value::Array(rows)) => rows.clone(),
            _ => vec![payload.clone()],
        },
        other => vec![other.clone()],
    }
}

impl Connector for JsonlExportConnector {
    fn manifest(&self) -> &ConnectorManifest {
        &self.manifest
    }

    /// `params.output_path` overrides the configured file.
    fn invoke(&self, operation: &str, params: &Value) -> Result<Value, ConnectorError> {
        if self.manifest.mode_of(operation) != Some(PermissionMode::Write) {
            return Err(ConnectorError::permanent(format!(
                "{} does not support operation '{operation}'",
                self.manifest.connector_id
            )));
        }
        let path = params
            .get("output_path")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.path.clone());
        let rows = payload_rows(params.get("payload").unwrap_or(&Value::Null));

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ConnectorError::transient(e.to_string()))?;
        }
        let mut batch = String::new();
        for row in &rows {
            batch.push_str(&row.to_string());
            batch.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ConnectorError::transient(format!("cannot open '{}': {e}", path.display())))?;
        // Once the file is open a partial append may already be on disk, so
        // retrying could duplicate rows.
        let written = |e: std::io::Error| {
            ConnectorError::permanent(format!("append to '{}' failed: {e}", path.display()))
        };
        file.write_all(batch.as_bytes()).map_err(written)?;
        file.flush().map_err(written)?;

        debug!(operation, path = %path.display(), rows = rows.len(), "rows exported");
        Ok(json!({ "output_path": path.display().to_string(), "rows_written": rows.len() }))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use warden_contracts::connector::PermissionMode;
    use warden_core::traits::Connector;

    use super::{FixtureConnector, JsonlExportConnector, EXPORT_OPERATION};

    #[test]
    fn fixtures_serve_files_and_declare_them() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("sent_emails.json"), r#"[{"id":1},{"id":2},{"id":3}]"#).unwrap();
        fs::write(dir.path().join("tickets.json"), r#"{"open":4}"#).unwrap();

        let fixtures = FixtureConnector::new(dir.path());
        assert_eq!(fixtures.manifest().mode_of("tickets"), Some(PermissionMode::Read));
        assert_eq!(fixtures.manifest().mode_of("calendar_events"), Some(PermissionMode::Read));

        let mail = fixtures.invoke("sent_emails", &json!({ "limit": 2 })).unwrap();
        assert_eq!(mail, json!([{ "id": 1 }, { "id": 2 }]));
        assert_eq!(fixtures.invoke("tickets", &json!({})).unwrap(), json!({ "open": 4 }));
    }

    #[test]
    fn fixtures_fail_permanently_on_missing_or_undeclared() {
        let dir = tempfile::tempdir().unwrap();
        let fixtures = FixtureConnector::new(dir.path());

        let missing = fixtures.invoke("calendar_events", &json!({})).unwrap_err();
        assert!(!missing.is_transient());
        assert!(fixtures.invoke("delete_everything", &json!({})).is_err());
    }

    #[test]
    fn export_appends_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("entries.jsonl");
        let export = JsonlExportConnector::new(&path);

        let envelope = json!({ "payload": { "schema_version": "x.v1", "suggestions": [{ "a": 1 }, { "a": 2 }] } });
        assert_eq!(export.invoke(EXPORT_OPERATION, &envelope).unwrap()["rows_written"], 2);
        export.invoke(EXPORT_OPERATION, &json!({ "payload": [{ "a": 3 }] })).unwrap();

        let lines: Vec<String> = fs::read_to_string(&path).unwrap().lines().map(str::to_string).collect();
        assert_eq!(lines, vec![r#"{"a":1}"#, r#"{"a":2}"#, r#"{"a":3}"#]);
        assert!(export.invoke("sent_emails", &json!({})).is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn export_failure_after_open_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let export = JsonlExportConnector::new(dir.path().join("entries.jsonl"));

        let err = export
            .invoke(EXPORT_OPERATION, &json!({ "output_path": "/dev/full", "payload": [{ "a": 1 }, { "a": 2 }] }))
            .unwrap_err();
        assert!(!err.is_transient(), "a partial append must not be retried: {err:?}");
    }
}
