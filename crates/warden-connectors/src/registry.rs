//! The connector registry.
//!
//! Built-in connectors are registered first and must be valid and unique;
//! any problem with one is a fatal configuration error. Plugin connectors
//! come afterwards and are never allowed to override anything: a collision
//! or an invalid manifest is skipped and recorded.

use std::{collections::BTreeMap, sync::Arc};

use serde::Serialize;
use tracing::{info, warn};

use warden_contracts::{
    connector::ConnectorManifest,
    error::{ConfigErrorKind, WardenError, WardenResult},
    playbook::PlaybookSpec,
    policy::ViolationKind,
};
use warden_core::traits::{Connector, ConnectorCatalog};

/// Where a connector came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "origin")]
pub enum ConnectorSource {
    Builtin,
    /// The descriptor file (or other origin) that supplied the plugin.
    Plugin(String),
}

impl ConnectorSource {
    pub fn label(&self) -> &str {
        match self {
            Self::Builtin => "builtin",
            Self::Plugin(origin) => origin,
        }
    }
}

/// A plugin that was not registered, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedConnector {
    pub connector_id: String,
    pub reason: String,
    pub source: String,
}

struct Registered {
    /// Snapshot taken at registration; later changes inside the connector
    /// are never seen.
    manifest: ConnectorManifest,
    connector: Arc<dyn Connector>,
    source: ConnectorSource,
}

#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<String, Registered>,
    skipped: Vec<SkippedConnector>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a built-in connector.
    ///
    /// Returns `Config{invalid_manifest}` or `Config{duplicate_connector_id}`.
    pub fn register_builtin(&mut self, connector: Arc<dyn Connector>) -> WardenResult<()> {
        let manifest = connector.manifest().clone();
        manifest.validate()?;
        if self.connectors.contains_key(&manifest.connector_id) {
            return Err(WardenError::config(
                ConfigErrorKind::DuplicateConnectorId,
                format!("built-in connector '{}' registered twice", manifest.connector_id),
            ));
        }
        info!(connector_id = %manifest.connector_id, operations = manifest.operations.len(), "registered built-in connector");
        self.insert(manifest, connector, ConnectorSource::Builtin);
        Ok(())
    }

    /// Register a plugin connector. Returns `false` when it was skipped.
    pub fn register_plugin(&mut self, connector: Arc<dyn Connector>, origin: &str) -> bool {
        let manifest = connector.manifest().clone();
        if let Err(e) = manifest.validate() {
            self.skip(&manifest.connector_id, e.to_string(), origin);
            return false;
        }
        if let Some(existing) = self.connectors.get(&manifest.connector_id) {
            let reason = format!(
                "connector id already registered by {}",
                existing.source.label()
            );
            self.skip(&manifest.connector_id, reason, origin);
            return false;
        }
        info!(connector_id = %manifest.connector_id, origin, "registered plugin connector");
        self.insert(manifest, connector, ConnectorSource::Plugin(origin.to_string()));
        true
    }

    /// Record a plugin that never got as far as registration.
    pub fn skip(&mut self, connector_id: &str, reason: impl Into<String>, origin: &str) {
        let reason = reason.into();
        warn!(connector_id, origin, %reason, "plugin connector skipped");
        self.skipped.push(SkippedConnector {
            connector_id: connector_id.to_string(),
            reason,
            source: origin.to_string(),
        });
    }

    fn insert(&mut self, manifest: ConnectorManifest, connector: Arc<dyn Connector>, source: ConnectorSource) {
        self.connectors
            .insert(manifest.connector_id.clone(), Registered { manifest, connector, source });
    }

    /// The registered manifest for `connector_id`.
    pub fn lookup(&self, connector_id: &str) -> WardenResult<&ConnectorManifest> {
        self.manifest(connector_id).ok_or_else(|| WardenError::NotFound {
            what: "connector",
            id: connector_id.to_string(),
        })
    }

    /// Every registered manifest, in id order.
    pub fn manifests(&self) -> Vec<&ConnectorManifest> {
        self.connectors.values().map(|r| &r.manifest).collect()
    }

    pub fn source_of(&self, connector_id: &str) -> Option<&ConnectorSource> {
        self.connectors.get(connector_id).map(|r| &r.source)
    }

    pub fn skipped(&self) -> &[SkippedConnector] {
        &self.skipped
    }
}

impl ConnectorCatalog for ConnectorRegistry {
    fn manifest(&self, connector_id: &str) -> Option<&ConnectorManifest> {
        self.connectors.get(connector_id).map(|r| &r.manifest)
    }

    fn connector(&self, connector_id: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(connector_id).map(|r| Arc::clone(&r.connector))
    }

    fn validate(&self, playbook: &PlaybookSpec) -> WardenResult<()> {
        for step in &playbook.steps {
            let Some(connector_id) = step.connector_id.as_deref() else {
                if step.kind.requires_connector() {
                    return Err(violation(
                        ViolationKind::UndeclaredConnector,
                        format!("step '{}' ({}) names no connector", step.step_id, step.kind.as_str()),
                    ));
                }
                continue;
            };
            let manifest = self.manifest(connector_id).ok_or_else(|| {
                violation(
                    ViolationKind::UndeclaredConnector,
                    format!("step '{}' references unknown connector '{connector_id}'", step.step_id),
                )
            })?;
            let operation = step.operation.as_deref().unwrap_or_default();
            if manifest.mode_of(operation).is_none() {
                return Err(violation(
                    ViolationKind::UndeclaredOperation,
                    format!(
                        "step '{}' references operation '{operation}' not declared by '{connector_id}'",
                        step.step_id
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn violation(kind: ViolationKind, reason: String) -> WardenError {
    WardenError::PolicyViolation { kind, reason }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use warden_contracts::{
        connector::{ConnectorManifest, PermissionMode},
        error::{ConfigErrorKind, ConnectorError, WardenError},
        playbook::{PlaybookSpec, StepKind, StepSpec},
        policy::ViolationKind,
    };
    use warden_core::traits::{Connector, ConnectorCatalog};

    use super::{ConnectorRegistry, ConnectorSource};

    // ── Helpers ───────────────────────────────────────────────────────────────

    struct Stub {
        manifest: ConnectorManifest,
        answer: Value,
    }

    impl Connector for Stub {
        fn manifest(&self) -> &ConnectorManifest {
            &self.manifest
        }
        fn invoke(&self, _operation: &str, _params: &Value) -> Result<Value, ConnectorError> {
            Ok(self.answer.clone())
        }
    }

    fn stub(id: &str, op: &str, mode: PermissionMode, answer: Value) -> Arc<dyn Connector> {
        Arc::new(Stub { manifest: ConnectorManifest::new(id, mode).with_operation(op, mode), answer })
    }

    fn registry() -> ConnectorRegistry {
        let mut registry = ConnectorRegistry::new();
        registry.register_builtin(stub("mail", "sent_emails", PermissionMode::Read, json!("builtin"))).unwrap();
        registry.register_builtin(stub("export", "export_time_entries", PermissionMode::Write, json!(null))).unwrap();
        registry
    }

    // ── Registration ──────────────────────────────────────────────────────────

    #[test]
    fn test_builtin_duplicates_and_invalid_manifests_are_fatal() {
        let mut registry = registry();
        let dup = registry.register_builtin(stub("mail", "other", PermissionMode::Read, json!(null))).unwrap_err();
        assert!(matches!(dup, WardenError::Config { kind: ConfigErrorKind::DuplicateConnectorId, .. }));

        let empty: Arc<dyn Connector> = Arc::new(Stub {
            manifest: ConnectorManifest::new("bare", PermissionMode::Read),
            answer: json!(null),
        });
        let invalid = registry.register_builtin(empty).unwrap_err();
        assert!(matches!(invalid, WardenError::Config { kind: ConfigErrorKind::InvalidManifest, .. }));
    }

    #[test]
    fn test_plugin_collision_is_skipped_not_overridden() {
        let mut registry = registry();
        assert!(!registry.register_plugin(stub("mail", "sent_emails", PermissionMode::Write, json!("plugin")), "evil.toml"));
        assert!(registry.register_plugin(stub("jira", "issues", PermissionMode::Read, json!([])), "jira.toml"));

        assert_eq!(registry.lookup("mail").unwrap().mode_of("sent_emails"), Some(PermissionMode::Read));
        let answer = registry.connector("mail").unwrap().invoke("sent_emails", &json!({})).unwrap();
        assert_eq!(answer, json!("builtin"));

        assert_eq!(registry.skipped().len(), 1);
        assert_eq!(registry.skipped()[0].connector_id, "mail");
        assert_eq!(registry.skipped()[0].source, "evil.toml");
        assert_eq!(registry.source_of("jira"), Some(&ConnectorSource::Plugin("jira.toml".to_string())));

        let ids: Vec<&str> = registry.manifests().iter().map(|m| m.connector_id.as_str()).collect();
        assert_eq!(ids, vec!["export", "jira", "mail"]);
    }

    #[test]
    fn test_lookup_unknown_is_not_found() {
        assert!(matches!(registry().lookup("slack"), Err(WardenError::NotFound { .. })));
    }

    // ── Playbook validation ───────────────────────────────────────────────────

    #[test]
    fn test_validate_checks_connectors_and_operations() {
        let registry = registry();
        let good = PlaybookSpec::new(
            "ok",
            vec![
                StepSpec::new("mail", StepKind::Collect).with_connector("mail", "sent_emails"),
                StepSpec::new("review", StepKind::Approve),
                StepSpec::new("export", StepKind::Apply).with_connector("export", "export_time_entries"),
            ],
        );
        registry.validate(&good).unwrap();

        let unknown = PlaybookSpec::new("x", vec![StepSpec::new("a", StepKind::Collect).with_connector("slack", "messages")]);
        assert!(matches!(
            registry.validate(&unknown),
            Err(WardenError::PolicyViolation { kind: ViolationKind::UndeclaredConnector, .. })
        ));

        let bad_op = PlaybookSpec::new("x", vec![StepSpec::new("a", StepKind::Collect).with_connector("mail", "inbox")]);
        assert!(matches!(
            registry.validate(&bad_op),
            Err(WardenError::PolicyViolation { kind: ViolationKind::UndeclaredOperation, .. })
        ));
    }
}
