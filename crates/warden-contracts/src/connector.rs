//! Connector manifest types.
//!
//! A manifest is a connector's declaration of what it may do. The registry
//! and the policy engine consult manifests only; they never ask the
//! connector itself what an operation does.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigErrorKind, WardenError, WardenResult};

/// Whether an operation only observes external state or changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    Read,
    Write,
}

impl Default for PermissionMode {
    fn default() -> Self {
        Self::Read
    }
}

/// The declared capabilities of one connector.
///
/// Immutable once registered for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorManifest {
    /// Unique identifier, referenced by playbook steps.
    pub connector_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default_mode: PermissionMode,
    /// Operation name → mode.
    #[serde(default)]
    pub operations: BTreeMap<String, PermissionMode>,
}

impl ConnectorManifest {
    pub fn new(connector_id: impl Into<String>, default_mode: PermissionMode) -> Self {
        Self {
            connector_id: connector_id.into(),
            description: String::new(),
            default_mode,
            operations: BTreeMap::new(),
        }
    }

    /// Builder-style helper for declaring an operation.
    pub fn with_operation(mut self, name: impl Into<String>, mode: PermissionMode) -> Self {
        self.operations.insert(name.into(), mode);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// The declared mode of `operation`, or `None` if it is not exposed.
    pub fn mode_of(&self, operation: &str) -> Option<PermissionMode> {
        self.operations.get(operation).copied()
    }

    /// Check the structural rules every manifest must satisfy.
    ///
    /// The id must be non-empty ASCII alphanumerics, `_` or `-`, and at
    /// least one operation with a non-empty name must be declared.
    pub fn validate(&self) -> WardenResult<()> {
        let id_ok = !self.connector_id.is_empty()
            && self
                .connector_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !id_ok {
            return Err(WardenError::config(
                ConfigErrorKind::InvalidManifest,
                format!("connector id '{}' is empty or has illegal characters", self.connector_id),
            ));
        }
        if self.operations.is_empty() {
            return Err(WardenError::config(
                ConfigErrorKind::InvalidManifest,
                format!("connector '{}' declares no operations", self.connector_id),
            ));
        }
        if self.operations.keys().any(|op| op.trim().is_empty()) {
            return Err(WardenError::config(
                ConfigErrorKind::InvalidManifest,
                format!("connector '{}' declares an unnamed operation", self.connector_id),
            ));
        }
        Ok(())
    }
}
