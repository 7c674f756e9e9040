//! Error taxonomy for the Warden playbook engine.
//!
//! All fallible operations across the workspace return `WardenResult<T>`.
//! Collaborator failures (`ConnectorError`, `ProviderError`) are separate
//! types so implementations outside this workspace can construct them
//! without pulling in the full enum; both convert into `WardenError`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{policy::ViolationKind, verify::IntegrityReason};

/// Whether a connector failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorErrorKind {
    Transient,
    Permanent,
}

impl fmt::Display for ConnectorErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

/// A failure reported by a connector's `invoke`.
#[derive(Debug, Clone, Error)]
#[error("{kind} connector failure: {message}")]
pub struct ConnectorError {
    pub kind: ConnectorErrorKind,
    pub message: String,
}

impl ConnectorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self { kind: ConnectorErrorKind::Transient, message: message.into() }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { kind: ConnectorErrorKind::Permanent, message: message.into() }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ConnectorErrorKind::Transient
    }
}

/// Whether a model-provider failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Retryable,
    Fatal,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => f.write_str("retryable"),
            Self::Fatal => f.write_str("fatal"),
        }
    }
}

/// A failure reported by a model provider's `generate`.
#[derive(Debug, Clone, Error)]
#[error("{kind} provider failure: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { kind: ProviderErrorKind::Retryable, message: message.into() }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { kind: ProviderErrorKind::Fatal, message: message.into() }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ProviderErrorKind::Retryable
    }
}

/// Which configuration invariant was broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigErrorKind {
    InvalidManifest,
    DuplicateConnectorId,
    /// A configuration or policy file could not be read or parsed.
    InvalidFile,
}

impl fmt::Display for ConfigErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidManifest => f.write_str("invalid_manifest"),
            Self::DuplicateConnectorId => f.write_str("duplicate_connector_id"),
            Self::InvalidFile => f.write_str("invalid_file"),
        }
    }
}

/// The unified error type for the Warden engine.
#[derive(Debug, Error)]
pub enum WardenError {
    /// The policy engine refused a step. Always aborts the run.
    #[error("policy violation ({kind}): {reason}")]
    PolicyViolation { kind: ViolationKind, reason: String },

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A model response did not satisfy its named schema contract.
    #[error("schema validation failed for '{schema_id}': {reason}")]
    SchemaValidation { schema_id: String, reason: String },

    /// A stored audit chain is inconsistent. Never repaired automatically.
    #[error("audit integrity error ({reason}) at seq {seq:?}: {detail}")]
    AuditIntegrity {
        reason: IntegrityReason,
        seq: Option<u64>,
        detail: String,
    },

    #[error("configuration error ({kind}): {reason}")]
    Config { kind: ConfigErrorKind, reason: String },

    /// An audit sink could not persist an event.
    ///
    /// Fatal: a step that cannot be audited cannot proceed.
    #[error("audit write failed: {reason}")]
    AuditWriteFailed { reason: String },

    #[error("store error: {reason}")]
    Store { reason: String },

    /// An operation was attempted from a run or step state that forbids it.
    #[error("state machine error: {reason}")]
    StateMachine { reason: String },

    #[error("invalid playbook: {reason}")]
    Playbook { reason: String },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },
}

impl WardenError {
    pub fn config(kind: ConfigErrorKind, reason: impl Into<String>) -> Self {
        Self::Config { kind, reason: reason.into() }
    }

    pub fn store(reason: impl fmt::Display) -> Self {
        Self::Store { reason: reason.to_string() }
    }

    pub fn state(reason: impl Into<String>) -> Self {
        Self::StateMachine { reason: reason.into() }
    }
}

/// Convenience alias used throughout the Warden crates.
pub type WardenResult<T> = Result<T, WardenError>;
