//! Policy verdict and evaluation context types.
//!
//! The policy engine consumes a `PolicyContext` and produces a
//! `PolicyVerdict`. Any verdict other than `Allow` prevents the step's
//! external call from ever being made.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    connector::ConnectorManifest,
    playbook::StepKind,
};

/// The four ways a step can break policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    UndeclaredConnector,
    UndeclaredOperation,
    WriteOutsideApply,
    UnapprovedWrite,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UndeclaredConnector => "undeclared_connector",
            Self::UndeclaredOperation => "undeclared_operation",
            Self::WriteOutsideApply => "write_outside_apply",
            Self::UnapprovedWrite => "unapproved_write",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The decision emitted by the policy engine for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyVerdict {
    /// The step may run.
    Allow,

    /// The step must not run; the run aborts.
    Deny {
        kind: ViolationKind,
        /// Human-readable explanation, written to the audit log.
        reason: String,
    },
}

impl PolicyVerdict {
    pub fn deny(kind: ViolationKind, reason: impl Into<String>) -> Self {
        Self::Deny { kind, reason: reason.into() }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Everything the policy engine needs to decide on one step.
///
/// Built by the runner from the step, the run flags, and the manifest the
/// registry resolved for the step's connector (if any).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyContext {
    pub run_id: String,
    pub step_id: String,
    pub kind: StepKind,
    pub connector_id: Option<String>,
    pub operation: Option<String>,
    /// The registered manifest for `connector_id`; `None` when unknown.
    pub manifest: Option<ConnectorManifest>,
    pub approve: bool,
    pub dry_run: bool,
}
