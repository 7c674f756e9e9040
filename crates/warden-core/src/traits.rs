//! Trait definitions for the Warden execution pipeline.
//!
//! These traits draw the trust boundary around the runner:
//!
//! - `Connector`, `ModelProvider`, `Reviewer`: untrusted collaborators
//! - `ConnectorCatalog`: resolves connector references to manifests
//! - `PolicyEngine`: trusted gate, evaluated before every step
//! - `Sanitizer`: trusted filter between connector data and context
//! - `SchemaValidator`: trusted checker for model responses
//! - `AuditWriter`: trusted sink, records every transition
//! - `RunStore`: durable run state, enough to resume in a new process
//!
//! The runner never invokes a connector unless the policy engine has
//! returned `Allow` for that step.

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use warden_contracts::{
    audit::{AuditEvent, NewEvent},
    connector::ConnectorManifest,
    error::{ConnectorError, ProviderError, WardenResult},
    playbook::PlaybookSpec,
    policy::{PolicyContext, PolicyVerdict},
    run::{PendingApproval, ReviewDecision, RunRecord, RunStatus},
};

/// An external capability provider.
///
/// Implementations are **untrusted**: the runner only trusts the manifest
/// the registry accepted at registration time.
pub trait Connector: Send + Sync {
    fn manifest(&self) -> &ConnectorManifest;

    /// Perform `operation` with `params`.
    ///
    /// For write operations the runner places the approved data under the
    /// `payload` key of `params`.
    fn invoke(&self, operation: &str, params: &Value) -> Result<Value, ConnectorError>;
}

/// Resolves connector ids to manifests and instances.
pub trait ConnectorCatalog: Send + Sync {
    fn manifest(&self, connector_id: &str) -> Option<&ConnectorManifest>;

    fn connector(&self, connector_id: &str) -> Option<Arc<dyn Connector>>;

    /// Check that every connector/operation a playbook references exists.
    ///
    /// Returns `WardenError::PolicyViolation` on the first unknown reference.
    fn validate(&self, playbook: &PlaybookSpec) -> WardenResult<()>;
}

/// The request handed to a model provider.
///
/// `data` only ever contains sanitized context; instructions travel in
/// `task` and `context_note`, never inside the data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub task: String,
    pub data: Value,
    pub context_note: String,
}

/// A language-model backend.
pub trait ModelProvider: Send + Sync {
    /// Short name recorded in the audit trail (e.g. "local", "anthropic").
    fn name(&self) -> &str;

    fn generate(&self, prompt: &Prompt, schema_id: &str) -> Result<Value, ProviderError>;
}

/// A human (or automated) approver.
pub trait Reviewer: Send + Sync {
    /// The identifier recorded as `actor` on the reviewer's events.
    fn reviewer_id(&self) -> &str;

    fn request_approval(&self, step_id: &str, proposed_effect: &Value) -> WardenResult<ReviewDecision>;
}

/// The policy gate, consulted immediately before each step.
///
/// Implementations are **trusted** and must be deterministic and free of I/O.
pub trait PolicyEngine: Send + Sync {
    fn evaluate(&self, ctx: &PolicyContext) -> WardenResult<PolicyVerdict>;
}

/// Filter applied to untrusted data before it enters the run context.
pub trait Sanitizer: Send + Sync {
    fn sanitize(&self, value: Value) -> Value;
}

/// Checks a model response against a named, versioned schema contract.
pub trait SchemaValidator: Send + Sync {
    /// Return the validated response, or `WardenError::SchemaValidation`.
    fn validate(&self, schema_id: &str, response: &Value) -> WardenResult<Value>;
}

/// The audit trail: append-only, hash-chained, single writer per run.
pub trait AuditWriter: Send + Sync {
    /// Sequence, hash and persist one event. Returns the stored event.
    ///
    /// A failed append is fatal to the run: a step that cannot be audited
    /// cannot proceed.
    fn append(&self, event: NewEvent) -> WardenResult<AuditEvent>;

    /// Every stored event of a run, ascending by `seq`.
    fn events_for_run(&self, run_id: &str) -> WardenResult<Vec<AuditEvent>>;

    /// Called once a run reaches a terminal state.
    fn finalize(&self, run_id: &str) -> WardenResult<()>;
}

/// Durable run state kept beside the audit trail.
pub trait RunStore: Send + Sync {
    fn create_run(&self, record: &RunRecord) -> WardenResult<()>;

    fn update_run_status(&self, run_id: &str, status: RunStatus, error: Option<&str>) -> WardenResult<()>;

    fn load_run(&self, run_id: &str) -> WardenResult<Option<RunRecord>>;

    /// Persist a context entry (a step output or its alias).
    fn save_output(&self, run_id: &str, key: &str, value: &Value) -> WardenResult<()>;

    fn load_outputs(&self, run_id: &str) -> WardenResult<BTreeMap<String, Value>>;

    fn create_pending_approval(&self, approval: &PendingApproval) -> WardenResult<()>;

    /// The unresolved approval for a run, if any.
    fn pending_approval(&self, run_id: &str) -> WardenResult<Option<PendingApproval>>;

    /// Close the pending approval of `step_id`.
    ///
    /// Fails with `WardenError::StateMachine` when there is nothing open to
    /// resolve, so two resumers cannot both proceed.
    fn resolve_approval(
        &self,
        run_id: &str,
        step_id: &str,
        decision: &ReviewDecision,
        reviewer: &str,
    ) -> WardenResult<()>;
}
