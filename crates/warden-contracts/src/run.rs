//! Run-level state: identifiers, statuses, the in-memory context, and the
//! records the structured store keeps so a suspended run can be resumed.

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::playbook::{PlaybookSpec, StepKind, INPUTS_KEY};

/// Unique identifier for one playbook run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub uuid::Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Run-level lifecycle.
///
/// `Pending → Running → {Completed, Failed, Aborted}`; a run parked at an
/// approve step sits in `AwaitingApproval` between two `Running` segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    AwaitingApproval,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Per-step lifecycle: `Pending → Running → {Completed, Failed, Skipped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// The mutable state a run accumulates while its steps execute.
///
/// Lives only for the duration of a run segment. Its durable trace is the
/// audit trail plus the structured store's step-output rows, from which it
/// is rebuilt on resume.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub inputs: Value,
    /// Step outputs keyed by step id, plus any `params.output` aliases.
    pub outputs: BTreeMap<String, Value>,
    pub approve: bool,
    pub dry_run: bool,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, inputs: Value, approve: bool, dry_run: bool) -> Self {
        Self {
            run_id: run_id.into(),
            inputs,
            outputs: BTreeMap::new(),
            approve,
            dry_run,
        }
    }

    /// The value every `{{ path }}` template is resolved against.
    pub fn template_scope(&self) -> Value {
        let mut scope = serde_json::Map::new();
        for (key, value) in &self.outputs {
            scope.insert(key.clone(), value.clone());
        }
        scope.insert(INPUTS_KEY.to_string(), self.inputs.clone());
        Value::Object(scope)
    }
}

/// What happened to one step in a run segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: String,
    pub kind: StepKind,
    pub state: StepState,
    pub error: Option<String>,
}

/// The result the runner hands back after a run segment ends.
///
/// Policy denials, step failures and suspensions are all normal outcomes
/// here; only infrastructure failures surface as `Err` from the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub steps: Vec<StepOutcome>,
    pub outputs: BTreeMap<String, Value>,
    /// The first fatal condition, when the run did not complete.
    pub error: Option<String>,
    /// Set while `status == AwaitingApproval`.
    pub pending_step: Option<String>,
}

/// The structured-store row describing a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    /// Snapshot taken at run start; resume executes exactly this playbook.
    pub playbook: PlaybookSpec,
    pub inputs: Value,
    pub approve: bool,
    pub dry_run: bool,
    pub status: RunStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A reviewer's answer to a pending approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Approve a reviewer-modified effect instead of the proposed one.
    Edit { payload: Value },
}

impl ReviewDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject { .. } => "reject",
            Self::Edit { .. } => "edit",
        }
    }
}

/// An approve step parked until a reviewer decides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub run_id: String,
    pub step_id: String,
    /// Position of the approve step within the playbook snapshot.
    pub step_index: usize,
    pub proposed_effect: Value,
    pub created_at: DateTime<Utc>,
}
