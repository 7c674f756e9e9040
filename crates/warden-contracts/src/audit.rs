//! Audit event types.
//!
//! `AuditEvent` is one fully-formed entry of a run's hash chain. Only the
//! audit log constructs it; callers hand the log a `NewEvent` and receive
//! the sequenced, hashed event back.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Actor recorded for every transition the engine performs on its own.
pub const ACTOR_SYSTEM: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    PolicyViolation,
    RunCompleted,
    RunAborted,
    RunFailed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::PolicyViolation => "policy_violation",
            Self::RunCompleted => "run_completed",
            Self::RunAborted => "run_aborted",
            Self::RunFailed => "run_failed",
        }
    }

    /// Events that close a run.
    pub fn is_run_terminal(&self) -> bool {
        matches!(self, Self::RunCompleted | Self::RunAborted | Self::RunFailed)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition the runner wants recorded, before sequencing and hashing.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub run_id: String,
    pub event_type: EventType,
    pub actor: String,
    pub step_id: Option<String>,
    pub data: Value,
}

impl NewEvent {
    /// An event attributed to the engine itself.
    pub fn system(
        run_id: impl Into<String>,
        event_type: EventType,
        step_id: Option<&str>,
        data: Value,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            event_type,
            actor: ACTOR_SYSTEM.to_string(),
            step_id: step_id.map(str::to_string),
            data,
        }
    }

    /// Re-attribute the event, e.g. to a reviewer.
    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }
}

/// A single entry in a run's SHA-256 hash chain.
///
/// Modifying any hashed field invalidates `event_hash`, and the next
/// event's `prev_hash` no longer matches; the verifier detects both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// 1-based position in the run's chain.
    pub seq: u64,
    pub run_id: String,
    /// UTC, truncated to microseconds so every encoding round-trips exactly.
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub actor: String,
    pub step_id: Option<String>,
    pub data: Value,
    /// `event_hash` of the previous event; `None` only for `seq == 1`.
    pub prev_hash: Option<String>,
    pub event_hash: String,
}

impl AuditEvent {
    /// The timestamp exactly as it enters the canonical payload.
    pub fn canonical_timestamp(&self) -> String {
        format_timestamp(&self.timestamp)
    }
}

/// Render a timestamp in the one format used for hashing and storage.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// The last link of a run's chain, used to extend it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainHead {
    pub seq: u64,
    pub event_hash: String,
}

/// The two physical encodings of the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// The structured (SQLite) store.
    Db,
    /// The append-only JSON-lines text log.
    Jsonl,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Db => "db",
            Self::Jsonl => "jsonl",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record read back from a sink.
///
/// Sinks never reject what they read; malformed rows are surfaced so the
/// verifier can report them as `parse_error` alongside everything else.
#[derive(Debug, Clone)]
pub enum LoadedRecord {
    Event(AuditEvent),
    Malformed {
        /// The record's `seq`, when it could still be recovered.
        seq: Option<u64>,
        detail: String,
    },
}
