//! Audit-chain verification report types.
//!
//! The verifier never stops at the first problem: a report lists every
//! integrity issue it found, each tagged with the `seq` it concerns and the
//! source it was found in.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Which stored encoding(s) to verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifySource {
    Db,
    Jsonl,
    /// Both sinks independently, then cross-checked against each other.
    Both,
}

impl VerifySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Db => "db",
            Self::Jsonl => "jsonl",
            Self::Both => "both",
        }
    }
}

impl fmt::Display for VerifySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerifySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "db" => Ok(Self::Db),
            "jsonl" => Ok(Self::Jsonl),
            "both" => Ok(Self::Both),
            other => Err(format!("source must be db, jsonl, or both (got '{other}')")),
        }
    }
}

/// Why a stored chain failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityReason {
    MissingEvent,
    EventHashMismatch,
    PrevHashMismatch,
    ParseError,
}

impl IntegrityReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingEvent => "missing_event",
            Self::EventHashMismatch => "event_hash_mismatch",
            Self::PrevHashMismatch => "prev_hash_mismatch",
            Self::ParseError => "parse_error",
        }
    }
}

impl fmt::Display for IntegrityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single problem found during verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    /// The affected `seq`; `None` when the problem is not tied to one
    /// (an empty run, an unparsable line).
    pub seq: Option<u64>,
    pub reason: IntegrityReason,
    /// `Db`/`Jsonl` for per-sink checks, `Both` for the cross-check.
    pub source: VerifySource,
    pub detail: String,
}

/// The outcome of verifying one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub run_id: String,
    pub source: VerifySource,
    /// Distinct events examined (the larger sink, for `Both`).
    pub checked_events: usize,
    pub last_seq: Option<u64>,
    pub last_event_hash: Option<String>,
    /// Every detected problem, in discovery order. Empty on pass.
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    pub fn passed(&self) -> bool {
        self.issues.is_empty()
    }

    /// True when no requested sink holds a single event for the run.
    pub fn has_no_events(&self) -> bool {
        self.checked_events == 0
            && !self.issues.is_empty()
            && self
                .issues
                .iter()
                .all(|i| i.reason == IntegrityReason::MissingEvent && i.seq.is_none())
    }

    /// Issues reported at `seq`.
    pub fn issues_at(&self, seq: u64) -> impl Iterator<Item = &IntegrityIssue> {
        self.issues.iter().filter(move |i| i.seq == Some(seq))
    }
}
