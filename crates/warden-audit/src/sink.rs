//! The physical destinations of the audit trail.

use warden_contracts::{
    audit::{AuditEvent, ChainHead, LoadedRecord, SinkKind},
    error::WardenResult,
};

/// One append-only encoding of the audit trail.
///
/// Sinks store what they are given. Sequencing and hashing belong to
/// `AuditLog`; reading back never repairs or filters bad records.
pub trait AuditSink: Send + Sync {
    fn kind(&self) -> SinkKind;

    /// Persist one fully-formed event.
    fn write(&self, event: &AuditEvent) -> WardenResult<()>;

    /// Every record this sink holds for `run_id`, in storage order.
    fn load_events(&self, run_id: &str) -> WardenResult<Vec<LoadedRecord>>;

    /// The highest-`seq` event stored for `run_id`.
    fn head(&self, run_id: &str) -> WardenResult<Option<ChainHead>>;
}
