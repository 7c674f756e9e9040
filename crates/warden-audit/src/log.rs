//! `AuditLog`: the sequencing authority over both sinks.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{SubsecRound, Utc};
use tracing::{debug, info, warn};

use warden_contracts::{
    audit::{AuditEvent, ChainHead, LoadedRecord, NewEvent},
    error::{WardenError, WardenResult},
    verify::IntegrityReason,
};
use warden_core::traits::AuditWriter;

use crate::{chain::hash_event, sink::AuditSink};

type RunHead = Arc<Mutex<Option<ChainHead>>>;

/// Assigns `seq`, `prev_hash` and `event_hash`, then writes each event to
/// the structured sink followed by the line sink.
///
/// Appends for one run are serialized by a per-run lock; different runs do
/// not contend beyond the lookup of that lock. The structured sink is the
/// source of truth for a run's head when it is not cached.
pub struct AuditLog {
    db: Arc<dyn AuditSink>,
    jsonl: Arc<dyn AuditSink>,
    heads: Mutex<HashMap<String, RunHead>>,
}

impl AuditLog {
    pub fn new(db: Arc<dyn AuditSink>, jsonl: Arc<dyn AuditSink>) -> Self {
        Self { db, jsonl, heads: Mutex::new(HashMap::new()) }
    }

    fn run_head(&self, run_id: &str) -> WardenResult<RunHead> {
        let mut heads = self
            .heads
            .lock()
            .map_err(|_| WardenError::AuditWriteFailed { reason: "head cache lock poisoned".to_string() })?;
        if let Some(head) = heads.get(run_id) {
            return Ok(Arc::clone(head));
        }
        let stored = self.db.head(run_id)?;
        let head = Arc::new(Mutex::new(stored));
        heads.insert(run_id.to_string(), Arc::clone(&head));
        Ok(head)
    }
}

impl AuditWriter for AuditLog {
    fn append(&self, new: NewEvent) -> WardenResult<AuditEvent> {
        let head = self.run_head(&new.run_id)?;
        let mut head = head
            .lock()
            .map_err(|_| WardenError::AuditWriteFailed { reason: "run head lock poisoned".to_string() })?;

        let (seq, prev_hash) = match head.as_ref() {
            Some(h) => (h.seq + 1, Some(h.event_hash.clone())),
            None => (1, None),
        };

        let mut event = AuditEvent {
            seq,
            run_id: new.run_id,
            // Stored timestamps carry microseconds; hashing what was stored
            // must reproduce the hash computed here.
            timestamp: Utc::now().trunc_subsecs(6),
            event_type: new.event_type,
            actor: new.actor,
            step_id: new.step_id,
            data: new.data,
            prev_hash,
            event_hash: String::new(),
        };
        event.event_hash = hash_event(&event);

        self.db.write(&event)?;
        *head = Some(ChainHead { seq, event_hash: event.event_hash.clone() });

        if let Err(e) = self.jsonl.write(&event) {
            warn!(run_id = %event.run_id, seq, error = %e, "jsonl sink write failed");
            return Err(e);
        }

        debug!(
            run_id = %event.run_id,
            seq,
            event_type = %event.event_type,
            step_id = ?event.step_id,
            "audit event appended"
        );
        Ok(event)
    }

    fn events_for_run(&self, run_id: &str) -> WardenResult<Vec<AuditEvent>> {
        self.db
            .load_events(run_id)?
            .into_iter()
            .map(|record| match record {
                LoadedRecord::Event(event) => Ok(event),
                LoadedRecord::Malformed { seq, detail } => Err(WardenError::AuditIntegrity {
                    reason: IntegrityReason::ParseError,
                    seq,
                    detail,
                }),
            })
            .collect()
    }

    /// Drops the cached head. Later appends for the run reload it from the
    /// structured sink.
    fn finalize(&self, run_id: &str) -> WardenResult<()> {
        let mut heads = self
            .heads
            .lock()
            .map_err(|_| WardenError::AuditWriteFailed { reason: "head cache lock poisoned".to_string() })?;
        let Some(head) = heads.remove(run_id) else {
            info!(run_id, "audit trail finalized");
            return Ok(());
        };
        // Waits for an in-flight append while new ones are held at the cache.
        let head = head
            .lock()
            .map_err(|_| WardenError::AuditWriteFailed { reason: "run head lock poisoned".to_string() })?;
        match head.as_ref() {
            Some(h) => info!(run_id, last_seq = h.seq, last_event_hash = %h.event_hash, "audit trail finalized"),
            None => info!(run_id, "audit trail finalized with no events"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use warden_contracts::audit::{EventType, NewEvent};
    use warden_core::traits::AuditWriter;

    use super::AuditLog;
    use crate::{JsonlSink, SqliteStore};

    fn cached(log: &AuditLog, run_id: &str) -> bool {
        log.heads.lock().unwrap().contains_key(run_id)
    }

    #[test]
    fn finalize_evicts_the_head_and_the_chain_still_continues() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("warden.db")).unwrap();
        let jsonl = Arc::new(JsonlSink::new(dir.path().join("audit/events.jsonl")).unwrap());
        let log = AuditLog::new(Arc::new(store), jsonl);

        log.append(NewEvent::system("r1", EventType::RunStarted, None, json!({}))).unwrap();
        let closed = log.append(NewEvent::system("r1", EventType::RunCompleted, None, json!({}))).unwrap();
        log.append(NewEvent::system("r2", EventType::RunStarted, None, json!({}))).unwrap();
        assert!(cached(&log, "r1"));

        log.finalize("r1").unwrap();
        assert!(!cached(&log, "r1"));
        assert!(cached(&log, "r2"), "other runs keep their head");

        let next = log.append(NewEvent::system("r1", EventType::StepStarted, Some("late"), json!({}))).unwrap();
        assert_eq!(next.seq, closed.seq + 1);
        assert_eq!(next.prev_hash, Some(closed.event_hash));
        log.finalize("never-started").unwrap();
    }
}
