//! The structured store: SQLite, one file per Warden home.
//!
//! `SqliteStore` is both the structured audit sink and the run store. All
//! access goes through one connection behind `Arc<Mutex<_>>`; clones share
//! it.
//!
//! # Schema
//!
//! - `audit_events`: one row per event, primary key `(run_id, seq)`. Rows
//!   are only ever inserted.
//! - `runs`: the run record, including the playbook snapshot.
//! - `step_outputs`: context entries keyed by `(run_id, key)`.
//! - `approvals`: pending and resolved approvals keyed by `(run_id, step_id)`.

use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use warden_contracts::{
    audit::{format_timestamp, AuditEvent, ChainHead, EventType, LoadedRecord, SinkKind},
    error::{WardenError, WardenResult},
    run::{PendingApproval, ReviewDecision, RunRecord, RunStatus},
};
use warden_core::traits::RunStore;

use crate::sink::AuditSink;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS audit_events (
    run_id      TEXT NOT NULL,
    seq         INTEGER NOT NULL,
    timestamp   TEXT NOT NULL,
    event_type  TEXT NOT NULL,
    actor       TEXT NOT NULL,
    step_id     TEXT,
    data_json   TEXT NOT NULL,
    prev_hash   TEXT,
    event_hash  TEXT NOT NULL,
    PRIMARY KEY (run_id, seq)
);
CREATE TABLE IF NOT EXISTS runs (
    run_id         TEXT PRIMARY KEY,
    playbook_name  TEXT NOT NULL,
    playbook_json  TEXT NOT NULL,
    inputs_json    TEXT NOT NULL,
    approve        INTEGER NOT NULL,
    dry_run        INTEGER NOT NULL,
    status         TEXT NOT NULL,
    error          TEXT,
    started_at     TEXT NOT NULL,
    ended_at       TEXT
);
CREATE TABLE IF NOT EXISTS step_outputs (
    run_id      TEXT NOT NULL,
    key         TEXT NOT NULL,
    value_json  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (run_id, key)
);
CREATE TABLE IF NOT EXISTS approvals (
    run_id         TEXT NOT NULL,
    step_id        TEXT NOT NULL,
    step_index     INTEGER NOT NULL,
    proposed_json  TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    decision_json  TEXT,
    reviewer       TEXT,
    resolved_at    TEXT,
    PRIMARY KEY (run_id, step_id)
);
";

/// SQLite-backed audit sink and run store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> WardenResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(WardenError::store)?;
        }
        let conn = Connection::open(path).map_err(WardenError::store)?;
        debug!(path = %path.display(), "opened structured store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> WardenResult<Self> {
        Self::init(Connection::open_in_memory().map_err(WardenError::store)?)
    }

    fn init(conn: Connection) -> WardenResult<Self> {
        conn.execute_batch(SCHEMA).map_err(WardenError::store)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn conn(&self) -> WardenResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| WardenError::store("connection lock poisoned"))
    }

    /// Run raw SQL against the store. Intended for maintenance and tests.
    pub fn execute(&self, sql: &str) -> WardenResult<usize> {
        self.conn()?.execute(sql, []).map_err(WardenError::store)
    }

    /// All run records, newest first.
    pub fn list_runs(&self) -> WardenResult<Vec<RunRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT run_id, playbook_json, inputs_json, approve, dry_run, status, error, started_at, ended_at
                 FROM runs ORDER BY started_at DESC",
            )
            .map_err(WardenError::store)?;
        let rows = stmt
            .query_map([], run_row)
            .map_err(WardenError::store)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(WardenError::store)?;
        rows.into_iter().map(RawRun::into_record).collect()
    }
}

// ── Row decoding ─────────────────────────────────────────────────────────────

struct RawEvent {
    seq: i64,
    run_id: String,
    timestamp: String,
    event_type: String,
    actor: String,
    step_id: Option<String>,
    data_json: String,
    prev_hash: Option<String>,
    event_hash: String,
}

impl RawEvent {
    fn decode(self) -> LoadedRecord {
        let seq = u64::try_from(self.seq).ok();
        let malformed = |detail: String| LoadedRecord::Malformed { seq, detail };

        let Some(seq_value) = seq.filter(|s| *s > 0) else {
            return malformed(format!("invalid seq {}", self.seq));
        };
        let timestamp = match DateTime::parse_from_rfc3339(&self.timestamp) {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(e) => return malformed(format!("invalid timestamp '{}': {e}", self.timestamp)),
        };
        let event_type: EventType = match serde_json::from_value(Value::String(self.event_type.clone())) {
            Ok(t) => t,
            Err(_) => return malformed(format!("unknown event_type '{}'", self.event_type)),
        };
        let data: Value = match serde_json::from_str(&self.data_json) {
            Ok(v) => v,
            Err(e) => return malformed(format!("invalid data_json: {e}")),
        };

        LoadedRecord::Event(AuditEvent {
            seq: seq_value,
            run_id: self.run_id,
            timestamp,
            event_type,
            actor: self.actor,
            step_id: self.step_id,
            data,
            prev_hash: self.prev_hash,
            event_hash: self.event_hash,
        })
    }
}

struct RawRun {
    run_id: String,
    playbook_json: String,
    inputs_json: String,
    approve: bool,
    dry_run: bool,
    status: String,
    error: Option<String>,
    started_at: String,
    ended_at: Option<String>,
}

impl RawRun {
    fn into_record(self) -> WardenResult<RunRecord> {
        let corrupt = |what: &str, e: &dyn std::fmt::Display| {
            WardenError::store(format!("run {} has corrupt {what}: {e}", self.run_id))
        };
        Ok(RunRecord {
            playbook: serde_json::from_str(&self.playbook_json).map_err(|e| corrupt("playbook", &e))?,
            inputs: serde_json::from_str(&self.inputs_json).map_err(|e| corrupt("inputs", &e))?,
            approve: self.approve,
            dry_run: self.dry_run,
            status: self.status.parse::<RunStatus>().map_err(|e| corrupt("status", &e))?,
            error: self.error.clone(),
            started_at: parse_ts(&self.started_at).map_err(|e| corrupt("started_at", &e))?,
            ended_at: self
                .ended_at
                .as_deref()
                .map(parse_ts)
                .transpose()
                .map_err(|e| corrupt("ended_at", &e))?,
            run_id: self.run_id.clone(),
        })
    }
}

fn run_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        run_id: row.get(0)?,
        playbook_json: row.get(1)?,
        inputs_json: row.get(2)?,
        approve: row.get(3)?,
        dry_run: row.get(4)?,
        status: row.get(5)?,
        error: row.get(6)?,
        started_at: row.get(7)?,
        ended_at: row.get(8)?,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|ts| ts.with_timezone(&Utc))
}

fn to_json(value: &impl serde::Serialize) -> WardenResult<String> {
    serde_json::to_string(value).map_err(WardenError::store)
}

fn now() -> String {
    format_timestamp(&Utc::now())
}

// ── AuditSink impl ───────────────────────────────────────────────────────────

impl AuditSink for SqliteStore {
    fn kind(&self) -> SinkKind {
        SinkKind::Db
    }

    fn write(&self, event: &AuditEvent) -> WardenResult<()> {
        let seq = i64::try_from(event.seq).map_err(|_| WardenError::AuditWriteFailed {
            reason: format!("seq {} out of range", event.seq),
        })?;
        let data_json = serde_json::to_string(&event.data).map_err(|e| WardenError::AuditWriteFailed {
            reason: format!("cannot encode event data: {e}"),
        })?;

        self.conn()?
            .execute(
                "INSERT INTO audit_events
                    (run_id, seq, timestamp, event_type, actor, step_id, data_json, prev_hash, event_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.run_id,
                    seq,
                    event.canonical_timestamp(),
                    event.event_type.as_str(),
                    event.actor,
                    event.step_id,
                    data_json,
                    event.prev_hash,
                    event.event_hash,
                ],
            )
            .map_err(|e| WardenError::AuditWriteFailed {
                reason: format!("db insert of seq {} failed: {e}", event.seq),
            })?;
        Ok(())
    }

    fn load_events(&self, run_id: &str) -> WardenResult<Vec<LoadedRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT seq, run_id, timestamp, event_type, actor, step_id, data_json, prev_hash, event_hash
                 FROM audit_events WHERE run_id = ?1 ORDER BY seq ASC",
            )
            .map_err(WardenError::store)?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(RawEvent {
                    seq: row.get(0)?,
                    run_id: row.get(1)?,
                    timestamp: row.get(2)?,
                    event_type: row.get(3)?,
                    actor: row.get(4)?,
                    step_id: row.get(5)?,
                    data_json: row.get(6)?,
                    prev_hash: row.get(7)?,
                    event_hash: row.get(8)?,
                })
            })
            .map_err(WardenError::store)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(match row {
                Ok(raw) => raw.decode(),
                Err(e) => LoadedRecord::Malformed { seq: None, detail: format!("unreadable row: {e}") },
            });
        }
        Ok(records)
    }

    fn head(&self, run_id: &str) -> WardenResult<Option<ChainHead>> {
        let head = self
            .conn()?
            .query_row(
                "SELECT seq, event_hash FROM audit_events WHERE run_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![run_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(WardenError::store)?;

        head.map(|(seq, event_hash)| {
            u64::try_from(seq)
                .map(|seq| ChainHead { seq, event_hash })
                .map_err(|_| WardenError::store(format!("negative seq {seq} for run {run_id}")))
        })
        .transpose()
    }
}

// ── RunStore impl ────────────────────────────────────────────────────────────

impl RunStore for SqliteStore {
    fn create_run(&self, record: &RunRecord) -> WardenResult<()> {
        self.conn()?
            .execute(
                "INSERT INTO runs
                    (run_id, playbook_name, playbook_json, inputs_json, approve, dry_run, status, error, started_at, ended_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.run_id,
                    record.playbook.name,
                    to_json(&record.playbook)?,
                    to_json(&record.inputs)?,
                    record.approve,
                    record.dry_run,
                    record.status.as_str(),
                    record.error,
                    format_timestamp(&record.started_at),
                    record.ended_at.as_ref().map(format_timestamp),
                ],
            )
            .map_err(WardenError::store)?;
        Ok(())
    }

    fn update_run_status(&self, run_id: &str, status: RunStatus, error: Option<&str>) -> WardenResult<()> {
        let ended_at = status.is_terminal().then(now);
        let changed = self
            .conn()?
            .execute(
                "UPDATE runs SET status = ?2, error = ?3, ended_at = ?4 WHERE run_id = ?1",
                params![run_id, status.as_str(), error, ended_at],
            )
            .map_err(WardenError::store)?;
        if changed == 0 {
            return Err(WardenError::NotFound { what: "run", id: run_id.to_string() });
        }
        Ok(())
    }

    fn load_run(&self, run_id: &str) -> WardenResult<Option<RunRecord>> {
        let raw = self
            .conn()?
            .query_row(
                "SELECT run_id, playbook_json, inputs_json, approve, dry_run, status, error, started_at, ended_at
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                run_row,
            )
            .optional()
            .map_err(WardenError::store)?;
        raw.map(RawRun::into_record).transpose()
    }

    fn save_output(&self, run_id: &str, key: &str, value: &Value) -> WardenResult<()> {
        self.conn()?
            .execute(
                "INSERT INTO step_outputs (run_id, key, value_json, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(run_id, key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
                params![run_id, key, to_json(value)?, now()],
            )
            .map_err(WardenError::store)?;
        Ok(())
    }

    fn load_outputs(&self, run_id: &str) -> WardenResult<BTreeMap<String, Value>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT key, value_json FROM step_outputs WHERE run_id = ?1")
            .map_err(WardenError::store)?;
        let rows = stmt
            .query_map(params![run_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(WardenError::store)?;

        let mut outputs = BTreeMap::new();
        for row in rows {
            let (key, json) = row.map_err(WardenError::store)?;
            let value = serde_json::from_str(&json)
                .map_err(|e| WardenError::store(format!("output '{key}' of run {run_id} is corrupt: {e}")))?;
            outputs.insert(key, value);
        }
        Ok(outputs)
    }

    fn create_pending_approval(&self, approval: &PendingApproval) -> WardenResult<()> {
        let step_index = i64::try_from(approval.step_index).map_err(WardenError::store)?;
        self.conn()?
            .execute(
                "INSERT INTO approvals (run_id, step_id, step_index, proposed_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    approval.run_id,
                    approval.step_id,
                    step_index,
                    to_json(&approval.proposed_effect)?,
                    format_timestamp(&approval.created_at),
                ],
            )
            .map_err(WardenError::store)?;
        Ok(())
    }

    fn pending_approval(&self, run_id: &str) -> WardenResult<Option<PendingApproval>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT step_id, step_index, proposed_json, created_at FROM approvals
                 WHERE run_id = ?1 AND resolved_at IS NULL
                 ORDER BY created_at DESC LIMIT 1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(WardenError::store)?;

        let Some((step_id, step_index, proposed_json, created_at)) = row else {
            return Ok(None);
        };
        Ok(Some(PendingApproval {
            run_id: run_id.to_string(),
            step_index: usize::try_from(step_index).map_err(WardenError::store)?,
            proposed_effect: serde_json::from_str(&proposed_json).map_err(WardenError::store)?,
            created_at: parse_ts(&created_at).map_err(WardenError::store)?,
            step_id,
        }))
    }

    fn resolve_approval(
        &self,
        run_id: &str,
        step_id: &str,
        decision: &ReviewDecision,
        reviewer: &str,
    ) -> WardenResult<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE approvals SET decision_json = ?3, reviewer = ?4, resolved_at = ?5
                 WHERE run_id = ?1 AND step_id = ?2 AND resolved_at IS NULL",
                params![run_id, step_id, to_json(decision)?, reviewer, now()],
            )
            .map_err(WardenError::store)?;
        if changed == 0 {
            return Err(WardenError::state(format!(
                "approval '{step_id}' of run {run_id} is not pending"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use warden_contracts::{
        audit::{AuditEvent, EventType, LoadedRecord},
        error::WardenError,
        playbook::{PlaybookSpec, StepKind, StepSpec},
        run::{PendingApproval, ReviewDecision, RunRecord, RunStatus},
    };
    use warden_core::traits::RunStore;

    use super::SqliteStore;
    use crate::sink::AuditSink;

    fn record(run_id: &str) -> RunRecord {
        RunRecord {
            run_id: run_id.to_string(),
            playbook: PlaybookSpec::new("weekly", vec![StepSpec::new("review", StepKind::Approve)]),
            inputs: json!({ "week": 42 }),
            approve: true,
            dry_run: false,
            status: RunStatus::Running,
            error: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    fn event(run_id: &str, seq: u64) -> AuditEvent {
        AuditEvent {
            seq,
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            event_type: EventType::StepStarted,
            actor: "system".to_string(),
            step_id: Some("review".to_string()),
            data: json!({ "n": seq }),
            prev_hash: None,
            event_hash: format!("hash-{seq}"),
        }
    }

    #[test]
    fn events_round_trip_in_seq_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.write(&event("r1", 2)).unwrap();
        store.write(&event("r1", 1)).unwrap();
        store.write(&event("r2", 1)).unwrap();

        let loaded = store.load_events("r1").unwrap();
        let seqs: Vec<u64> = loaded
            .iter()
            .map(|r| match r {
                LoadedRecord::Event(e) => e.seq,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(store.head("r1").unwrap().unwrap().event_hash, "hash-2");
        assert!(store.head("r3").unwrap().is_none());
    }

    #[test]
    fn duplicate_seq_is_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.write(&event("r1", 1)).unwrap();
        assert!(matches!(store.write(&event("r1", 1)), Err(WardenError::AuditWriteFailed { .. })));
    }

    #[test]
    fn corrupt_rows_surface_as_malformed() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.write(&event("r1", 1)).unwrap();
        store
            .execute("UPDATE audit_events SET data_json = '{not json' WHERE run_id = 'r1'")
            .unwrap();

        match &store.load_events("r1").unwrap()[0] {
            LoadedRecord::Malformed { seq, detail } => {
                assert_eq!(*seq, Some(1));
                assert!(detail.contains("data_json"));
            }
            other => panic!("expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn run_records_and_outputs_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_run(&record("r1")).unwrap();
            store.save_output("r1", "draft", &json!({ "entries": [] })).unwrap();
            store.save_output("r1", "draft", &json!({ "entries": [1] })).unwrap();
            store.update_run_status("r1", RunStatus::Failed, Some("boom")).unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        let run = reopened.load_run("r1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("boom"));
        assert!(run.ended_at.is_some());
        assert_eq!(run.playbook.steps[0].step_id, "review");
        assert_eq!(reopened.load_outputs("r1").unwrap()["draft"], json!({ "entries": [1] }));
        assert_eq!(reopened.list_runs().unwrap().len(), 1);
        assert!(reopened.load_run("nope").unwrap().is_none());
        assert!(reopened.update_run_status("nope", RunStatus::Running, None).is_err());
    }

    #[test]
    fn approval_resolves_exactly_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_run(&record("r1")).unwrap();
        store
            .create_pending_approval(&PendingApproval {
                run_id: "r1".to_string(),
                step_id: "review".to_string(),
                step_index: 0,
                proposed_effect: json!({ "rows": 2 }),
                created_at: Utc::now(),
            })
            .unwrap();

        let pending = store.pending_approval("r1").unwrap().unwrap();
        assert_eq!(pending.proposed_effect, json!({ "rows": 2 }));

        store
            .resolve_approval("r1", "review", &ReviewDecision::Approve, "reviewer@firm")
            .unwrap();
        assert!(store.pending_approval("r1").unwrap().is_none());

        let again = store.resolve_approval("r1", "review", &ReviewDecision::Approve, "other");
        assert!(matches!(again, Err(WardenError::StateMachine { .. })));
    }
}
