//! The line-oriented sink: one JSON object per event, shared by all runs.

use std::{
    fs::{self, OpenOptions},
    io::{BufRead, BufReader, ErrorKind, Write},
    path::PathBuf,
    sync::Mutex,
};

use serde_json::{json, Value};
use tracing::debug;

use warden_contracts::{
    audit::{AuditEvent, ChainHead, LoadedRecord, SinkKind},
    error::{WardenError, WardenResult},
};

use crate::sink::AuditSink;

/// Appends events to a single JSONL file.
///
/// Each line carries the canonical timestamp string, so re-hashing a line
/// reproduces the stored `event_hash` exactly.
pub struct JsonlSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSink {
    /// Creates the parent directory if needed. The file itself is created on
    /// first write.
    pub fn new(path: impl Into<PathBuf>) -> WardenResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(WardenError::store)?;
        }
        Ok(Self { path, write_lock: Mutex::new(()) })
    }
}

/// The stored form of one event.
pub fn encode_line(event: &AuditEvent) -> String {
    json!({
        "seq": event.seq,
        "run_id": event.run_id,
        "timestamp": event.canonical_timestamp(),
        "event_type": event.event_type.as_str(),
        "actor": event.actor,
        "step_id": event.step_id,
        "data": event.data,
        "prev_hash": event.prev_hash,
        "event_hash": event.event_hash,
    })
    .to_string()
}

/// Decode one line, or `None` when it belongs to another run.
fn decode_line(line: &str, run_id: &str) -> Option<LoadedRecord> {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            return Some(LoadedRecord::Malformed { seq: None, detail: format!("invalid JSON line: {e}") });
        }
    };
    if value.get("run_id").and_then(Value::as_str) != Some(run_id) {
        return None;
    }
    let seq = value.get("seq").and_then(Value::as_u64);
    Some(match serde_json::from_value::<AuditEvent>(value) {
        Ok(event) => LoadedRecord::Event(event),
        Err(e) => LoadedRecord::Malformed { seq, detail: format!("invalid event record: {e}") },
    })
}

impl AuditSink for JsonlSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Jsonl
    }

    fn write(&self, event: &AuditEvent) -> WardenResult<()> {
        let failed = |e: std::io::Error| WardenError::AuditWriteFailed {
            reason: format!("jsonl append to '{}' failed: {e}", self.path.display()),
        };
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| WardenError::AuditWriteFailed { reason: "jsonl lock poisoned".to_string() })?;

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).map_err(failed)?;
        let mut line = encode_line(event);
        line.push('\n');
        file.write_all(line.as_bytes()).map_err(failed)?;
        file.flush().map_err(failed)?;
        Ok(())
    }

    /// Records in file order. A line that is not JSON at all cannot be
    /// attributed to a run and is reported for every run.
    fn load_events(&self, run_id: &str) -> WardenResult<Vec<LoadedRecord>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(WardenError::store(e)),
        };

        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(WardenError::store)?;
            if line.trim().is_empty() {
                continue;
            }
            if let Some(record) = decode_line(&line, run_id) {
                if let LoadedRecord::Malformed { detail, .. } = &record {
                    debug!(line = index + 1, %detail, "malformed jsonl record");
                }
                records.push(record);
            }
        }
        Ok(records)
    }

    fn head(&self, run_id: &str) -> WardenResult<Option<ChainHead>> {
        Ok(self
            .load_events(run_id)?
            .into_iter()
            .filter_map(|record| match record {
                LoadedRecord::Event(e) => Some(ChainHead { seq: e.seq, event_hash: e.event_hash }),
                LoadedRecord::Malformed { .. } => None,
            })
            .max_by_key(|head| head.seq))
    }
}
