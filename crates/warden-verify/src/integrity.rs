//! Chain verification over the stored audit sinks.
//!
//! Each requested sink is checked on its own:
//!
//! 1. **Parse**: malformed records, duplicate `seq`, foreign `run_id` and
//!    non-object `data` are `parse_error`.
//! 2. **Coverage**: every `seq` in `1..=max` must be present; each gap is a
//!    `missing_event`. A run with no events at all is one `missing_event`
//!    with no `seq`.
//! 3. **Chain**: each event's `event_hash` is recomputed, and its
//!    `prev_hash` must equal the recomputed hash of `seq - 1` (or be null at
//!    `seq = 1`). The event right after a gap is not link-checked.
//!
//! For `both`, the two sinks are then cross-checked `seq` by `seq`.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use tracing::{debug, info, warn};

use warden_audit::{chain::hash_event, AuditSink};
use warden_contracts::{
    audit::{AuditEvent, LoadedRecord, SinkKind},
    error::WardenResult,
    verify::{IntegrityIssue, IntegrityReason, IntegrityReport, VerifySource},
};

/// Verifies runs against the structured and line sinks.
pub struct ChainVerifier {
    db: Arc<dyn AuditSink>,
    jsonl: Arc<dyn AuditSink>,
}

/// The per-sink result, kept for the cross-check.
struct SinkCheck {
    events: BTreeMap<u64, AuditEvent>,
    issues: Vec<IntegrityIssue>,
}

impl ChainVerifier {
    pub fn new(db: Arc<dyn AuditSink>, jsonl: Arc<dyn AuditSink>) -> Self {
        Self { db, jsonl }
    }

    /// Verify one run. Only sink read failures are errors; every integrity
    /// problem is reported in the returned `IntegrityReport`.
    pub fn verify(&self, run_id: &str, source: VerifySource) -> WardenResult<IntegrityReport> {
        let report = match source {
            VerifySource::Db => {
                let check = check_sink(run_id, self.db.load_events(run_id)?, VerifySource::Db);
                report_for(run_id, source, &check.events, check.issues)
            }
            VerifySource::Jsonl => {
                let check = check_sink(run_id, self.jsonl.load_events(run_id)?, VerifySource::Jsonl);
                report_for(run_id, source, &check.events, check.issues)
            }
            VerifySource::Both => {
                let db = check_sink(run_id, self.db.load_events(run_id)?, VerifySource::Db);
                let jsonl = check_sink(run_id, self.jsonl.load_events(run_id)?, VerifySource::Jsonl);

                let mut issues = db.issues;
                issues.extend(jsonl.issues);
                issues.extend(cross_check(
                    (self.db.kind(), &db.events),
                    (self.jsonl.kind(), &jsonl.events),
                ));

                let primary = if db.events.len() >= jsonl.events.len() { &db.events } else { &jsonl.events };
                report_for(run_id, source, primary, issues)
            }
        };

        if report.passed() {
            info!(run_id, %source, events = report.checked_events, "audit chain verified");
        } else {
            warn!(run_id, %source, issues = report.issues.len(), "audit chain verification failed");
        }
        Ok(report)
    }
}

fn issue(seq: Option<u64>, reason: IntegrityReason, source: VerifySource, detail: impl Into<String>) -> IntegrityIssue {
    IntegrityIssue { seq, reason, source, detail: detail.into() }
}

fn report_for(
    run_id: &str,
    source: VerifySource,
    events: &BTreeMap<u64, AuditEvent>,
    issues: Vec<IntegrityIssue>,
) -> IntegrityReport {
    let last = events.values().next_back();
    IntegrityReport {
        run_id: run_id.to_string(),
        source,
        checked_events: events.len(),
        last_seq: last.map(|e| e.seq),
        last_event_hash: last.map(|e| e.event_hash.clone()),
        issues,
    }
}

/// Verify the records of one sink in isolation.
fn check_sink(run_id: &str, records: Vec<LoadedRecord>, source: VerifySource) -> SinkCheck {
    let mut events: BTreeMap<u64, AuditEvent> = BTreeMap::new();
    let mut unreadable: BTreeSet<u64> = BTreeSet::new();
    let mut issues = Vec::new();

    // ── Parse ────────────────────────────────────────────────────────────────
    for record in records {
        let event = match record {
            LoadedRecord::Event(event) => event,
            LoadedRecord::Malformed { seq, detail } => {
                unreadable.extend(seq);
                issues.push(issue(seq, IntegrityReason::ParseError, source, detail));
                continue;
            }
        };
        let seq = event.seq;
        if seq == 0 {
            issues.push(issue(Some(0), IntegrityReason::ParseError, source, "seq must start at 1"));
        } else if event.run_id != run_id {
            unreadable.insert(seq);
            issues.push(issue(
                Some(seq),
                IntegrityReason::ParseError,
                source,
                format!("record belongs to run '{}'", event.run_id),
            ));
        } else if !event.data.is_object() {
            unreadable.insert(seq);
            issues.push(issue(Some(seq), IntegrityReason::ParseError, source, "event data is not an object"));
        } else if events.contains_key(&seq) {
            issues.push(issue(Some(seq), IntegrityReason::ParseError, source, "duplicate seq"));
        } else {
            events.insert(seq, event);
        }
    }

    // ── Coverage and chain ───────────────────────────────────────────────────
    let max_seq = events.keys().chain(unreadable.iter()).copied().max();
    let Some(max_seq) = max_seq else {
        issues.push(issue(None, IntegrityReason::MissingEvent, source, "no events recorded for run"));
        return SinkCheck { events, issues };
    };

    let mut prev_recomputed: Option<String> = None;
    for seq in 1..=max_seq {
        let Some(event) = events.get(&seq) else {
            if !unreadable.contains(&seq) {
                issues.push(issue(Some(seq), IntegrityReason::MissingEvent, source, "seq absent from sink"));
            }
            prev_recomputed = None;
            continue;
        };

        let recomputed = hash_event(event);
        if recomputed != event.event_hash {
            issues.push(issue(
                Some(seq),
                IntegrityReason::EventHashMismatch,
                source,
                format!("stored {} but recomputed {}", event.event_hash, recomputed),
            ));
        }

        if seq == 1 {
            if let Some(prev) = &event.prev_hash {
                issues.push(issue(
                    Some(seq),
                    IntegrityReason::PrevHashMismatch,
                    source,
                    format!("first event has prev_hash {prev}"),
                ));
            }
        } else if let Some(expected) = &prev_recomputed {
            if event.prev_hash.as_ref() != Some(expected) {
                issues.push(issue(
                    Some(seq),
                    IntegrityReason::PrevHashMismatch,
                    source,
                    format!(
                        "prev_hash {} does not match seq {} hash {expected}",
                        event.prev_hash.as_deref().unwrap_or("null"),
                        seq - 1
                    ),
                ));
            }
        }
        prev_recomputed = Some(recomputed);
    }

    debug!(run_id, %source, events = events.len(), issues = issues.len(), "sink checked");
    SinkCheck { events, issues }
}

/// Compare the `seq` sets and shared hashes of two sinks.
fn cross_check(
    (left_kind, left): (SinkKind, &BTreeMap<u64, AuditEvent>),
    (right_kind, right): (SinkKind, &BTreeMap<u64, AuditEvent>),
) -> Vec<IntegrityIssue> {
    let mut issues = Vec::new();
    let all: BTreeSet<u64> = left.keys().chain(right.keys()).copied().collect();
    for seq in all {
        match (left.get(&seq), right.get(&seq)) {
            (Some(_), None) => issues.push(issue(
                Some(seq),
                IntegrityReason::MissingEvent,
                VerifySource::Both,
                format!("present in {left_kind} but missing from {right_kind}"),
            )),
            (None, Some(_)) => issues.push(issue(
                Some(seq),
                IntegrityReason::MissingEvent,
                VerifySource::Both,
                format!("present in {right_kind} but missing from {left_kind}"),
            )),
            (Some(l), Some(r)) if l.event_hash != r.event_hash => issues.push(issue(
                Some(seq),
                IntegrityReason::EventHashMismatch,
                VerifySource::Both,
                format!("{left_kind} has {} but {right_kind} has {}", l.event_hash, r.event_hash),
            )),
            _ => {}
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::Arc};

    use serde_json::json;

    use warden_audit::{AuditLog, JsonlSink, SqliteStore};
    use warden_contracts::{
        audit::{EventType, NewEvent},
        verify::{IntegrityReason, IntegrityReport, VerifySource},
    };
    use warden_core::traits::AuditWriter;

    use super::ChainVerifier;

    // ── Helpers ───────────────────────────────────────────────────────────────

    struct Harness {
        dir: tempfile::TempDir,
        store: SqliteStore,
        verifier: ChainVerifier,
    }

    impl Harness {
        fn jsonl_path(&self) -> std::path::PathBuf {
            self.dir.path().join("audit").join("events.jsonl")
        }
    }

    /// A run of `n` events, plus one unrelated run sharing the sinks.
    fn harness(n: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("warden.db")).unwrap();
        let jsonl = Arc::new(JsonlSink::new(dir.path().join("audit").join("events.jsonl")).unwrap());
        let log = AuditLog::new(Arc::new(store.clone()), jsonl.clone());

        log.append(NewEvent::system("run-a", EventType::RunStarted, None, json!({ "playbook": "weekly" })))
            .unwrap();
        for i in 1..n {
            log.append(NewEvent::system("run-a", EventType::StepStarted, Some(&format!("s{i}")), json!({ "i": i })))
                .unwrap();
            log.append(NewEvent::system("run-b", EventType::StepStarted, None, json!({}))).unwrap();
        }

        let verifier = ChainVerifier::new(Arc::new(store.clone()), jsonl);
        Harness { dir, store, verifier }
    }

    fn reasons(report: &IntegrityReport) -> Vec<(Option<u64>, IntegrityReason, VerifySource)> {
        report.issues.iter().map(|i| (i.seq, i.reason, i.source)).collect()
    }

    // ── Passing chains ────────────────────────────────────────────────────────

    #[test]
    fn test_clean_run_passes_every_source() {
        let h = harness(4);
        for source in [VerifySource::Db, VerifySource::Jsonl, VerifySource::Both] {
            let report = h.verifier.verify("run-a", source).unwrap();
            assert!(report.passed(), "{source}: {:?}", report.issues);
            assert_eq!(report.checked_events, 4);
            assert_eq!(report.last_seq, Some(4));
            assert!(report.last_event_hash.is_some());
        }
    }

    #[test]
    fn test_floats_rehash_identically_after_storage() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("warden.db")).unwrap();
        let jsonl = Arc::new(JsonlSink::new(dir.path().join("audit").join("events.jsonl")).unwrap());
        let log = AuditLog::new(Arc::new(store.clone()), jsonl.clone());

        log.append(NewEvent::system("r", EventType::StepCompleted, Some("draft"), json!({ "confidence": 0.9856906946328695 })))
            .unwrap();
        log.append(NewEvent::system("r", EventType::StepCompleted, Some("sum"), json!({ "hours": 0.1 * 3.0 })))
            .unwrap();
        log.append(NewEvent::system("r", EventType::StepCompleted, None, json!({ "tiny": 1.0715660391465826e-75 })))
            .unwrap();

        let report = ChainVerifier::new(Arc::new(store), jsonl).verify("r", VerifySource::Both).unwrap();
        assert!(report.passed(), "{:?}", report.issues);
        assert_eq!(report.checked_events, 3);
    }

    #[test]
    fn test_unknown_run_has_no_events() {
        let h = harness(2);
        let report = h.verifier.verify("nope", VerifySource::Both).unwrap();
        assert!(!report.passed());
        assert!(report.has_no_events());
        assert_eq!(report.issues.len(), 2);
    }

    // ── Tampering ─────────────────────────────────────────────────────────────

    #[test]
    fn test_edited_data_breaks_hash_and_next_link() {
        let h = harness(4);
        h.store
            .execute("UPDATE audit_events SET data_json = '{\"i\":99}' WHERE run_id = 'run-a' AND seq = 2")
            .unwrap();

        let db = h.verifier.verify("run-a", VerifySource::Db).unwrap();
        assert_eq!(
            reasons(&db),
            vec![
                (Some(2), IntegrityReason::EventHashMismatch, VerifySource::Db),
                (Some(3), IntegrityReason::PrevHashMismatch, VerifySource::Db),
            ]
        );
        assert!(h.verifier.verify("run-a", VerifySource::Jsonl).unwrap().passed());
    }

    #[test]
    fn test_deleted_row_is_missing_in_sink_and_cross_check() {
        let h = harness(4);
        h.store.execute("DELETE FROM audit_events WHERE run_id = 'run-a' AND seq = 2").unwrap();

        let both = h.verifier.verify("run-a", VerifySource::Both).unwrap();
        assert_eq!(
            reasons(&both),
            vec![
                (Some(2), IntegrityReason::MissingEvent, VerifySource::Db),
                (Some(2), IntegrityReason::MissingEvent, VerifySource::Both),
            ]
        );
        assert!(both.issues[1].detail.contains("present in jsonl"));
        assert_eq!(both.checked_events, 4);
    }

    #[test]
    fn test_forged_hash_in_one_sink_is_caught_twice() {
        let h = harness(4);
        h.store
            .execute("UPDATE audit_events SET event_hash = 'deadbeef' WHERE run_id = 'run-a' AND seq = 2")
            .unwrap();

        let both = h.verifier.verify("run-a", VerifySource::Both).unwrap();
        assert_eq!(
            reasons(&both),
            vec![
                (Some(2), IntegrityReason::EventHashMismatch, VerifySource::Db),
                (Some(2), IntegrityReason::EventHashMismatch, VerifySource::Both),
            ]
        );
    }

    #[test]
    fn test_truncated_jsonl_tail_is_only_a_cross_check_gap() {
        let h = harness(4);
        let path = h.jsonl_path();
        let mut lines: Vec<String> = fs::read_to_string(&path).unwrap().lines().map(str::to_string).collect();
        let last = lines.iter().rposition(|l| l.contains("\"run-a\"")).unwrap();
        lines.remove(last);
        fs::write(&path, lines.join("\n") + "\n").unwrap();

        assert!(h.verifier.verify("run-a", VerifySource::Jsonl).unwrap().passed());
        let both = h.verifier.verify("run-a", VerifySource::Both).unwrap();
        assert_eq!(reasons(&both), vec![(Some(4), IntegrityReason::MissingEvent, VerifySource::Both)]);
        assert!(both.issues[0].detail.contains("present in db but missing from jsonl"));
    }

    #[test]
    fn test_non_object_data_is_a_parse_error() {
        let h = harness(2);
        h.store
            .execute("UPDATE audit_events SET data_json = '[1,2]' WHERE run_id = 'run-a' AND seq = 1")
            .unwrap();

        let db = h.verifier.verify("run-a", VerifySource::Db).unwrap();
        assert_eq!(reasons(&db), vec![(Some(1), IntegrityReason::ParseError, VerifySource::Db)]);
    }

    #[test]
    fn test_jsonl_garbage_and_duplicates_are_parse_errors() {
        let h = harness(3);
        let path = h.jsonl_path();
        let contents = fs::read_to_string(&path).unwrap();
        let first_run_a = contents.lines().find(|l| l.contains("\"run-a\"")).unwrap().to_string();

        let mut tampered = contents.clone();
        tampered.push_str(&first_run_a);
        tampered.push('\n');
        tampered.push_str("not json at all\n");
        fs::write(&path, tampered).unwrap();

        let jsonl = h.verifier.verify("run-a", VerifySource::Jsonl).unwrap();
        assert_eq!(
            reasons(&jsonl),
            vec![
                (Some(1), IntegrityReason::ParseError, VerifySource::Jsonl),
                (None, IntegrityReason::ParseError, VerifySource::Jsonl),
            ]
        );
        assert!(jsonl.issues[0].detail.contains("duplicate"));
    }

    #[test]
    fn test_forged_first_link_is_reported() {
        let h = harness(2);
        h.store
            .execute("UPDATE audit_events SET prev_hash = 'abc' WHERE run_id = 'run-a' AND seq = 1")
            .unwrap();

        let db = h.verifier.verify("run-a", VerifySource::Db).unwrap();
        let found = reasons(&db);
        assert!(found.contains(&(Some(1), IntegrityReason::PrevHashMismatch, VerifySource::Db)));
        assert!(found.contains(&(Some(1), IntegrityReason::EventHashMismatch, VerifySource::Db)));
    }
}
