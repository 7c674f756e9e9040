//! Hash-chain primitives: canonical payloads and event hashes.
//!
//! Hash input layout:
//!
//!   SHA-256( prev_hash_or_empty_string ‖ canonical_payload )
//!
//! where `canonical_payload` is the JSON object
//! `{run_id, timestamp, event_type, actor, step_id, data, prev_hash}` with
//! keys sorted at every depth and no insignificant whitespace. The result is
//! a lowercase 64-character hex string.

use std::fmt::Write as _;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use warden_contracts::audit::{format_timestamp, AuditEvent};

/// Serialize `value` deterministically.
///
/// Object keys are emitted in byte order at every depth regardless of how
/// the map was built, so the output never depends on insertion order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // Display for a JSON string value performs the escaping.
    let _ = write!(out, "{}", Value::String(s.to_string()));
}

/// The canonical payload of an event, exactly as it is hashed.
pub fn canonical_payload(event: &AuditEvent) -> String {
    canonical_json(&json!({
        "run_id": event.run_id,
        "timestamp": format_timestamp(&event.timestamp),
        "event_type": event.event_type.as_str(),
        "actor": event.actor,
        "step_id": event.step_id,
        "data": event.data,
        "prev_hash": event.prev_hash,
    }))
}

/// `SHA-256(prev_hash_or_empty ‖ payload)` as lowercase hex.
pub fn compute_event_hash(prev_hash: Option<&str>, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.unwrap_or("").as_bytes());
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Recompute the hash an event should carry from its stored fields.
pub fn hash_event(event: &AuditEvent) -> String {
    compute_event_hash(event.prev_hash.as_deref(), &canonical_payload(event))
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use warden_contracts::audit::{AuditEvent, EventType};

    use super::{canonical_json, canonical_payload, compute_event_hash, hash_event};

    fn event() -> AuditEvent {
        AuditEvent {
            seq: 1,
            run_id: "run-1".to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 3, 2, 9, 30, 0).unwrap(),
            event_type: EventType::RunStarted,
            actor: "system".to_string(),
            step_id: None,
            data: json!({ "playbook": "weekly", "approve": false }),
            prev_hash: None,
            event_hash: String::new(),
        }
    }

    #[test]
    fn keys_are_sorted_at_every_depth_without_whitespace() {
        let value = json!({ "b": 1, "a": { "z": [true, null], "m": "x\"y" } });
        assert_eq!(canonical_json(&value), r#"{"a":{"m":"x\"y","z":[true,null]},"b":1}"#);
    }

    #[test]
    fn payload_has_fixed_field_set_and_timestamp_format() {
        let payload = canonical_payload(&event());
        assert_eq!(
            payload,
            concat!(
                r#"{"actor":"system","data":{"approve":false,"playbook":"weekly"},"#,
                r#""event_type":"run_started","prev_hash":null,"run_id":"run-1","#,
                r#""step_id":null,"timestamp":"2026-03-02T09:30:00.000000Z"}"#
            )
        );
    }

    #[test]
    fn hash_is_deterministic_and_chained() {
        let first = event();
        let h1 = hash_event(&first);
        assert_eq!(h1, hash_event(&first));
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let payload = canonical_payload(&first);
        assert_ne!(compute_event_hash(Some(&h1), &payload), compute_event_hash(None, &payload));
    }

    #[test]
    fn any_field_change_changes_the_hash() {
        let base = hash_event(&event());

        let mut tampered = event();
        tampered.data = json!({ "playbook": "weekly", "approve": true });
        assert_ne!(hash_event(&tampered), base);

        let mut tampered = event();
        tampered.actor = "mallory".to_string();
        assert_ne!(hash_event(&tampered), base);
    }
}
