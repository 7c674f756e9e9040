//! # warden-audit
//!
//! Append-only, SHA-256 hash-chained audit trail for Warden runs.
//!
//! ## Overview
//!
//! Every run transition becomes an `AuditEvent` with a per-run `seq`
//! starting at 1 and an `event_hash` over the previous hash plus the
//! event's canonical payload. `AuditLog` assigns those fields and writes
//! each event twice: to SQLite (`SqliteStore`) and to a shared JSONL file
//! (`JsonlSink`). Either copy can be verified on its own.
//!
//! `SqliteStore` also implements `RunStore`, so one database file holds the
//! audit rows and the resumable run state.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use warden_audit::{AuditLog, JsonlSink, SqliteStore};
//!
//! let store = SqliteStore::open(home.join("warden.db"))?;
//! let jsonl = JsonlSink::new(home.join("audit/events.jsonl"))?;
//! let audit = AuditLog::new(Arc::new(store.clone()), Arc::new(jsonl));
//! ```

pub mod chain;
pub mod jsonl;
pub mod log;
pub mod sink;
pub mod sqlite;

pub use chain::{canonical_json, compute_event_hash, hash_event};
pub use jsonl::JsonlSink;
pub use log::AuditLog;
pub use sink::AuditSink;
pub use sqlite::SqliteStore;

// ── Tests ─────────────────────────────────────────────────────────────────────
