//! # warden-verify
//!
//! Independent verification for Warden.
//!
//! This crate provides:
//!
//! 1. [`integrity::ChainVerifier`]: recomputes the hash chain of a run from
//!    the SQLite store, the JSONL log, or both, and cross-checks the two.
//!    Every problem is reported, never just the first.
//! 2. [`contract::ContractRegistry`]: named, versioned JSON Schema
//!    contracts (`name.vN`) that `llm` step responses must satisfy. It
//!    implements [`warden_core::traits::SchemaValidator`].
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use warden_verify::{ChainVerifier, ContractRegistry};
//! use warden_contracts::verify::VerifySource;
//!
//! let verifier = ChainVerifier::new(db_sink, jsonl_sink);
//! let report = verifier.verify(&run_id, VerifySource::Both)?;
//! assert!(report.passed());
//! ```

pub mod contract;
pub mod integrity;

pub use contract::{ContractRegistry, TIME_ENTRY_SUGGESTIONS_V1};
pub use integrity::ChainVerifier;
