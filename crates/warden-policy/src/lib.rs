//! # warden-policy
//!
//! The write-gating policy engine and the sanitation boundary for the
//! Warden runtime.
//!
//! ## Overview
//!
//! [`ManifestPolicyEngine`] implements the
//! [`PolicyEngine`](warden_core::traits::PolicyEngine) trait. It decides
//! from connector manifests alone whether a step may run. It also owns the
//! [`RuleSanitizer`] strategy, configured by the `[sanitizer]` table of the
//! policy file.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::path::Path;
//! use warden_policy::ManifestPolicyEngine;
//!
//! let engine = ManifestPolicyEngine::from_file(Path::new("policy.toml"))?;
//! let sanitizer = engine.sanitizer();
//! // Pass both to `warden_core::PlaybookRunner::new(...)`.
//! ```

pub mod config;
pub mod engine;
pub mod sanitize;

pub use config::{PolicyConfig, SanitizerRules};
pub use engine::ManifestPolicyEngine;
pub use sanitize::RuleSanitizer;

// ── Tests ─────────────────────────────────────────────────────────────────────
