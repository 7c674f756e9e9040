//! # warden-core
//!
//! The playbook execution runtime for Warden.
//!
//! This crate provides:
//! - The collaborator traits (`Connector`, `PolicyEngine`, `AuditWriter`, `RunStore`, ...)
//! - The `PlaybookRunner` state machine that wires them together in trust order
//! - Playbook loading, `{{ path }}` templates, transform functions and retry policy
//!
//! ## Usage
//!
//! ```rust,ignore
//! use warden_core::{PlaybookRunner, RunOptions, playbook::load_playbook};
//! ```

pub mod playbook;
pub mod retry;
pub mod runner;
pub mod template;
pub mod traits;
pub mod transform;

pub use retry::RetryPolicy;
pub use runner::{PlaybookRunner, RunOptions};
