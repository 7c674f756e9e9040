//! # warden-contracts
//!
//! Shared types, the error taxonomy, and collaborator contracts for the
//! Warden playbook engine.
//!
//! All crates in the workspace import from here. No business logic lives in
//! this crate: only data definitions, small validation helpers and errors.

pub mod audit;
pub mod connector;
pub mod error;
pub mod playbook;
pub mod policy;
pub mod run;
pub mod verify;
