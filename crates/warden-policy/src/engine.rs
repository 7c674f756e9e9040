//! Manifest-driven policy engine.
//!
//! `ManifestPolicyEngine` implements the `PolicyEngine` trait from
//! warden-core. It consults only the manifest the runner resolved for the
//! step's connector, never the connector itself.
//!
//! Evaluation algorithm, first failing check wins:
//!
//! 1. `collect` and `apply` steps must name a connector. A named connector
//!    must be registered (`undeclared_connector`) and the operation must be
//!    in its manifest (`undeclared_operation`). Steps of other kinds that
//!    name no connector pass checks 1–3 vacuously.
//! 2. A `write` operation outside an `apply` step → `write_outside_apply`.
//! 3. A `write` operation in an `apply` step needs `approve` unless the run
//!    is a dry run → `unapproved_write`.

use std::path::Path;

use tracing::{debug, warn};

use warden_contracts::{
    connector::PermissionMode,
    error::WardenResult,
    playbook::StepKind,
    policy::{PolicyContext, PolicyVerdict, ViolationKind},
};
use warden_core::traits::PolicyEngine;

use crate::{config::PolicyConfig, sanitize::RuleSanitizer};

/// The write-gating policy engine.
///
/// ```rust,ignore
/// use warden_policy::ManifestPolicyEngine;
///
/// let engine = ManifestPolicyEngine::from_file(Path::new("policy.toml"))?;
/// let sanitizer = engine.sanitizer();
/// ```
#[derive(Debug, Clone, Default)]
pub struct ManifestPolicyEngine {
    config: PolicyConfig,
}

impl ManifestPolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn from_toml_str(s: &str) -> WardenResult<Self> {
        Ok(Self::new(PolicyConfig::from_toml_str(s)?))
    }

    pub fn from_file(path: &Path) -> WardenResult<Self> {
        Ok(Self::new(PolicyConfig::from_file(path)?))
    }

    /// The sanitation strategy configured by this policy.
    pub fn sanitizer(&self) -> RuleSanitizer {
        RuleSanitizer::new(self.config.sanitizer.clone())
    }
}

impl PolicyEngine for ManifestPolicyEngine {
    fn evaluate(&self, ctx: &PolicyContext) -> WardenResult<PolicyVerdict> {
        debug!(
            run_id = %ctx.run_id,
            step_id = %ctx.step_id,
            kind = %ctx.kind,
            connector = ctx.connector_id.as_deref().unwrap_or("-"),
            operation = ctx.operation.as_deref().unwrap_or("-"),
            "evaluating policy"
        );

        let verdict = check(ctx);
        if let PolicyVerdict::Deny { kind, reason } = &verdict {
            warn!(run_id = %ctx.run_id, step_id = %ctx.step_id, kind = %kind, reason = %reason, "policy denied step");
        }
        Ok(verdict)
    }
}

fn check(ctx: &PolicyContext) -> PolicyVerdict {
    // ── Check 1: declared connector and operation ────────────────────────────
    let Some(connector_id) = ctx.connector_id.as_deref() else {
        if ctx.kind.requires_connector() {
            return PolicyVerdict::deny(
                ViolationKind::UndeclaredConnector,
                format!("{} step '{}' does not name a connector", ctx.kind, ctx.step_id),
            );
        }
        return PolicyVerdict::Allow;
    };

    let Some(manifest) = ctx.manifest.as_ref().filter(|m| m.connector_id == connector_id) else {
        return PolicyVerdict::deny(
            ViolationKind::UndeclaredConnector,
            format!("step '{}' references unregistered connector '{connector_id}'", ctx.step_id),
        );
    };

    let Some(operation) = ctx.operation.as_deref() else {
        return PolicyVerdict::deny(
            ViolationKind::UndeclaredOperation,
            format!("step '{}' names connector '{connector_id}' but no operation", ctx.step_id),
        );
    };

    let Some(mode) = manifest.mode_of(operation) else {
        return PolicyVerdict::deny(
            ViolationKind::UndeclaredOperation,
            format!("connector '{connector_id}' does not declare operation '{operation}'"),
        );
    };

    if mode == PermissionMode::Read {
        return PolicyVerdict::Allow;
    }

    // ── Check 2: writes only in apply steps ──────────────────────────────────
    if ctx.kind != StepKind::Apply {
        return PolicyVerdict::deny(
            ViolationKind::WriteOutsideApply,
            format!(
                "write operation '{connector_id}.{operation}' used in {} step '{}'",
                ctx.kind, ctx.step_id
            ),
        );
    }

    // ── Check 3: approval for real writes ────────────────────────────────────
    if !ctx.approve && !ctx.dry_run {
        return PolicyVerdict::deny(
            ViolationKind::UnapprovedWrite,
            format!(
                "apply step '{}' writes via '{connector_id}.{operation}' but the run was not approved",
                ctx.step_id
            ),
        );
    }

    PolicyVerdict::Allow
}
