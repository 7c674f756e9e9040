//! Warden: policy-gated playbook runner CLI.
//!
//! Usage:
//!   warden run --playbook weekly.toml --input week=42 --approve
//!   warden resume --run-id <id> --decision approve
//!   warden cancel --run-id <id> --reason "wrong week"
//!   warden status --run-id <id>
//!   warden runs
//!   warden verify --run-id <id> --source both
//!   warden connectors
//!
//! Exit codes: 0 success, 1 run or verification failure, 2 invalid input.

mod app;
mod config;
mod providers;

use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    str::FromStr,
};

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

use warden_contracts::{
    connector::PermissionMode,
    error::{WardenError, WardenResult},
    run::{ReviewDecision, RunStatus, RunSummary},
    verify::{IntegrityReport, VerifySource},
};
use warden_core::{playbook::load_playbook, traits::Reviewer, RunOptions};

use crate::{app::Warden, config::resolve_home};

// ── CLI definition ────────────────────────────────────────────────────────────

/// Run playbooks behind a policy gate with a verifiable audit trail.
#[derive(Parser)]
#[command(name = "warden", version, about = "Policy-gated playbook runner with a hash-chained audit trail")]
struct Cli {
    /// Warden home directory (database, audit log, warden.toml).
    #[arg(long, env = "WARDEN_HOME", global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a playbook run. Stops at the first approval unless --auto is given.
    Run {
        #[arg(long)]
        playbook: PathBuf,
        /// Run input as key=value; the value is parsed as JSON when possible.
        #[arg(long = "input", value_parser = parse_input)]
        inputs: Vec<(String, Value)>,
        /// Allow write operations in apply steps.
        #[arg(long)]
        approve: bool,
        /// Simulate apply steps.
        #[arg(long)]
        dry_run: bool,
        /// Answer every approval with this decision instead of suspending.
        #[arg(long, value_enum)]
        auto: Option<AutoDecision>,
        #[arg(long, default_value = "cli")]
        reviewer: String,
    },
    /// Record a reviewer decision for a suspended run and continue it.
    Resume {
        #[arg(long)]
        run_id: String,
        #[arg(long, value_enum)]
        decision: DecisionArg,
        #[arg(long)]
        reason: Option<String>,
        /// JSON file replacing the proposed effect (with --decision edit).
        #[arg(long)]
        payload: Option<PathBuf>,
        #[arg(long, default_value = "cli")]
        reviewer: String,
    },
    /// Abort a run that has not finished.
    Cancel {
        #[arg(long)]
        run_id: String,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Print the current summary of a run.
    Status {
        #[arg(long)]
        run_id: String,
    },
    /// List stored runs, newest first.
    Runs,
    /// Recompute and cross-check the audit chain of a run.
    Verify {
        #[arg(long)]
        run_id: String,
        #[arg(long, default_value = "both", value_parser = VerifySource::from_str)]
        source: VerifySource,
    },
    /// List registered connectors and skipped plugins.
    Connectors,
}

#[derive(Clone, Copy, ValueEnum)]
enum AutoDecision {
    Approve,
    Reject,
}

#[derive(Clone, Copy, ValueEnum)]
enum DecisionArg {
    Approve,
    Reject,
    Edit,
}

fn parse_input(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw.split_once('=').ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

// ── Exit codes ────────────────────────────────────────────────────────────────

const EXIT_FAILURE: u8 = 1;
const EXIT_INVALID: u8 = 2;

fn exit_code_for(error: &WardenError) -> u8 {
    match error {
        WardenError::Config { .. }
        | WardenError::Playbook { .. }
        | WardenError::NotFound { .. }
        | WardenError::StateMachine { .. } => EXIT_INVALID,
        _ => EXIT_FAILURE,
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    // Set RUST_LOG=debug for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn dispatch(cli: Cli) -> WardenResult<u8> {
    let warden = Warden::open(resolve_home(cli.home)?)?;
    match cli.command {
        Command::Run { playbook, inputs, approve, dry_run, auto, reviewer } => {
            let playbook = load_playbook(&playbook)?;
            let options = RunOptions { inputs: Value::Object(inputs.into_iter().collect::<Map<_, _>>()), approve, dry_run };
            let runner = warden.runner()?;
            let summary = match auto {
                Some(decision) => {
                    let reviewer = StaticReviewer { id: reviewer, decision };
                    runner.drive_with_reviewer(&playbook, options, &reviewer)?
                }
                None => runner.start(&playbook, options)?,
            };
            print_summary(&summary)
        }
        Command::Resume { run_id, decision, reason, payload, reviewer } => {
            let decision = match decision {
                DecisionArg::Approve => ReviewDecision::Approve,
                DecisionArg::Reject => ReviewDecision::Reject { reason },
                DecisionArg::Edit => {
                    let path = payload.ok_or_else(|| WardenError::Playbook {
                        reason: "--decision edit requires --payload <file>".to_string(),
                    })?;
                    ReviewDecision::Edit { payload: read_json(&path)? }
                }
            };
            let summary = warden.runner()?.resume_with_decision(&run_id, decision, &reviewer)?;
            print_summary(&summary)
        }
        Command::Cancel { run_id, reason, actor } => {
            let summary = warden.runner()?.cancel(&run_id, &actor, &reason)?;
            print_summary(&summary)
        }
        Command::Status { run_id } => {
            let summary = warden.runner()?.summary(&run_id)?;
            print_json(&summary)?;
            Ok(0)
        }
        Command::Runs => {
            for run in warden.runs()? {
                let ended = run.ended_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string());
                println!(
                    "{} {} {} started {} ended {}",
                    run.run_id,
                    run.status,
                    run.playbook.name,
                    run.started_at.to_rfc3339(),
                    ended
                );
            }
            Ok(0)
        }
        Command::Verify { run_id, source } => {
            let report = warden.verifier().verify(&run_id, source)?;
            Ok(print_report(&report))
        }
        Command::Connectors => {
            for manifest in warden.registry().manifests() {
                let source = warden
                    .registry()
                    .source_of(&manifest.connector_id)
                    .map(|s| s.label().to_string())
                    .unwrap_or_default();
                println!("{} ({source})", manifest.connector_id);
                for (operation, mode) in &manifest.operations {
                    let mode = match mode {
                        PermissionMode::Read => "read",
                        PermissionMode::Write => "write",
                    };
                    println!("  {operation}: {mode}");
                }
            }
            for skipped in warden.registry().skipped() {
                println!("skipped {} from {}: {}", skipped.connector_id, skipped.source, skipped.reason);
            }
            Ok(0)
        }
    }
}

// ── Reviewer ──────────────────────────────────────────────────────────────────

/// Gives the same answer to every approval.
struct StaticReviewer {
    id: String,
    decision: AutoDecision,
}

impl Reviewer for StaticReviewer {
    fn reviewer_id(&self) -> &str {
        &self.id
    }

    fn request_approval(&self, _step_id: &str, _proposed_effect: &Value) -> WardenResult<ReviewDecision> {
        Ok(match self.decision {
            AutoDecision::Approve => ReviewDecision::Approve,
            AutoDecision::Reject => ReviewDecision::Reject { reason: Some("rejected by --auto reject".to_string()) },
        })
    }
}

// ── Output ────────────────────────────────────────────────────────────────────

fn read_json(path: &Path) -> WardenResult<Value> {
    let text = fs::read_to_string(path).map_err(|e| WardenError::Playbook {
        reason: format!("cannot read '{}': {e}", path.display()),
    })?;
    serde_json::from_str(&text).map_err(|e| WardenError::Playbook {
        reason: format!("'{}' is not JSON: {e}", path.display()),
    })
}

fn print_json(value: &impl serde::Serialize) -> WardenResult<()> {
    let text = serde_json::to_string_pretty(value).map_err(WardenError::store)?;
    println!("{text}");
    Ok(())
}

/// Completed and suspended runs exit 0; failed and aborted runs exit 1.
fn print_summary(summary: &RunSummary) -> WardenResult<u8> {
    print_json(summary)?;
    Ok(match summary.status {
        RunStatus::Failed | RunStatus::Aborted => EXIT_FAILURE,
        _ => 0,
    })
}

fn print_report(report: &IntegrityReport) -> u8 {
    if report.has_no_events() {
        eprintln!("audit verification failed: no audit events for run {} ({})", report.run_id, report.source);
        return EXIT_INVALID;
    }
    if report.passed() {
        println!(
            "audit verified: run {} source {} events {} last_seq {} last_hash {}",
            report.run_id,
            report.source,
            report.checked_events,
            report.last_seq.unwrap_or_default(),
            report.last_event_hash.as_deref().unwrap_or("-"),
        );
        return 0;
    }
    println!(
        "audit verification failed: run {} source {} issues {}",
        report.run_id,
        report.source,
        report.issues.len()
    );
    for issue in &report.issues {
        let seq = issue.seq.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
        println!("  seq {seq} {} [{}]: {}", issue.reason, issue.source, issue.detail);
    }
    EXIT_FAILURE
}
