use std::{fs, path::Path};

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;

const PLAYBOOK: &str = r#"
name = "weekly-timesheet"

[[steps]]
id = "mail"
kind = "collect"
connector = "fixtures"
operation = "sent_emails"

[[steps]]
id = "draft"
kind = "llm"
params = { task = "Suggest time entries", schema = "time_entry_suggestions.v1", source = "mail" }

[[steps]]
id = "review"
kind = "approve"
params = { source = "draft" }

[[steps]]
id = "export"
kind = "apply"
connector = "jsonl_export"
operation = "export_time_entries"
params = { source = "review" }
"#;

const MAIL: &str = r#"[
  { "id": "m-1", "subject": "Re: filing", "matter_id": "M-7" },
  { "id": "m-2", "subject": "Invoice" }
]"#;

/// Run warden against `home`.
fn warden(home: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("warden");
    cmd.env("WARDEN_HOME", home).env_remove("RUST_LOG");
    cmd
}

/// A home with fixtures and fast retries, plus the playbook path.
fn setup() -> (tempfile::TempDir, std::path::PathBuf) {
    let home = tempfile::tempdir().unwrap();
    fs::create_dir_all(home.path().join("fixtures")).unwrap();
    fs::write(home.path().join("fixtures").join("sent_emails.json"), MAIL).unwrap();
    fs::write(
        home.path().join("warden.toml"),
        "[llm]\nbackoff_ms = 1\n[connectors]\nbackoff_ms = 1\n",
    )
    .unwrap();
    let playbook = home.path().join("weekly.toml");
    fs::write(&playbook, PLAYBOOK).unwrap();
    (home, playbook)
}

fn summary(output: &[u8]) -> Value {
    serde_json::from_slice(output).unwrap()
}

fn export_path(home: &Path) -> std::path::PathBuf {
    home.join("exports").join("time_entries.jsonl")
}

// ─── Run / resume ────────────────────────────────────────────────

#[test]
fn run_suspends_then_resume_completes_and_verifies() {
    let (home, playbook) = setup();

    let out = warden(home.path())
        .args(["run", "--playbook"])
        .arg(&playbook)
        .arg("--approve")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let parked = summary(&out);
    assert_eq!(parked["status"], "awaiting_approval");
    assert_eq!(parked["pending_step"], "review");
    assert!(!export_path(home.path()).exists(), "nothing is written before approval");
    let run_id = parked["run_id"].as_str().unwrap().to_string();

    let out = warden(home.path())
        .args(["resume", "--run-id", &run_id, "--decision", "approve", "--reviewer", "partner@firm"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(summary(&out)["status"], "completed");

    let exported = fs::read_to_string(export_path(home.path())).unwrap();
    assert_eq!(exported.lines().count(), 2);
    assert!(exported.contains("\"matter_id\":\"M-7\""));

    warden(home.path())
        .args(["verify", "--run-id", &run_id, "--source", "both"])
        .assert()
        .code(0)
        .stdout(predicate::str::starts_with("audit verified:"));

    warden(home.path())
        .args(["resume", "--run-id", &run_id, "--decision", "approve"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not awaiting approval"));
}

#[test]
fn unapproved_write_aborts_before_any_step() {
    let (home, playbook) = setup();

    let out = warden(home.path())
        .args(["run", "--auto", "approve", "--playbook"])
        .arg(&playbook)
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();
    let aborted = summary(&out);
    assert_eq!(aborted["status"], "aborted");
    assert!(aborted["error"].as_str().unwrap().contains("unapproved_write"));
    assert!(!export_path(home.path()).exists());

    warden(home.path())
        .args(["verify", "--run-id", aborted["run_id"].as_str().unwrap()])
        .assert()
        .code(0);
}

#[test]
fn dry_run_completes_without_writing() {
    let (home, playbook) = setup();

    let out = warden(home.path())
        .args(["run", "--dry-run", "--auto", "approve", "--playbook"])
        .arg(&playbook)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(summary(&out)["status"], "completed");
    assert!(!export_path(home.path()).exists());
}

#[test]
fn cancel_aborts_a_suspended_run() {
    let (home, playbook) = setup();

    let out = warden(home.path())
        .args(["run", "--approve", "--playbook"])
        .arg(&playbook)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let run_id = summary(&out)["run_id"].as_str().unwrap().to_string();

    warden(home.path())
        .args(["cancel", "--run-id", &run_id, "--reason", "wrong week"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("\"aborted\""));

    warden(home.path())
        .args(["status", "--run-id", &run_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("cancelled: wrong week"));
}

#[test]
fn runs_lists_stored_runs_with_status() {
    let (home, playbook) = setup();

    warden(home.path()).arg("runs").assert().success().stdout(predicate::str::is_empty());

    let out = warden(home.path())
        .args(["run", "--approve", "--playbook"])
        .arg(&playbook)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let run_id = summary(&out)["run_id"].as_str().unwrap().to_string();

    warden(home.path())
        .arg("runs")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("{run_id} awaiting_approval weekly-timesheet")))
        .stdout(predicate::str::contains("ended -"));
}

// ─── Verify ──────────────────────────────────────────────────────

#[test]
fn tampered_db_row_fails_only_the_db_source() {
    let (home, playbook) = setup();

    let out = warden(home.path())
        .args(["run", "--approve", "--auto", "approve", "--playbook"])
        .arg(&playbook)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let run_id = summary(&out)["run_id"].as_str().unwrap().to_string();

    let conn = rusqlite::Connection::open(home.path().join("warden.db")).unwrap();
    conn.execute(
        "UPDATE audit_events SET actor = 'mallory' WHERE run_id = ?1 AND seq = 2",
        [&run_id],
    )
    .unwrap();
    drop(conn);

    warden(home.path())
        .args(["verify", "--run-id", &run_id, "--source", "db"])
        .assert()
        .code(1)
        .stdout(predicate::str::starts_with("audit verification failed:"))
        .stdout(predicate::str::contains("seq 2 event_hash_mismatch"));

    warden(home.path())
        .args(["verify", "--run-id", &run_id, "--source", "jsonl"])
        .assert()
        .code(0);
}

#[test]
fn verify_rejects_unknown_runs_and_sources() {
    let (home, _) = setup();

    warden(home.path())
        .args(["verify", "--run-id", "no-such-run", "--source", "both"])
        .assert()
        .code(2);

    warden(home.path())
        .args(["verify", "--run-id", "x", "--source", "s3"])
        .assert()
        .code(2);
}

// ─── Connectors ──────────────────────────────────────────────────

#[test]
fn connectors_lists_builtins_and_skipped_plugins() {
    let (home, _) = setup();
    fs::create_dir_all(home.path().join("plugins")).unwrap();
    fs::write(
        home.path().join("plugins").join("clash.toml"),
        "factory = \"fixtures\"\n[manifest]\nconnector_id = \"jsonl_export\"\noperations = { x = \"read\" }\n[settings]\nroot = \"/tmp\"\n",
    )
    .unwrap();

    warden(home.path())
        .arg("connectors")
        .assert()
        .success()
        .stdout(predicate::str::contains("fixtures (builtin)"))
        .stdout(predicate::str::contains("export_time_entries: write"))
        .stdout(predicate::str::contains("skipped jsonl_export"));
}
