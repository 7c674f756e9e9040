//! Loading playbooks from TOML.

use std::{fs, path::Path};

use tracing::debug;

use warden_contracts::{
    error::{WardenError, WardenResult},
    playbook::PlaybookSpec,
};

/// Parse and validate a playbook document.
pub fn parse_playbook(source: &str) -> WardenResult<PlaybookSpec> {
    let playbook: PlaybookSpec = toml::from_str(source).map_err(|e| WardenError::Playbook {
        reason: format!("TOML parse error: {e}"),
    })?;
    playbook.validate()?;
    Ok(playbook)
}

/// Read, parse and validate a playbook file.
pub fn load_playbook(path: impl AsRef<Path>) -> WardenResult<PlaybookSpec> {
    let path = path.as_ref();
    let source = fs::read_to_string(path).map_err(|e| WardenError::Playbook {
        reason: format!("cannot read '{}': {e}", path.display()),
    })?;
    let playbook = parse_playbook(&source)?;
    debug!(path = %path.display(), name = %playbook.name, steps = playbook.steps.len(), "playbook loaded");
    Ok(playbook)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use warden_contracts::{error::WardenError, playbook::StepKind};

    use super::{load_playbook, parse_playbook};

    const WEEKLY: &str = r#"
name = "weekly-timesheet"
description = "Draft time entries from last week's sent mail"

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
optional = false
params = { source = "draft" }

[[steps]]
id = "export"
kind = "apply"
connector = "jsonl_export"
operation = "export_time_entries"
params = { source = "review" }
"#;

    #[test]
    fn parses_steps_in_declared_order() {
        let playbook = parse_playbook(WEEKLY).unwrap();
        assert_eq!(playbook.name, "weekly-timesheet");
        assert_eq!(playbook.version, "1.0");
        let kinds: Vec<StepKind> = playbook.steps.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![StepKind::Collect, StepKind::Llm, StepKind::Approve, StepKind::Apply]);
        assert_eq!(playbook.steps[1].param_str("schema"), Some("time_entry_suggestions.v1"));
    }

    #[test]
    fn rejects_unknown_step_kind() {
        let err = parse_playbook("name = \"x\"\n[[steps]]\nid = \"a\"\nkind = \"delete\"\n").unwrap_err();
        assert!(matches!(err, WardenError::Playbook { .. }));
    }

    #[test]
    fn rejects_playbook_without_steps() {
        let err = parse_playbook("name = \"empty\"\nsteps = []\n").unwrap_err();
        assert!(err.to_string().contains("at least one step"));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(WEEKLY.as_bytes()).unwrap();
        let playbook = load_playbook(file.path()).unwrap();
        assert_eq!(playbook.steps.len(), 4);

        assert!(load_playbook("/nonexistent/playbook.toml").is_err());
    }
}
