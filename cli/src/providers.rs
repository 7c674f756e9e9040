//! Model providers that need no network.
//!
//! `local` drafts time entry suggestions straight from the collected data,
//! one per item. `fixture` replays a canned response per schema id. Both
//! stand behind the same `ModelProvider` seam a hosted model would use.

use std::{fs, path::PathBuf};

use serde_json::{json, Value};

use warden_contracts::error::ProviderError;
use warden_core::traits::{ModelProvider, Prompt};
use warden_verify::TIME_ENTRY_SUGGESTIONS_V1;

pub struct LocalProvider;

impl ModelProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn generate(&self, prompt: &Prompt, schema_id: &str) -> Result<Value, ProviderError> {
        if schema_id != TIME_ENTRY_SUGGESTIONS_V1 {
            return Err(ProviderError::fatal(format!("local provider cannot produce '{schema_id}'")));
        }
        let items: Vec<&Value> = match &prompt.data {
            Value::Array(items) => items.iter().collect(),
            Value::Null => Vec::new(),
            other => vec![other],
        };
        let suggestions: Vec<Value> = items.into_iter().enumerate().map(|(i, item)| draft(i, item)).collect();
        Ok(json!({ "schema_version": TIME_ENTRY_SUGGESTIONS_V1, "suggestions": suggestions }))
    }
}

fn text(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| item.get(*k))
        .and_then(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn draft(index: usize, item: &Value) -> Value {
    let matter_id = text(item, &["matter_id", "matter"]).unwrap_or_else(|| "UNASSIGNED".to_string());
    let narrative = text(item, &["narrative", "subject", "title", "summary"])
        .unwrap_or_else(|| format!("Matter {matter_id} legal work"));
    let minutes = ["duration_minutes", "minutes"]
        .iter()
        .find_map(|k| item.get(*k).and_then(Value::as_u64))
        .filter(|m| *m > 0)
        .unwrap_or(6);
    let evidence = text(item, &["id", "message_id", "event_id"]).unwrap_or_else(|| format!("item:{index}"));

    json!({
        "matter_id": matter_id,
        "client_id": text(item, &["client_id", "client"]),
        "duration_minutes": minutes,
        "narrative": narrative,
        "confidence": 0.5,
        "evidence_refs": [evidence],
    })
}

/// Replays `<dir>/<schema_id>.json`.
pub struct FixtureProvider {
    dir: PathBuf,
}

impl FixtureProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ModelProvider for FixtureProvider {
    fn name(&self) -> &str {
        "fixture"
    }

    fn generate(&self, _prompt: &Prompt, schema_id: &str) -> Result<Value, ProviderError> {
        let path = self.dir.join(format!("{schema_id}.json"));
        let text = fs::read_to_string(&path)
            .map_err(|e| ProviderError::fatal(format!("no canned response at '{}': {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| ProviderError::fatal(format!("canned response '{}' is not JSON: {e}", path.display())))
    }
}
