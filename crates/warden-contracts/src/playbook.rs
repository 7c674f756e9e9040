//! Playbook and step definitions.
//!
//! A playbook is an ordered list of typed steps. Order is fixed at load
//! time and is the only execution order the runner knows.

use std::{collections::HashSet, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{WardenError, WardenResult};

/// Context key under which run inputs are exposed to steps.
pub const INPUTS_KEY: &str = "inputs";

/// The five step kinds. Only `Apply` may perform write operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Collect,
    Transform,
    Llm,
    Approve,
    Apply,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Collect => "collect",
            Self::Transform => "transform",
            Self::Llm => "llm",
            Self::Approve => "approve",
            Self::Apply => "apply",
        }
    }

    /// Kinds that cannot run without naming a connector.
    pub fn requires_connector(&self) -> bool {
        matches!(self, Self::Collect | Self::Apply)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(rename = "id")]
    pub step_id: String,
    pub kind: StepKind,
    #[serde(rename = "connector", default, skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// When true, a failure of this step is recorded but does not halt the run.
    #[serde(default)]
    pub optional: bool,
    #[serde(default = "empty_params")]
    pub params: Value,
}

fn empty_params() -> Value {
    Value::Object(Default::default())
}

impl StepSpec {
    pub fn new(step_id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            step_id: step_id.into(),
            kind,
            connector_id: None,
            operation: None,
            optional: false,
            params: empty_params(),
        }
    }

    pub fn with_connector(mut self, connector_id: impl Into<String>, operation: impl Into<String>) -> Self {
        self.connector_id = Some(connector_id.into());
        self.operation = Some(operation.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// A string-valued param, if present.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub steps: Vec<StepSpec>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl PlaybookSpec {
    pub fn new(name: impl Into<String>, steps: Vec<StepSpec>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            version: default_version(),
            steps,
        }
    }

    /// Structural checks done once at load time.
    ///
    /// Rejects an empty step list, empty or duplicate step ids, and any
    /// context key that would shadow another: a step or `output` alias
    /// named `inputs`, or an alias equal to another step id or alias.
    pub fn validate(&self) -> WardenResult<()> {
        if self.steps.is_empty() {
            return Err(WardenError::Playbook {
                reason: format!("playbook '{}' must define at least one step", self.name),
            });
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.step_id.trim().is_empty() {
                return Err(WardenError::Playbook {
                    reason: "step id must not be empty".to_string(),
                });
            }
            if step.step_id == INPUTS_KEY {
                return Err(WardenError::Playbook {
                    reason: format!("step id '{INPUTS_KEY}' is reserved for run inputs"),
                });
            }
            if !seen.insert(step.step_id.as_str()) {
                return Err(WardenError::Playbook {
                    reason: format!("duplicate step id '{}'", step.step_id),
                });
            }
        }

        let mut aliases = HashSet::new();
        for step in &self.steps {
            let Some(alias) = step.param_str("output").filter(|a| *a != step.step_id) else {
                continue;
            };
            let clash = if alias == INPUTS_KEY {
                Some("run inputs")
            } else if seen.contains(alias) {
                Some("another step")
            } else if !aliases.insert(alias) {
                Some("another alias")
            } else {
                None
            };
            if let Some(owner) = clash {
                return Err(WardenError::Playbook {
                    reason: format!("step '{}' output alias '{alias}' would overwrite {owner}", step.step_id),
                });
            }
        }
        Ok(())
    }
}
