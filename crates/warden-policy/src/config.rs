//! Policy file schema.
//!
//! The policy file is TOML. Its only table today is `[sanitizer]`; the
//! write rules themselves are fixed and driven by connector manifests.
//!
//! ```toml
//! [sanitizer]
//! max_string_len = 2048
//! drop_keys = ["system_prompt", "instructions", "tool_call", "hidden"]
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use warden_contracts::error::{ConfigErrorKind, WardenError, WardenResult};

/// Rules applied to untrusted data at the context-merge boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizerRules {
    /// Strings longer than this many characters are truncated.
    pub max_string_len: usize,
    /// Arrays longer than this are truncated.
    pub max_array_items: usize,
    /// Values nested deeper than this are replaced by `null`.
    pub max_depth: usize,
    /// Remove `<script>`/`<style>` blocks and markup tags from strings.
    pub strip_markup: bool,
    /// Remove control characters other than `\n` and `\t`.
    pub strip_control_chars: bool,
    /// Object keys removed at any depth.
    pub drop_keys: Vec<String>,
}

impl Default for SanitizerRules {
    fn default() -> Self {
        Self {
            max_string_len: 4096,
            max_array_items: 500,
            max_depth: 16,
            strip_markup: true,
            strip_control_chars: true,
            drop_keys: vec![
                "system_prompt".to_string(),
                "instructions".to_string(),
                "tool_call".to_string(),
            ],
        }
    }
}

/// The whole policy file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub sanitizer: SanitizerRules,
}

impl PolicyConfig {
    /// Returns `WardenError::Config` if the TOML is malformed or does not
    /// match the expected schema.
    pub fn from_toml_str(s: &str) -> WardenResult<Self> {
        toml::from_str(s).map_err(|e| {
            WardenError::config(ConfigErrorKind::InvalidFile, format!("failed to parse policy TOML: {e}"))
        })
    }

    pub fn from_file(path: &Path) -> WardenResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            WardenError::config(
                ConfigErrorKind::InvalidFile,
                format!("failed to read policy file '{}': {e}", path.display()),
            )
        })?;
        Self::from_toml_str(&contents)
    }
}
