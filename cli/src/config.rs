//! `warden.toml`: per-home settings.
//!
//! ```toml
//! policy_file = "policy.toml"
//! contracts_dir = "contracts"
//!
//! [paths]
//! db = "warden.db"
//! jsonl = "audit/events.jsonl"
//!
//! [llm]
//! provider = "local"
//! max_retries = 2
//! backoff_ms = 500
//!
//! [connectors]
//! fixtures_dir = "fixtures"
//! export_path = "exports/time_entries.jsonl"
//! plugin_dir = "plugins"
//! ```
//!
//! Every key is optional. Relative paths are taken from the home directory.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use warden_contracts::error::{ConfigErrorKind, WardenError, WardenResult};
use warden_core::RetryPolicy;

pub const CONFIG_FILE: &str = "warden.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub db: PathBuf,
    pub jsonl: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self { db: PathBuf::from("warden.db"), jsonl: PathBuf::from("audit/events.jsonl") }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Deterministic drafting from the collected data, no network.
    Local,
    /// Canned responses from `<fixtures_dir>/<schema_id>.json`.
    Fixture,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub fixtures_dir: PathBuf,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self { provider: ProviderKind::Local, fixtures_dir: PathBuf::from("llm"), max_retries: 2, backoff_ms: 500 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectorsConfig {
    pub fixtures_dir: PathBuf,
    pub export_path: PathBuf,
    pub plugin_dir: PathBuf,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for ConnectorsConfig {
    fn default() -> Self {
        Self {
            fixtures_dir: PathBuf::from("fixtures"),
            export_path: PathBuf::from("exports/time_entries.jsonl"),
            plugin_dir: PathBuf::from("plugins"),
            max_retries: 2,
            backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub policy_file: Option<PathBuf>,
    pub contracts_dir: Option<PathBuf>,
    pub paths: PathsConfig,
    pub llm: LlmConfig,
    pub connectors: ConnectorsConfig,
}

impl WardenConfig {
    pub fn from_toml_str(s: &str) -> WardenResult<Self> {
        toml::from_str(s).map_err(|e| {
            WardenError::config(ConfigErrorKind::InvalidFile, format!("failed to parse {CONFIG_FILE}: {e}"))
        })
    }

    /// Read `<home>/warden.toml`, or defaults when it does not exist, and
    /// anchor every relative path at `home`.
    pub fn load(home: &Path) -> WardenResult<Self> {
        let path = home.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|e| {
                WardenError::config(ConfigErrorKind::InvalidFile, format!("failed to read '{}': {e}", path.display()))
            })?;
            Self::from_toml_str(&contents)?
        } else {
            Self::default()
        };
        config.anchor(home);
        Ok(config)
    }

    fn anchor(&mut self, home: &Path) {
        let at = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = home.join(&*p);
            }
        };
        at(&mut self.paths.db);
        at(&mut self.paths.jsonl);
        at(&mut self.llm.fixtures_dir);
        at(&mut self.connectors.fixtures_dir);
        at(&mut self.connectors.export_path);
        at(&mut self.connectors.plugin_dir);
        if let Some(p) = self.policy_file.as_mut() {
            at(p);
        }
        if let Some(p) = self.contracts_dir.as_mut() {
            at(p);
        }
    }

    pub fn connector_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.connectors.max_retries, Duration::from_millis(self.connectors.backoff_ms))
    }

    pub fn llm_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.llm.max_retries, Duration::from_millis(self.llm.backoff_ms))
    }
}

/// `--home` / `WARDEN_HOME`, else `~/.warden`.
pub fn resolve_home(explicit: Option<PathBuf>) -> WardenResult<PathBuf> {
    if let Some(home) = explicit {
        return Ok(home);
    }
    dirs::home_dir()
        .map(|h| h.join(".warden"))
        .ok_or_else(|| WardenError::config(ConfigErrorKind::InvalidFile, "cannot determine a home directory; pass --home"))
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::{ProviderKind, WardenConfig};

    #[test]
    fn missing_file_gives_anchored_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = WardenConfig::load(dir.path()).unwrap();
        assert_eq!(config.paths.db, dir.path().join("warden.db"));
        assert_eq!(config.paths.jsonl, dir.path().join("audit").join("events.jsonl"));
        assert_eq!(config.llm.provider, ProviderKind::Local);
        assert!(config.policy_file.is_none());
    }

    #[test]
    fn partial_file_overrides_only_what_it_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("warden.toml"),
            "policy_file = \"/etc/warden/policy.toml\"\n[llm]\nprovider = \"fixture\"\nmax_retries = 0\n",
        )
        .unwrap();

        let config = WardenConfig::load(dir.path()).unwrap();
        assert_eq!(config.policy_file.as_deref(), Some(Path::new("/etc/warden/policy.toml")));
        assert_eq!(config.llm.provider, ProviderKind::Fixture);
        assert_eq!(config.llm.max_retries, 0);
        assert_eq!(config.llm.backoff_ms, 500);
        assert_eq!(config.connectors.plugin_dir, dir.path().join(PathBuf::from("plugins")));
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        assert!(WardenConfig::from_toml_str("[llm]\nprovider = \"gpt\"\n").is_err());
    }
}
