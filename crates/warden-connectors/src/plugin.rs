//! Plugin discovery from a directory of TOML descriptors.
//!
//! A descriptor names a compiled-in factory, the manifest the plugin
//! declares, and free-form settings for the factory:
//!
//! ```toml
//! factory = "fixtures"
//!
//! [manifest]
//! connector_id = "archive_mail"
//! default_mode = "read"
//! operations = { sent_emails = "read" }
//!
//! [settings]
//! root = "/srv/archive"
//! ```
//!
//! Nothing found here can fail startup. Unreadable descriptors, unknown
//! factories and factory errors are recorded on the registry as skips.

use std::{collections::BTreeMap, fs, path::Path, sync::Arc};

use serde::Deserialize;
use tracing::{debug, info};

use warden_contracts::{
    connector::ConnectorManifest,
    error::{ConfigErrorKind, WardenError, WardenResult},
};
use warden_core::traits::Connector;

use crate::{
    builtin::{FixtureConnector, JsonlExportConnector, FIXTURES_ID, JSONL_EXPORT_ID},
    registry::ConnectorRegistry,
};

#[derive(Debug, Clone, Deserialize)]
pub struct PluginDescriptor {
    pub factory: String,
    pub manifest: ConnectorManifest,
    #[serde(default)]
    pub settings: toml::Table,
}

impl PluginDescriptor {
    pub fn from_toml_str(source: &str) -> WardenResult<Self> {
        toml::from_str(source).map_err(|e| {
            WardenError::config(ConfigErrorKind::InvalidFile, format!("invalid plugin descriptor: {e}"))
        })
    }

    fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(toml::Value::as_str)
    }
}

pub type ConnectorFactory = Box<dyn Fn(&PluginDescriptor) -> WardenResult<Arc<dyn Connector>> + Send + Sync>;

/// Named constructors a descriptor may refer to.
#[derive(Default)]
pub struct ConnectorFactories {
    factories: BTreeMap<String, ConnectorFactory>,
}

impl ConnectorFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// `fixtures` (setting `root`) and `jsonl_export` (setting `path`).
    pub fn with_builtins() -> Self {
        let mut factories = Self::new();
        factories.register(
            FIXTURES_ID,
            Box::new(|d: &PluginDescriptor| {
                let root = d.setting_str("root").ok_or_else(|| missing_setting(d, "root"))?;
                Ok(Arc::new(FixtureConnector::with_manifest(d.manifest.clone(), root)) as Arc<dyn Connector>)
            }),
        );
        factories.register(
            JSONL_EXPORT_ID,
            Box::new(|d: &PluginDescriptor| {
                let path = d.setting_str("path").ok_or_else(|| missing_setting(d, "path"))?;
                Ok(Arc::new(JsonlExportConnector::with_manifest(d.manifest.clone(), path)) as Arc<dyn Connector>)
            }),
        );
        factories
    }

    pub fn register(&mut self, name: impl Into<String>, factory: ConnectorFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn build(&self, descriptor: &PluginDescriptor) -> WardenResult<Arc<dyn Connector>> {
        let factory = self.factories.get(&descriptor.factory).ok_or_else(|| {
            WardenError::config(
                ConfigErrorKind::InvalidManifest,
                format!("unknown connector factory '{}'", descriptor.factory),
            )
        })?;
        factory(descriptor)
    }
}

fn missing_setting(descriptor: &PluginDescriptor, key: &str) -> WardenError {
    WardenError::config(
        ConfigErrorKind::InvalidManifest,
        format!("plugin '{}' is missing setting '{key}'", descriptor.manifest.connector_id),
    )
}

/// Register every `*.toml` descriptor in `dir`, in file-name order.
///
/// A missing directory means no plugins. Returns how many were registered.
pub fn discover_plugins(
    registry: &mut ConnectorRegistry,
    dir: impl AsRef<Path>,
    factories: &ConnectorFactories,
) -> WardenResult<usize> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        debug!(dir = %dir.display(), "no plugin directory");
        return Ok(0);
    }
    let mut paths: Vec<_> = fs::read_dir(dir)
        .map_err(|e| {
            WardenError::config(ConfigErrorKind::InvalidFile, format!("cannot read '{}': {e}", dir.display()))
        })?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("toml"))
        .collect();
    paths.sort();

    let mut registered = 0;
    for path in paths {
        let origin = path.display().to_string();
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default().to_string();

        let descriptor = match fs::read_to_string(&path)
            .map_err(WardenError::store)
            .and_then(|text| PluginDescriptor::from_toml_str(&text))
        {
            Ok(d) => d,
            Err(e) => {
                registry.skip(&stem, e.to_string(), &origin);
                continue;
            }
        };
        match factories.build(&descriptor) {
            Ok(connector) => {
                if registry.register_plugin(connector, &origin) {
                    registered += 1;
                }
            }
            Err(e) => registry.skip(&descriptor.manifest.connector_id, e.to_string(), &origin),
        }
    }
    info!(dir = %dir.display(), registered, skipped = registry.skipped().len(), "plugin discovery finished");
    Ok(registered)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use warden_contracts::connector::PermissionMode;
    use warden_core::traits::ConnectorCatalog;

    use super::{discover_plugins, ConnectorFactories};
    use crate::{builtin::FixtureConnector, registry::ConnectorRegistry};

    fn descriptor(id: &str, factory: &str, setting: &str) -> String {
        format!(
            "factory = \"{factory}\"\n\
             [manifest]\n\
             connector_id = \"{id}\"\n\
             default_mode = \"read\"\n\
             operations = {{ sent_emails = \"read\" }}\n\
             [settings]\n\
             {setting}\n"
        )
    }

    #[test]
    fn discovers_in_order_and_records_skips() {
        let fixtures = tempfile::tempdir().unwrap();
        fs::write(fixtures.path().join("sent_emails.json"), "[1]").unwrap();
        let root = format!("root = {:?}", fixtures.path().display().to_string());

        let plugins = tempfile::tempdir().unwrap();
        fs::write(plugins.path().join("a_archive.toml"), descriptor("archive", "fixtures", &root)).unwrap();
        fs::write(plugins.path().join("b_clash.toml"), descriptor("fixtures", "fixtures", &root)).unwrap();
        fs::write(plugins.path().join("c_again.toml"), descriptor("archive", "fixtures", &root)).unwrap();
        fs::write(plugins.path().join("d_unknown.toml"), descriptor("slack", "slack_sdk", "")).unwrap();
        fs::write(plugins.path().join("e_broken.toml"), "factory = ").unwrap();
        fs::write(plugins.path().join("ignored.txt"), "nothing").unwrap();

        let mut registry = ConnectorRegistry::new();
        registry.register_builtin(std::sync::Arc::new(FixtureConnector::new(fixtures.path()))).unwrap();

        let registered = discover_plugins(&mut registry, plugins.path(), &ConnectorFactories::with_builtins()).unwrap();
        assert_eq!(registered, 1);

        let skipped: Vec<&str> = registry.skipped().iter().map(|s| s.connector_id.as_str()).collect();
        assert_eq!(skipped, vec!["fixtures", "archive", "slack", "e_broken"]);

        let archive = registry.connector("archive").unwrap();
        assert_eq!(archive.manifest().mode_of("sent_emails"), Some(PermissionMode::Read));
        assert_eq!(archive.invoke("sent_emails", &json!({})).unwrap(), json!([1]));
    }

    #[test]
    fn missing_directory_means_no_plugins() {
        let mut registry = ConnectorRegistry::new();
        let found = discover_plugins(&mut registry, "/nonexistent/plugins", &ConnectorFactories::with_builtins()).unwrap();
        assert_eq!(found, 0);
        assert!(registry.skipped().is_empty());
    }
}
