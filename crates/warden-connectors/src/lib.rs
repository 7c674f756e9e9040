//! # warden-connectors
//!
//! The connector side of Warden: the registry the runner and policy engine
//! consult, plugin discovery, and the `fixtures` / `jsonl_export` reference
//! connectors.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use warden_connectors::{builtin_registry, discover_plugins, ConnectorFactories};
//!
//! let mut registry = builtin_registry(&fixtures_dir, &export_path)?;
//! discover_plugins(&mut registry, &plugin_dir, &ConnectorFactories::with_builtins())?;
//! ```

use std::{path::Path, sync::Arc};

use warden_contracts::error::WardenResult;

pub mod builtin;
pub mod plugin;
pub mod registry;

pub use builtin::{FixtureConnector, JsonlExportConnector};
pub use plugin::{discover_plugins, ConnectorFactories, PluginDescriptor};
pub use registry::{ConnectorRegistry, ConnectorSource, SkippedConnector};

/// A registry holding the two built-in connectors.
pub fn builtin_registry(fixtures_dir: &Path, export_path: &Path) -> WardenResult<ConnectorRegistry> {
    let mut registry = ConnectorRegistry::new();
    registry.register_builtin(Arc::new(FixtureConnector::new(fixtures_dir)))?;
    registry.register_builtin(Arc::new(JsonlExportConnector::new(export_path)))?;
    Ok(registry)
}
