//! Wiring: one Warden home directory turned into a runner and a verifier.

use std::{path::PathBuf, sync::Arc};

use tracing::{debug, warn};

use warden_audit::{AuditLog, JsonlSink, SqliteStore};
use warden_connectors::{builtin_registry, discover_plugins, ConnectorFactories, ConnectorRegistry};
use warden_contracts::{
    error::{ConfigErrorKind, WardenError, WardenResult},
    run::RunRecord,
};
use warden_core::{traits::ModelProvider, PlaybookRunner};
use warden_policy::ManifestPolicyEngine;
use warden_verify::{ChainVerifier, ContractRegistry};

use crate::{
    config::{ProviderKind, WardenConfig},
    providers::{FixtureProvider, LocalProvider},
};

pub struct Warden {
    pub config: WardenConfig,
    store: SqliteStore,
    jsonl: Arc<JsonlSink>,
    registry: Arc<ConnectorRegistry>,
}

impl Warden {
    /// Load configuration, open both stores and build the connector
    /// registry (built-ins, then plugins).
    pub fn open(home: PathBuf) -> WardenResult<Self> {
        let config = WardenConfig::load(&home)?;
        debug!(home = %home.display(), "opening warden home");

        let store = SqliteStore::open(&config.paths.db)?;
        let jsonl = Arc::new(JsonlSink::new(&config.paths.jsonl)?);

        let mut registry = builtin_registry(&config.connectors.fixtures_dir, &config.connectors.export_path)?;
        discover_plugins(&mut registry, &config.connectors.plugin_dir, &ConnectorFactories::with_builtins())?;

        Ok(Self { config, store, jsonl, registry: Arc::new(registry) })
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    pub fn runner(&self) -> WardenResult<PlaybookRunner> {
        let policy = match &self.config.policy_file {
            Some(path) => ManifestPolicyEngine::from_file(path)?,
            None => ManifestPolicyEngine::default(),
        };
        let sanitizer = policy.sanitizer();

        let mut contracts = ContractRegistry::with_builtins()?;
        if let Some(dir) = &self.config.contracts_dir {
            if !dir.is_dir() {
                return Err(WardenError::config(
                    ConfigErrorKind::InvalidFile,
                    format!("contracts_dir '{}' is not a directory", dir.display()),
                ));
            }
            contracts.load_dir(dir)?;
        }

        let provider: Box<dyn ModelProvider> = match self.config.llm.provider {
            ProviderKind::Local => Box::new(LocalProvider),
            ProviderKind::Fixture => Box::new(FixtureProvider::new(&self.config.llm.fixtures_dir)),
        };
        if !self.registry.skipped().is_empty() {
            warn!(count = self.registry.skipped().len(), "some plugin connectors were skipped");
        }

        let audit = AuditLog::new(Arc::new(self.store.clone()), self.jsonl.clone());
        Ok(PlaybookRunner::new(
            self.registry.clone(),
            Box::new(policy),
            Box::new(sanitizer),
            Box::new(contracts),
            Box::new(audit),
            Box::new(self.store.clone()),
        )
        .with_provider(provider)
        .with_retry(self.config.connector_retry(), self.config.llm_retry()))
    }

    /// Every stored run, newest first.
    pub fn runs(&self) -> WardenResult<Vec<RunRecord>> {
        self.store.list_runs()
    }

    pub fn verifier(&self) -> ChainVerifier {
        ChainVerifier::new(Arc::new(self.store.clone()), self.jsonl.clone())
    }
}
