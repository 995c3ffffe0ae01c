use crate::ServerError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use wasmxds_core::{DirStore, KeyValueStore, MemoryStore};
use wasmxds_provider::ProvidersConfig;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8610";

/// Contents of `wasmxds.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: String,
    /// Watch only this namespace.
    pub namespace: Option<String>,
    /// Root of a directory-backed config-map/secret store. Without it the
    /// store is in-memory and empty.
    pub store_dir: Option<PathBuf>,
    pub requeue_interval_secs: u64,
    /// How long a discovery request with an up-to-date version waits for a
    /// change before answering 304.
    pub poll_timeout_secs: u64,
    pub providers: ProvidersConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_owned(),
            namespace: None,
            store_dir: None,
            requeue_interval_secs: 30,
            poll_timeout_secs: 30,
            providers: ProvidersConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path).map_err(|source| ServerError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ServerError::ParseConfig {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn key_value_store(&self) -> Arc<dyn KeyValueStore> {
        match &self.store_dir {
            Some(dir) => Arc::new(DirStore::new(dir)),
            None => Arc::new(MemoryStore::new()),
        }
    }
}
