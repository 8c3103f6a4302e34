// src/store/mod.rs

/// Local file backend
pub mod file;
/// Distributed key-value backend
pub mod kv;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::info;

use crate::config::{KvBackend, Presets};
use crate::resolver::model::ResolvedConfig;

pub use file::FileStore;
pub use kv::{EtcdGatewayClient, KvClient, KvEntry, KvStore, MemoryKvClient, TxnGuard};

/// Which persistence backend holds the resolved configs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreBackend {
    /// One versioned document on local disk
    File,

    /// Key namespace in the distributed key-value store
    Distributed,
}

impl StoreBackend {
    /// Backend required for the given number of broker nodes
    pub fn for_node_count(nodes: usize) -> Self {
        if nodes > 1 {
            StoreBackend::Distributed
        } else {
            StoreBackend::File
        }
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::File => write!(f, "file"),
            StoreBackend::Distributed => write!(f, "distributed"),
        }
    }
}

/// Uniform interface over the file and key-value backends.
///
/// Committed versions are immutable. A commit either fully lands, moving the
/// current-version pointer, or leaves the store as it was.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Which backend this is
    fn backend(&self) -> StoreBackend;

    /// Version the current pointer designates, if any
    async fn current_version(&self) -> Result<Option<u64>, StoreError>;

    /// Reads a retained version
    async fn read(&self, version: u64) -> Result<ResolvedConfig, StoreError>;

    /// Reads the exact bytes a version was committed with
    async fn read_raw(&self, version: u64) -> Result<Vec<u8>, StoreError>;

    /// Persists a config and makes it current; its version must be newer
    /// than the current one
    async fn commit(&self, config: &ResolvedConfig) -> Result<(), StoreError>;

    /// Retained versions, oldest first
    async fn versions(&self) -> Result<Vec<u64>, StoreError>;

    /// Drops all but the newest `retain` versions, returning how many went
    async fn prune(&self, retain: usize) -> Result<usize, StoreError>;

    /// Receives the current version every time it moves forward
    fn watch(&self) -> watch::Receiver<Option<u64>>;

    /// Reads the current config, if any
    async fn read_current(&self) -> Result<Option<ResolvedConfig>, StoreError> {
        match self.current_version().await? {
            Some(version) => self.read(version).await.map(Some),
            None => Ok(None),
        }
    }
}

/// Hands out the store for each backend
#[async_trait]
pub trait StoreProvider: Send + Sync {
    async fn open(&self, backend: StoreBackend) -> Result<Arc<dyn ConfigStore>, StoreError>;
}

/// Opens stores as configured by presets, once per backend
pub struct PresetStores {
    presets: Presets,
    shutdown: watch::Receiver<bool>,
    opened: Mutex<HashMap<StoreBackend, Arc<dyn ConfigStore>>>,
}

impl PresetStores {
    /// Distributed stores poll their pointer until `shutdown` flips
    pub fn new(presets: Presets, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            presets,
            shutdown,
            opened: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl StoreProvider for PresetStores {
    async fn open(&self, backend: StoreBackend) -> Result<Arc<dyn ConfigStore>, StoreError> {
        let mut opened = self.opened.lock().await;
        if let Some(store) = opened.get(&backend) {
            return Ok(store.clone());
        }

        let presets = &self.presets;
        let interval = Duration::from_millis(presets.kv.watch_interval_ms);
        let store: Arc<dyn ConfigStore> = match backend {
            StoreBackend::File => Arc::new(FileStore::open(presets.settings_document()).await?),
            StoreBackend::Distributed => match presets.kv.backend {
                KvBackend::Etcd => {
                    let client = EtcdGatewayClient::new(&presets.kv.url, presets.retry.store.timeout())?;
                    let store = KvStore::new(Arc::new(client), &presets.kv.namespace).await?;
                    store.spawn_watch(interval, self.shutdown.clone());
                    Arc::new(store)
                }
                KvBackend::Memory => {
                    let store = KvStore::new(Arc::new(MemoryKvClient::new()), &presets.kv.namespace).await?;
                    store.spawn_watch(interval, self.shutdown.clone());
                    Arc::new(store)
                }
            },
        };

        info!("Opened {} config store", backend);
        opened.insert(backend, store.clone());
        Ok(store)
    }
}

/// Fixed stores, for embedding and tests
pub struct StaticStores {
    file: Arc<dyn ConfigStore>,
    distributed: Arc<dyn ConfigStore>,
}

impl StaticStores {
    /// Serves the given stores regardless of presets
    pub fn new(file: Arc<dyn ConfigStore>, distributed: Arc<dyn ConfigStore>) -> Self {
        Self { file, distributed }
    }
}

#[async_trait]
impl StoreProvider for StaticStores {
    async fn open(&self, backend: StoreBackend) -> Result<Arc<dyn ConfigStore>, StoreError> {
        Ok(match backend {
            StoreBackend::File => self.file.clone(),
            StoreBackend::Distributed => self.distributed.clone(),
        })
    }
}

/// Copies every retained version from one store into another, oldest first.
///
/// Versions the target already holds are skipped.
pub async fn migrate(from: &dyn ConfigStore, to: &dyn ConfigStore) -> Result<usize, StoreError> {
    let floor = to.current_version().await?.unwrap_or(0);
    let mut copied = 0;

    for version in from.versions().await? {
        if version <= floor {
            continue;
        }
        let config = from.read(version).await?;
        to.commit(&config).await?;
        copied += 1;
    }

    if copied > 0 {
        info!(
            "Migrated {} config version(s) from {} to {} store",
            copied,
            from.backend(),
            to.backend()
        );
    }

    Ok(copied)
}

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to write {path}: {error}")]
    WriteFailed {
        path: String,
        error: String,
    },

    #[error("Failed to read {path}: {error}")]
    ReadFailed {
        path: String,
        error: String,
    },

    #[error("Config version {0} is not retained")]
    NotFound(u64),

    #[error("Stored config is corrupt: {0}")]
    Corrupt(String),

    #[error("Cannot commit version {attempted}: current version is {current}")]
    StaleVersion {
        current: u64,
        attempted: u64,
    },

    #[error("Current-version pointer moved during commit")]
    Conflict,

    #[error("Key-value store unavailable: {0}")]
    Unavailable(String),

    #[error("Key-value store call timed out")]
    Timeout,
}

impl StoreError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::model::fixtures::resolved;

    #[test]
    fn backend_follows_node_count() {
        assert_eq!(StoreBackend::for_node_count(1), StoreBackend::File);
        assert_eq!(StoreBackend::for_node_count(3), StoreBackend::Distributed);
    }

    #[tokio::test]
    async fn migration_copies_history_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = FileStore::open(dir.path().join("settings.json")).await.unwrap();
        for version in 1..=3 {
            file.commit(&resolved(version, &["a.example.com"])).await.unwrap();
        }

        let kv = KvStore::new(Arc::new(MemoryKvClient::new()), "/morio/config")
            .await
            .unwrap();
        assert_eq!(migrate(&file, &kv).await.unwrap(), 3);
        assert_eq!(migrate(&file, &kv).await.unwrap(), 0);
        assert_eq!(kv.current_version().await.unwrap(), Some(3));
        assert_eq!(kv.read_raw(2).await.unwrap(), file.read_raw(2).await.unwrap());
    }
}
