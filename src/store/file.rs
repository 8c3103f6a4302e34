// src/store/file.rs

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error};

use crate::resolver::model::ResolvedConfig;
use crate::store::{ConfigStore, StoreBackend, StoreError};

/// On-disk document holding every retained version
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct VersionedDocument {
    current: Option<u64>,
    versions: BTreeMap<u64, String>,
}

/// File-backed store: one versioned JSON document, replaced atomically
pub struct FileStore {
    path: PathBuf,
    document: Mutex<VersionedDocument>,
    current: watch::Sender<Option<u64>>,
}

impl FileStore {
    /// Opens the document at `path`, starting empty when it does not exist
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let document = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<VersionedDocument>(&bytes)
                .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VersionedDocument::default(),
            Err(e) => {
                return Err(StoreError::ReadFailed {
                    path: path.to_string_lossy().into_owned(),
                    error: e.to_string(),
                })
            }
        };

        debug!(
            "Opened file store {} at version {:?}",
            path.display(),
            document.current
        );

        let (current, _) = watch::channel(document.current);

        Ok(Self {
            path,
            document: Mutex::new(document),
            current,
        })
    }

    /// Path of the backing document
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, document: &VersionedDocument) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(document).map_err(|e| StoreError::WriteFailed {
            path: self.path.to_string_lossy().into_owned(),
            error: e.to_string(),
        })?;

        write_atomic(&self.path, &bytes).await.map_err(|e| {
            error!("Failed to write {}: {}", self.path.display(), e);
            StoreError::WriteFailed {
                path: self.path.to_string_lossy().into_owned(),
                error: e.to_string(),
            }
        })
    }
}

/// Writes `bytes` to a temporary sibling of `path` and renames it into place
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e);
    }

    Ok(())
}

#[async_trait]
impl ConfigStore for FileStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::File
    }

    async fn current_version(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.document.lock().await.current)
    }

    async fn read(&self, version: u64) -> Result<ResolvedConfig, StoreError> {
        let raw = self.read_raw(version).await?;
        ResolvedConfig::from_bytes(&raw)
            .map_err(|e| StoreError::Corrupt(format!("version {}: {}", version, e)))
    }

    async fn read_raw(&self, version: u64) -> Result<Vec<u8>, StoreError> {
        let document = self.document.lock().await;
        document
            .versions
            .get(&version)
            .map(|raw| raw.as_bytes().to_vec())
            .ok_or(StoreError::NotFound(version))
    }

    async fn commit(&self, config: &ResolvedConfig) -> Result<(), StoreError> {
        let raw = config
            .to_bytes()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let raw = String::from_utf8(raw).map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let mut document = self.document.lock().await;

        // Check the version moves forward
        let current = document.current.unwrap_or(0);
        if config.version <= current {
            return Err(StoreError::StaleVersion {
                current,
                attempted: config.version,
            });
        }

        // Persist a copy first; the cached document only changes on success
        let mut next = document.clone();
        next.versions.insert(config.version, raw);
        next.current = Some(config.version);
        self.persist(&next).await?;
        *document = next;

        self.current.send_replace(Some(config.version));
        debug!(version = config.version, "Committed config to {}", self.path.display());

        Ok(())
    }

    async fn versions(&self) -> Result<Vec<u64>, StoreError> {
        Ok(self.document.lock().await.versions.keys().copied().collect())
    }

    async fn prune(&self, retain: usize) -> Result<usize, StoreError> {
        let mut document = self.document.lock().await;
        let retain = retain.max(1);
        let excess = document.versions.len().saturating_sub(retain);
        if excess == 0 {
            return Ok(0);
        }

        let mut next = document.clone();
        let doomed: Vec<u64> = next.versions.keys().take(excess).copied().collect();
        for version in &doomed {
            next.versions.remove(version);
        }
        self.persist(&next).await?;
        *document = next;

        debug!("Pruned {} config version(s)", doomed.len());
        Ok(doomed.len())
    }

    fn watch(&self) -> watch::Receiver<Option<u64>> {
        self.current.subscribe()
    }
}
