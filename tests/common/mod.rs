// tests/common/mod.rs

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use moriod::cluster::{
    ClusterError, Heartbeat, HeartbeatAction, HeartbeatReport, PeerClient, SyncRequest, SyncResponse,
};
use moriod::config::Presets;
use moriod::container::{ContainerError, ContainerInfo, ContainerSpec, EngineClient, ObservedState};
use moriod::resolver::model::ResolvedConfig;
use moriod::service::{Collaborators, Service};
use moriod::store::{ConfigStore, FileStore, KvStore, MemoryKvClient, StaticStores, StoreBackend, StoreError};
use tokio::sync::watch;

/// Container engine keeping containers in memory
#[derive(Default)]
pub struct FakeEngine {
    containers: Mutex<HashMap<String, ContainerInfo>>,
    hanging: Mutex<HashSet<String>>,
    next_id: AtomicU64,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `start` on the named container never return
    pub fn hang_on_start(&self, name: &str) {
        self.hanging.lock().unwrap().insert(name.to_string());
    }

    pub fn state_of(&self, name: &str) -> Option<ObservedState> {
        self.containers.lock().unwrap().get(name).map(|c| c.state)
    }

    fn transition(&self, id: &str, state: ObservedState) -> Result<(), ContainerError> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .values_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| ContainerError::NotFound(id.to_string()))?;
        container.state = state;
        Ok(())
    }

    fn name_of(&self, id: &str) -> Option<String> {
        self.containers
            .lock()
            .unwrap()
            .values()
            .find(|c| c.id == id)
            .map(|c| c.name.clone())
    }
}

#[async_trait]
impl EngineClient for FakeEngine {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, ContainerError> {
        Ok(self.containers.lock().unwrap().get(name).cloned())
    }

    async fn list_managed(&self) -> Result<Vec<ContainerInfo>, ContainerError> {
        Ok(self.containers.lock().unwrap().values().cloned().collect())
    }

    async fn pull(&self, _image: &str) -> Result<(), ContainerError> {
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, ContainerError> {
        let id = format!("{}-{}", spec.name, self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().unwrap().insert(
            spec.name.clone(),
            ContainerInfo {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                state: ObservedState::Created,
                service: Some(spec.name.clone()),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), ContainerError> {
        let hangs = self
            .name_of(id)
            .map_or(false, |name| self.hanging.lock().unwrap().contains(&name));
        if hangs {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.transition(id, ObservedState::Running)
    }

    async fn stop(&self, id: &str) -> Result<(), ContainerError> {
        self.transition(id, ObservedState::Stopped)
    }

    async fn pause(&self, id: &str) -> Result<(), ContainerError> {
        self.transition(id, ObservedState::Paused)
    }

    async fn unpause(&self, id: &str) -> Result<(), ContainerError> {
        self.transition(id, ObservedState::Running)
    }

    async fn kill(&self, id: &str) -> Result<(), ContainerError> {
        self.transition(id, ObservedState::Stopped)
    }
}

/// Peer transport that records syncs and accepts everything
#[derive(Default)]
pub struct RecordingPeers {
    pub synced: Mutex<Vec<(String, u64)>>,

    /// Makes every sync wait forever
    pub hang: bool,
}

#[async_trait]
impl PeerClient for RecordingPeers {
    async fn sync(&self, peer: &str, request: &SyncRequest) -> Result<SyncResponse, ClusterError> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.synced
            .lock()
            .unwrap()
            .push((peer.to_string(), request.config.version));
        Ok(SyncResponse {
            adopted: true,
            version: request.config.version,
        })
    }

    async fn heartbeat(&self, _peer: &str, heartbeat: &Heartbeat) -> Result<HeartbeatReport, ClusterError> {
        Ok(HeartbeatReport {
            issues: vec![],
            action: HeartbeatAction::None,
            leader: heartbeat.leader,
            config_version: heartbeat.config_version,
        })
    }
}

/// File store whose commits take a while
pub struct SlowStore {
    pub inner: FileStore,
    pub delay: Duration,
}

#[async_trait]
impl ConfigStore for SlowStore {
    fn backend(&self) -> StoreBackend {
        self.inner.backend()
    }

    async fn current_version(&self) -> Result<Option<u64>, StoreError> {
        self.inner.current_version().await
    }

    async fn read(&self, version: u64) -> Result<ResolvedConfig, StoreError> {
        self.inner.read(version).await
    }

    async fn read_raw(&self, version: u64) -> Result<Vec<u8>, StoreError> {
        self.inner.read_raw(version).await
    }

    async fn commit(&self, config: &ResolvedConfig) -> Result<(), StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.commit(config).await
    }

    async fn versions(&self) -> Result<Vec<u64>, StoreError> {
        self.inner.versions().await
    }

    async fn prune(&self, retain: usize) -> Result<usize, StoreError> {
        self.inner.prune(retain).await
    }

    fn watch(&self) -> watch::Receiver<Option<u64>> {
        self.inner.watch()
    }
}

/// Presets for a node rooted in `dir`, with short retry budgets
pub fn presets(dir: &std::path::Path, hostname: &str) -> Presets {
    let mut presets = Presets::default();
    presets.version = "0.1.0".to_string();
    presets.node_hostname = hostname.to_string();
    presets.config_root = dir.join("etc");
    presets.data_root = dir.join("data");
    presets.reconcile_interval_secs = 60;
    for policy in [
        &mut presets.retry.store,
        &mut presets.retry.engine,
        &mut presets.retry.propagation,
    ] {
        policy.max_attempts = 2;
        policy.initial_backoff_ms = 1;
        policy.max_backoff_ms = 5;
        policy.timeout_ms = 200;
    }
    presets
}

/// A running service with in-memory collaborators
pub struct Node {
    pub dir: tempfile::TempDir,
    pub service: Service,
    pub engine: Arc<FakeEngine>,
    pub peers: Arc<RecordingPeers>,
}

pub async fn node(hostname: &str) -> Node {
    node_with(hostname, FakeEngine::new()).await
}

pub async fn node_with(hostname: &str, engine: FakeEngine) -> Node {
    NodeBuilder::new(hostname).engine(engine).build().await
}

/// Node with non-default collaborators
pub struct NodeBuilder {
    hostname: String,
    engine: FakeEngine,
    peers: RecordingPeers,
    commit_delay: Duration,
    propagation_timeout_ms: Option<u64>,
}

impl NodeBuilder {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            engine: FakeEngine::new(),
            peers: RecordingPeers::default(),
            commit_delay: Duration::ZERO,
            propagation_timeout_ms: None,
        }
    }

    pub fn engine(mut self, engine: FakeEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Peers never answer syncs
    pub fn hanging_peers(mut self, timeout_ms: u64) -> Self {
        self.peers.hang = true;
        self.propagation_timeout_ms = Some(timeout_ms);
        self
    }

    /// File store commits take `delay`
    pub fn slow_commits(mut self, delay: Duration) -> Self {
        self.commit_delay = delay;
        self
    }

    pub async fn build(self) -> Node {
        let dir = tempfile::tempdir().unwrap();
        let mut presets = presets(dir.path(), &self.hostname);
        if let Some(timeout_ms) = self.propagation_timeout_ms {
            presets.retry.propagation.timeout_ms = timeout_ms;
        }
        if !self.commit_delay.is_zero() {
            presets.retry.store.timeout_ms = self.commit_delay.as_millis() as u64 * 10;
        }

        let file = SlowStore {
            inner: FileStore::open(presets.settings_document()).await.unwrap(),
            delay: self.commit_delay,
        };
        let stores = StaticStores::new(
            Arc::new(file),
            Arc::new(KvStore::new(Arc::new(MemoryKvClient::new()), "/morio").await.unwrap()),
        );
        let engine = Arc::new(self.engine);
        let peers = Arc::new(self.peers);

        let service = Service::with_collaborators(
            presets,
            Collaborators {
                stores: Arc::new(stores),
                engine: engine.clone(),
                peers: peers.clone(),
            },
        )
        .await
        .unwrap();

        Node {
            dir,
            service,
            engine,
            peers,
        }
    }
}
