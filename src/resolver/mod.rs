// src/resolver/mod.rs

/// Default service catalogue
pub mod defaults;
/// Resolved config types
pub mod model;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::settings::RawSettings;
use crate::config::validator::SettingsValidator;
use crate::config::{ConfigError, Presets};
use crate::retry::{retry, Attempt, RetryError};
use crate::status::{Component, StatusReporter};
use crate::store::{migrate, ConfigStore, StoreBackend, StoreError, StoreProvider};

use model::{ClusterIdentity, DeploymentMode, NodeDescriptor, NodeRole, ResolvedConfig};

/// Resolution engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    /// Nothing resolved yet
    Ephemeral,

    /// A resolution is in flight
    Resolving,

    /// A resolved config is authoritative
    Operational,

    /// The last resolution failed; the prior version, if any, stays authoritative
    Degraded,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Ephemeral => write!(f, "ephemeral"),
            EngineState::Resolving => write!(f, "resolving"),
            EngineState::Operational => write!(f, "operational"),
            EngineState::Degraded => write!(f, "degraded"),
        }
    }
}

/// Turns operator settings into versioned, immutable resolved configs.
///
/// One resolution runs at a time system-wide. Published snapshots only ever
/// move forward.
pub struct ResolutionEngine {
    presets: Arc<Presets>,
    validator: SettingsValidator,
    stores: Arc<dyn StoreProvider>,
    token: Mutex<()>,
    state: watch::Sender<EngineState>,
    snapshot: watch::Sender<Option<Arc<ResolvedConfig>>>,
    status: StatusReporter,
}

impl ResolutionEngine {
    /// Creates an engine; call `boot` before anything else
    pub fn new(presets: Arc<Presets>, stores: Arc<dyn StoreProvider>, status: StatusReporter) -> Self {
        let (state, _) = watch::channel(EngineState::Ephemeral);
        let (snapshot, _) = watch::channel(None);

        Self {
            validator: SettingsValidator::from_presets(&presets),
            presets,
            stores,
            token: Mutex::new(()),
            state,
            snapshot,
            status,
        }
    }

    /// Loads the persisted config, falling back to the bootstrap file, and
    /// stays ephemeral when neither exists
    pub async fn boot(&self) -> Result<EngineState, ResolveError> {
        let file = self.open_store(StoreBackend::File).await?;
        let local = self
            .with_store_retry("read local config", || file.read_current())
            .await?;

        let mut config = match local {
            Some(config) => config,
            None => {
                return match self.presets.read_bootstrap()? {
                    Some(settings) => {
                        info!("No persisted config, resolving bootstrap settings");
                        self.resolve(settings).await?;
                        Ok(EngineState::Operational)
                    }
                    None => {
                        info!("No persisted config and no bootstrap settings, running ephemeral");
                        self.set_state(EngineState::Ephemeral);
                        Ok(EngineState::Ephemeral)
                    }
                };
            }
        };

        // A clustered node may have missed versions while it was down
        if config.mode == DeploymentMode::Clustered {
            match self.newer_from_distributed(config.version).await {
                Ok(Some(remote)) => {
                    if let Err(e) = file.commit(&remote).await {
                        warn!("Failed to mirror version {} locally: {}", remote.version, e);
                    }
                    config = remote;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Distributed store unreachable at boot, serving local copy: {}", e);
                    self.status.failing(Component::Store, e.to_string());
                }
            }
        }

        info!(version = config.version, mode = %config.mode, "Loaded persisted config");
        self.publish(Arc::new(config));
        self.set_state(EngineState::Operational);
        Ok(EngineState::Operational)
    }

    async fn newer_from_distributed(&self, than: u64) -> Result<Option<ResolvedConfig>, ResolveError> {
        let store = self.open_store(StoreBackend::Distributed).await?;
        let remote = self
            .with_store_retry("read distributed config", || store.read_current())
            .await?;
        Ok(remote.filter(|remote| remote.version > than))
    }

    /// Validates settings and publishes them as the next version.
    ///
    /// Fails with `ResolutionInProgress` while another resolution runs.
    /// Validation failures change nothing; persistence failures leave the
    /// prior version authoritative and the engine degraded.
    pub async fn resolve(&self, settings: RawSettings) -> Result<Arc<ResolvedConfig>, ResolveError> {
        let _token = self
            .token
            .try_lock()
            .map_err(|_| ResolveError::ResolutionInProgress)?;

        // Check the settings before touching anything
        let settings = settings.normalized();
        self.validator.validate(&settings)?;
        if !settings.declares(&self.presets.node_hostname) {
            return Err(ResolveError::InvalidSettings(format!(
                "this node ({}) is not one of the declared nodes",
                self.presets.node_hostname
            )));
        }

        self.set_state(EngineState::Resolving);
        let previous = self.current();

        match self.apply(settings, previous.as_deref()).await {
            Ok(config) => {
                let config = Arc::new(config);
                self.publish(config.clone());
                self.set_state(EngineState::Operational);
                self.status.ok(Component::Store);
                metrics::increment_counter!("morio_resolutions_total");
                info!(
                    version = config.version,
                    mode = %config.mode,
                    nodes = config.nodes.len(),
                    "Published resolved config"
                );
                Ok(config)
            }
            Err(e) => {
                error!("Resolution failed, prior version stays authoritative: {}", e);
                self.status.failing(Component::Store, e.to_string());
                self.set_state(EngineState::Degraded);
                Err(e)
            }
        }
    }

    /// Persists the next version on the backend the node count requires
    async fn apply(&self, settings: RawSettings, previous: Option<&ResolvedConfig>) -> Result<ResolvedConfig, ResolveError> {
        let backend = StoreBackend::for_node_count(settings.cluster.broker_nodes.len());
        let target = self.open_store(backend).await?;

        // Carry history over when the backend changes
        if let Some(previous) = previous {
            let source = StoreBackend::for_node_count(previous.broker_count());
            if source != backend {
                info!("Switching config store from {} to {}", source, backend);
                let source = self.open_store(source).await?;
                self.with_store_retry("migrate config history", || migrate(source.as_ref(), target.as_ref()))
                    .await?;
            }
        }

        let stored = self
            .with_store_retry("read current version", || target.current_version())
            .await?
            .unwrap_or(0);
        let floor = previous.map(|p| p.version).unwrap_or(0).max(stored);

        let config = self.build(settings, previous, floor + 1);
        self.with_store_retry("commit config", || target.commit(&config))
            .await?;

        if backend == StoreBackend::Distributed {
            self.mirror_locally(&config).await;
        }

        match target.prune(self.presets.history_retention).await {
            Ok(0) => {}
            Ok(pruned) => debug!("Pruned {} old config version(s)", pruned),
            Err(e) => warn!("Failed to prune config history: {}", e),
        }

        Ok(config)
    }

    /// Builds the resolved config; node ids carry over by hostname
    fn build(&self, settings: RawSettings, previous: Option<&ResolvedConfig>, version: u64) -> ResolvedConfig {
        let mode = settings.implied_mode();
        let brokers = settings.cluster.broker_nodes.len();

        let leader = settings
            .cluster
            .leader
            .clone()
            .or_else(|| {
                previous
                    .and_then(|p| p.leader())
                    .map(|node| node.hostname.clone())
                    .filter(|hostname| settings.cluster.broker_nodes.contains(hostname))
            })
            .or_else(|| settings.cluster.broker_nodes.first().cloned());

        let nodes: Vec<NodeDescriptor> = settings
            .declared_nodes()
            .enumerate()
            .map(|(index, hostname)| {
                let known = previous.and_then(|p| p.node(hostname));
                let role = if leader.as_deref() == Some(hostname) {
                    NodeRole::Leader
                } else {
                    NodeRole::Follower
                };

                NodeDescriptor {
                    id: known.map(|n| n.id).unwrap_or_else(Uuid::new_v4),
                    serial: index as u32 + 1,
                    hostname: hostname.to_string(),
                    role,
                    flanking: index >= brokers,
                    certificate_fingerprint: settings
                        .cluster
                        .fingerprints
                        .get(hostname)
                        .cloned()
                        .or_else(|| known.and_then(|n| n.certificate_fingerprint.clone())),
                    last_seen: known.and_then(|n| n.last_seen),
                }
            })
            .collect();

        let local_flanking = settings
            .cluster
            .flanking_nodes
            .iter()
            .any(|node| node.eq_ignore_ascii_case(&self.presets.node_hostname));

        ResolvedConfig {
            version,
            mode,
            cluster: ClusterIdentity {
                uuid: previous.map(|p| p.cluster.uuid).unwrap_or_else(Uuid::new_v4),
                name: settings.cluster.name.clone(),
                fqdn: settings.cluster.fqdn.clone(),
            },
            nodes,
            services: defaults::services_for(
                &settings,
                mode,
                &self.presets.node_hostname,
                local_flanking,
                &self.presets.version,
            ),
            settings,
            created_at: Utc::now(),
        }
    }

    /// Accepts a config resolved elsewhere (the leader). Only a strictly
    /// newer version is taken; returns whether it was.
    pub async fn adopt(&self, config: ResolvedConfig) -> Result<bool, ResolveError> {
        let _token = self
            .token
            .try_lock()
            .map_err(|_| ResolveError::ResolutionInProgress)?;

        if self.current().map_or(false, |current| current.version >= config.version) {
            debug!(version = config.version, "Ignoring config that is not newer");
            return Ok(false);
        }

        let file = self.open_store(StoreBackend::File).await?;
        self.with_store_retry("store adopted config", || file.commit(&config))
            .await?;

        info!(version = config.version, "Adopted config from the leader");
        self.publish(Arc::new(config));
        self.set_state(EngineState::Operational);
        Ok(true)
    }

    /// Re-reads the distributed store and adopts a newer version if present
    pub async fn refresh(&self) -> Result<bool, ResolveError> {
        let current = match self.current() {
            Some(current) if current.mode == DeploymentMode::Clustered => current,
            _ => return Ok(false),
        };

        match self.newer_from_distributed(current.version).await? {
            Some(remote) => self.adopt(remote).await,
            None => Ok(false),
        }
    }

    /// Follows the distributed store so versions committed by other nodes
    /// are picked up; ends when `shutdown` flips to true
    pub fn spawn_store_follower(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut snapshots = self.subscribe();
            loop {
                let clustered = self
                    .current()
                    .map_or(false, |c| c.mode == DeploymentMode::Clustered);
                let mut versions = if clustered {
                    match self.stores.open(StoreBackend::Distributed).await {
                        Ok(store) => Some(store.watch()),
                        Err(e) => {
                            warn!("Cannot follow distributed store: {}", e);
                            None
                        }
                    }
                } else {
                    None
                };

                let moved = async {
                    match versions.as_mut() {
                        Some(versions) => versions.changed().await.is_ok(),
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = snapshots.changed() => {}
                    moved = moved => {
                        if !moved {
                            continue;
                        }
                        match self.refresh().await {
                            Ok(true) => debug!("Picked up a newer config from the distributed store"),
                            Ok(false) => {}
                            Err(ResolveError::ResolutionInProgress) => {}
                            Err(e) => warn!("Failed to refresh from distributed store: {}", e),
                        }
                    }
                }
            }
            debug!("Store follower stopped");
        })
    }

    async fn mirror_locally(&self, config: &ResolvedConfig) {
        let result = match self.stores.open(StoreBackend::File).await {
            Ok(file) => file.commit(config).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(version = config.version, "Failed to keep a local copy of the config: {}", e);
        }
    }

    /// Current resolved config, if any
    pub fn current(&self) -> Option<Arc<ResolvedConfig>> {
        self.snapshot.borrow().clone()
    }

    /// Current resolved config, or `EphemeralModeRequired` while none exists
    pub fn require_current(&self) -> Result<Arc<ResolvedConfig>, ResolveError> {
        self.current().ok_or(ResolveError::EphemeralModeRequired)
    }

    /// Receives every newly published config
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ResolvedConfig>>> {
        self.snapshot.subscribe()
    }

    /// Current engine state
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Receives every engine state change
    pub fn subscribe_state(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Presets the engine runs with
    pub fn presets(&self) -> &Presets {
        &self.presets
    }

    /// Retained versions on the backend currently in use
    pub async fn history(&self) -> Result<Vec<u64>, ResolveError> {
        let store = self.current_store().await?;
        Ok(store.versions().await?)
    }

    /// Exact bytes of a retained version
    pub async fn read_raw(&self, version: u64) -> Result<Vec<u8>, ResolveError> {
        let store = self.current_store().await?;
        Ok(store.read_raw(version).await?)
    }

    async fn current_store(&self) -> Result<Arc<dyn ConfigStore>, ResolveError> {
        let current = self.require_current()?;
        self.open_store(StoreBackend::for_node_count(current.broker_count()))
            .await
    }

    async fn open_store(&self, backend: StoreBackend) -> Result<Arc<dyn ConfigStore>, ResolveError> {
        let stores = self.stores.clone();
        self.with_store_retry("open config store", || {
            let stores = stores.clone();
            async move { stores.open(backend).await }
        })
        .await
    }

    fn publish(&self, config: Arc<ResolvedConfig>) {
        let version = config.version;
        let published = self.snapshot.send_if_modified(|current| {
            if current.as_ref().map_or(true, |c| c.version < version) {
                *current = Some(config);
                true
            } else {
                false
            }
        });

        if published {
            metrics::gauge!("morio_config_version", version as f64);
        }
    }

    fn set_state(&self, state: EngineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Resolution engine {} -> {}", previous, state);
        }
        self.status.engine(state);
    }

    async fn with_store_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, ResolveError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        retry(&self.presets.retry.store, what, |_| {
            let call = op();
            async move {
                match call.await {
                    Ok(value) => Attempt::Done(value),
                    Err(e) if e.is_transient() => Attempt::Transient(e),
                    Err(e) => Attempt::Fatal(e),
                }
            }
        })
        .await
        .map_err(|e| match e {
            RetryError::Fatal(e) => ResolveError::from(e),
            RetryError::Exhausted { attempts, last } => {
                ResolveError::StoreUnavailable(format!("{} failed after {} attempts: {}", what, attempts, last))
            }
            RetryError::TimedOut { attempt, timeout } => ResolveError::StoreUnavailable(format!(
                "{} timed out after {:?} (attempt {})",
                what, timeout, attempt
            )),
        })
    }
}

/// Resolution errors
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("This operation requires a resolved configuration")]
    EphemeralModeRequired,

    #[error("Another resolution is in progress")]
    ResolutionInProgress,

    #[error("Failed to write {path}: {error}")]
    FilesystemWriteFailed {
        path: String,
        error: String,
    },

    #[error("Config store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Config store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ResolveError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::WriteFailed { path, error } => ResolveError::FilesystemWriteFailed { path, error },
            other => ResolveError::Store(other),
        }
    }
}

impl From<ConfigError> for ResolveError {
    fn from(e: ConfigError) -> Self {
        ResolveError::InvalidSettings(e.to_string())
    }
}
