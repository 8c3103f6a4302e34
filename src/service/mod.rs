// src/service/mod.rs

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ca::{
    self, CaError, CertificateAuthority, CertificateRecord, CertificateRequest, IssuedCertificate, IssuedTo,
    RootRotation, RotationReport,
};
use crate::cluster::{
    spawn_heartbeat, ClusterCoordinator, ClusterError, Heartbeat, HeartbeatReport, HttpPeerClient, JoinOutcome,
    JoinRequest, PeerClient, PropagationReport, SyncRequest, SyncResponse,
};
use crate::config::{ConfigError, Presets, RawSettings};
use crate::container::{
    spawn_reconciler, ContainerError, ContainerObservation, DockerEngineClient, EngineClient, LifecycleController,
    LifecycleOp,
};
use crate::resolver::model::{CertificateIdentity, DeploymentMode, ResolvedConfig};
use crate::resolver::{EngineState, ResolutionEngine, ResolveError};
use crate::status::{StatusAggregator, StatusColor};
use crate::store::{PresetStores, StoreError, StoreProvider};

/// Service command for inter-component communication
#[derive(Debug)]
pub enum ServiceCommand {
    /// Initial setup of an ephemeral node
    Setup(RawSettings, oneshot::Sender<Result<SetupOutcome, ServiceError>>),

    /// Resolve new settings on an operational node
    Deploy(RawSettings, oneshot::Sender<Result<DeployOutcome, ServiceError>>),

    /// Issue a certificate from the internal CA
    IssueCertificate(CertificateRequest, oneshot::Sender<Result<IssuedCertificate, ServiceError>>),

    /// Revoke a certificate by serial
    RevokeCertificate(u64, oneshot::Sender<Result<CertificateRecord, ServiceError>>),

    /// Replace the CA root
    RotateRoot(RootRotation, oneshot::Sender<Result<RotationReport, ServiceError>>),

    /// Apply a lifecycle operation to a service
    Apply(String, LifecycleOp, oneshot::Sender<Result<ContainerObservation, ServiceError>>),

    /// Admit a broker node
    Join(JoinRequest, oneshot::Sender<Result<JoinOutcome, ServiceError>>),

    /// Answer a follower's heartbeat
    Heartbeat(Heartbeat, oneshot::Sender<Result<HeartbeatReport, ServiceError>>),

    /// Accept a snapshot pushed by the leader
    Sync(SyncRequest, oneshot::Sender<Result<SyncResponse, ServiceError>>),

    /// Hand leadership to another broker
    TransferLeadership(String, oneshot::Sender<Result<PropagationReport, ServiceError>>),

    /// Shutdown the service
    Shutdown(oneshot::Sender<Result<(), ServiceError>>),
}

/// Result of a setup
#[derive(Debug, Clone)]
pub struct SetupOutcome {
    /// First resolved config
    pub config: Arc<ResolvedConfig>,

    /// Fingerprint of the CA root
    pub root_fingerprint: String,

    /// Fingerprint of the local node certificate
    pub node_fingerprint: String,

    /// Peers reached with the first version, when clustered
    pub propagation: Option<PropagationReport>,
}

/// Result of a deploy
#[derive(Debug, Clone)]
pub struct DeployOutcome {
    /// Newly resolved config
    pub config: Arc<ResolvedConfig>,
    /// Peers reached with the new version, when clustered
    pub propagation: Option<PropagationReport>,
}

/// A failing component as shown in the status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentFailure {
    /// Failing component, as `kind:name`
    pub component: String,

    /// Service status code, when the component is a service
    pub code: Option<u16>,

    /// Last error reported
    pub reason: String,
}

/// Node status as shown to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Numeric status code
    pub code: u16,
    /// Human readable status
    pub description: String,
    /// Color for dashboards
    pub color: StatusColor,
    /// Resolution engine state
    pub engine: Option<EngineState>,
    /// Version this node serves
    pub config_version: Option<u64>,
    /// Deployment mode this node runs in
    pub mode: Option<DeploymentMode>,
    /// Hostname of the leader
    pub leader: Option<String>,

    /// Whether this follower lost contact with the leader
    pub stale: bool,

    /// Components currently failing
    pub failures: Vec<ComponentFailure>,
}

/// Collaborators the daemon talks to
pub struct Collaborators {
    /// Config stores
    pub stores: Arc<dyn StoreProvider>,
    /// Container engine
    pub engine: Arc<dyn EngineClient>,
    /// Transport to other nodes
    pub peers: Arc<dyn PeerClient>,
}

/// Main service coordination layer
pub struct Service {
    /// Service command channel
    command_tx: mpsc::Sender<ServiceCommand>,

    /// Read directly for status, so it never waits behind a command
    core: Arc<Core>,
}

/// Components every command handler works with
struct Core {
    presets: Arc<Presets>,

    resolver: Arc<ResolutionEngine>,

    /// Certificate Authority
    ca: Arc<CertificateAuthority>,

    controller: Arc<LifecycleController>,

    coordinator: Arc<ClusterCoordinator>,

    status: StatusAggregator,
}

/// Service implementation for the core daemon.
///
/// Commands run in their own tasks: a slow propagation never holds up
/// other commands, and concurrent resolutions meet at the resolver's
/// mutual-exclusion token.
struct ServiceImpl {
    core: Arc<Core>,

    /// Flips to true on shutdown; every background task watches it
    shutdown: watch::Sender<bool>,

    /// Background tasks joined on shutdown
    tasks: Vec<(&'static str, JoinHandle<()>)>,

    /// Commands still being handled
    in_flight: Vec<JoinHandle<()>>,

    /// Service command channel
    command_rx: mpsc::Receiver<ServiceCommand>,
}

impl Service {
    /// Creates the service with the collaborators the presets describe
    pub async fn new(presets: Presets) -> Result<Self, ServiceError> {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let engine = DockerEngineClient::new(
            &presets.engine.url,
            &presets.engine.api_version,
            presets.retry.engine.timeout(),
        )?;
        let peers = HttpPeerClient::new(presets.cluster.peer_port, presets.retry.propagation.timeout());
        let stores = PresetStores::new(presets.clone(), shutdown_rx);

        let collaborators = Collaborators {
            stores: Arc::new(stores),
            engine: Arc::new(engine),
            peers: Arc::new(peers),
        };
        Self::assemble(presets, collaborators, shutdown).await
    }

    /// Creates the service around the given collaborators
    pub async fn with_collaborators(presets: Presets, collaborators: Collaborators) -> Result<Self, ServiceError> {
        let (shutdown, _) = watch::channel(false);
        Self::assemble(presets, collaborators, shutdown).await
    }

    async fn assemble(
        presets: Presets,
        collaborators: Collaborators,
        shutdown: watch::Sender<bool>,
    ) -> Result<Self, ServiceError> {
        // Create command channel
        let (command_tx, command_rx) = mpsc::channel(1000);
        let presets = Arc::new(presets);
        let status = StatusAggregator::new();

        // Load the last known config, or stay ephemeral
        let resolver = Arc::new(ResolutionEngine::new(
            presets.clone(),
            collaborators.stores,
            status.reporter(),
        ));
        let state = resolver.boot().await?;
        info!(node = %presets.node_hostname, "Booted in {} state", state);

        let ca = Arc::new(CertificateAuthority::open(presets.ca_dir(), &presets.certificates).await?);

        let controller = Arc::new(LifecycleController::new(
            collaborators.engine,
            ca.clone(),
            resolver.clone(),
            presets.clone(),
            status.reporter(),
        ));

        let coordinator = Arc::new(ClusterCoordinator::new(
            resolver.clone(),
            collaborators.peers,
            presets.clone(),
            status.reporter(),
            shutdown.subscribe(),
        ));

        let tasks = vec![
            ("reconciler", spawn_reconciler(controller.clone(), shutdown.subscribe())),
            ("heartbeat", spawn_heartbeat(coordinator.clone(), shutdown.subscribe())),
            ("store follower", resolver.clone().spawn_store_follower(shutdown.subscribe())),
        ];

        let core = Arc::new(Core {
            presets,
            resolver,
            ca,
            controller,
            coordinator,
            status,
        });

        // Create service implementation
        let service_impl = ServiceImpl {
            core: core.clone(),
            shutdown,
            tasks,
            in_flight: Vec::new(),
            command_rx,
        };

        // Start service implementation
        tokio::spawn(service_impl.run());

        Ok(Self { command_tx, core })
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, ServiceError>>) -> ServiceCommand,
    ) -> Result<T, ServiceError> {
        let (tx, rx) = oneshot::channel();

        self.command_tx
            .send(command(tx))
            .await
            .map_err(|_| ServiceError::ChannelClosed)?;

        rx.await.map_err(|_| ServiceError::ResponseChannelClosed)?
    }

    /// Sets up an ephemeral node with its first settings
    pub async fn setup(&self, settings: RawSettings) -> Result<SetupOutcome, ServiceError> {
        self.request(|tx| ServiceCommand::Setup(settings, tx)).await
    }

    /// Deploys new settings on an operational node
    pub async fn deploy(&self, settings: RawSettings) -> Result<DeployOutcome, ServiceError> {
        self.request(|tx| ServiceCommand::Deploy(settings, tx)).await
    }

    /// Issues a certificate
    pub async fn issue_certificate(&self, request: CertificateRequest) -> Result<IssuedCertificate, ServiceError> {
        self.request(|tx| ServiceCommand::IssueCertificate(request, tx)).await
    }

    /// Revokes a certificate
    pub async fn revoke_certificate(&self, serial: u64) -> Result<CertificateRecord, ServiceError> {
        self.request(|tx| ServiceCommand::RevokeCertificate(serial, tx)).await
    }

    /// Replaces the CA root
    pub async fn rotate_root(&self, rotation: RootRotation) -> Result<RotationReport, ServiceError> {
        self.request(|tx| ServiceCommand::RotateRoot(rotation, tx)).await
    }

    /// Applies a lifecycle operation to a service
    pub async fn apply(&self, service: &str, op: LifecycleOp) -> Result<ContainerObservation, ServiceError> {
        let service = service.to_string();
        self.request(|tx| ServiceCommand::Apply(service, op, tx)).await
    }

    /// Admits a broker node
    pub async fn join(&self, request: JoinRequest) -> Result<JoinOutcome, ServiceError> {
        self.request(|tx| ServiceCommand::Join(request, tx)).await
    }

    /// Answers a follower's heartbeat
    pub async fn heartbeat(&self, heartbeat: Heartbeat) -> Result<HeartbeatReport, ServiceError> {
        self.request(|tx| ServiceCommand::Heartbeat(heartbeat, tx)).await
    }

    /// Accepts a snapshot pushed by the leader
    pub async fn sync(&self, request: SyncRequest) -> Result<SyncResponse, ServiceError> {
        self.request(|tx| ServiceCommand::Sync(request, tx)).await
    }

    /// Hands leadership to another broker
    pub async fn transfer_leadership(&self, hostname: &str) -> Result<PropagationReport, ServiceError> {
        let hostname = hostname.to_string();
        self.request(|tx| ServiceCommand::TransferLeadership(hostname, tx)).await
    }

    /// Gets the node status
    pub async fn status(&self) -> Result<StatusReport, ServiceError> {
        Ok(self.core.status_report().await)
    }

    /// Stops background work and the service loop
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.request(ServiceCommand::Shutdown).await
    }
}

fn reply<T>(response_tx: oneshot::Sender<Result<T, ServiceError>>, result: Result<T, ServiceError>, what: &str) {
    if response_tx.send(result).is_err() {
        error!("Failed to send {} response", what);
    }
}

impl ServiceImpl {
    /// Runs the service implementation
    async fn run(mut self) {
        info!("Service started");

        while let Some(command) = self.command_rx.recv().await {
            self.in_flight.retain(|handle| !handle.is_finished());

            match command {
                ServiceCommand::Shutdown(response_tx) => {
                    let result = self.handle_shutdown().await;
                    reply(response_tx, result, "shutdown");

                    // Exit the service loop
                    break;
                }
                command => {
                    let core = self.core.clone();
                    self.in_flight.push(tokio::spawn(core.handle(command)));
                }
            }
        }

        info!("Service stopped");
    }

    /// Handles shutting down the service
    async fn handle_shutdown(&mut self) -> Result<(), ServiceError> {
        // Tell every background task to stop
        self.shutdown.send_replace(true);

        for (name, handle) in self.tasks.drain(..) {
            match handle.await {
                Ok(()) => debug!("Stopped {}", name),
                Err(e) => error!("Task {} failed: {}", name, e),
            }
        }

        // Propagations give up on shutdown, so these finish promptly
        for handle in self.in_flight.drain(..) {
            if let Err(e) = handle.await {
                error!("Command handler failed: {}", e);
            }
        }

        info!(
            "Stopped with {} container(s) observed",
            self.core.controller.observations().await.len()
        );
        Ok(())
    }
}

impl Core {
    /// Handles one command and sends the reply
    async fn handle(self: Arc<Self>, command: ServiceCommand) {
        match command {
            ServiceCommand::Setup(settings, response_tx) => {
                let result = self.handle_setup(settings).await;
                reply(response_tx, result, "setup");
            }
            ServiceCommand::Deploy(settings, response_tx) => {
                let result = self.handle_deploy(settings).await;
                reply(response_tx, result, "deploy");
            }
            ServiceCommand::IssueCertificate(request, response_tx) => {
                let result = self.ca.issue_certificate(&request).await.map_err(ServiceError::from);
                reply(response_tx, result, "issue certificate");
            }
            ServiceCommand::RevokeCertificate(serial, response_tx) => {
                let result = self.ca.revoke(serial).await.map_err(ServiceError::from);
                reply(response_tx, result, "revoke certificate");
            }
            ServiceCommand::RotateRoot(rotation, response_tx) => {
                let result = self.ca.rotate_root(&rotation).await.map_err(ServiceError::from);
                reply(response_tx, result, "rotate root");
            }
            ServiceCommand::Apply(service, op, response_tx) => {
                let result = self.controller.apply(&service, op).await.map_err(ServiceError::from);
                reply(response_tx, result, "lifecycle");
            }
            ServiceCommand::Join(request, response_tx) => {
                let result = self.coordinator.join(request).await.map_err(ServiceError::from);
                reply(response_tx, result, "join");
            }
            ServiceCommand::Heartbeat(heartbeat, response_tx) => {
                let result = self
                    .coordinator
                    .receive_heartbeat(heartbeat)
                    .await
                    .map_err(ServiceError::from);
                reply(response_tx, result, "heartbeat");
            }
            ServiceCommand::Sync(request, response_tx) => {
                let result = self.coordinator.accept_sync(request).await.map_err(ServiceError::from);
                reply(response_tx, result, "sync");
            }
            ServiceCommand::TransferLeadership(hostname, response_tx) => {
                let result = self
                    .coordinator
                    .transfer_leadership(&hostname)
                    .await
                    .map_err(ServiceError::from);
                reply(response_tx, result, "leadership transfer");
            }
            ServiceCommand::Shutdown(response_tx) => {
                // The command loop owns shutdown
                reply(response_tx, Ok(()), "shutdown");
            }
        }
    }

    /// Handles the initial setup: CA root, node certificate, first version
    async fn handle_setup(&self, settings: RawSettings) -> Result<SetupOutcome, ServiceError> {
        // Check the node is still waiting for setup
        if self.resolver.current().is_some() {
            return Err(ServiceError::AlreadySetUp);
        }

        // Check this node is one of the declared nodes
        let hostname = self.presets.node_hostname.clone();
        if !settings.declares(&hostname) {
            return Err(ServiceError::FqdnMismatch(hostname));
        }

        let root_fingerprint = self.ca.ensure_root().await?;

        // Issue the node certificate
        let mut san = vec![hostname.clone()];
        if let Some(fqdn) = settings.cluster.fqdn.as_deref() {
            san.push(fqdn.to_string());
        }
        let san: Vec<&str> = san.iter().map(String::as_str).collect();
        let mut request = CertificateRequest::for_identity(
            &CertificateIdentity::named(&hostname, &san),
            self.ca.subject_defaults(),
            IssuedTo::Service("core".to_string()),
        );
        request.lifetime = Some(self.presets.certificates.lifetime_max.clone());
        let issued = self.ca.issue_certificate(&request).await?;
        ca::write_service_material(&self.presets.service_dir("core"), &issued).await?;
        let node_fingerprint = issued.record.fingerprint.clone();

        let settings = settings.with_fingerprint(&hostname, &node_fingerprint);
        let config = self.resolver.resolve(settings).await?;
        info!(version = config.version, mode = %config.mode, "Setup complete");

        let propagation = self.propagate(&config).await;
        Ok(SetupOutcome {
            config,
            root_fingerprint,
            node_fingerprint,
            propagation,
        })
    }

    /// Handles a deploy of new settings
    async fn handle_deploy(&self, settings: RawSettings) -> Result<DeployOutcome, ServiceError> {
        let current = self.resolver.require_current()?;

        // Followers take their settings from the leader
        if current.mode == DeploymentMode::Clustered && !self.coordinator.is_leader() {
            return Err(ClusterError::NotLeader {
                leader: current.leader().map(|node| node.hostname.clone()),
            }
            .into());
        }

        let config = self.resolver.resolve(settings).await?;
        let propagation = self.propagate(&config).await;
        Ok(DeployOutcome { config, propagation })
    }

    async fn propagate(&self, config: &Arc<ResolvedConfig>) -> Option<PropagationReport> {
        if config.mode != DeploymentMode::Clustered {
            return None;
        }

        let report = self.coordinator.propagate(config.clone()).await;
        if !report.is_complete() {
            warn!(
                version = report.version,
                "Version not delivered to {} peer(s)",
                report.failed.len()
            );
        }
        Some(report)
    }

    /// Builds the status report from the shared status board
    async fn status_report(&self) -> StatusReport {
        let snapshot = self.status.snapshot();
        let code = crate::status::current_status(&snapshot);
        let config = self.resolver.current();

        let failures = snapshot
            .failures()
            .map(|(component, reason)| ComponentFailure {
                component: component.to_string(),
                code: Some(component.code()),
                reason: reason.to_string(),
            })
            .collect();

        StatusReport {
            code: code.code(),
            description: code.description().to_string(),
            color: code.color(),
            engine: snapshot.engine,
            config_version: config.as_ref().map(|c| c.version),
            mode: config.as_ref().map(|c| c.mode),
            leader: config
                .as_ref()
                .and_then(|c| c.leader())
                .map(|node| node.hostname.clone()),
            stale: self.coordinator.is_stale().await,
            failures,
        }
    }
}

/// Error during service operations
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("This endpoint is only available in ephemeral mode")]
    AlreadySetUp,

    #[error("This node ({0}) is not one of the declared nodes")]
    FqdnMismatch(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Ca(#[from] CaError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Response channel closed")]
    ResponseChannelClosed,
}

impl ServiceError {
    /// Stable identifier shown to operators
    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::AlreadySetUp => "morio.core.ephemeral.required",
            ServiceError::FqdnMismatch(_) => "morio.core.settings.fqdn.mismatch",
            ServiceError::Config(e) => config_code(e),
            ServiceError::Store(e) => store_code(e),
            ServiceError::Resolve(e) => resolve_code(e),
            ServiceError::Ca(e) => match e {
                CaError::ValidationError(_) => "morio.core.ca.request.invalid",
                CaError::SigningError(_) => "morio.core.ca.signing.failed",
                CaError::NotInitialized => "morio.core.ca.root.missing",
                CaError::RootKeyCorrupt(_) | CaError::StateCorrupt(_) => "morio.core.ca.root.corrupt",
                CaError::UnknownSerial(_) => "morio.core.ca.serial.unknown",
                CaError::RotationNotConfirmed => "morio.core.ca.rotation.unconfirmed",
                CaError::InvalidLifetime(_) => "morio.core.ca.lifetime.invalid",
                CaError::FilesystemWriteFailed { .. } => "morio.core.fs.write.failed",
                CaError::ReadFailed { .. } => "morio.core.fs.read.failed",
            },
            ServiceError::Container(e) => match e {
                ContainerError::UnknownService(_) => "morio.core.service.unknown",
                ContainerError::UnknownOperation(_) => "morio.core.service.operation.unknown",
                ContainerError::EngineError(_) | ContainerError::Rejected { .. } => "morio.core.engine.failed",
                ContainerError::NotFound(_) => "morio.core.engine.container.missing",
                ContainerError::Timeout => "morio.core.engine.timeout",
                ContainerError::InvalidTransition { .. } => "morio.core.service.transition.invalid",
                ContainerError::CertificateUnavailable { .. } => "morio.core.service.certificate.missing",
                ContainerError::RetryExhausted { .. } => "morio.core.engine.retries.exhausted",
            },
            ServiceError::Cluster(e) => match e {
                ClusterError::ClusterFull { .. } => "morio.core.cluster.full",
                ClusterError::VersionMismatch { .. } => "morio.core.cluster.version.mismatch",
                ClusterError::NotLeader { .. } => "morio.core.cluster.leader.required",
                ClusterError::DeploymentMismatch { .. } => "morio.core.cluster.mismatch",
                ClusterError::UnknownNode(_) => "morio.core.cluster.missing",
                ClusterError::Unreachable { .. } | ClusterError::Timeout(_) => "morio.core.cluster.unreachable",
                ClusterError::Rejected { .. } => "morio.core.cluster.rejected",
                ClusterError::Aborted => "morio.core.shutdown",
                ClusterError::Resolve(e) => resolve_code(e),
            },
            ServiceError::ChannelClosed | ServiceError::ResponseChannelClosed => "morio.core.shutdown",
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Store(e) => e.is_transient(),
            ServiceError::Resolve(e) | ServiceError::Cluster(ClusterError::Resolve(e)) => matches!(
                e,
                ResolveError::ResolutionInProgress | ResolveError::StoreUnavailable(_)
            ),
            ServiceError::Container(e) => e.is_transient(),
            ServiceError::Cluster(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Whether an operator has to step in
    pub fn is_escalation(&self) -> bool {
        match self {
            ServiceError::Resolve(e) | ServiceError::Cluster(ClusterError::Resolve(e)) => matches!(
                e,
                ResolveError::FilesystemWriteFailed { .. } | ResolveError::StoreUnavailable(_)
            ),
            ServiceError::Store(StoreError::WriteFailed { .. }) | ServiceError::Store(StoreError::Corrupt(_)) => true,
            ServiceError::Ca(e) => matches!(
                e,
                CaError::RootKeyCorrupt(_) | CaError::StateCorrupt(_) | CaError::FilesystemWriteFailed { .. }
            ),
            ServiceError::Container(ContainerError::RetryExhausted { .. }) => true,
            _ => false,
        }
    }
}

fn config_code(e: &ConfigError) -> &'static str {
    match e {
        ConfigError::SchemaViolation(_) => "morio.core.schema.violation",
        ConfigError::FileReadError { .. } => "morio.core.fs.read.failed",
        _ => "morio.core.settings.invalid",
    }
}

fn store_code(e: &StoreError) -> &'static str {
    match e {
        StoreError::WriteFailed { .. } => "morio.core.fs.write.failed",
        StoreError::ReadFailed { .. } => "morio.core.fs.read.failed",
        StoreError::Corrupt(_) => "morio.core.checksum.mismatch",
        StoreError::NotFound(_) => "morio.core.store.version.missing",
        StoreError::StaleVersion { .. } | StoreError::Conflict => "morio.core.store.conflict",
        StoreError::Unavailable(_) | StoreError::Timeout => "morio.core.store.unavailable",
    }
}

fn resolve_code(e: &ResolveError) -> &'static str {
    match e {
        ResolveError::InvalidSettings(_) => "morio.core.schema.violation",
        ResolveError::EphemeralModeRequired => "morio.core.ephemeral.prohibited",
        ResolveError::ResolutionInProgress => "morio.core.resolution.in_progress",
        ResolveError::FilesystemWriteFailed { .. } => "morio.core.fs.write.failed",
        ResolveError::StoreUnavailable(_) => "morio.core.store.unavailable",
        ResolveError::Store(e) => store_code(e),
    }
}
