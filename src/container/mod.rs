// src/container/mod.rs

/// Container engine clients
pub mod client;
/// Per-service reconciliation workers
pub mod reconcile;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::ca::{
    service_material_present, write_service_material, CertificateAuthority, CertificateRequest, IssuedTo,
    Validity,
};
use crate::config::Presets;
use crate::resolver::defaults;
use crate::resolver::model::ServiceSpec;
use crate::resolver::ResolutionEngine;
use crate::retry::{retry, Attempt, RetryError};
use crate::status::{Component, StatusReporter};

pub use client::{ContainerInfo, ContainerSpec, DockerEngineClient, EngineClient, SERVICE_LABEL};
#[cfg(test)]
pub use client::MockEngineClient;
pub use reconcile::spawn_reconciler;

/// Container state as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedState {
    /// Created, never started
    Created,
    /// Running or restarting
    Running,
    /// Frozen
    Paused,
    /// Exited or stopped
    Stopped,
    /// Killed through the controller
    Killed,
    /// No container exists
    Missing,
}

impl ObservedState {
    /// Maps the engine's state string
    pub fn from_engine(status: &str) -> Self {
        match status {
            "created" => ObservedState::Created,
            "running" | "restarting" => ObservedState::Running,
            "paused" => ObservedState::Paused,
            _ => ObservedState::Stopped,
        }
    }
}

impl fmt::Display for ObservedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObservedState::Created => "created",
            ObservedState::Running => "running",
            ObservedState::Paused => "paused",
            ObservedState::Stopped => "stopped",
            ObservedState::Killed => "killed",
            ObservedState::Missing => "missing",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleOp {
    /// Start, provisioning the container first if missing
    Start,
    /// Stop gracefully
    Stop,
    /// Freeze a running container
    Pause,
    /// Resume a paused container
    Unpause,
    /// Stop immediately
    Kill,
}

impl fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleOp::Start => "start",
            LifecycleOp::Stop => "stop",
            LifecycleOp::Pause => "pause",
            LifecycleOp::Unpause => "unpause",
            LifecycleOp::Kill => "kill",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for LifecycleOp {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(LifecycleOp::Start),
            "stop" => Ok(LifecycleOp::Stop),
            "pause" => Ok(LifecycleOp::Pause),
            "unpause" => Ok(LifecycleOp::Unpause),
            "kill" => Ok(LifecycleOp::Kill),
            other => Err(ContainerError::UnknownOperation(other.to_string())),
        }
    }
}

/// Observed state of one managed container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerObservation {
    /// Managed service
    pub service_name: String,
    /// Engine container id, unless missing
    pub container_id: Option<String>,
    /// State last seen
    pub observed_state: ObservedState,

    /// Last time the observed state changed
    pub last_transition_at: DateTime<Utc>,
}

/// Applies lifecycle operations to managed containers and tracks what it
/// observes. Operations on one service are serialized; services are
/// independent of each other.
pub struct LifecycleController {
    engine: Arc<dyn EngineClient>,
    ca: Arc<CertificateAuthority>,
    resolver: Arc<ResolutionEngine>,
    presets: Arc<Presets>,
    observations: RwLock<HashMap<String, ContainerObservation>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    status: StatusReporter,
}

impl LifecycleController {
    /// Creates a controller; it reports every service to `status`
    pub fn new(
        engine: Arc<dyn EngineClient>,
        ca: Arc<CertificateAuthority>,
        resolver: Arc<ResolutionEngine>,
        presets: Arc<Presets>,
        status: StatusReporter,
    ) -> Self {
        Self {
            engine,
            ca,
            resolver,
            presets,
            observations: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            status,
        }
    }

    /// Applies an operation to a service's container.
    ///
    /// Operations already satisfied succeed without touching the engine or
    /// the observation. Failures that leave the service unusable are
    /// reported to the status board.
    pub async fn apply(&self, service: &str, op: LifecycleOp) -> Result<ContainerObservation, ContainerError> {
        let spec = self.spec_for(service)?;
        let result = self.execute(&spec, op).await;

        match &result {
            Ok(observation) => {
                info!(service, state = %observation.observed_state, "Applied {}", op);
                self.status.ok(Component::Service(service.to_string()));
            }
            Err(e) if e.is_degrading() => {
                self.status.failing(Component::Service(service.to_string()), e.to_string());
            }
            Err(e) => debug!(service, "Refused {}: {}", op, e),
        }

        result
    }

    /// Services wanted on this node: the current config's, or the
    /// ephemeral set while nothing is resolved
    pub fn wanted_services(&self) -> BTreeMap<String, ServiceSpec> {
        match self.resolver.current() {
            Some(config) => config.services.clone(),
            None => defaults::ephemeral_services(&self.presets.version),
        }
    }

    fn spec_for(&self, service: &str) -> Result<ServiceSpec, ContainerError> {
        self.wanted_services()
            .remove(service)
            .ok_or_else(|| ContainerError::UnknownService(service.to_string()))
    }

    /// Last observation of a service, if it was ever observed
    pub async fn observation(&self, service: &str) -> Option<ContainerObservation> {
        self.observations.read().await.get(service).cloned()
    }

    /// Every observation, by service
    pub async fn observations(&self) -> BTreeMap<String, ContainerObservation> {
        self.observations
            .read()
            .await
            .iter()
            .map(|(name, observation)| (name.clone(), observation.clone()))
            .collect()
    }

    /// Runs an operation under the service's lock
    async fn execute(&self, spec: &ServiceSpec, op: LifecycleOp) -> Result<ContainerObservation, ContainerError> {
        let lock = self.service_lock(&spec.name).await;
        let _guard = lock.lock().await;

        let current = self.observe(&spec.name).await?;
        let service = spec.name.as_str();

        let next = match (op, current.observed_state) {
            (LifecycleOp::Start, ObservedState::Running)
            | (LifecycleOp::Pause, ObservedState::Paused)
            | (LifecycleOp::Unpause, ObservedState::Running) => return Ok(current),

            (LifecycleOp::Stop, state) | (LifecycleOp::Kill, state)
                if !matches!(state, ObservedState::Running | ObservedState::Paused) =>
            {
                return Ok(current)
            }

            (LifecycleOp::Start, ObservedState::Paused) | (LifecycleOp::Unpause, ObservedState::Paused) => {
                // Unpausing resumes serving, so the certificate gate applies
                self.ensure_certificate(spec).await?;
                let id = container_id(&current)?;
                self.engine_call(service, op, || self.engine.unpause(id)).await?;
                ObservedState::Running
            }

            (LifecycleOp::Start, state) => {
                // Never start without a valid certificate
                self.ensure_certificate(spec).await?;

                let id = match state {
                    ObservedState::Missing => self.provision(spec).await?,
                    _ => container_id(&current)?.to_string(),
                };
                self.engine_call(service, op, || self.engine.start(&id)).await?;
                return Ok(self.record(service, Some(id), ObservedState::Running).await);
            }

            (LifecycleOp::Stop, _) => {
                let id = container_id(&current)?;
                self.engine_call(service, op, || self.engine.stop(id)).await?;
                ObservedState::Stopped
            }

            (LifecycleOp::Kill, _) => {
                let id = container_id(&current)?;
                self.engine_call(service, op, || self.engine.kill(id)).await?;
                ObservedState::Killed
            }

            (LifecycleOp::Pause, ObservedState::Running) => {
                let id = container_id(&current)?;
                self.engine_call(service, op, || self.engine.pause(id)).await?;
                ObservedState::Paused
            }

            (LifecycleOp::Pause, state) | (LifecycleOp::Unpause, state) => {
                return Err(ContainerError::InvalidTransition {
                    service: service.to_string(),
                    state,
                    operation: op,
                })
            }
        };

        Ok(self.record(service, current.container_id.clone(), next).await)
    }

    /// Pulls the image and creates the container, returning its id
    async fn provision(&self, spec: &ServiceSpec) -> Result<String, ContainerError> {
        info!(service = %spec.name, image = %spec.image, "Creating container");

        self.engine_call(&spec.name, LifecycleOp::Start, || self.engine.pull(&spec.image))
            .await?;

        let mut binds = Vec::new();
        if spec.certificate.is_some() {
            binds.push(format!(
                "{}:/etc/morio/{}:ro",
                self.presets.service_dir(&spec.name).display(),
                spec.name
            ));
        }
        let container = ContainerSpec {
            name: spec.name.clone(),
            image: spec.image.clone(),
            hostname: spec.name.clone(),
            network: self.presets.network.clone(),
            labels: BTreeMap::from([
                (SERVICE_LABEL.to_string(), spec.name.clone()),
                ("morio.version".to_string(), self.presets.version.clone()),
            ]),
            binds,
        };

        let id = self
            .engine_call(&spec.name, LifecycleOp::Start, || self.engine.create(&container))
            .await?;
        self.record(&spec.name, Some(id.clone()), ObservedState::Created).await;
        Ok(id)
    }

    /// Makes sure the CA holds a valid, unexpired certificate for the
    /// service and that its TLS material is on disk. Renews certificates
    /// close to expiry.
    pub async fn ensure_certificate(&self, spec: &ServiceSpec) -> Result<(), ContainerError> {
        let identity = match &spec.certificate {
            Some(identity) => identity,
            None => return Ok(()),
        };
        let unavailable = |reason: String| ContainerError::CertificateUnavailable {
            service: spec.name.clone(),
            reason,
        };

        let issued_to = IssuedTo::Service(spec.name.clone());
        let dir = self.presets.service_dir(&spec.name);
        let lifetime = Some(self.presets.certificates.lifetime_max.clone());

        let issued = match self.ca.valid_record_for(&issued_to, &identity.cn).await {
            Some(record) if !self.ca.needs_renewal(&record) && service_material_present(&dir).await => {
                return match self.ca.validate(&record).await {
                    Ok(Validity::Valid) => Ok(()),
                    Ok(validity) => Err(unavailable(format!("certificate {} is {:?}", record.serial, validity))),
                    Err(e) => Err(unavailable(e.to_string())),
                };
            }
            Some(record) => {
                info!(service = %spec.name, serial = record.serial, "Renewing service certificate");
                self.ca.renew(record.serial, lifetime).await
            }
            None => {
                info!(service = %spec.name, cn = %identity.cn, "Issuing service certificate");
                let mut request = CertificateRequest::for_identity(identity, self.ca.subject_defaults(), issued_to);
                request.lifetime = lifetime;
                self.ca.issue_certificate(&request).await
            }
        }
        .map_err(|e| unavailable(e.to_string()))?;

        write_service_material(&dir, &issued)
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        match self.ca.validate(&issued.record).await {
            Ok(Validity::Valid) => Ok(()),
            Ok(validity) => Err(unavailable(format!(
                "fresh certificate {} is {:?}",
                issued.record.serial, validity
            ))),
            Err(e) => Err(unavailable(e.to_string())),
        }
    }

    /// Stops the container of a service that is no longer wanted
    pub async fn retire(&self, service: &str) -> Result<ContainerObservation, ContainerError> {
        let lock = self.service_lock(service).await;
        let _guard = lock.lock().await;

        let current = self.observe(service).await?;
        if !matches!(current.observed_state, ObservedState::Running | ObservedState::Paused) {
            return Ok(current);
        }

        info!(service, "Stopping container that is no longer wanted");
        let id = container_id(&current)?;
        self.engine_call(service, LifecycleOp::Stop, || self.engine.stop(id))
            .await?;
        Ok(self.record(service, current.container_id.clone(), ObservedState::Stopped).await)
    }

    /// Names of services with a managed container on the engine
    pub async fn managed_containers(&self) -> Result<Vec<String>, ContainerError> {
        let listed = self
            .retrying("core", "list", || self.engine.list_managed())
            .await?;
        Ok(listed.into_iter().filter_map(|info| info.service).collect())
    }

    /// Inspects the container and records what was seen
    async fn observe(&self, service: &str) -> Result<ContainerObservation, ContainerError> {
        let info = self
            .retrying(service, "inspect", || self.engine.inspect(service))
            .await?;

        let (id, mut state) = match info {
            Some(info) => (Some(info.id), info.state),
            None => (None, ObservedState::Missing),
        };

        // The engine cannot tell a killed container from a stopped one
        if state == ObservedState::Stopped {
            if let Some(known) = self.observation(service).await {
                if known.observed_state == ObservedState::Killed && known.container_id == id {
                    state = ObservedState::Killed;
                }
            }
        }

        Ok(self.record(service, id, state).await)
    }

    /// Stores an observation; the transition time only moves when the
    /// state or container changes
    async fn record(&self, service: &str, container_id: Option<String>, state: ObservedState) -> ContainerObservation {
        let mut observations = self.observations.write().await;
        match observations.get(service) {
            Some(known) if known.observed_state == state && known.container_id == container_id => known.clone(),
            _ => {
                let observation = ContainerObservation {
                    service_name: service.to_string(),
                    container_id,
                    observed_state: state,
                    last_transition_at: Utc::now(),
                };
                debug!(service, "Observed {}", state);
                observations.insert(service.to_string(), observation.clone());
                observation
            }
        }
    }

    async fn service_lock(&self, service: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn engine_call<T, F, Fut>(&self, service: &str, op: LifecycleOp, call: F) -> Result<T, ContainerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ContainerError>>,
    {
        let what = op.to_string();
        self.retrying(service, &what, call).await
    }

    async fn retrying<T, F, Fut>(&self, service: &str, what: &str, mut call: F) -> Result<T, ContainerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ContainerError>>,
    {
        let label = format!("{} {}", what, service);
        retry(&self.presets.retry.engine, &label, |_| {
            let call = call();
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
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { attempts, last } => {
                warn!(service, "Giving up on {} after {} attempts: {}", what, attempts, last);
                metrics::increment_counter!("morio_engine_retries_exhausted_total");
                ContainerError::RetryExhausted {
                    service: service.to_string(),
                    operation: what.to_string(),
                    reason: last.to_string(),
                }
            }
            RetryError::TimedOut { attempt, timeout } => {
                warn!(service, "Giving up on {}: attempt {} timed out", what, attempt);
                metrics::increment_counter!("morio_engine_retries_exhausted_total");
                ContainerError::RetryExhausted {
                    service: service.to_string(),
                    operation: what.to_string(),
                    reason: format!("timed out after {:?}", timeout),
                }
            }
        })
    }
}

fn container_id(observation: &ContainerObservation) -> Result<&str, ContainerError> {
    observation
        .container_id
        .as_deref()
        .ok_or_else(|| ContainerError::NotFound(observation.service_name.clone()))
}

/// Container lifecycle errors
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Unknown lifecycle operation: {0}")]
    UnknownOperation(String),

    #[error("Container engine error: {0}")]
    EngineError(String),

    #[error("Container engine refused the request ({status}): {message}")]
    Rejected {
        status: u16,
        message: String,
    },

    #[error("No such container: {0}")]
    NotFound(String),

    #[error("Container engine call timed out")]
    Timeout,

    #[error("Cannot {operation} {service}: container is {state}")]
    InvalidTransition {
        service: String,
        state: ObservedState,
        operation: LifecycleOp,
    },

    #[error("No valid certificate for {service}: {reason}")]
    CertificateUnavailable {
        service: String,
        reason: String,
    },

    #[error("Giving up on {operation} {service}: {reason}")]
    RetryExhausted {
        service: String,
        operation: String,
        reason: String,
    },
}

impl ContainerError {
    /// Whether retrying the same engine call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ContainerError::EngineError(_) | ContainerError::Timeout)
    }

    /// Whether the failure leaves the service unusable, as opposed to a
    /// refused request
    pub fn is_degrading(&self) -> bool {
        !matches!(
            self,
            ContainerError::UnknownService(_)
                | ContainerError::UnknownOperation(_)
                | ContainerError::InvalidTransition { .. }
        )
    }
}
