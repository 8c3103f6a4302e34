// src/container/reconcile.rs

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::container::{ContainerError, LifecycleController, LifecycleOp};
use crate::resolver::defaults::start_rank;
use crate::resolver::model::{DesiredState, ServiceSpec};
use crate::status::Component;

/// Handle to the reconciliation task of one service
struct Worker {
    desired: watch::Sender<Option<ServiceSpec>>,
    handle: JoinHandle<()>,
}

/// Starts reconciliation: one task per service compares the desired state
/// of the current config with what the engine reports. Runs until
/// `shutdown` flips to true.
pub fn spawn_reconciler(controller: Arc<LifecycleController>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut configs = controller.resolver.subscribe();
        let mut workers: HashMap<String, Worker> = HashMap::new();

        loop {
            let mut wanted: Vec<ServiceSpec> = controller.wanted_services().into_values().collect();
            wanted.sort_by_key(|spec| start_rank(&spec.name));

            // Hand the new specs to their workers, in start order
            for spec in &wanted {
                match workers.get(&spec.name) {
                    Some(worker) => {
                        worker.desired.send_if_modified(|current| {
                            if current.as_ref() == Some(spec) {
                                return false;
                            }
                            *current = Some(spec.clone());
                            true
                        });
                    }
                    None => {
                        let (desired, rx) = watch::channel(Some(spec.clone()));
                        let handle = tokio::spawn(run_worker(
                            controller.clone(),
                            spec.name.clone(),
                            rx,
                            shutdown.clone(),
                        ));
                        debug!(service = %spec.name, "Started reconciliation");
                        workers.insert(spec.name.clone(), Worker { desired, handle });
                    }
                }
            }

            // Retire services that are no longer wanted
            for (name, worker) in &workers {
                if !wanted.iter().any(|spec| &spec.name == name) {
                    worker.desired.send_if_modified(|current| current.take().is_some());
                }
            }

            // Managed containers nobody reconciles are stopped once
            match controller.managed_containers().await {
                Ok(names) => {
                    for name in names.iter().filter(|name| !workers.contains_key(*name)) {
                        if let Err(e) = controller.retire(name).await {
                            warn!(service = %name, "Failed to stop unmanaged container: {}", e);
                        }
                    }
                }
                Err(e) => warn!("Failed to list managed containers: {}", e),
            }

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                res = configs.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }

        for (name, worker) in workers {
            drop(worker.desired);
            if let Err(e) = worker.handle.await {
                error!(service = %name, "Reconciliation task failed: {}", e);
            }
        }
        info!("Reconciliation stopped");
    })
}

/// Reconciles one service until shutdown.
///
/// Failures are retried with backoff. Once the engine retry budget's worth
/// of consecutive rounds failed, the service is reported failing and the
/// worker waits for a new spec.
async fn run_worker(
    controller: Arc<LifecycleController>,
    service: String,
    mut desired: watch::Receiver<Option<ServiceSpec>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let policy = controller.presets.retry.engine;
    let interval = Duration::from_secs(controller.presets.reconcile_interval_secs.max(1));
    let component = Component::Service(service.clone());
    let mut failures: u32 = 0;

    loop {
        let spec = desired.borrow_and_update().clone();
        let outcome = match &spec {
            Some(spec) => converge(&controller, spec).await,
            None => controller.retire(&service).await.map(|_| ()),
        };

        let wait = match outcome {
            Ok(()) => {
                if failures > 0 {
                    info!(service = %service, "Reconciled after {} failed round(s)", failures);
                }
                failures = 0;
                match spec {
                    Some(_) => controller.status.ok(component.clone()),
                    None => controller.status.remove(&component),
                }
                Some(interval)
            }
            Err(e) => {
                failures += 1;
                if failures >= policy.max_attempts.max(1) {
                    error!(service = %service, "Reconciliation gave up after {} rounds: {}", failures, e);
                    metrics::increment_counter!("morio_reconcile_giveups_total");
                    controller.status.failing(component.clone(), e.to_string());
                    None
                } else {
                    warn!(service = %service, "Reconciliation round {} failed: {}", failures, e);
                    Some(policy.backoff_with_jitter(failures))
                }
            }
        };

        let pause = async {
            match wait {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            res = desired.changed() => {
                if res.is_err() {
                    break;
                }
                failures = 0;
            }
            _ = pause => {}
        }
    }

    debug!(service = %service, "Reconciliation worker stopped");
}

/// Brings one service to its desired state
async fn converge(controller: &LifecycleController, spec: &ServiceSpec) -> Result<(), ContainerError> {
    match spec.desired {
        DesiredState::Running => {
            // Renews material that is about to expire
            controller.ensure_certificate(spec).await?;
            controller.execute(spec, LifecycleOp::Start).await.map(|_| ())
        }
        DesiredState::Stopped => controller.execute(spec, LifecycleOp::Stop).await.map(|_| ()),
        DesiredState::Paused => match controller.execute(spec, LifecycleOp::Pause).await {
            Ok(_) => Ok(()),
            // Only a running container can be paused
            Err(ContainerError::InvalidTransition { .. }) => {
                controller.execute(spec, LifecycleOp::Start).await?;
                controller.execute(spec, LifecycleOp::Pause).await.map(|_| ())
            }
            Err(e) => Err(e),
        },
    }
}
