// src/cluster/mod.rs

/// Heartbeats between followers and the leader
pub mod heartbeat;
/// Transport to other nodes
pub mod peer;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Presets;
use crate::resolver::model::{DeploymentMode, NodeDescriptor, NodeRole, ResolvedConfig};
use crate::resolver::{ResolutionEngine, ResolveError};
use crate::retry::{retry, Attempt, RetryError};
use crate::status::{Component, StatusReporter};

pub use heartbeat::{spawn_heartbeat, Heartbeat, HeartbeatAction, HeartbeatIssue, HeartbeatReport};
pub use peer::{HttpPeerClient, PeerClient, SyncRequest, SyncResponse};

/// Request from a node that wants to join as a broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Hostname of the joining node
    pub hostname: String,

    /// Morio version the joining node runs
    pub morio_version: String,

    /// Fingerprint of the joining node's certificate
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// Outcome of an accepted join
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Config that includes the new node
    pub config: Arc<ResolvedConfig>,

    /// Descriptor of the joined node
    pub node: NodeDescriptor,

    /// Whether the node was a member already
    pub already_member: bool,

    /// Delivery of the new version to the other nodes
    pub propagation: PropagationReport,
}

/// Per-peer outcome of a propagation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationReport {
    /// Version that was propagated
    pub version: u64,
    /// Peers that adopted or already had the version
    pub delivered: Vec<String>,

    /// Peers that could not be reached within the retry budget, with the
    /// last error
    pub failed: Vec<(String, String)>,
}

impl PropagationReport {
    /// Whether every peer got the version
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// What the leader knows about a follower from its heartbeats
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberState {
    /// Hostname of the follower
    pub hostname: String,
    /// Last heartbeat received
    pub last_seen: DateTime<Utc>,
    /// Version the follower reported
    pub config_version: u64,
    /// Morio version the follower reported
    pub morio_version: String,
}

/// Follower-side view of the leader
#[derive(Debug, Clone, Copy)]
struct LeaderContact {
    last: Instant,
    stale: bool,
}

/// Keeps the resolved config consistent across nodes.
///
/// Membership and leadership live inside the resolved config; the
/// coordinator reads and replicates it, and only changes it through the
/// resolution engine.
pub struct ClusterCoordinator {
    resolver: Arc<ResolutionEngine>,
    peers: Arc<dyn PeerClient>,
    presets: Arc<Presets>,
    members: RwLock<HashMap<Uuid, MemberState>>,
    contact: RwLock<LeaderContact>,
    status: StatusReporter,
    shutdown: watch::Receiver<bool>,
}

impl ClusterCoordinator {
    /// Creates the coordinator; propagations give up once `shutdown` flips to true
    pub fn new(
        resolver: Arc<ResolutionEngine>,
        peers: Arc<dyn PeerClient>,
        presets: Arc<Presets>,
        status: StatusReporter,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            resolver,
            peers,
            presets,
            members: RwLock::new(HashMap::new()),
            contact: RwLock::new(LeaderContact {
                last: Instant::now(),
                stale: false,
            }),
            status,
            shutdown,
        }
    }

    /// This node's descriptor in the current config
    pub fn local_node(&self) -> Result<NodeDescriptor, ClusterError> {
        let config = self.resolver.require_current()?;
        config
            .node(&self.presets.node_hostname)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownNode(self.presets.node_hostname.clone()))
    }

    /// Whether this node leads the cluster
    pub fn is_leader(&self) -> bool {
        self.local_node()
            .map(|node| node.role == NodeRole::Leader)
            .unwrap_or(false)
    }

    /// Whether this follower lost the leader for longer than the liveness window
    pub async fn is_stale(&self) -> bool {
        self.contact.read().await.stale
    }

    /// Followers the leader heard from, by node id
    pub async fn members(&self) -> HashMap<Uuid, MemberState> {
        self.members.read().await.clone()
    }

    /// Admits a broker node. Only the leader accepts joins; the new version
    /// is propagated before returning.
    pub async fn join(&self, request: JoinRequest) -> Result<JoinOutcome, ClusterError> {
        let config = self.resolver.require_current()?;
        self.require_leader(&config)?;

        // Check the node runs the same version
        if request.morio_version != self.presets.version {
            return Err(ClusterError::VersionMismatch {
                ours: self.presets.version.clone(),
                theirs: request.morio_version,
            });
        }

        if let Some(node) = config.node(&request.hostname) {
            debug!("{} is already a member", request.hostname);
            return Ok(JoinOutcome {
                node: node.clone(),
                config: config.clone(),
                already_member: true,
                propagation: PropagationReport {
                    version: config.version,
                    ..Default::default()
                },
            });
        }

        // Check there is room for one more broker
        let max = self.presets.cluster.max_nodes;
        if config.settings.cluster.broker_nodes.len() >= max {
            return Err(ClusterError::ClusterFull { max });
        }

        let mut settings = config.settings.with_added_broker(&request.hostname);
        if let Some(fingerprint) = &request.fingerprint {
            settings = settings.with_fingerprint(&request.hostname, fingerprint);
        }

        let next = self.resolver.resolve(settings).await?;
        let node = next
            .node(&request.hostname)
            .cloned()
            .ok_or_else(|| ClusterError::UnknownNode(request.hostname.clone()))?;
        info!(version = next.version, "{} joined the cluster as node {}", node.hostname, node.serial);

        let propagation = self.propagate(next.clone()).await;
        Ok(JoinOutcome {
            config: next,
            node,
            already_member: false,
            propagation,
        })
    }

    /// Hands leadership to another broker by resolving a new version
    pub async fn transfer_leadership(&self, hostname: &str) -> Result<PropagationReport, ClusterError> {
        let config = self.resolver.require_current()?;
        self.require_leader(&config)?;

        if config.node(hostname).is_none() {
            return Err(ClusterError::UnknownNode(hostname.to_string()));
        }

        let next = self
            .resolver
            .resolve(config.settings.with_leader(hostname))
            .await?;
        info!(version = next.version, "Leadership handed to {}", hostname);
        Ok(self.propagate(next).await)
    }

    /// Pushes a config to every other node. Each peer is retried on its own
    /// and a slow or dead peer never holds up the others.
    pub async fn propagate(&self, config: Arc<ResolvedConfig>) -> PropagationReport {
        let local = self.presets.node_hostname.clone();
        let request = Arc::new(SyncRequest {
            from: local.clone(),
            config: (*config).clone(),
        });

        let deliveries = config
            .peers_of(&local)
            .map(|peer| {
                let peer = peer.hostname.clone();
                let request = request.clone();
                async move {
                    let result = self.deliver(&peer, &request).await;
                    (peer, result)
                }
            })
            .collect::<Vec<_>>();

        let mut report = PropagationReport {
            version: config.version,
            ..Default::default()
        };
        for (peer, result) in join_all(deliveries).await {
            match result {
                Ok(response) => {
                    debug!(peer = %peer, adopted = response.adopted, "Delivered version {}", config.version);
                    report.delivered.push(peer);
                }
                Err(e) => {
                    warn!(peer = %peer, "Failed to deliver version {}: {}", config.version, e);
                    report.failed.push((peer, e.to_string()));
                }
            }
        }

        if report.is_complete() {
            self.status.ok(Component::Cluster);
        } else {
            metrics::increment_counter!("morio_propagation_failures_total");
            let peers: Vec<&str> = report.failed.iter().map(|(peer, _)| peer.as_str()).collect();
            self.status.failing(
                Component::Cluster,
                format!("version {} not delivered to {}", config.version, peers.join(", ")),
            );
        }

        report
    }

    /// Delivers to one peer within the propagation budget, giving up early
    /// on shutdown
    async fn deliver(&self, peer: &str, request: &SyncRequest) -> Result<SyncResponse, ClusterError> {
        let label = format!("sync {}", peer);
        let attempts = retry(&self.presets.retry.propagation, &label, |_| async move {
            match self.peers.sync(peer, request).await {
                Ok(response) => Attempt::Done(response),
                Err(e) if e.is_transient() => Attempt::Transient(e),
                Err(e) => Attempt::Fatal(e),
            }
        });

        let mut shutdown = self.shutdown.clone();
        let aborted = async move {
            loop {
                if *shutdown.borrow_and_update() {
                    return;
                }
                if shutdown.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            result = attempts => result.map_err(|e| match e {
                RetryError::Fatal(e) => e,
                RetryError::Exhausted { attempts, last } => ClusterError::Unreachable {
                    peer: peer.to_string(),
                    reason: format!("gave up after {} attempts: {}", attempts, last),
                },
                RetryError::TimedOut { .. } => ClusterError::Timeout(peer.to_string()),
            }),
            _ = aborted => Err(ClusterError::Aborted),
        }
    }

    /// Takes a snapshot pushed by the leader.
    ///
    /// The sender must lead either the incoming version or, when the
    /// incoming version is newer, the version this node serves. The latter
    /// lets a leader hand over leadership and still push the handover.
    pub async fn accept_sync(&self, request: SyncRequest) -> Result<SyncResponse, ClusterError> {
        let SyncRequest { from, config: incoming } = request;
        let current = self.resolver.current();

        // Check the snapshot belongs to this deployment
        if let Some(current) = &current {
            if current.mode == DeploymentMode::Clustered && current.cluster.uuid != incoming.cluster.uuid {
                return Err(ClusterError::DeploymentMismatch {
                    expected: current.cluster.uuid,
                    got: incoming.cluster.uuid,
                });
            }
        }

        let leads = |config: &ResolvedConfig| {
            config
                .leader()
                .map_or(false, |node| node.hostname.eq_ignore_ascii_case(&from))
        };
        let handover = current
            .as_deref()
            .map_or(false, |current| incoming.version > current.version && leads(current));
        if !leads(&incoming) && !handover {
            return Err(ClusterError::NotLeader {
                leader: incoming.leader().map(|node| node.hostname.clone()),
            });
        }
        if incoming.node(&self.presets.node_hostname).is_none() {
            return Err(ClusterError::UnknownNode(self.presets.node_hostname.clone()));
        }

        let version = incoming.version;
        let adopted = self.resolver.adopt(incoming).await?;
        self.leader_seen().await;

        Ok(SyncResponse {
            adopted,
            version: self.resolver.current().map(|c| c.version).unwrap_or(version),
        })
    }

    /// Records contact with the leader, clearing a stale condition
    async fn leader_seen(&self) {
        let mut contact = self.contact.write().await;
        contact.last = Instant::now();
        if contact.stale {
            contact.stale = false;
            info!("Leader reachable again");
            self.status.ok(Component::Cluster);
        }
    }

    fn require_leader(&self, config: &ResolvedConfig) -> Result<(), ClusterError> {
        match config.leader() {
            Some(leader) if leader.hostname.eq_ignore_ascii_case(&self.presets.node_hostname) => Ok(()),
            leader => Err(ClusterError::NotLeader {
                leader: leader.map(|node| node.hostname.clone()),
            }),
        }
    }
}

/// Cluster coordination errors
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("The cluster already has the maximum of {max} broker nodes")]
    ClusterFull { max: usize },

    #[error("Version mismatch: this node runs {ours}, the joining node runs {theirs}")]
    VersionMismatch { ours: String, theirs: String },

    #[error("This node is not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<String> },

    #[error("Snapshot belongs to cluster {got}, this node is part of {expected}")]
    DeploymentMismatch { expected: Uuid, got: Uuid },

    #[error("Node {0} is not part of the cluster")]
    UnknownNode(String),

    #[error("Peer {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },

    #[error("Peer {0} did not answer in time")]
    Timeout(String),

    #[error("Peer {peer} refused the request ({status}): {message}")]
    Rejected {
        peer: String,
        status: u16,
        message: String,
    },

    #[error("Aborted by shutdown")]
    Aborted,

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

impl ClusterError {
    /// Whether retrying the same peer call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Unreachable { .. } | ClusterError::Timeout(_))
    }
}
