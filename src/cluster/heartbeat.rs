// src/cluster/heartbeat.rs

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cluster::{ClusterCoordinator, ClusterError, MemberState, SyncRequest};
use crate::resolver::model::{DeploymentMode, NodeRole, ResolvedConfig};
use crate::status::Component;

/// Sent by followers to the leader at every heartbeat interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Cluster the sender belongs to
    pub cluster: Uuid,
    /// Id of the sending node
    pub node: Uuid,
    /// Serial of the sending node
    pub node_serial: u32,

    /// Leader as the follower knows it
    pub leader: Option<Uuid>,

    /// Morio version the sender runs
    pub morio_version: String,

    /// Resolved config version the follower serves
    pub config_version: u64,

    /// When the heartbeat was sent
    pub sent_at: DateTime<Utc>,
}

/// Mismatches the leader found in a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeartbeatIssue {
    /// The follower runs another Morio version
    VersionMismatch,
    /// The follower serves an older config version
    SettingsVersionMismatch,
    /// The follower follows another leader
    LeaderChange,
    /// The follower belongs to another cluster
    DeploymentMismatch,
}

/// What the follower should do about the issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatAction {
    /// Nothing to do
    None,

    /// The leader pushes its config to the follower
    Sync,

    /// No leader is known; an operator must designate one
    Elect,

    /// The follower re-reads the config from the store
    Resync,
}

/// Leader's answer to a heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReport {
    /// Problems the leader found with the heartbeat
    pub issues: Vec<HeartbeatIssue>,
    /// What the follower should do about them
    pub action: HeartbeatAction,

    /// Leader as the answering node knows it
    pub leader: Option<Uuid>,

    /// Version the leader serves
    pub config_version: u64,
}

impl ClusterCoordinator {
    /// Heartbeat describing this node
    pub fn heartbeat(&self) -> Result<Heartbeat, ClusterError> {
        let config = self.resolver.require_current()?;
        let local = config
            .node(&self.presets.node_hostname)
            .ok_or_else(|| ClusterError::UnknownNode(self.presets.node_hostname.clone()))?;

        Ok(Heartbeat {
            cluster: config.cluster.uuid,
            node: local.id,
            node_serial: local.serial,
            leader: config.leader().map(|node| node.id),
            morio_version: self.presets.version.clone(),
            config_version: config.version,
            sent_at: Utc::now(),
        })
    }

    /// Answers a follower's heartbeat. A follower that is behind gets the
    /// current config pushed in the background.
    pub async fn receive_heartbeat(self: &Arc<Self>, heartbeat: Heartbeat) -> Result<HeartbeatReport, ClusterError> {
        let config = self.resolver.require_current()?;
        let leader = config.leader().map(|node| node.id);
        let report = |issues: Vec<HeartbeatIssue>, action: HeartbeatAction| HeartbeatReport {
            issues,
            action,
            leader,
            config_version: config.version,
        };

        // Check the heartbeat comes from a node of this deployment
        let sender = match config.node_by_id(&heartbeat.node) {
            Some(node) if heartbeat.cluster == config.cluster.uuid => node.clone(),
            _ => {
                warn!(node = %heartbeat.node, "Heartbeat from outside this deployment");
                return Ok(report(vec![HeartbeatIssue::DeploymentMismatch], HeartbeatAction::Resync));
            }
        };

        let mut issues = Vec::new();
        if heartbeat.morio_version != self.presets.version {
            warn!(
                node = %sender.hostname,
                "Node runs {} while this node runs {}",
                heartbeat.morio_version,
                self.presets.version
            );
            issues.push(HeartbeatIssue::VersionMismatch);
        }

        let local_leads = config
            .node(&self.presets.node_hostname)
            .map_or(false, |node| node.role == NodeRole::Leader);

        let action = if leader.is_none() {
            issues.push(HeartbeatIssue::LeaderChange);
            HeartbeatAction::Elect
        } else if !local_leads {
            issues.push(HeartbeatIssue::LeaderChange);
            HeartbeatAction::Resync
        } else {
            let mut action = HeartbeatAction::None;
            if heartbeat.leader != leader {
                issues.push(HeartbeatIssue::LeaderChange);
                action = HeartbeatAction::Sync;
            }
            if heartbeat.config_version < config.version {
                issues.push(HeartbeatIssue::SettingsVersionMismatch);
                action = HeartbeatAction::Sync;
            } else if heartbeat.config_version > config.version {
                // The follower saw a newer version than the leader serves
                issues.push(HeartbeatIssue::SettingsVersionMismatch);
                let resolver = self.resolver.clone();
                tokio::spawn(async move {
                    if let Err(e) = resolver.refresh().await {
                        warn!("Failed to refresh after a heartbeat from ahead: {}", e);
                    }
                });
            }
            action
        };

        if local_leads {
            self.members.write().await.insert(
                sender.id,
                MemberState {
                    hostname: sender.hostname.clone(),
                    last_seen: Utc::now(),
                    config_version: heartbeat.config_version,
                    morio_version: heartbeat.morio_version.clone(),
                },
            );
        }

        if action == HeartbeatAction::Sync {
            let coordinator = self.clone();
            let peer = sender.hostname.clone();
            let snapshot = config.clone();
            tokio::spawn(async move { coordinator.sync_peer(&peer, &snapshot).await });
        }

        if !issues.is_empty() {
            debug!(node = %sender.hostname, ?issues, ?action, "Heartbeat mismatch");
        }
        Ok(report(issues, action))
    }

    async fn sync_peer(&self, peer: &str, config: &ResolvedConfig) {
        let request = SyncRequest {
            from: self.presets.node_hostname.clone(),
            config: config.clone(),
        };
        match self.deliver(peer, &request).await {
            Ok(response) => debug!(peer, version = response.version, "Resynced follower"),
            Err(e) => warn!(peer, "Failed to resync follower: {}", e),
        }
    }

    /// One heartbeat round. Followers report to the leader, the leader
    /// checks on its followers. Returns the leader's report, if one was
    /// received.
    pub async fn send_heartbeat(&self) -> Result<Option<HeartbeatReport>, ClusterError> {
        let config = match self.resolver.current() {
            Some(config) if config.mode == DeploymentMode::Clustered => config,
            _ => return Ok(None),
        };

        let local = config
            .node(&self.presets.node_hostname)
            .ok_or_else(|| ClusterError::UnknownNode(self.presets.node_hostname.clone()))?;
        if local.role == NodeRole::Leader {
            self.check_members(&config).await;
            return Ok(None);
        }

        let leader = config
            .leader()
            .ok_or(ClusterError::NotLeader { leader: None })?
            .hostname
            .clone();
        let heartbeat = self.heartbeat()?;

        let started = Instant::now();
        let result = tokio::time::timeout(
            self.presets.retry.propagation.timeout(),
            self.peers.heartbeat(&leader, &heartbeat),
        )
        .await
        .unwrap_or_else(|_| Err(ClusterError::Timeout(leader.clone())));
        let rtt = started.elapsed();

        match result {
            Ok(report) => {
                metrics::gauge!("morio_heartbeat_rtt_seconds", rtt.as_secs_f64());
                if rtt > Duration::from_millis(self.presets.cluster.heartbeat_max_rtt_ms) {
                    warn!(leader = %leader, "Slow heartbeat: {}ms", rtt.as_millis());
                }
                self.leader_seen().await;
                self.act_on(&report).await;
                Ok(Some(report))
            }
            Err(e) => {
                debug!(leader = %leader, "Heartbeat failed: {}", e);
                self.check_liveness(&leader).await;
                Err(e)
            }
        }
    }

    async fn act_on(&self, report: &HeartbeatReport) {
        if report.issues.contains(&HeartbeatIssue::VersionMismatch) {
            warn!("The leader runs a different Morio version");
        }

        match report.action {
            HeartbeatAction::None | HeartbeatAction::Sync => {}
            HeartbeatAction::Resync => match self.resolver.refresh().await {
                Ok(true) => info!("Resynced config from the store"),
                Ok(false) => {}
                Err(e) => warn!("Resync failed: {}", e),
            },
            HeartbeatAction::Elect => {
                // Followers never promote themselves
                error!("The cluster has no leader; designate one with a leadership transfer");
            }
        }
    }

    /// Marks this follower stale once the leader was out of reach for
    /// longer than the liveness window. The last known-good config keeps
    /// being served.
    async fn check_liveness(&self, leader: &str) {
        let window = Duration::from_secs(self.presets.cluster.liveness_window_secs);
        let mut contact = self.contact.write().await;
        let silent = contact.last.elapsed();

        if silent >= window && !contact.stale {
            contact.stale = true;
            warn!(leader, "Leader unreachable for {}s, node is stale", silent.as_secs());
            self.status.failing(
                Component::Cluster,
                format!("leader {} unreachable for {}s", leader, silent.as_secs()),
            );
        }
    }

    /// Leader side: logs followers that went quiet
    async fn check_members(&self, config: &ResolvedConfig) {
        let window = chrono::Duration::seconds(self.presets.cluster.liveness_window_secs as i64);
        let now = Utc::now();
        let members = self.members.read().await;

        let quiet: Vec<&str> = config
            .peers_of(&self.presets.node_hostname)
            .filter(|node| {
                members
                    .get(&node.id)
                    .map_or(true, |member| now - member.last_seen > window)
            })
            .map(|node| node.hostname.as_str())
            .collect();

        metrics::gauge!("morio_quiet_followers", quiet.len() as f64);
        if !quiet.is_empty() {
            debug!("No recent heartbeat from {}", quiet.join(", "));
        }
    }
}

/// Runs heartbeat rounds until `shutdown` flips to true
pub fn spawn_heartbeat(coordinator: Arc<ClusterCoordinator>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(coordinator.presets.cluster.heartbeat_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = coordinator.send_heartbeat().await {
                        debug!("Heartbeat round failed: {}", e);
                    }
                }
            }
        }
        debug!("Heartbeat stopped");
    })
}
