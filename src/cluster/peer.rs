// src/cluster/peer.rs

use std::time::Duration;

use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Client, Method, Request};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::heartbeat::{Heartbeat, HeartbeatReport};
use crate::cluster::ClusterError;
use crate::resolver::model::ResolvedConfig;

/// Snapshot pushed from the leader to a follower
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    /// Hostname of the sending node
    pub from: String,

    /// Snapshot to adopt
    pub config: ResolvedConfig,
}

/// What a follower answers to a sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Whether the snapshot was newer and got adopted
    pub adopted: bool,

    /// Version the follower serves after the sync
    pub version: u64,
}

/// Transport to the core service of other nodes
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Pushes a snapshot to a peer
    async fn sync(&self, peer: &str, request: &SyncRequest) -> Result<SyncResponse, ClusterError>;

    /// Sends a heartbeat to the leader
    async fn heartbeat(&self, peer: &str, heartbeat: &Heartbeat) -> Result<HeartbeatReport, ClusterError>;
}

/// Peer client posting JSON to `http://<peer>:<port>/-/core/cluster/...`
pub struct HttpPeerClient {
    client: Client<HttpConnector>,
    port: u16,
    timeout: Duration,
}

impl HttpPeerClient {
    /// Creates a client for peers listening on `port`
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            port,
            timeout,
        }
    }

    async fn post<B, R>(&self, peer: &str, endpoint: &str, body: &B) -> Result<R, ClusterError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let uri = format!("http://{}:{}/-/core/cluster/{}", peer, self.port, endpoint);
        let unreachable = |reason: String| ClusterError::Unreachable {
            peer: peer.to_string(),
            reason,
        };

        let payload = serde_json::to_vec(body).map_err(|e| unreachable(e.to_string()))?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(&uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(payload))
            .map_err(|e| unreachable(e.to_string()))?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| unreachable(e.to_string()))?;
            let status = response.status();
            let bytes = hyper::body::to_bytes(response.into_body())
                .await
                .map_err(|e| unreachable(e.to_string()))?;
            Ok::<_, ClusterError>((status, bytes))
        };

        let (status, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| ClusterError::Timeout(peer.to_string()))??;
        debug!("POST {} -> {}", uri, status);

        if status.is_server_error() {
            return Err(unreachable(format!("{}: {}", status, String::from_utf8_lossy(&bytes))));
        }
        if !status.is_success() {
            return Err(ClusterError::Rejected {
                peer: peer.to_string(),
                status: status.as_u16(),
                message: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        serde_json::from_slice(&bytes).map_err(|e| unreachable(format!("unreadable response: {}", e)))
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn sync(&self, peer: &str, request: &SyncRequest) -> Result<SyncResponse, ClusterError> {
        self.post(peer, "sync", request).await
    }

    async fn heartbeat(&self, peer: &str, heartbeat: &Heartbeat) -> Result<HeartbeatReport, ClusterError> {
        self.post(peer, "heartbeat", heartbeat).await
    }
}
