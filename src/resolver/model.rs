// src/resolver/model.rs

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::settings::RawSettings;

/// Deployment mode of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Nothing resolved yet; waiting for setup
    Ephemeral,

    /// One broker node, file-backed store
    Standalone,

    /// Several broker nodes, distributed store
    Clustered,
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentMode::Ephemeral => write!(f, "ephemeral"),
            DeploymentMode::Standalone => write!(f, "standalone"),
            DeploymentMode::Clustered => write!(f, "clustered"),
        }
    }
}

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// The one node that accepts deploys and joins
    Leader,
    /// Takes its config from the leader
    Follower,
}

/// Desired container state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    /// Started and serving
    Running,
    /// Stopped, container kept
    Stopped,
    /// Started, then frozen
    Paused,
}

/// Certificate identity a service requires; missing subject fields are
/// filled from presets
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CertificateIdentity {
    /// Common name
    pub cn: String,

    /// Country, defaulting to the presets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c: Option<String>,

    /// State or province, defaulting to the presets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub st: Option<String>,

    /// Locality, defaulting to the presets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l: Option<String>,

    /// Organization, defaulting to the presets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o: Option<String>,

    /// Organizational unit, defaulting to the presets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ou: Option<String>,

    /// Subject alternative names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub san: Vec<String>,
}

impl CertificateIdentity {
    /// Identity with only a common name and SANs
    pub fn named(cn: &str, san: &[&str]) -> Self {
        Self {
            cn: cn.to_string(),
            c: None,
            st: None,
            l: None,
            o: None,
            ou: None,
            san: san.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A node as recorded in a resolved config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Stable node identifier, carried over between versions
    pub id: Uuid,

    /// Position in declaration order, starting at 1
    pub serial: u32,

    /// Node hostname, lowercase
    pub hostname: String,

    /// Leader or follower
    pub role: NodeRole,

    /// Flanking nodes run a reduced set of services and never lead
    #[serde(default)]
    pub flanking: bool,

    /// SHA-256 fingerprint of the node certificate
    #[serde(default)]
    pub certificate_fingerprint: Option<String>,

    /// Last time the leader heard from this node
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Identity of the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterIdentity {
    /// Cluster id, kept across versions
    pub uuid: Uuid,
    /// Display name
    pub name: String,
    /// Cluster-wide FQDN
    #[serde(default)]
    pub fqdn: Option<String>,
}

/// A managed service as recorded in a resolved config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Service name
    pub name: String,

    /// Container image reference
    pub image: String,

    /// Desired container state
    pub desired: DesiredState,

    /// Identity the CA must hold a valid certificate for before start
    #[serde(default)]
    pub certificate: Option<CertificateIdentity>,
}

/// An immutable, versioned snapshot of the resolved configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedConfig {
    /// Version number, strictly increasing
    pub version: u64,

    /// Mode implied by the broker count
    pub mode: DeploymentMode,

    /// Cluster identity
    pub cluster: ClusterIdentity,

    /// Nodes in declaration order
    pub nodes: Vec<NodeDescriptor>,

    /// Services by name
    pub services: BTreeMap<String, ServiceSpec>,

    /// Settings this version was resolved from
    pub settings: RawSettings,

    /// When the version was resolved
    pub created_at: DateTime<Utc>,
}

impl ResolvedConfig {
    /// The current leader
    pub fn leader(&self) -> Option<&NodeDescriptor> {
        self.nodes.iter().find(|node| node.role == NodeRole::Leader)
    }

    /// Looks up a node by hostname
    pub fn node(&self, hostname: &str) -> Option<&NodeDescriptor> {
        self.nodes
            .iter()
            .find(|node| node.hostname.eq_ignore_ascii_case(hostname))
    }

    /// Looks up a node by id
    pub fn node_by_id(&self, id: &Uuid) -> Option<&NodeDescriptor> {
        self.nodes.iter().find(|node| &node.id == id)
    }

    /// Number of broker nodes
    pub fn broker_count(&self) -> usize {
        self.nodes.iter().filter(|node| !node.flanking).count()
    }

    /// All nodes except the given one
    pub fn peers_of<'a>(&'a self, hostname: &'a str) -> impl Iterator<Item = &'a NodeDescriptor> + 'a {
        self.nodes
            .iter()
            .filter(move |node| !node.hostname.eq_ignore_ascii_case(hostname))
    }

    /// Canonical serialized form, as persisted by the stores
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Parses the stored form of a config
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A resolved config with the given brokers; the first one leads
    pub fn resolved(version: u64, hostnames: &[&str]) -> ResolvedConfig {
        let settings = if hostnames.len() > 1 {
            RawSettings::with_brokers("test", hostnames, Some("cluster.example.com"))
        } else {
            RawSettings::with_brokers("test", hostnames, None)
        };

        ResolvedConfig {
            version,
            mode: settings.implied_mode(),
            cluster: ClusterIdentity {
                uuid: Uuid::nil(),
                name: "test".to_string(),
                fqdn: settings.cluster.fqdn.clone(),
            },
            nodes: hostnames
                .iter()
                .enumerate()
                .map(|(index, hostname)| NodeDescriptor {
                    id: Uuid::new_v4(),
                    serial: index as u32 + 1,
                    hostname: hostname.to_string(),
                    role: if index == 0 { NodeRole::Leader } else { NodeRole::Follower },
                    flanking: false,
                    certificate_fingerprint: None,
                    last_seen: None,
                })
                .collect(),
            services: BTreeMap::new(),
            settings,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::resolved;
    use super::*;

    #[test]
    fn leader_and_peers_are_derived_from_nodes() {
        let config = resolved(4, &["a.example.com", "b.example.com", "c.example.com"]);
        assert_eq!(config.leader().map(|n| n.hostname.as_str()), Some("a.example.com"));
        assert_eq!(config.peers_of("a.example.com").count(), 2);
        assert_eq!(config.node("B.example.com").map(|n| n.serial), Some(2));
        assert_eq!(config.broker_count(), 3);
    }

    #[test]
    fn serialized_form_is_stable() {
        let config = resolved(1, &["a.example.com"]);
        let bytes = config.to_bytes().unwrap();
        assert_eq!(ResolvedConfig::from_bytes(&bytes).unwrap(), config);
        assert_eq!(ResolvedConfig::from_bytes(&bytes).unwrap().to_bytes().unwrap(), bytes);
    }
}
