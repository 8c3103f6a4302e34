// src/config/settings.rs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{schema, ConfigError};
use crate::resolver::model::{CertificateIdentity, DeploymentMode, DesiredState};

/// Operator-supplied settings, as submitted through setup, deploy or the
/// bootstrap file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSettings {
    /// Advisory mode; must agree with the node count when given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<DeploymentMode>,

    /// Cluster membership
    pub cluster: ClusterSettings,

    /// Per-service overrides of the default catalogue
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, ServiceOverride>,

    /// Free-form metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Cluster section of the settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Display name of the cluster
    pub name: String,

    /// Broker node hostnames; their count decides the deployment mode
    pub broker_nodes: Vec<String>,

    /// Flanking node hostnames; never leaders, never counted toward the mode
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flanking_nodes: Vec<String>,

    /// Cluster-wide FQDN, required with more than one broker node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,

    /// Explicit leader hostname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,

    /// Node certificate fingerprints, by hostname
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fingerprints: BTreeMap<String, String>,
}

/// Override of one service in the default catalogue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOverride {
    /// Image replacing the catalogue's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Desired container state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<DesiredState>,

    /// Certificate identity replacing the catalogue's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateIdentity>,
}

/// Operator notes kept with the settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Free-form comment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl RawSettings {
    /// Minimal settings for a single node
    pub fn standalone(name: &str, hostname: &str) -> Self {
        Self::with_brokers(name, &[hostname], None)
    }

    /// Minimal settings for the given broker nodes
    pub fn with_brokers(name: &str, hostnames: &[&str], fqdn: Option<&str>) -> Self {
        Self {
            mode: None,
            cluster: ClusterSettings {
                name: name.to_string(),
                broker_nodes: hostnames.iter().map(|h| h.to_ascii_lowercase()).collect(),
                flanking_nodes: Vec::new(),
                fqdn: fqdn.map(str::to_ascii_lowercase),
                leader: None,
                fingerprints: BTreeMap::new(),
            },
            services: BTreeMap::new(),
            metadata: None,
        }
    }

    /// Parses a YAML (or JSON) document, checking it against the schema first
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_yaml::from_str(content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Self::from_json_value(value)
    }

    /// Converts a JSON document, checking it against the schema first
    pub fn from_json_value(value: Value) -> Result<Self, ConfigError> {
        schema::validate_settings_against_schema(&value).map_err(ConfigError::SchemaViolation)?;
        serde_json::from_value(value)
            .map(Self::normalized)
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Lowercases every hostname; DNS names compare case-insensitively
    pub fn normalized(mut self) -> Self {
        let cluster = &mut self.cluster;
        for hostname in cluster.broker_nodes.iter_mut().chain(cluster.flanking_nodes.iter_mut()) {
            hostname.make_ascii_lowercase();
        }
        for hostname in cluster.fqdn.iter_mut().chain(cluster.leader.iter_mut()) {
            hostname.make_ascii_lowercase();
        }
        cluster.fingerprints = std::mem::take(&mut cluster.fingerprints)
            .into_iter()
            .map(|(hostname, fingerprint)| (hostname.to_ascii_lowercase(), fingerprint))
            .collect();
        self
    }

    /// JSON form of the settings
    pub fn to_json_value(&self) -> Result<Value, ConfigError> {
        serde_json::to_value(self).map_err(|e| ConfigError::SerializationError(e.to_string()))
    }

    /// Broker nodes first, then flanking nodes, in declaration order
    pub fn declared_nodes(&self) -> impl Iterator<Item = &str> {
        self.cluster
            .broker_nodes
            .iter()
            .chain(self.cluster.flanking_nodes.iter())
            .map(String::as_str)
    }

    /// Whether the hostname is declared as a broker or flanking node
    pub fn declares(&self, hostname: &str) -> bool {
        self.declared_nodes().any(|node| node.eq_ignore_ascii_case(hostname))
    }

    /// Mode implied by the number of broker nodes
    pub fn implied_mode(&self) -> DeploymentMode {
        if self.cluster.broker_nodes.len() > 1 {
            DeploymentMode::Clustered
        } else {
            DeploymentMode::Standalone
        }
    }

    /// Copy of these settings with one more broker node
    pub fn with_added_broker(&self, hostname: &str) -> Self {
        let mut settings = self.clone();
        settings.cluster.broker_nodes.push(hostname.to_ascii_lowercase());
        settings.mode = None;
        settings
    }

    /// Copy of these settings with an explicit leader
    pub fn with_leader(&self, hostname: &str) -> Self {
        let mut settings = self.clone();
        settings.cluster.leader = Some(hostname.to_ascii_lowercase());
        settings
    }

    /// Copy of these settings with a recorded node fingerprint
    pub fn with_fingerprint(&self, hostname: &str, fingerprint: &str) -> Self {
        let mut settings = self.clone();
        settings
            .cluster
            .fingerprints
            .insert(hostname.to_ascii_lowercase(), fingerprint.to_string());
        settings
    }
}
