// src/config/mod.rs

/// JSON schema of the settings document
pub mod schema;
/// Operator settings
pub mod settings;
/// Validation of presets and settings
pub mod validator;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::retry::RetryPolicy;

pub use settings::{RawSettings, ServiceOverride};

/// Presets: the daemon's own configuration, as opposed to operator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presets {
    /// Morio version advertised to peers
    pub version: String,

    /// Configuration folder (settings document, CA material, service TLS files)
    pub config_root: PathBuf,

    /// Data folder (CA state, audit log)
    pub data_root: PathBuf,

    /// Bootstrap settings file read at first boot when nothing is persisted
    pub bootstrap_file: Option<PathBuf>,

    /// Hostname of this node, matched against the declared nodes
    pub node_hostname: String,

    /// Log level used when RUST_LOG is not set
    pub log_level: String,

    /// Name of the container network managed services join
    pub network: String,

    /// Container engine configuration
    pub engine: EnginePresets,

    /// Distributed key-value store configuration
    pub kv: KvPresets,

    /// Cluster coordination configuration
    pub cluster: ClusterPresets,

    /// Number of resolved config versions retained for rollback and audit
    pub history_retention: usize,

    /// Seconds between two reconciliation passes of a service
    pub reconcile_interval_secs: u64,

    /// Certificate Authority configuration
    pub certificates: CertificatePresets,

    /// Retry budgets per class of external call
    pub retry: RetryPresets,
}

/// Container engine presets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnginePresets {
    /// Base URL of the Docker Engine API
    pub url: String,

    /// Engine API version prefix
    pub api_version: String,
}

/// Which key-value client backs the clustered store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvBackend {
    /// etcd v3 through its JSON gateway
    Etcd,

    /// In-process map, for single-process deployments and tests
    Memory,
}

/// Distributed key-value store presets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvPresets {
    /// Client implementation
    pub backend: KvBackend,

    /// Base URL of the etcd gateway
    pub url: String,

    /// Key namespace under which versions are stored
    pub namespace: String,

    /// Milliseconds between two polls of the current-version pointer
    pub watch_interval_ms: u64,
}

/// Cluster coordination presets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterPresets {
    /// TCP port the core service listens on for peer traffic
    pub peer_port: u16,

    /// Maximum number of broker nodes
    pub max_nodes: usize,

    /// Maximum number of flanking nodes
    pub max_flanking_nodes: usize,

    /// Seconds between heartbeats from followers to the leader
    pub heartbeat_interval_secs: u64,

    /// Heartbeat round trips slower than this are logged
    pub heartbeat_max_rtt_ms: u64,

    /// Seconds without reaching the leader after which a follower is stale
    pub liveness_window_secs: u64,
}

/// Certificate Authority presets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificatePresets {
    /// Shortest lifetime a requester may ask for
    pub lifetime_min: String,

    /// Lifetime used when a request does not ask for one
    pub lifetime_default: String,

    /// Longest lifetime, also used for service certificates
    pub lifetime_max: String,

    /// Service certificates expiring within this many days are renewed
    pub renew_within_days: i64,

    /// Subject fields used when an identity does not provide them
    pub subject: SubjectDefaults,
}

/// Default X.509 subject fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectDefaults {
    /// Organization name used as the default common name
    pub cn: String,
    /// Two-letter country code
    pub c: String,
    /// State or province
    pub st: String,
    /// Locality
    pub l: String,
    /// Organization
    pub o: String,
    /// Organizational unit
    pub ou: String,
}

/// Retry budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPresets {
    /// Config store reads and writes
    pub store: RetryPolicy,

    /// Container engine calls
    pub engine: RetryPolicy,

    /// Peer propagation and heartbeats
    pub propagation: RetryPolicy,
}

impl Default for Presets {
    fn default() -> Self {
        let node_hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());

        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_root: PathBuf::from("/etc/morio"),
            data_root: PathBuf::from("/var/lib/morio"),
            bootstrap_file: None,
            node_hostname,
            log_level: "info".to_string(),
            network: "morionet".to_string(),
            engine: EnginePresets {
                url: "http://127.0.0.1:2375".to_string(),
                api_version: "v1.43".to_string(),
            },
            kv: KvPresets {
                backend: KvBackend::Etcd,
                url: "http://127.0.0.1:2379".to_string(),
                namespace: "/morio/config".to_string(),
                watch_interval_ms: 2_000,
            },
            cluster: ClusterPresets {
                peer_port: 3007,
                max_nodes: 9,
                max_flanking_nodes: 36,
                heartbeat_interval_secs: 30,
                heartbeat_max_rtt_ms: 150,
                liveness_window_secs: 90,
            },
            history_retention: 10,
            reconcile_interval_secs: 15,
            certificates: CertificatePresets {
                lifetime_min: "5m".to_string(),
                lifetime_default: "750h".to_string(),
                lifetime_max: "17544h".to_string(),
                renew_within_days: 66,
                subject: SubjectDefaults {
                    cn: "Morio".to_string(),
                    c: "BE".to_string(),
                    st: "Brussels".to_string(),
                    l: "Brussels".to_string(),
                    o: "CERT-EU".to_string(),
                    ou: "Engineering Team".to_string(),
                },
            },
            retry: RetryPresets {
                store: RetryPolicy::conservative(),
                engine: RetryPolicy::conservative(),
                propagation: RetryPolicy {
                    max_attempts: 8,
                    initial_backoff_ms: 1_000,
                    max_backoff_ms: 60_000,
                    timeout_ms: 5_000,
                },
            },
        }
    }
}

impl Presets {
    /// Loads presets: built-in defaults, then an optional YAML file, then
    /// `MORIO_` environment variables (`MORIO_CLUSTER__PEER_PORT=4000`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let defaults = config::Config::try_from(&Self::default())
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileReadError {
                    path: path.to_string_lossy().into_owned(),
                    error: "file does not exist".to_string(),
                });
            }
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("MORIO")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let presets: Presets = builder
            .build()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        validator::PresetsValidator::new().validate(&presets)?;

        match path {
            Some(path) => info!("Presets loaded from {}", path.display()),
            None => debug!("Using built-in presets"),
        }

        Ok(presets)
    }

    /// Folder holding the CA root material and state
    pub fn ca_dir(&self) -> PathBuf {
        self.data_root.join("ca")
    }

    /// Path of the file-backed config store document
    pub fn settings_document(&self) -> PathBuf {
        self.config_root.join("settings.json")
    }

    /// Folder receiving a service's TLS material
    pub fn service_dir(&self, service: &str) -> PathBuf {
        self.config_root.join(service)
    }

    /// Reads the bootstrap settings file, if one is configured and present
    pub fn read_bootstrap(&self) -> Result<Option<RawSettings>, ConfigError> {
        let path = match &self.bootstrap_file {
            Some(path) if path.exists() => path,
            _ => return Ok(None),
        };

        let content = fs::read_to_string(path).map_err(|e| ConfigError::FileReadError {
            path: path.to_string_lossy().into_owned(),
            error: e.to_string(),
        })?;

        info!("Reading bootstrap settings from {}", path.display());

        RawSettings::from_yaml_str(&content).map(Some)
    }
}

/// Parses a certificate lifetime such as `750h`, `5m` or `30s`
pub fn parse_lifetime(lifetime: &str) -> Option<Duration> {
    let lifetime = lifetime.trim();
    if lifetime.len() < 2 {
        return None;
    }

    let (count, unit) = lifetime.split_at(lifetime.len() - 1);
    let count: i64 = count.parse().ok()?;
    if count <= 0 {
        return None;
    }

    match unit {
        "h" => Some(Duration::hours(count)),
        "m" => Some(Duration::minutes(count)),
        "s" => Some(Duration::seconds(count)),
        _ => None,
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {error}")]
    FileReadError {
        path: String,
        error: String,
    },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Failed to serialize configuration: {0}")]
    SerializationError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Settings violate the schema: {0}")]
    SchemaViolation(String),
}
