// src/config/validator.rs

use std::collections::HashSet;

use tracing::warn;
use url::Url;

use crate::config::settings::RawSettings;
use crate::config::{parse_lifetime, ConfigError, Presets};
use crate::resolver::defaults;
use crate::resolver::model::DeploymentMode;

/// Presets validator
pub struct PresetsValidator {}

impl PresetsValidator {
    /// Creates a new presets validator
    pub fn new() -> Self {
        Self {}
    }

    /// Validates presets
    pub fn validate(&self, presets: &Presets) -> Result<(), ConfigError> {
        if presets.node_hostname.is_empty() {
            return Err(ConfigError::ValidationError(
                "Node hostname cannot be empty".to_string(),
            ));
        }

        // Validate endpoints
        self.validate_url("engine.url", &presets.engine.url)?;
        self.validate_url("kv.url", &presets.kv.url)?;

        if presets.history_retention == 0 {
            return Err(ConfigError::ValidationError(
                "History retention must keep at least one version".to_string(),
            ));
        }

        if presets.cluster.max_nodes == 0 {
            return Err(ConfigError::ValidationError(
                "Maximum node count cannot be zero".to_string(),
            ));
        }

        if presets.cluster.heartbeat_interval_secs == 0
            || presets.cluster.liveness_window_secs < presets.cluster.heartbeat_interval_secs
        {
            return Err(ConfigError::ValidationError(
                "Liveness window must cover at least one heartbeat interval".to_string(),
            ));
        }

        // Validate retry budgets
        for (name, policy) in [
            ("store", &presets.retry.store),
            ("engine", &presets.retry.engine),
            ("propagation", &presets.retry.propagation),
        ] {
            if policy.max_attempts == 0 || policy.timeout_ms == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "Retry policy {} needs at least one attempt and a non-zero timeout",
                    name
                )));
            }
            if policy.initial_backoff_ms > policy.max_backoff_ms {
                return Err(ConfigError::ValidationError(format!(
                    "Retry policy {} has an initial backoff above its cap",
                    name
                )));
            }
        }

        self.validate_lifetimes(presets)?;

        if presets.certificates.subject.c.chars().count() != 2 {
            return Err(ConfigError::ValidationError(
                "Default certificate country must be two characters".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_url(&self, name: &str, value: &str) -> Result<(), ConfigError> {
        let url = Url::parse(value).map_err(|e| {
            ConfigError::ValidationError(format!("Invalid URL for {}: {} ({})", name, value, e))
        })?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::ValidationError(format!(
                "Invalid URL for {}: {}. Only http and https are supported.",
                name, value
            )));
        }

        Ok(())
    }

    fn validate_lifetimes(&self, presets: &Presets) -> Result<(), ConfigError> {
        let certificates = &presets.certificates;
        let parse = |name: &str, value: &str| {
            parse_lifetime(value).ok_or_else(|| {
                ConfigError::ValidationError(format!("Invalid certificate lifetime {}: {}", name, value))
            })
        };

        let min = parse("lifetime_min", &certificates.lifetime_min)?;
        let default = parse("lifetime_default", &certificates.lifetime_default)?;
        let max = parse("lifetime_max", &certificates.lifetime_max)?;

        if min > default || default > max {
            return Err(ConfigError::ValidationError(
                "Certificate lifetimes must satisfy min <= default <= max".to_string(),
            ));
        }

        if certificates.renew_within_days < 0 {
            return Err(ConfigError::ValidationError(
                "Certificate renewal window cannot be negative".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for PresetsValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Structural validation of operator settings, after the schema check
pub struct SettingsValidator {
    max_nodes: usize,
    max_flanking_nodes: usize,
}

impl SettingsValidator {
    /// Creates a validator enforcing the given node limits
    pub fn new(max_nodes: usize, max_flanking_nodes: usize) -> Self {
        Self {
            max_nodes,
            max_flanking_nodes,
        }
    }

    /// Creates a validator from presets
    pub fn from_presets(presets: &Presets) -> Self {
        Self::new(presets.cluster.max_nodes, presets.cluster.max_flanking_nodes)
    }

    /// Validates settings
    pub fn validate(&self, settings: &RawSettings) -> Result<(), ConfigError> {
        let cluster = &settings.cluster;
        let name_len = cluster.name.chars().count();
        if !(2..=255).contains(&name_len) {
            return Err(ConfigError::ValidationError(
                "Cluster name must be between 2 and 255 characters".to_string(),
            ));
        }

        // Validate node counts
        let brokers = cluster.broker_nodes.len();
        if brokers == 0 {
            return Err(ConfigError::ValidationError(
                "At least one broker node is required".to_string(),
            ));
        }
        if brokers > self.max_nodes {
            return Err(ConfigError::ValidationError(format!(
                "At most {} broker nodes are supported, got {}",
                self.max_nodes, brokers
            )));
        }
        if brokers % 2 == 0 {
            warn!("An even number of broker nodes ({}) cannot tolerate a split vote", brokers);
        }
        if cluster.flanking_nodes.len() > self.max_flanking_nodes {
            return Err(ConfigError::ValidationError(format!(
                "At most {} flanking nodes are supported",
                self.max_flanking_nodes
            )));
        }

        // Validate hostnames are unique across both node lists
        let mut seen = HashSet::new();
        for node in settings.declared_nodes() {
            if !seen.insert(node.to_ascii_lowercase()) {
                return Err(ConfigError::ValidationError(format!(
                    "Node {} is declared more than once",
                    node
                )));
            }
        }

        if brokers > 1 && cluster.fqdn.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::ValidationError(
                "A cluster FQDN is required with more than one broker node".to_string(),
            ));
        }

        if let Some(leader) = &cluster.leader {
            if !cluster.broker_nodes.iter().any(|node| node.eq_ignore_ascii_case(leader)) {
                return Err(ConfigError::ValidationError(format!(
                    "Leader {} is not one of the broker nodes",
                    leader
                )));
            }
        }

        for hostname in cluster.fingerprints.keys() {
            if !settings.declares(hostname) {
                return Err(ConfigError::ValidationError(format!(
                    "Fingerprint given for undeclared node {}",
                    hostname
                )));
            }
        }

        // Validate the mode hint
        match settings.mode {
            Some(DeploymentMode::Ephemeral) => {
                return Err(ConfigError::ValidationError(
                    "Settings cannot request ephemeral mode".to_string(),
                ));
            }
            Some(mode) if mode != settings.implied_mode() => {
                return Err(ConfigError::ValidationError(format!(
                    "Mode {} does not match {} broker node(s)",
                    mode, brokers
                )));
            }
            _ => {}
        }

        self.validate_services(settings)
    }

    fn validate_services(&self, settings: &RawSettings) -> Result<(), ConfigError> {
        for (name, service) in &settings.services {
            if !defaults::is_known_service(name) {
                return Err(ConfigError::ValidationError(format!(
                    "Unknown service {}",
                    name
                )));
            }

            if let Some(image) = &service.image {
                if image.trim().is_empty() || image.contains(char::is_whitespace) {
                    return Err(ConfigError::ValidationError(format!(
                        "Invalid image reference for service {}",
                        name
                    )));
                }
            }

            if let Some(identity) = &service.certificate {
                if identity.cn.is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "Certificate identity of service {} needs a common name",
                        name
                    )));
                }
                if let Some(c) = &identity.c {
                    if c.chars().count() != 2 {
                        return Err(ConfigError::ValidationError(format!(
                            "Certificate country of service {} must be two characters",
                            name
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}
