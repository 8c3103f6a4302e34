// src/resolver/defaults.rs

use std::collections::BTreeMap;

use crate::config::settings::RawSettings;
use crate::resolver::model::{CertificateIdentity, DeploymentMode, DesiredState, ServiceSpec};

/// Services in the order they are brought up on an operational node
pub const SERVICE_ORDER: [&str; 9] = [
    "ca", "db", "proxy", "api", "ui", "broker", "console", "connector", "dbuilder",
];

/// Services brought up while a node waits for setup
pub const EPHEMERAL_SERVICE_ORDER: [&str; 3] = ["proxy", "api", "ui"];

/// Services that are only wanted when the settings mention them
const OPTIONAL_SERVICES: [&str; 2] = ["connector", "dbuilder"];

/// Services running on flanking nodes
const FLANKING_SERVICES: [&str; 2] = ["proxy", "connector"];

/// Whether the name is part of the service catalogue
pub fn is_known_service(name: &str) -> bool {
    name == "core" || SERVICE_ORDER.contains(&name)
}

/// Numeric code identifying a service in status reports
pub fn service_code(name: &str) -> Option<u16> {
    match name {
        "core" => Some(10),
        "api" => Some(11),
        "ca" => Some(12),
        "broker" => Some(13),
        "db" => Some(14),
        "console" => Some(15),
        "ui" => Some(16),
        "proxy" => Some(17),
        "connector" => Some(18),
        "dbuilder" => Some(19),
        _ => None,
    }
}

/// Default container image for a service
pub fn default_image(name: &str, version: &str) -> Option<String> {
    let image = match name {
        "ca" => "smallstep/step-ca:0.25.2".to_string(),
        "db" => "rqlite/rqlite:8.24.2".to_string(),
        "proxy" => "traefik:2.10.7".to_string(),
        "broker" => "docker.redpanda.com/redpandadata/redpanda:v23.3.4".to_string(),
        "console" => "docker.redpanda.com/redpandadata/console:v2.5.2".to_string(),
        "connector" => "docker.elastic.co/logstash/logstash:8.13.3".to_string(),
        "core" | "api" | "ui" | "dbuilder" => format!("morio/{}:{}", name, version),
        _ => return None,
    };
    Some(image)
}

/// Default certificate identity, for services that talk TLS to their peers
fn default_identity(name: &str, hostname: &str, fqdn: Option<&str>) -> Option<CertificateIdentity> {
    match name {
        "broker" | "db" | "proxy" | "api" | "console" | "connector" => {
            let mut san = vec![hostname.to_string(), name.to_string()];
            if let Some(fqdn) = fqdn {
                san.push(fqdn.to_string());
            }
            Some(CertificateIdentity {
                cn: format!("{}.{}", name, hostname),
                c: None,
                st: None,
                l: None,
                o: None,
                ou: None,
                san,
            })
        }
        _ => None,
    }
}

/// Builds the services wanted on a node, with operator overrides applied.
///
/// `flanking` restricts the catalogue to the services flanking nodes run.
pub fn services_for(
    settings: &RawSettings,
    mode: DeploymentMode,
    hostname: &str,
    flanking: bool,
    version: &str,
) -> BTreeMap<String, ServiceSpec> {
    let order: &[&str] = match mode {
        DeploymentMode::Ephemeral => &EPHEMERAL_SERVICE_ORDER,
        _ => &SERVICE_ORDER,
    };

    let mut services = BTreeMap::new();
    for name in order {
        if flanking && !FLANKING_SERVICES.contains(name) {
            continue;
        }

        let overrides = settings.services.get(*name);
        if OPTIONAL_SERVICES.contains(name) && overrides.is_none() {
            continue;
        }

        let image = overrides
            .and_then(|o| o.image.clone())
            .or_else(|| default_image(name, version));
        let image = match image {
            Some(image) => image,
            None => continue,
        };

        // Ephemeral services run before the CA has a root
        let certificate = match mode {
            DeploymentMode::Ephemeral => None,
            _ => overrides
                .and_then(|o| o.certificate.clone())
                .or_else(|| default_identity(name, hostname, settings.cluster.fqdn.as_deref())),
        };

        services.insert(
            name.to_string(),
            ServiceSpec {
                name: name.to_string(),
                image,
                desired: overrides
                    .and_then(|o| o.desired)
                    .unwrap_or(DesiredState::Running),
                certificate,
            },
        );
    }

    services
}

/// Services run while a node waits for setup
pub fn ephemeral_services(version: &str) -> BTreeMap<String, ServiceSpec> {
    EPHEMERAL_SERVICE_ORDER
        .iter()
        .filter_map(|name| {
            let image = default_image(name, version)?;
            Some((
                name.to_string(),
                ServiceSpec {
                    name: name.to_string(),
                    image,
                    desired: DesiredState::Running,
                    certificate: None,
                },
            ))
        })
        .collect()
}

/// Position of a service in the start order; unknown services go last
pub fn start_rank(name: &str) -> usize {
    SERVICE_ORDER
        .iter()
        .position(|candidate| *candidate == name)
        .unwrap_or(SERVICE_ORDER.len())
}
