// src/ca/record.rs

use std::fmt;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// X.509 subject fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Common name
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

/// Who a certificate was issued to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "id")]
pub enum IssuedTo {
    /// A cluster node, by id
    Node(Uuid),
    /// A managed service, by name
    Service(String),
    /// An operator, by name
    Operator(String),
}

impl fmt::Display for IssuedTo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssuedTo::Node(id) => write!(f, "node {}", id),
            IssuedTo::Service(name) => write!(f, "service {}", name),
            IssuedTo::Operator(name) => write!(f, "operator {}", name),
        }
    }
}

/// A certificate the CA issued. Records are only ever created by the CA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    /// Unique, monotonic serial number
    pub serial: u64,
    /// Subject the certificate was issued for
    pub subject: Subject,
    /// Subject alternative names
    pub san: Vec<String>,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
    /// Who requested the certificate
    pub issued_to: IssuedTo,

    /// SHA-256 fingerprint of the DER encoding, hex
    pub fingerprint: String,

    /// Fingerprint of the root that signed this certificate
    pub issuer_fingerprint: String,

    /// Serial of the record this one renewed
    #[serde(default)]
    pub supersedes: Option<u64>,

    /// Signed certificate, PEM encoded
    pub certificate_pem: String,
}

impl CertificateRecord {
    /// Whether the validity window has passed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }

    /// Whether the certificate expires within the given window from `now`
    pub fn expires_within(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        self.not_after - now <= window
    }
}

/// Validation outcome for a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validity {
    /// Within its validity window and not revoked
    Valid,
    /// Past its end of validity
    Expired,
    /// Revoked or superseded
    Revoked,
}

/// A freshly issued certificate. The private key is handed over here and
/// not retained by the CA.
pub struct IssuedCertificate {
    /// Record the CA keeps
    pub record: CertificateRecord,

    /// Leaf private key; the CA does not retain it
    pub private_key: SecretString,

    /// PEM of the root the certificate chains to
    pub ca_pem: String,
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("record", &self.record)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

impl IssuedCertificate {
    /// PEM encoded private key
    pub fn private_key_pem(&self) -> &str {
        self.private_key.expose_secret()
    }
}

/// Explicit, audited request to replace the root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootRotation {
    /// Must be true; rotation invalidates every certificate signed so far
    pub confirm: bool,

    /// Recorded in the audit log
    pub reason: String,
}

/// Outcome of a root rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationReport {
    /// Fingerprint of the replaced root
    pub previous_fingerprint: String,
    /// Fingerprint of the new root
    pub fingerprint: String,

    /// Unexpired, unrevoked certificates that chained to the previous root
    pub invalidated: usize,
}
