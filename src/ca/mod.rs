// src/ca/mod.rs

/// Certificate records, root rotation and issued material
pub mod record;
/// Certificate requests and their validation
pub mod request;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, SubsecRound, Utc};
use rand::Rng;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::config::{parse_lifetime, CertificatePresets, SubjectDefaults};
use crate::store::file::write_atomic;

pub use record::{
    CertificateRecord, IssuedCertificate, IssuedTo, RootRotation, RotationReport, Subject, Validity,
};
pub use request::{CertificateRequest, ValidatedRequest};

const ROOT_KEY_FILE: &str = "root.key";
const ROOT_CERT_FILE: &str = "root.crt";
const STATE_FILE: &str = "state.json";
const AUDIT_FILE: &str = "audit.log";

/// Root certificates are valid for ten years
const ROOT_LIFETIME_DAYS: i64 = 3650;

/// Root metadata needed to rebuild the issuer after a restart
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RootRecord {
    subject: Subject,
    serial: u64,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,

    /// SHA-256 of the root certificate DER
    fingerprint: String,

    /// SHA-256 of the root public key, checked against the key on disk
    key_fingerprint: String,
}

/// Everything the CA persists apart from the root key and certificate
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Ledger {
    last_serial: u64,
    root: Option<RootRecord>,
    records: BTreeMap<u64, CertificateRecord>,
    revoked: BTreeSet<u64>,
}

/// Root signing material, only ever held inside the CA
struct RootMaterial {
    key: KeyPair,
    cert: Certificate,
    pem: String,
    fingerprint: String,
}

/// Lifetime bounds for leaf certificates
#[derive(Debug, Clone, Copy)]
struct Lifetimes {
    min: Duration,
    default: Duration,
    max: Duration,
}

/// Internal Certificate Authority
pub struct CertificateAuthority {
    dir: PathBuf,
    lifetimes: Lifetimes,
    renew_within: Duration,
    subject_defaults: SubjectDefaults,
    root: RwLock<Option<RootMaterial>>,
    last_serial: AtomicU64,
    ledger: Mutex<Ledger>,
}

impl CertificateAuthority {
    /// Opens the CA in `dir`, loading the root if one was created before.
    ///
    /// A root key that is missing, unreadable or does not match the recorded
    /// root is reported as `RootKeyCorrupt`; it is never replaced here.
    pub async fn open(dir: impl Into<PathBuf>, presets: &CertificatePresets) -> Result<Self, CaError> {
        let dir = dir.into();
        let lifetime = |value: &str| {
            parse_lifetime(value).ok_or_else(|| CaError::InvalidLifetime(value.to_string()))
        };
        let lifetimes = Lifetimes {
            min: lifetime(&presets.lifetime_min)?,
            default: lifetime(&presets.lifetime_default)?,
            max: lifetime(&presets.lifetime_max)?,
        };

        let state_path = dir.join(STATE_FILE);
        let ledger = match fs::read(&state_path).await {
            Ok(bytes) => serde_json::from_slice::<Ledger>(&bytes)
                .map_err(|e| CaError::StateCorrupt(e.to_string()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ledger::default(),
            Err(e) => return Err(read_failed(&state_path, e)),
        };

        settle_staged_root(&dir, ledger.root.as_ref()).await?;

        let root = match &ledger.root {
            Some(record) => Some(Self::load_root(&dir, record).await?),
            None => {
                if fs::metadata(dir.join(ROOT_KEY_FILE)).await.is_ok() {
                    return Err(CaError::RootKeyCorrupt(
                        "a root key exists but no root is recorded".to_string(),
                    ));
                }
                None
            }
        };

        if let Some(root) = &root {
            info!("Loaded CA root {}", root.fingerprint);
        } else {
            debug!("No CA root yet in {}", dir.display());
        }

        Ok(Self {
            dir,
            lifetimes,
            renew_within: Duration::days(presets.renew_within_days),
            subject_defaults: presets.subject.clone(),
            root: RwLock::new(root),
            last_serial: AtomicU64::new(ledger.last_serial),
            ledger: Mutex::new(ledger),
        })
    }

    async fn load_root(dir: &Path, record: &RootRecord) -> Result<RootMaterial, CaError> {
        let key_path = dir.join(ROOT_KEY_FILE);
        let key_pem = Zeroizing::new(fs::read_to_string(&key_path).await.map_err(|e| {
            CaError::RootKeyCorrupt(format!("cannot read {}: {}", key_path.display(), e))
        })?);
        let key = KeyPair::from_pem(&key_pem)
            .map_err(|e| CaError::RootKeyCorrupt(format!("cannot parse root key: {}", e)))?;

        if fingerprint(&key.public_key_der()) != record.key_fingerprint {
            return Err(CaError::RootKeyCorrupt(
                "root key does not match the recorded root".to_string(),
            ));
        }

        let cert_path = dir.join(ROOT_CERT_FILE);
        let pem = fs::read_to_string(&cert_path)
            .await
            .map_err(|e| read_failed(&cert_path, e))?;

        let cert = root_params(record)?
            .self_signed(&key)
            .map_err(|e| CaError::RootKeyCorrupt(format!("cannot rebuild root: {}", e)))?;

        Ok(RootMaterial {
            key,
            cert,
            pem,
            fingerprint: record.fingerprint.clone(),
        })
    }

    /// Creates the root on first use; an existing root is kept as is.
    /// Returns the root fingerprint.
    pub async fn ensure_root(&self) -> Result<String, CaError> {
        let mut root = self.root.write().await;
        if let Some(existing) = root.as_ref() {
            return Ok(existing.fingerprint.clone());
        }

        let material = self.create_root().await?;
        let fingerprint = material.fingerprint.clone();
        *root = Some(material);

        info!("Created CA root {}", fingerprint);
        Ok(fingerprint)
    }

    /// Generates and persists a new root, updating the ledger
    async fn create_root(&self) -> Result<RootMaterial, CaError> {
        let now = Utc::now().trunc_subsecs(0);
        let subject = Subject {
            cn: format!("{} Root CA", self.subject_defaults.cn),
            c: self.subject_defaults.c.clone(),
            st: self.subject_defaults.st.clone(),
            l: self.subject_defaults.l.clone(),
            o: self.subject_defaults.o.clone(),
            ou: self.subject_defaults.ou.clone(),
        };

        let key = KeyPair::generate().map_err(|e| CaError::SigningError(e.to_string()))?;
        let mut record = RootRecord {
            subject,
            serial: rand::thread_rng().gen_range(1..u64::MAX),
            not_before: now,
            not_after: now + Duration::days(ROOT_LIFETIME_DAYS),
            fingerprint: String::new(),
            key_fingerprint: fingerprint(&key.public_key_der()),
        };

        let cert = root_params(&record)?
            .self_signed(&key)
            .map_err(|e| CaError::SigningError(e.to_string()))?;
        record.fingerprint = fingerprint(cert.der());
        let pem = cert.pem();

        // Stage the key and certificate, record the root, then move them in
        let key_pem = SecretString::new(key.serialize_pem());
        let staged_key = staged(&self.dir.join(ROOT_KEY_FILE));
        let staged_cert = staged(&self.dir.join(ROOT_CERT_FILE));
        let staging = async {
            write_atomic(&staged_key, key_pem.expose_secret().as_bytes())
                .await
                .map_err(|e| write_failed(&staged_key, e))?;
            restrict_permissions(&staged_key).await;
            write_atomic(&staged_cert, pem.as_bytes())
                .await
                .map_err(|e| write_failed(&staged_cert, e))
        };
        if let Err(e) = staging.await {
            discard_staged(&self.dir).await;
            return Err(e);
        }

        let mut ledger = self.ledger.lock().await;
        let mut next = ledger.clone();
        next.root = Some(record.clone());
        if let Err(e) = self.persist(&next).await {
            discard_staged(&self.dir).await;
            return Err(e);
        }
        *ledger = next;

        // An interrupted promotion is finished on the next open
        promote_staged(&self.dir).await?;

        Ok(RootMaterial {
            key,
            cert,
            pem,
            fingerprint: record.fingerprint,
        })
    }

    /// PEM of the current root
    pub async fn root_pem(&self) -> Option<String> {
        self.root.read().await.as_ref().map(|root| root.pem.clone())
    }

    /// Fingerprint of the current root
    pub async fn root_fingerprint(&self) -> Option<String> {
        self.root.read().await.as_ref().map(|root| root.fingerprint.clone())
    }

    /// Highest serial handed out so far
    pub fn last_serial(&self) -> u64 {
        self.last_serial.load(Ordering::SeqCst)
    }

    /// Default subject fields for identities that do not set them
    pub fn subject_defaults(&self) -> &SubjectDefaults {
        &self.subject_defaults
    }

    /// Validates and signs a request. The private key goes to the caller.
    pub async fn issue_certificate(&self, request: &CertificateRequest) -> Result<IssuedCertificate, CaError> {
        let validated = request.validate()?;
        self.issue_validated(validated, None).await
    }

    async fn issue_validated(
        &self,
        request: ValidatedRequest,
        supersedes: Option<u64>,
    ) -> Result<IssuedCertificate, CaError> {
        let lifetime = self.lifetime_for(request.lifetime.as_deref())?;

        let root = self.root.read().await;
        let root = root.as_ref().ok_or(CaError::NotInitialized)?;

        let mut params = CertificateParams::default();
        let mut san = Vec::with_capacity(request.san.len());
        for name in &request.san {
            let name = name
                .clone()
                .try_into()
                .map_err(|_| CaError::ValidationError(format!("{:?} is not a valid DNS name", name)))?;
            san.push(SanType::DnsName(name));
        }
        params.subject_alt_names = san;

        let key = KeyPair::generate().map_err(|e| CaError::SigningError(e.to_string()))?;

        // Serials are allocated only once the request is known to be valid
        let serial = self.last_serial.fetch_add(1, Ordering::SeqCst) + 1;

        let not_before = Utc::now().trunc_subsecs(0);
        let not_after = not_before + lifetime;
        params.distinguished_name = distinguished_name(&request.subject);
        params.not_before = offset(not_before)?;
        params.not_after = offset(not_after)?;
        params.serial_number = Some(SerialNumber::from(serial));
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let cert = params
            .signed_by(&key, &root.cert, &root.key)
            .map_err(|e| CaError::SigningError(e.to_string()))?;

        let record = CertificateRecord {
            serial,
            subject: request.subject,
            san: request.san,
            not_before,
            not_after,
            issued_to: request.issued_to,
            fingerprint: fingerprint(cert.der()),
            issuer_fingerprint: root.fingerprint.clone(),
            supersedes,
            certificate_pem: cert.pem(),
        };

        {
            let mut ledger = self.ledger.lock().await;
            let mut next = ledger.clone();
            next.last_serial = next.last_serial.max(serial);
            next.records.insert(serial, record.clone());
            self.persist(&next).await?;
            *ledger = next;
        }

        metrics::increment_counter!("morio_certificates_issued_total");
        info!(
            serial,
            "Issued certificate for {} ({}) valid until {}",
            record.subject.cn,
            record.issued_to,
            record.not_after
        );

        Ok(IssuedCertificate {
            record,
            private_key: SecretString::new(key.serialize_pem()),
            ca_pem: root.pem.clone(),
        })
    }

    /// Requested lifetime clamped to the CA bounds
    fn lifetime_for(&self, requested: Option<&str>) -> Result<Duration, CaError> {
        let lifetime = match requested {
            Some(value) => parse_lifetime(value).ok_or_else(|| {
                CaError::ValidationError(format!("invalid certificate lifetime {:?}", value))
            })?,
            None => self.lifetimes.default,
        };

        Ok(lifetime.max(self.lifetimes.min).min(self.lifetimes.max))
    }

    /// Issues a replacement for a record; the new record references the old one
    pub async fn renew(&self, serial: u64, lifetime: Option<String>) -> Result<IssuedCertificate, CaError> {
        let previous = self.record(serial).await.ok_or(CaError::UnknownSerial(serial))?;
        let request = ValidatedRequest {
            subject: previous.subject,
            san: previous.san,
            lifetime,
            issued_to: previous.issued_to,
        };

        let issued = self.issue_validated(request, Some(serial)).await?;
        info!("Certificate {} superseded by {}", serial, issued.record.serial);
        Ok(issued)
    }

    /// Revokes a certificate. Revoking twice is harmless.
    pub async fn revoke(&self, serial: u64) -> Result<CertificateRecord, CaError> {
        let mut ledger = self.ledger.lock().await;
        let record = ledger
            .records
            .get(&serial)
            .cloned()
            .ok_or(CaError::UnknownSerial(serial))?;

        if ledger.revoked.contains(&serial) {
            return Ok(record);
        }

        let mut next = ledger.clone();
        next.revoked.insert(serial);
        self.persist(&next).await?;
        *ledger = next;

        warn!(serial, "Revoked certificate for {}", record.subject.cn);
        Ok(record)
    }

    /// Checks a record against the CA's own ledger
    pub async fn validate(&self, record: &CertificateRecord) -> Result<Validity, CaError> {
        self.validate_at(record, Utc::now()).await
    }

    /// Checks a record at a given instant
    pub async fn validate_at(&self, record: &CertificateRecord, now: DateTime<Utc>) -> Result<Validity, CaError> {
        let ledger = self.ledger.lock().await;
        let known = ledger
            .records
            .get(&record.serial)
            .ok_or(CaError::UnknownSerial(record.serial))?;

        if known.fingerprint != record.fingerprint {
            return Err(CaError::UnknownSerial(record.serial));
        }

        if ledger.revoked.contains(&record.serial) {
            Ok(Validity::Revoked)
        } else if known.is_expired_at(now) {
            Ok(Validity::Expired)
        } else {
            Ok(Validity::Valid)
        }
    }

    /// Looks up a record by serial
    pub async fn record(&self, serial: u64) -> Option<CertificateRecord> {
        self.ledger.lock().await.records.get(&serial).cloned()
    }

    /// All records, by serial
    pub async fn records(&self) -> Vec<CertificateRecord> {
        self.ledger.lock().await.records.values().cloned().collect()
    }

    /// Newest record for an identity that is unrevoked, unexpired and
    /// signed by the current root
    pub async fn valid_record_for(&self, issued_to: &IssuedTo, cn: &str) -> Option<CertificateRecord> {
        let root = self.root_fingerprint().await?;
        let now = Utc::now();
        let ledger = self.ledger.lock().await;

        ledger
            .records
            .values()
            .rev()
            .find(|record| {
                &record.issued_to == issued_to
                    && record.subject.cn == cn
                    && record.issuer_fingerprint == root
                    && !ledger.revoked.contains(&record.serial)
                    && !record.is_expired_at(now)
            })
            .cloned()
    }

    /// Whether a record is due for renewal
    pub fn needs_renewal(&self, record: &CertificateRecord) -> bool {
        record.expires_within(Utc::now(), self.renew_within)
    }

    /// Replaces the root. Requires explicit confirmation and is written to
    /// the audit log; certificates signed by the previous root are counted,
    /// not revoked.
    pub async fn rotate_root(&self, rotation: &RootRotation) -> Result<RotationReport, CaError> {
        if !rotation.confirm {
            return Err(CaError::RotationNotConfirmed);
        }

        let mut root = self.root.write().await;
        let previous = root
            .as_ref()
            .map(|root| root.fingerprint.clone())
            .ok_or(CaError::NotInitialized)?;

        let invalidated = {
            let ledger = self.ledger.lock().await;
            let now = Utc::now();
            ledger
                .records
                .values()
                .filter(|record| {
                    record.issuer_fingerprint == previous
                        && !ledger.revoked.contains(&record.serial)
                        && !record.is_expired_at(now)
                })
                .count()
        };

        let material = self.create_root().await?;
        let report = RotationReport {
            previous_fingerprint: previous,
            fingerprint: material.fingerprint.clone(),
            invalidated,
        };
        *root = Some(material);

        self.audit(rotation, &report).await?;
        warn!(
            "CA root rotated from {} to {} ({} certificate(s) invalidated): {}",
            report.previous_fingerprint, report.fingerprint, report.invalidated, rotation.reason
        );

        Ok(report)
    }

    async fn audit(&self, rotation: &RootRotation, report: &RotationReport) -> Result<(), CaError> {
        let path = self.dir.join(AUDIT_FILE);
        let entry = serde_json::json!({
            "at": Utc::now(),
            "action": "rotate_root",
            "reason": rotation.reason,
            "previous_fingerprint": report.previous_fingerprint,
            "fingerprint": report.fingerprint,
            "invalidated": report.invalidated,
        });

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| write_failed(&path, e))?;
        file.write_all(format!("{}\n", entry).as_bytes())
            .await
            .map_err(|e| write_failed(&path, e))?;
        file.flush().await.map_err(|e| write_failed(&path, e))
    }

    async fn persist(&self, ledger: &Ledger) -> Result<(), CaError> {
        let path = self.dir.join(STATE_FILE);
        let bytes = serde_json::to_vec_pretty(ledger).map_err(|e| CaError::StateCorrupt(e.to_string()))?;
        write_atomic(&path, &bytes).await.map_err(|e| {
            error!("Failed to persist CA state: {}", e);
            write_failed(&path, e)
        })
    }
}

/// Writes a service's TLS material (`tls-cert.pem`, `tls-key.pem`,
/// `tls-ca.pem`) into `dir`
pub async fn write_service_material(dir: &Path, issued: &IssuedCertificate) -> Result<(), CaError> {
    let files = [
        ("tls-cert.pem", issued.record.certificate_pem.as_str()),
        ("tls-key.pem", issued.private_key_pem()),
        ("tls-ca.pem", issued.ca_pem.as_str()),
    ];

    for (name, content) in files {
        let path = dir.join(name);
        write_atomic(&path, content.as_bytes())
            .await
            .map_err(|e| write_failed(&path, e))?;
    }
    restrict_permissions(&dir.join("tls-key.pem")).await;

    debug!("Wrote TLS material to {}", dir.display());
    Ok(())
}

/// Whether a service's TLS material is present in `dir`
pub async fn service_material_present(dir: &Path) -> bool {
    for name in ["tls-cert.pem", "tls-key.pem", "tls-ca.pem"] {
        if fs::metadata(dir.join(name)).await.is_err() {
            return false;
        }
    }
    true
}

/// Hex SHA-256 of a DER encoding
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

fn root_params(record: &RootRecord) -> Result<CertificateParams, CaError> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(&record.subject);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.serial_number = Some(SerialNumber::from(record.serial));
    params.not_before = offset(record.not_before)?;
    params.not_after = offset(record.not_after)?;
    Ok(params)
}

fn distinguished_name(subject: &Subject) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CountryName, subject.c.clone());
    dn.push(DnType::StateOrProvinceName, subject.st.clone());
    dn.push(DnType::LocalityName, subject.l.clone());
    dn.push(DnType::OrganizationName, subject.o.clone());
    dn.push(DnType::OrganizationalUnitName, subject.ou.clone());
    dn.push(DnType::CommonName, subject.cn.clone());
    dn
}

fn offset(at: DateTime<Utc>) -> Result<OffsetDateTime, CaError> {
    OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| CaError::SigningError(format!("timestamp out of range: {}", e)))
}

fn staged(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".staged");
    PathBuf::from(name)
}

/// Moves a staged root into place
async fn promote_staged(dir: &Path) -> Result<(), CaError> {
    for name in [ROOT_KEY_FILE, ROOT_CERT_FILE] {
        let path = dir.join(name);
        match fs::rename(staged(&path), &path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(write_failed(&path, e)),
        }
    }
    Ok(())
}

async fn discard_staged(dir: &Path) {
    for name in [ROOT_KEY_FILE, ROOT_CERT_FILE] {
        let path = staged(&dir.join(name));
        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }
}

/// Finishes a root left staged by an interrupted write when the ledger
/// already records it, and drops it otherwise
async fn settle_staged_root(dir: &Path, record: Option<&RootRecord>) -> Result<(), CaError> {
    let pem = match fs::read_to_string(staged(&dir.join(ROOT_KEY_FILE))).await {
        Ok(pem) => Zeroizing::new(pem),
        Err(_) => {
            discard_staged(dir).await;
            return Ok(());
        }
    };

    let staged_fingerprint = KeyPair::from_pem(&pem)
        .ok()
        .map(|key| fingerprint(&key.public_key_der()));
    match (staged_fingerprint, record) {
        (Some(staged), Some(record)) if staged == record.key_fingerprint => {
            info!("Completing staged CA root {}", record.fingerprint);
            promote_staged(dir).await
        }
        _ => {
            warn!("Discarding a CA root that was never recorded");
            discard_staged(dir).await;
            Ok(())
        }
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await {
        warn!("Failed to restrict permissions on {}: {}", path.display(), e);
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) {}

fn write_failed(path: &Path, e: impl std::fmt::Display) -> CaError {
    CaError::FilesystemWriteFailed {
        path: path.to_string_lossy().into_owned(),
        error: e.to_string(),
    }
}

fn read_failed(path: &Path, e: impl std::fmt::Display) -> CaError {
    CaError::ReadFailed {
        path: path.to_string_lossy().into_owned(),
        error: e.to_string(),
    }
}

/// Certificate Authority errors
#[derive(Debug, Error)]
pub enum CaError {
    #[error("Invalid certificate request: {0}")]
    ValidationError(String),

    #[error("Failed to sign certificate: {0}")]
    SigningError(String),

    #[error("The CA has no root yet")]
    NotInitialized,

    #[error("CA root key is unusable: {0}")]
    RootKeyCorrupt(String),

    #[error("CA state is unreadable: {0}")]
    StateCorrupt(String),

    #[error("No certificate with serial {0}")]
    UnknownSerial(u64),

    #[error("Root rotation must be explicitly confirmed")]
    RotationNotConfirmed,

    #[error("Invalid certificate lifetime preset: {0}")]
    InvalidLifetime(String),

    #[error("Failed to write {path}: {error}")]
    FilesystemWriteFailed {
        path: String,
        error: String,
    },

    #[error("Failed to read {path}: {error}")]
    ReadFailed {
        path: String,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Presets;

    fn request(cn: &str, c: &str) -> CertificateRequest {
        CertificateRequest {
            cn: cn.to_string(),
            c: c.to_string(),
            st: "X".to_string(),
            l: "Y".to_string(),
            o: "Z".to_string(),
            ou: "W".to_string(),
            san: vec![format!("{}.local", cn)],
            lifetime: None,
            issued_to: IssuedTo::Operator("test".to_string()),
        }
    }

    async fn ca(dir: &Path) -> CertificateAuthority {
        let ca = CertificateAuthority::open(dir, &Presets::default().certificates)
            .await
            .unwrap();
        ca.ensure_root().await.unwrap();
        ca
    }

    #[tokio::test]
    async fn serials_increase_by_one() {
        let dir = tempfile::tempdir().unwrap();
        let ca = ca(dir.path()).await;

        let first = ca.issue_certificate(&request("node-a", "US")).await.unwrap();
        let second = ca.issue_certificate(&request("node-b", "US")).await.unwrap();
        assert_eq!(second.record.serial, first.record.serial + 1);
        assert!(second.record.not_after > second.record.not_before);
        assert_eq!(second.record.san, vec!["node-b.local"]);
        assert!(second.record.certificate_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(second.private_key_pem().contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn invalid_requests_leave_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let ca = ca(dir.path()).await;
        ca.issue_certificate(&request("node-a", "US")).await.unwrap();
        let before = ca.last_serial();

        let result = ca.issue_certificate(&request("node-b", "USA")).await;
        assert!(matches!(result, Err(CaError::ValidationError(_))));
        assert_eq!(ca.last_serial(), before);
        assert_eq!(ca.records().await.len(), 1);
    }

    #[tokio::test]
    async fn issuing_without_a_root_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::open(dir.path(), &Presets::default().certificates)
            .await
            .unwrap();
        let result = ca.issue_certificate(&request("node-a", "US")).await;
        assert!(matches!(result, Err(CaError::NotInitialized)));
    }

    #[tokio::test]
    async fn revoked_and_expired_records_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let ca = ca(dir.path()).await;
        let issued = ca.issue_certificate(&request("node-a", "US")).await.unwrap();
        let record = issued.record.clone();

        assert_eq!(ca.validate(&record).await.unwrap(), Validity::Valid);
        assert_eq!(
            ca.validate_at(&record, record.not_after + Duration::seconds(1))
                .await
                .unwrap(),
            Validity::Expired
        );

        ca.revoke(record.serial).await.unwrap();
        ca.revoke(record.serial).await.unwrap();
        assert_eq!(ca.validate(&record).await.unwrap(), Validity::Revoked);
    }

    #[tokio::test]
    async fn records_from_elsewhere_are_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let ca = ca(dir.path()).await;
        let mut record = ca.issue_certificate(&request("node-a", "US")).await.unwrap().record;
        record.fingerprint = "00".repeat(32);
        assert!(matches!(ca.validate(&record).await, Err(CaError::UnknownSerial(_))));
    }

    #[tokio::test]
    async fn lifetimes_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let ca = ca(dir.path()).await;

        let mut short = request("node-a", "US");
        short.lifetime = Some("1s".to_string());
        let record = ca.issue_certificate(&short).await.unwrap().record;
        assert_eq!(record.not_after - record.not_before, Duration::minutes(5));

        let mut long = request("node-b", "US");
        long.lifetime = Some("99999h".to_string());
        let record = ca.issue_certificate(&long).await.unwrap().record;
        assert_eq!(record.not_after - record.not_before, Duration::hours(17544));

        let mut bad = request("node-c", "US");
        bad.lifetime = Some("forever".to_string());
        assert!(ca.issue_certificate(&bad).await.is_err());
    }

    #[tokio::test]
    async fn renewal_supersedes_the_previous_record() {
        let dir = tempfile::tempdir().unwrap();
        let ca = ca(dir.path()).await;
        let mut req = request("db", "BE");
        req.issued_to = IssuedTo::Service("db".to_string());
        let first = ca.issue_certificate(&req).await.unwrap().record;

        let renewed = ca.renew(first.serial, None).await.unwrap().record;
        assert_eq!(renewed.supersedes, Some(first.serial));
        assert_eq!(renewed.subject, first.subject);

        let current = ca
            .valid_record_for(&IssuedTo::Service("db".to_string()), "db")
            .await
            .unwrap();
        assert_eq!(current.serial, renewed.serial);
    }

    #[tokio::test]
    async fn state_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (root, serial) = {
            let ca = ca(dir.path()).await;
            let issued = ca.issue_certificate(&request("node-a", "US")).await.unwrap();
            (ca.root_fingerprint().await.unwrap(), issued.record.serial)
        };

        let ca = ca(dir.path()).await;
        assert_eq!(ca.root_fingerprint().await.unwrap(), root);
        assert_eq!(ca.last_serial(), serial);
        let next = ca.issue_certificate(&request("node-b", "US")).await.unwrap();
        assert_eq!(next.record.serial, serial + 1);
        assert_eq!(next.record.issuer_fingerprint, root);
    }

    #[tokio::test]
    async fn a_damaged_root_key_is_never_replaced() {
        let dir = tempfile::tempdir().unwrap();
        ca(dir.path()).await;
        std::fs::write(dir.path().join(ROOT_KEY_FILE), "garbage").unwrap();

        let result = CertificateAuthority::open(dir.path(), &Presets::default().certificates).await;
        assert!(matches!(result, Err(CaError::RootKeyCorrupt(_))));
        assert_eq!(std::fs::read_to_string(dir.path().join(ROOT_KEY_FILE)).unwrap(), "garbage");
    }

    #[tokio::test]
    async fn failed_rotation_keeps_the_previous_root_usable() {
        let dir = tempfile::tempdir().unwrap();
        let previous = {
            let ca = ca(dir.path()).await;
            let previous = ca.root_fingerprint().await.unwrap();

            // The ledger cannot be written while its temp path is a directory
            let blocker = dir.path().join("state.json.tmp");
            fs::create_dir(&blocker).await.unwrap();
            let result = ca
                .rotate_root(&RootRotation {
                    confirm: true,
                    reason: "scheduled".to_string(),
                })
                .await;
            assert!(matches!(result, Err(CaError::FilesystemWriteFailed { .. })));
            fs::remove_dir(&blocker).await.unwrap();
            previous
        };

        assert!(!dir.path().join("root.key.staged").exists());
        assert!(!dir.path().join("root.crt.staged").exists());

        let reopened = CertificateAuthority::open(dir.path(), &Presets::default().certificates)
            .await
            .unwrap();
        assert_eq!(reopened.root_fingerprint().await, Some(previous));
        assert!(reopened.issue_certificate(&request("node-a", "US")).await.is_ok());
    }

    #[tokio::test]
    async fn staged_roots_are_completed_or_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let recorded = {
            let ca = ca(dir.path()).await;
            ca.root_fingerprint().await.unwrap()
        };

        // A recorded root whose files were not moved in yet
        for name in ["root.key", "root.crt"] {
            fs::rename(dir.path().join(name), staged(&dir.path().join(name)))
                .await
                .unwrap();
        }
        let ca = CertificateAuthority::open(dir.path(), &Presets::default().certificates)
            .await
            .unwrap();
        assert_eq!(ca.root_fingerprint().await, Some(recorded.clone()));
        assert!(dir.path().join("root.key").exists());

        // A staged key the ledger never recorded
        let stray = KeyPair::generate().unwrap();
        fs::write(staged(&dir.path().join("root.key")), stray.serialize_pem())
            .await
            .unwrap();
        let ca = CertificateAuthority::open(dir.path(), &Presets::default().certificates)
            .await
            .unwrap();
        assert_eq!(ca.root_fingerprint().await, Some(recorded));
        assert!(!dir.path().join("root.key.staged").exists());
    }

    #[tokio::test]
    async fn root_rotation_is_explicit_and_audited() {
        let dir = tempfile::tempdir().unwrap();
        let ca = ca(dir.path()).await;
        let before = ca.root_fingerprint().await.unwrap();
        ca.issue_certificate(&request("node-a", "US")).await.unwrap();
        ca.issue_certificate(&request("node-b", "US")).await.unwrap();

        let unconfirmed = RootRotation {
            confirm: false,
            reason: "test".to_string(),
        };
        assert!(matches!(
            ca.rotate_root(&unconfirmed).await,
            Err(CaError::RotationNotConfirmed)
        ));
        assert_eq!(ca.ensure_root().await.unwrap(), before);

        let report = ca
            .rotate_root(&RootRotation {
                confirm: true,
                reason: "key ceremony".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(report.previous_fingerprint, before);
        assert_ne!(report.fingerprint, before);
        assert_eq!(report.invalidated, 2);

        let audit = std::fs::read_to_string(dir.path().join(AUDIT_FILE)).unwrap();
        assert!(audit.contains("key ceremony"));
        assert!(ca
            .valid_record_for(&IssuedTo::Operator("test".to_string()), "node-a")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn concurrent_issuance_never_reuses_serials() {
        let dir = tempfile::tempdir().unwrap();
        let ca = std::sync::Arc::new(ca(dir.path()).await);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ca = ca.clone();
                tokio::spawn(async move {
                    ca.issue_certificate(&request(&format!("node-{}", i), "US"))
                        .await
                        .map(|issued| issued.record.serial)
                })
            })
            .collect();

        let mut serials = BTreeSet::new();
        for handle in handles {
            assert!(serials.insert(handle.await.unwrap().unwrap()));
        }
        assert_eq!(serials.len(), 8);
        assert_eq!(ca.records().await.len(), 8);
    }

    #[tokio::test]
    async fn service_material_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let ca = ca(&dir.path().join("ca")).await;
        let issued = ca.issue_certificate(&request("broker", "BE")).await.unwrap();

        let service_dir = dir.path().join("broker");
        assert!(!service_material_present(&service_dir).await);
        write_service_material(&service_dir, &issued).await.unwrap();
        assert!(service_material_present(&service_dir).await);
        let ca_pem = std::fs::read_to_string(service_dir.join("tls-ca.pem")).unwrap();
        assert_eq!(Some(ca_pem), ca.root_pem().await);
    }
}
