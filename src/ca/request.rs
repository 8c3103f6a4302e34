// src/ca/request.rs

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ca::record::{IssuedTo, Subject};
use crate::ca::CaError;
use crate::config::SubjectDefaults;
use crate::resolver::model::CertificateIdentity;

/// Certificate signing request as submitted to the CA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRequest {
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

    /// Subject alternative names
    #[serde(default)]
    pub san: Vec<String>,

    /// Requested lifetime such as `"750h"`; clamped to the CA limits
    #[serde(default)]
    pub lifetime: Option<String>,

    /// Who the certificate is for
    pub issued_to: IssuedTo,
}

/// A request that passed validation: SANs de-duplicated and normalized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    /// Subject with every field checked
    pub subject: Subject,
    /// De-duplicated hostnames
    pub san: Vec<String>,
    /// Requested lifetime, clamped by the CA
    pub lifetime: Option<String>,
    /// Who the certificate is for
    pub issued_to: IssuedTo,
}

impl CertificateRequest {
    /// Builds a request for a service identity, filling missing subject
    /// fields from the defaults
    pub fn for_identity(identity: &CertificateIdentity, defaults: &SubjectDefaults, issued_to: IssuedTo) -> Self {
        let pick = |value: &Option<String>, fallback: &str| {
            value.clone().unwrap_or_else(|| fallback.to_string())
        };

        Self {
            cn: identity.cn.clone(),
            c: pick(&identity.c, &defaults.c),
            st: pick(&identity.st, &defaults.st),
            l: pick(&identity.l, &defaults.l),
            o: pick(&identity.o, &defaults.o),
            ou: pick(&identity.ou, &defaults.ou),
            san: identity.san.clone(),
            lifetime: None,
            issued_to,
        }
    }

    /// Checks the subject and SANs. Nothing is allocated or recorded here.
    pub fn validate(&self) -> Result<ValidatedRequest, CaError> {
        let cn = self.cn.trim();
        if cn.is_empty() {
            return Err(CaError::ValidationError("cn is required".to_string()));
        }

        if self.c.chars().count() != 2 {
            return Err(CaError::ValidationError(format!(
                "c must be exactly two characters, got {:?}",
                self.c
            )));
        }

        for (field, value) in [("st", &self.st), ("l", &self.l), ("o", &self.o), ("ou", &self.ou)] {
            if value.trim().is_empty() {
                return Err(CaError::ValidationError(format!("{} cannot be empty", field)));
            }
        }

        let mut seen = BTreeSet::new();
        let mut san = Vec::with_capacity(self.san.len());
        for name in &self.san {
            let name = name.trim().trim_end_matches('.').to_ascii_lowercase();
            if !is_valid_hostname(&name) {
                return Err(CaError::ValidationError(format!(
                    "{:?} is not a valid hostname",
                    name
                )));
            }
            if seen.insert(name.clone()) {
                san.push(name);
            }
        }

        Ok(ValidatedRequest {
            subject: Subject {
                cn: cn.to_string(),
                c: self.c.clone(),
                st: self.st.clone(),
                l: self.l.clone(),
                o: self.o.clone(),
                ou: self.ou.clone(),
            },
            san,
            lifetime: self.lifetime.clone(),
            issued_to: self.issued_to.clone(),
        })
    }
}

/// RFC 1123 hostname: dot-separated labels of letters, digits and inner hyphens
pub fn is_valid_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn request(c: &str, san: &[&str]) -> CertificateRequest {
        CertificateRequest {
            cn: "node-a".to_string(),
            c: c.to_string(),
            st: "X".to_string(),
            l: "Y".to_string(),
            o: "Z".to_string(),
            ou: "W".to_string(),
            san: san.iter().map(|s| s.to_string()).collect(),
            lifetime: None,
            issued_to: IssuedTo::Operator("test".to_string()),
        }
    }

    #[test]
    fn sans_are_deduplicated_in_order() {
        let validated = request("US", &["node-a.local", "NODE-A.local", "node-a", "node-a.local."])
            .validate()
            .unwrap();
        assert_eq!(validated.san, vec!["node-a.local", "node-a"]);
    }

    #[test]
    fn empty_subject_fields_are_rejected() {
        let mut bad = request("US", &[]);
        bad.ou = "  ".to_string();
        assert!(matches!(bad.validate(), Err(CaError::ValidationError(_))));

        let mut bad = request("US", &[]);
        bad.cn = String::new();
        assert!(matches!(bad.validate(), Err(CaError::ValidationError(_))));
    }

    #[test]
    fn invalid_hostnames_are_rejected() {
        assert!(request("US", &["-bad.local"]).validate().is_err());
        assert!(request("US", &["under_score.local"]).validate().is_err());
        assert!(request("US", &["a..b"]).validate().is_err());
        assert!(request("US", &["ok-1.example.com"]).validate().is_ok());
    }

    #[test]
    fn identities_take_defaults_for_missing_fields() {
        let defaults = crate::config::Presets::default().certificates.subject;
        let identity = CertificateIdentity::named("broker.node-a", &["node-a"]);
        let request = CertificateRequest::for_identity(&identity, &defaults, IssuedTo::Service("broker".to_string()));
        assert_eq!(request.c, "BE");
        assert_eq!(request.o, "CERT-EU");
        assert!(request.validate().is_ok());
    }

    proptest! {
        #[test]
        fn country_must_be_exactly_two_characters(c in "\\PC{0,6}") {
            let result = request(&c, &[]).validate();
            if c.chars().count() == 2 {
                prop_assert!(result.is_ok());
            } else {
                prop_assert!(matches!(result, Err(CaError::ValidationError(_))), "expected validation error");
            }
        }

        #[test]
        fn generated_hostnames_are_accepted(labels in prop::collection::vec("[a-z0-9]([a-z0-9-]{0,10}[a-z0-9])?", 1..5)) {
            let name = labels.join(".");
            prop_assert!(is_valid_hostname(&name));
        }
    }
}
