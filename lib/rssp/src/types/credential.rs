//! Credential record

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{KeyAlgorithm, VALIDITY_TIME_FORMAT};

/// A server-managed signing identity.
///
/// Only `enabled` changes after creation; everything else is fixed when the
/// credential is provisioned.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: String,
    pub owner: String,
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    pub key_algorithm: KeyAlgorithm,
    pub key_algorithm_oids: Vec<String>,
    pub issuer_dn: String,
    pub subject_dn: String,
    pub serial_number: String,
    pub valid_from: String,
    pub valid_to: String,
    pub certificate: String,
    #[serde(default)]
    pub certificate_chain: Vec<String>,
    #[serde(with = "super::base64_bytes")]
    pub wrapped_private_key: Vec<u8>,
    /// DER SubjectPublicKeyInfo exported from the device at generation time.
    #[serde(with = "super::base64_bytes")]
    pub public_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    Valid,
    Expired,
    NotYetValid,
}

impl Credential {
    pub fn supports(&self, sign_algo_oid: &str) -> bool {
        self.key_algorithm_oids.iter().any(|oid| oid == sign_algo_oid)
    }

    pub fn certificate_status(&self, now: DateTime<Utc>) -> CertificateStatus {
        let parse = |value: &str| {
            NaiveDateTime::parse_from_str(value, VALIDITY_TIME_FORMAT)
                .ok()
                .map(|t| t.and_utc())
        };
        match (parse(&self.valid_from), parse(&self.valid_to)) {
            (Some(from), _) if now < from => CertificateStatus::NotYetValid,
            (_, Some(to)) if now > to => CertificateStatus::Expired,
            _ => CertificateStatus::Valid,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("alias", &self.alias)
            .field("enabled", &self.enabled)
            .field("key_algorithm", &self.key_algorithm)
            .field("subject_dn", &self.subject_dn)
            .field("valid_to", &self.valid_to)
            .finish_non_exhaustive()
    }
}
