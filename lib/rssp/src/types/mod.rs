//! RSSP data types

mod algorithm;
mod credential;
mod csc;
mod error;

pub use algorithm::{EcCurve, HashAlgorithm, KeyAlgorithm, SignAlgorithm};
pub use credential::{CertificateStatus, Credential};
pub use csc::{
    AuthorizeRequest, AuthorizeResponse, CertInfo, CertificatesMode, CredentialInfoRequest,
    CredentialInfoResponse, CredentialsListRequest, CredentialsListResponse, InfoResponse,
    KeyInfo, SignHashRequest, SignHashResponse,
};
pub use error::{ErrorCode, ErrorResponse};

/// Fixed timestamp format used for certificate validity windows (GeneralizedTime).
pub const VALIDITY_TIME_FORMAT: &str = "%Y%m%d%H%M%SZ";

pub(crate) mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}
