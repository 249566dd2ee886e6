//! Certificate authority boundary
//!
//! Provisioning a credential hands the device-generated public key to a CA
//! and stores whatever certificate and chain it returns.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::RsspError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequest {
    #[serde(rename = "subjectDN")]
    pub subject_dn: String,
    pub alias: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Base64 DER SubjectPublicKeyInfo
    pub public_key: String,
    pub key_algorithm: String,
}

impl CertificateRequest {
    pub fn new(
        subject_dn: impl Into<String>,
        alias: impl Into<String>,
        country: Option<String>,
        public_key_der: &[u8],
        key_algorithm_oid: &str,
    ) -> Self {
        Self {
            subject_dn: subject_dn.into(),
            alias: alias.into(),
            country,
            public_key: STANDARD.encode(public_key_der),
            key_algorithm: key_algorithm_oid.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCertificate {
    /// Base64 DER end-entity certificate
    pub certificate: String,
    /// Issuer certificates, leaf excluded
    #[serde(default)]
    pub certificate_chain: Vec<String>,
    #[serde(rename = "issuerDN")]
    pub issuer_dn: String,
    #[serde(rename = "subjectDN")]
    pub subject_dn: String,
    pub serial_number: String,
    /// `YYYYMMDDHHMMSSZ`
    pub valid_from: String,
    pub valid_to: String,
}

#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(&self, request: &CertificateRequest) -> Result<IssuedCertificate, RsspError>;
}

#[derive(Debug, Deserialize)]
struct IssuerErrorResponse {
    error: String,
}

/// CA reachable over HTTP at `POST {base_url}/api/certificates`.
pub struct HttpCertificateIssuer {
    client: Client,
    base_url: String,
}

impl HttpCertificateIssuer {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CertificateIssuer for HttpCertificateIssuer {
    async fn issue(&self, request: &CertificateRequest) -> Result<IssuedCertificate, RsspError> {
        let url = format!("{}/api/certificates", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| RsspError::IssuanceFailed(format!("CA request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error = response
                .json::<IssuerErrorResponse>()
                .await
                .map(|body| body.error)
                .unwrap_or_else(|_| status.to_string());
            return Err(RsspError::IssuanceFailed(error));
        }

        response
            .json()
            .await
            .map_err(|e| RsspError::IssuanceFailed(format!("Failed to parse response: {}", e)))
    }
}
