//! RSSP HTTP Client

use std::io::Read;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::document::{ContentSigner, DetachedSignature};
use crate::error::RsspError;
use crate::types::{
    AuthorizeRequest, AuthorizeResponse, CertificatesMode, CredentialInfoRequest,
    CredentialInfoResponse, CredentialsListRequest, CredentialsListResponse, ErrorCode,
    ErrorResponse, HashAlgorithm, InfoResponse, SignAlgorithm, SignHashRequest, SignHashResponse,
};

/// Client for the CSC v1 endpoints of an RSSP.
pub struct RsspClient {
    client: Client,
    base_url: String,
    access_token: String,
    credential: Option<String>,
}

impl RsspClient {
    pub fn new(base_url: &str, access_token: impl Into<String>) -> Self {
        Self::with_timeout(base_url, access_token, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: &str, access_token: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            credential: None,
        }
    }

    /// Credential used when signing document content.
    pub fn with_credential(mut self, alias: impl Into<String>) -> Self {
        self.credential = Some(alias.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, RsspError> {
        let resp = self
            .client
            .post(format!("{}/csc/v1/{}", self.base_url, path))
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(resp.json().await?)
        } else {
            let status = resp.status();
            match resp.json::<ErrorResponse>().await {
                Ok(err) => Err(RsspError::ServerError(err.error_description, err.error)),
                Err(_) => Err(RsspError::ServerError(
                    format!("HTTP {}", status),
                    ErrorCode::UnexpectedError,
                )),
            }
        }
    }

    pub async fn health(&self) -> Result<String, RsspError> {
        let resp = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(resp.text().await?)
        } else {
            Err(RsspError::ServerError(
                format!("Health check failed: {}", resp.status()),
                ErrorCode::DeviceUnavailable,
            ))
        }
    }

    pub async fn info(&self) -> Result<InfoResponse, RsspError> {
        self.post("info", &serde_json::json!({})).await
    }

    pub async fn list_credentials(
        &self,
        request: &CredentialsListRequest,
    ) -> Result<CredentialsListResponse, RsspError> {
        self.post("credentials/list", request).await
    }

    pub async fn credential_info(
        &self,
        request: &CredentialInfoRequest,
    ) -> Result<CredentialInfoResponse, RsspError> {
        self.post("credentials/info", request).await
    }

    pub async fn authorize(&self, request: &AuthorizeRequest) -> Result<AuthorizeResponse, RsspError> {
        self.post("credentials/authorize", request).await
    }

    pub async fn sign_hash(&self, request: &SignHashRequest) -> Result<SignHashResponse, RsspError> {
        self.post("signatures/signHash", request).await
    }

    async fn credential(
        &self,
        alias: &str,
        certificates: CertificatesMode,
    ) -> Result<CredentialInfoResponse, RsspError> {
        self.credential_info(&CredentialInfoRequest {
            credential_id: Some(alias.to_string()),
            certificates,
            cert_info: false,
            auth_info: false,
        })
        .await
    }

    /// Authorize one signature and sign a single digest with `alias`.
    pub async fn sign_digest(&self, alias: &str, digest: &[u8]) -> Result<Vec<u8>, RsspError> {
        let info = self.credential(alias, CertificatesMode::None).await?;
        let sign_algo = choose_sign_algorithm(alias, &info.key.algo)?;
        self.sign_with(alias, sign_algo, digest).await
    }

    async fn sign_with(
        &self,
        alias: &str,
        sign_algo: SignAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, RsspError> {
        let encoded = STANDARD.encode(digest);

        let authorization = self
            .authorize(&AuthorizeRequest {
                credential_id: Some(alias.to_string()),
                num_signatures: Some(1),
                hash: Some(vec![encoded.clone()]),
                pin: None,
                description: None,
                client_data: None,
            })
            .await?;
        debug!(alias, expires_in = authorization.expires_in, "Authorized signature");

        let response = self
            .sign_hash(&SignHashRequest {
                credential_id: Some(alias.to_string()),
                sad: Some(authorization.sad),
                hash: vec![encoded],
                hash_algo: Some(HashAlgorithm::Sha256.oid().to_string()),
                sign_algo: Some(sign_algo.oid().to_string()),
                sign_algo_params: None,
                client_data: None,
            })
            .await?;

        let signature = response.signatures.into_iter().next().ok_or_else(|| {
            RsspError::FailedSigningData("Server returned no signature".to_string())
        })?;
        STANDARD
            .decode(signature)
            .map_err(|e| RsspError::FailedSigningData(format!("Invalid signature encoding: {}", e)))
    }
}

/// Pick the signing algorithm for SHA-256 digests from what a credential
/// advertises.
fn choose_sign_algorithm(alias: &str, advertised: &[String]) -> Result<SignAlgorithm, RsspError> {
    let advertised: Vec<SignAlgorithm> = advertised
        .iter()
        .filter_map(|oid| SignAlgorithm::from_oid(oid))
        .collect();
    advertised
        .iter()
        .find(|algo| algo.implied_hash() == Some(HashAlgorithm::Sha256))
        .or_else(|| advertised.iter().find(|algo| algo.implied_hash().is_none()))
        .copied()
        .ok_or_else(|| {
            RsspError::AlgorithmNotSupported(format!(
                "credential {} offers no SHA-256 compatible algorithm",
                alias
            ))
        })
}

/// Signs document content as a detached CMS SignedData: the content digest
/// goes into the signed attributes and the RSSP signs their digest.
#[async_trait]
impl ContentSigner for RsspClient {
    async fn sign_content(&self, content: &mut (dyn Read + Send)) -> Result<Vec<u8>, RsspError> {
        let alias = self.credential.as_deref().ok_or_else(|| {
            RsspError::InvalidRequest("No credential selected for signing".to_string())
        })?;

        let mut hasher = Sha256::new();
        std::io::copy(content, &mut hasher)?;
        let content_digest = hasher.finalize();

        let info = self.credential(alias, CertificatesMode::Chain).await?;
        let sign_algo = choose_sign_algorithm(alias, &info.key.algo)?;
        let certificates = info
            .cert
            .certificates
            .iter()
            .map(|certificate| STANDARD.decode(certificate))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                RsspError::FailedSigningData(format!("Invalid certificate encoding: {}", e))
            })?;

        let pending = DetachedSignature::new(&certificates, &content_digest)?;
        let attributes_digest = Sha256::digest(pending.signed_attributes_der()?);
        let signature = self.sign_with(alias, sign_algo, &attributes_digest).await?;
        debug!(
            alias,
            certificates = certificates.len(),
            "Signed CMS attributes"
        );
        pending.finish(sign_algo, &signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = RsspClient::new("http://rssp:8080/", "token");
        assert_eq!(client.base_url(), "http://rssp:8080");
    }

    #[test]
    fn test_prefers_sha256_bound_algorithm() {
        let advertised = vec![
            "1.2.840.113549.1.1.1".to_string(),
            "1.2.840.113549.1.1.11".to_string(),
        ];
        assert_eq!(
            choose_sign_algorithm("a1", &advertised).unwrap(),
            SignAlgorithm::RsaWithHash(HashAlgorithm::Sha256)
        );

        let plain = vec!["1.2.840.113549.1.1.1".to_string()];
        assert_eq!(
            choose_sign_algorithm("a1", &plain).unwrap(),
            SignAlgorithm::RsaEncryption
        );

        let unknown = vec!["1.2.3.4".to_string()];
        assert!(matches!(
            choose_sign_algorithm("a1", &unknown),
            Err(RsspError::AlgorithmNotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_sign_content_requires_credential() {
        let client = RsspClient::new("http://127.0.0.1:9", "token");
        let mut content: &[u8] = b"document";
        let result = client.sign_content(&mut content).await;
        assert!(matches!(result, Err(RsspError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_http_error() {
        let client = RsspClient::with_timeout("http://127.0.0.1:9", "token", Duration::from_millis(200));
        assert!(matches!(client.info().await, Err(RsspError::HttpError(_))));
    }
}
