//! Credential authorization and hash signing
//!
//! `authorize` issues a SAD bound to one credential and a signature quota.
//! `sign_hash` checks that SAD, re-resolves the credential and signs the
//! digests through the key-wrap service on a blocking thread. No
//! transaction state is kept between the two calls; the SAD carries it.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::error::RsspError;
use crate::issuer::CertificateIssuer;
use crate::keywrap::KeyWrapService;
use crate::store::CredentialStore;
use crate::token::{Token, TokenProvider, TokenStatus};
use crate::types::{Credential, HashAlgorithm, KeyAlgorithm, SignAlgorithm, SignHashRequest};

pub const DEFAULT_MAX_SIGNATURES: u32 = 1;

/// A freshly issued SAD.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub sad: String,
    /// Seconds the caller should treat the SAD as usable.
    pub expires_in: i64,
    pub credential_id: String,
}

/// A signHash call after wire-level validation.
#[derive(Debug, Clone)]
pub struct HashSigningRequest {
    pub alias: String,
    pub sad: String,
    pub digests: Vec<Vec<u8>>,
    pub sign_algo: String,
    pub hash_algo: Option<String>,
}

fn required(value: Option<String>, kind: &str, name: &str) -> Result<String, RsspError> {
    value.filter(|v| !v.is_empty()).ok_or_else(|| {
        RsspError::InvalidRequest(format!(
            "Missing (or invalid type) {} parameter {}",
            kind, name
        ))
    })
}

impl TryFrom<SignHashRequest> for HashSigningRequest {
    type Error = RsspError;

    fn try_from(request: SignHashRequest) -> Result<Self, Self::Error> {
        let alias = required(request.credential_id, "string", "credentialID")?;
        let sad = required(request.sad, "string", "SAD")?;
        if request.hash.is_empty() {
            return Err(RsspError::InvalidRequest(
                "Missing (or invalid type) array parameter hash".to_string(),
            ));
        }
        let digests = request
            .hash
            .iter()
            .map(|hash| {
                STANDARD.decode(hash).map_err(|_| {
                    RsspError::InvalidRequest("Invalid Base64 hash string parameter".to_string())
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let sign_algo = required(request.sign_algo, "string", "signAlgo")?;

        Ok(Self {
            alias,
            sad,
            digests,
            sign_algo,
            hash_algo: request.hash_algo.filter(|h| !h.is_empty()),
        })
    }
}

pub struct SigningService<D: Device> {
    pub(crate) store: Arc<dyn CredentialStore>,
    sad: Arc<TokenProvider>,
    pub(crate) wraps: Arc<KeyWrapService<D>>,
    pub(crate) issuer: Option<Arc<dyn CertificateIssuer>>,
    pub(crate) max_signatures: u32,
    pub(crate) key_algorithm: KeyAlgorithm,
}

impl<D: Device> SigningService<D> {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        sad: Arc<TokenProvider>,
        wraps: Arc<KeyWrapService<D>>,
    ) -> Self {
        Self {
            store,
            sad,
            wraps,
            issuer: None,
            max_signatures: DEFAULT_MAX_SIGNATURES,
            key_algorithm: KeyAlgorithm::Rsa { bits: 2048 },
        }
    }

    pub fn with_max_signatures(mut self, max_signatures: u32) -> Self {
        self.max_signatures = max_signatures;
        self
    }

    pub fn with_issuer(mut self, issuer: Arc<dyn CertificateIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Key kind generated for new credentials.
    pub fn with_key_algorithm(mut self, key_algorithm: KeyAlgorithm) -> Self {
        self.key_algorithm = key_algorithm;
        self
    }

    pub fn max_signatures(&self) -> u32 {
        self.max_signatures
    }

    pub fn key_wrap(&self) -> &Arc<KeyWrapService<D>> {
        &self.wraps
    }

    /// Look up an enabled credential. With no alias, the owner's sole
    /// credential is used.
    pub(crate) async fn resolve(
        &self,
        owner: &str,
        alias: Option<&str>,
    ) -> Result<Credential, RsspError> {
        let credential = match alias {
            Some(alias) => self.store.find(owner, alias).await?,
            None => {
                let mut credentials = self.store.list(owner).await?;
                if credentials.len() > 1 {
                    return Err(RsspError::InvalidRequest(
                        "Missing (or invalid type) string parameter credentialID".to_string(),
                    ));
                }
                credentials.pop()
            }
        };

        match credential {
            Some(credential) if credential.enabled => Ok(credential),
            Some(credential) => {
                debug!(owner, alias = %credential.alias, "Credential is disabled");
                Err(RsspError::CredentialNotFound)
            }
            None => Err(RsspError::CredentialNotFound),
        }
    }

    pub async fn authorize(
        &self,
        owner: &str,
        alias: Option<&str>,
        num_signatures: u32,
    ) -> Result<Authorization, RsspError> {
        if num_signatures == 0 {
            return Err(RsspError::InvalidRequest(
                "Invalid parameter numSignatures".to_string(),
            ));
        }
        if num_signatures > self.max_signatures {
            return Err(RsspError::TooManySignaturesRequested {
                requested: num_signatures,
                max: self.max_signatures,
            });
        }

        let credential = self.resolve(owner, alias).await?;
        let token = self
            .sad
            .issue_bound(owner, &credential.alias, num_signatures)?;

        info!(owner, alias = %credential.alias, num_signatures, "Issued SAD");
        Ok(Authorization {
            sad: token.raw,
            expires_in: self.sad.lifetime_seconds() - 1,
            credential_id: credential.alias,
        })
    }

    fn validate_sad(&self, raw: &str) -> Result<Token, RsspError> {
        match self.sad.validate(raw) {
            TokenStatus::Valid(token) => Ok(token),
            TokenStatus::Expired => Err(RsspError::FailedToValidateSad("SAD expired".to_string())),
            TokenStatus::Malformed(reason) => {
                debug!("Rejected SAD: {}", reason);
                Err(RsspError::FailedToValidateSad("Invalid SAD".to_string()))
            }
            TokenStatus::WrongType { expected, found } => {
                debug!("Rejected SAD: expected type {}, found {}", expected, found);
                Err(RsspError::FailedToValidateSad("Invalid SAD".to_string()))
            }
        }
    }

    /// Sign each digest with the credential's key, preserving order.
    pub async fn sign_hash(
        &self,
        owner: &str,
        request: HashSigningRequest,
    ) -> Result<Vec<Vec<u8>>, RsspError> {
        let token = self.validate_sad(&request.sad)?;
        if token.claims.sub != owner
            || token.claims.credential_id.as_deref() != Some(request.alias.as_str())
        {
            warn!(owner, alias = %request.alias, "SAD presented for a different credential");
            return Err(RsspError::FailedToValidateSad("Invalid SAD".to_string()));
        }

        if request.digests.is_empty() {
            return Err(RsspError::InvalidRequest(
                "Missing (or invalid type) array parameter hash".to_string(),
            ));
        }
        let quota = token.claims.num_signatures.unwrap_or(1);
        let requested = u32::try_from(request.digests.len()).unwrap_or(u32::MAX);
        if requested > quota {
            return Err(RsspError::TooManySignaturesRequested {
                requested,
                max: quota,
            });
        }

        let credential = self.resolve(owner, Some(&request.alias)).await?;

        let sign_algorithm = SignAlgorithm::from_oid(&request.sign_algo)
            .filter(|_| credential.supports(&request.sign_algo))
            .ok_or_else(|| RsspError::AlgorithmNotSupported(request.sign_algo.clone()))?;
        let hash = resolve_hash(
            sign_algorithm,
            request.hash_algo.as_deref(),
            &request.digests,
        )?;

        let algorithm = credential.key_algorithm;
        let payloads: Vec<Vec<u8>> = request
            .digests
            .iter()
            .map(|digest| algorithm.signing_input(hash, digest))
            .collect();

        let wraps = Arc::clone(&self.wraps);
        let wrapped = credential.wrapped_private_key;
        let signatures = tokio::task::spawn_blocking(move || {
            wraps.sign(&wrapped, &algorithm, algorithm.sign_mechanism(), &payloads)
        })
        .await
        .map_err(|e| RsspError::FailedSigningData(format!("signing task failed: {}", e)))??;

        info!(
            owner,
            alias = %request.alias,
            count = signatures.len(),
            "Signed hashes"
        );
        Ok(signatures)
    }
}

/// Pick the hash algorithm for a signHash call and check every digest fits it.
fn resolve_hash(
    algorithm: SignAlgorithm,
    hash_algo: Option<&str>,
    digests: &[Vec<u8>],
) -> Result<HashAlgorithm, RsspError> {
    let invalid_hash_algo = || RsspError::InvalidRequest("Invalid parameter hashAlgo".to_string());

    let requested = hash_algo
        .map(|oid| HashAlgorithm::from_oid(oid).ok_or_else(invalid_hash_algo))
        .transpose()?;

    let hash = match (algorithm.implied_hash(), requested) {
        (Some(implied), Some(requested)) if implied != requested => {
            return Err(invalid_hash_algo());
        }
        (Some(implied), _) => implied,
        (None, Some(requested)) => requested,
        (None, None) => digests
            .first()
            .and_then(|digest| HashAlgorithm::from_digest_len(digest.len()))
            .ok_or_else(|| {
                RsspError::InvalidRequest(
                    "Missing (or invalid type) string parameter hashAlgo".to_string(),
                )
            })?,
    };

    if digests.iter().any(|digest| digest.len() != hash.digest_len()) {
        return Err(RsspError::InvalidRequest(
            "Invalid digest value length".to_string(),
        ));
    }
    Ok(hash)
}
