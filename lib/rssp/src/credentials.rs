//! Credential lifecycle and the CSC `credentials/*` queries

use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::device::Device;
use crate::error::RsspError;
use crate::issuer::CertificateRequest;
use crate::signing::SigningService;
use crate::types::{
    CertInfo, CertificateStatus, CertificatesMode, Credential, CredentialInfoRequest,
    CredentialInfoResponse, CredentialsListRequest, CredentialsListResponse, KeyInfo,
};

const DEFAULT_PAGE_SIZE: u32 = 100;

/// Input for provisioning a new credential.
#[derive(Debug, Clone)]
pub struct NewCredential {
    pub owner: String,
    pub alias: String,
    pub subject_dn: String,
    pub country: Option<String>,
    pub description: Option<String>,
}

impl<D: Device> SigningService<D> {
    /// Generate a wrapped key pair, certify it and store the credential.
    ///
    /// A taken alias is rejected before any device or CA work.
    pub async fn create_credential(&self, new: NewCredential) -> Result<Credential, RsspError> {
        if new.alias.is_empty() {
            return Err(RsspError::InvalidRequest("alias must not be empty".to_string()));
        }
        if self.store.find(&new.owner, &new.alias).await?.is_some() {
            return Err(RsspError::CredentialAliasAlreadyExists(new.alias));
        }
        let issuer = self
            .issuer
            .as_ref()
            .ok_or_else(|| RsspError::IssuanceFailed("No certificate issuer configured".into()))?;

        let algorithm = self.key_algorithm;
        let wraps = Arc::clone(&self.wraps);
        let generated = tokio::task::spawn_blocking(move || wraps.generate_key_pair(&algorithm))
            .await
            .map_err(|e| RsspError::DeviceError(format!("key generation task failed: {}", e)))??;

        let request = CertificateRequest::new(
            &new.subject_dn,
            &new.alias,
            new.country,
            &generated.public_key,
            algorithm.key_oid(),
        );
        let issued = issuer.issue(&request).await?;

        let credential = Credential {
            id: Uuid::new_v4().to_string(),
            owner: new.owner,
            alias: new.alias,
            description: new.description,
            enabled: true,
            key_algorithm: algorithm,
            key_algorithm_oids: algorithm.supported_sign_algorithms(),
            issuer_dn: issued.issuer_dn,
            subject_dn: issued.subject_dn,
            serial_number: issued.serial_number,
            valid_from: issued.valid_from,
            valid_to: issued.valid_to,
            certificate: issued.certificate,
            certificate_chain: issued.certificate_chain,
            wrapped_private_key: generated.wrapped_private_key,
            public_key: generated.public_key,
            created_at: Utc::now(),
        };
        self.store.save(credential.clone()).await?;

        info!(
            owner = %credential.owner,
            alias = %credential.alias,
            id = %credential.id,
            "Created credential"
        );
        Ok(credential)
    }

    pub async fn delete_credential(&self, owner: &str, alias: &str) -> Result<(), RsspError> {
        self.store.delete(owner, alias).await?;
        info!(owner, alias, "Deleted credential");
        Ok(())
    }

    pub async fn set_credential_enabled(
        &self,
        owner: &str,
        alias: &str,
        enabled: bool,
    ) -> Result<(), RsspError> {
        self.store.set_enabled(owner, alias, enabled).await?;
        info!(owner, alias, enabled, "Updated credential state");
        Ok(())
    }

    /// Every credential of `owner`, disabled ones included.
    pub async fn credentials_of(&self, owner: &str) -> Result<Vec<Credential>, RsspError> {
        self.store.list(owner).await
    }

    /// Aliases of `owner`, paged by offset. The page token is opaque to callers.
    pub async fn list_credentials(
        &self,
        owner: &str,
        request: &CredentialsListRequest,
    ) -> Result<CredentialsListResponse, RsspError> {
        let page_size = request.max_results.unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size == 0 {
            return Err(RsspError::InvalidRequest(
                "Invalid parameter maxResults".to_string(),
            ));
        }
        let offset = match request.page_token.as_deref() {
            None | Some("") => 0,
            Some(token) => token.parse::<usize>().map_err(|_| {
                RsspError::InvalidRequest("Invalid parameter pageToken".to_string())
            })?,
        };

        let aliases: Vec<String> = self
            .store
            .list(owner)
            .await?
            .into_iter()
            .map(|credential| credential.alias)
            .collect();
        let end = offset.saturating_add(page_size as usize).min(aliases.len());
        let credential_ids = aliases.get(offset..end).map(<[String]>::to_vec).unwrap_or_default();
        let next_page_token = (end < aliases.len()).then(|| end.to_string());

        Ok(CredentialsListResponse {
            credential_ids,
            next_page_token,
        })
    }

    /// CSC `credentials/info`. Disabled credentials are still described.
    pub async fn credential_info(
        &self,
        owner: &str,
        request: &CredentialInfoRequest,
    ) -> Result<CredentialInfoResponse, RsspError> {
        let alias = request
            .credential_id
            .as_deref()
            .filter(|alias| !alias.is_empty())
            .ok_or_else(|| {
                RsspError::InvalidRequest(
                    "Missing (or invalid type) string parameter credentialID".to_string(),
                )
            })?;
        let credential = self
            .store
            .find(owner, alias)
            .await?
            .ok_or(RsspError::CredentialNotFound)?;

        Ok(describe(&credential, request, self.max_signatures))
    }
}

fn describe(
    credential: &Credential,
    request: &CredentialInfoRequest,
    multisign: u32,
) -> CredentialInfoResponse {
    let status = match credential.certificate_status(Utc::now()) {
        CertificateStatus::Valid => "valid",
        CertificateStatus::Expired => "expired",
        CertificateStatus::NotYetValid => "not_yet_valid",
    };

    let certificates = match request.certificates {
        CertificatesMode::None => vec![],
        CertificatesMode::Single => vec![credential.certificate.clone()],
        CertificatesMode::Chain => std::iter::once(credential.certificate.clone())
            .chain(credential.certificate_chain.iter().cloned())
            .collect(),
    };

    let detail = |value: &String| request.cert_info.then(|| value.clone());

    CredentialInfoResponse {
        description: credential.description.clone(),
        key: KeyInfo {
            status: if credential.enabled { "enabled" } else { "disabled" }.to_string(),
            algo: credential.key_algorithm_oids.clone(),
            len: credential.key_algorithm.bit_length(),
            curve: credential
                .key_algorithm
                .curve()
                .map(|curve| curve.oid().to_string()),
        },
        cert: CertInfo {
            status: status.to_string(),
            certificates,
            issuer_dn: detail(&credential.issuer_dn),
            serial_number: detail(&credential.serial_number),
            subject_dn: detail(&credential.subject_dn),
            valid_from: detail(&credential.valid_from),
            valid_to: detail(&credential.valid_to),
        },
        auth_mode: "explicit".to_string(),
        scal: "1".to_string(),
        multisign,
    }
}
