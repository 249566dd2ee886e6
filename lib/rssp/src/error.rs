//! RSSP Error Types

use thiserror::Error;

use crate::types::ErrorCode;

#[derive(Error, Debug)]
pub enum RsspError {
    #[error("Credential not found")]
    CredentialNotFound,

    #[error("Credential alias already exists: {0}")]
    CredentialAliasAlreadyExists(String),

    #[error("Too many signatures requested: {requested} (maximum {max})")]
    TooManySignaturesRequested { requested: u32, max: u32 },

    #[error("Failed to validate SAD: {0}")]
    FailedToValidateSad(String),

    #[error("Algorithm not supported: {0}")]
    AlgorithmNotSupported(String),

    #[error("Failed signing data: {0}")]
    FailedSigningData(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Wrapping key not initialized")]
    WrappingKeyMissing,

    #[error("Document does not permit further modification")]
    ModificationNotPermitted,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Certificate issuance failed: {0}")]
    IssuanceFailed(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Token error: {0}")]
    TokenError(String),

    #[error("Server error ({1:?}): {0}")]
    ServerError(String, ErrorCode),

    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl RsspError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            RsspError::CredentialNotFound => ErrorCode::CredentialNotFound,
            RsspError::CredentialAliasAlreadyExists(_) => ErrorCode::CredentialAliasAlreadyExists,
            RsspError::TooManySignaturesRequested { .. }
            | RsspError::FailedToValidateSad(_)
            | RsspError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            RsspError::AlgorithmNotSupported(_) => ErrorCode::AlgorithmNotSupported,
            RsspError::FailedSigningData(_) => ErrorCode::FailedSigning,
            RsspError::DeviceUnavailable(_)
            | RsspError::DeviceError(_)
            | RsspError::WrappingKeyMissing => ErrorCode::DeviceUnavailable,
            RsspError::ModificationNotPermitted => ErrorCode::ModificationNotPermitted,
            RsspError::Unauthorized(_) => ErrorCode::Unauthorized,
            RsspError::ServerError(_, code) => *code,
            _ => ErrorCode::UnexpectedError,
        }
    }

    /// Human-readable description safe to hand to a remote caller.
    ///
    /// Device and storage faults are reduced to a generic sentence so raw
    /// PKCS#11 return values never leave the service.
    pub fn description(&self) -> String {
        match self {
            RsspError::TooManySignaturesRequested { .. } => {
                "Invalid parameter numSignatures".to_string()
            }
            RsspError::FailedToValidateSad(reason) => reason.clone(),
            RsspError::InvalidRequest(reason) => reason.clone(),
            RsspError::AlgorithmNotSupported(_) => "Invalid parameter signAlgo".to_string(),
            RsspError::FailedSigningData(_) => "Failed to sign data".to_string(),
            RsspError::DeviceUnavailable(_)
            | RsspError::DeviceError(_)
            | RsspError::WrappingKeyMissing => "Signing device unavailable".to_string(),
            RsspError::StorageError(_)
            | RsspError::IoError(_)
            | RsspError::JsonError(_)
            | RsspError::TokenError(_)
            | RsspError::IssuanceFailed(_)
            | RsspError::HttpError(_) => "Unexpected error".to_string(),
            RsspError::ServerError(description, _) => description.clone(),
            _ => self.to_string(),
        }
    }
}
