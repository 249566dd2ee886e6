//! API error types

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    Unauthorized,
    CredentialNotFound,
    CredentialAliasAlreadyExists,
    AlgorithmNotSupported,
    ModificationNotPermitted,
    FailedSigning,
    DeviceUnavailable,
    UnexpectedError,
}

impl ErrorCode {
    /// HTTP status the code is reported with.
    pub fn status(&self) -> u16 {
        match self {
            ErrorCode::InvalidRequest
            | ErrorCode::AlgorithmNotSupported
            | ErrorCode::ModificationNotPermitted => 400,
            ErrorCode::Unauthorized => 401,
            ErrorCode::CredentialNotFound => 404,
            ErrorCode::CredentialAliasAlreadyExists => 409,
            ErrorCode::DeviceUnavailable => 503,
            ErrorCode::FailedSigning | ErrorCode::UnexpectedError => 500,
        }
    }
}

/// CSC error body: `{"error": "...", "error_description": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorCode,
    pub error_description: String,
}
