//! CSC v1 REST API Handlers
//!
//! Every route except `health` and `info` authenticates the caller with a
//! bearer access token; the token subject is the credential owner.

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use rssp::{
    AuthorizeRequest, AuthorizeResponse, CredentialInfoRequest, CredentialInfoResponse,
    CredentialsListRequest, CredentialsListResponse, Device, ErrorCode, ErrorResponse,
    HashSigningRequest, InfoResponse, RsspError, SignHashRequest, SignHashResponse,
    SigningService, TokenProvider, TokenStatus,
};
use std::sync::Arc;

/// Shared application state
pub struct AppState<D: Device> {
    pub service: SigningService<D>,
    pub access_tokens: TokenProvider,
    pub info: InfoResponse,
}

// ==================== Error Handling ====================

pub struct ApiError(pub StatusCode, pub Json<ErrorResponse>);

impl ApiError {
    fn new(status: StatusCode, error: ErrorCode, msg: impl Into<String>) -> Self {
        ApiError(
            status,
            Json(ErrorResponse {
                error,
                error_description: msg.into(),
            }),
        )
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::InvalidRequest, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized, msg)
    }
}

impl From<RsspError> for ApiError {
    fn from(e: RsspError) -> Self {
        let code = e.code();
        let status =
            StatusCode::from_u16(code.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", e);
        } else {
            tracing::debug!("Request rejected: {}", e);
        }
        Self::new(status, code, e.description())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(format!("Invalid request body: {}", rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

/// Resolve the bearer access token to its owner.
fn authenticate<D: Device>(state: &AppState<D>, headers: &HeaderMap) -> Result<String, ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::unauthorized("Missing bearer access token"))?;

    match state.access_tokens.validate(token) {
        TokenStatus::Valid(token) => Ok(token.claims.sub),
        TokenStatus::Expired => Err(ApiError::unauthorized("Access token expired")),
        TokenStatus::Malformed(reason) => {
            tracing::debug!("Rejected access token: {}", reason);
            Err(ApiError::unauthorized("Invalid access token"))
        }
        TokenStatus::WrongType { found, .. } => {
            tracing::warn!("Token of type {} presented as access token", found);
            Err(ApiError::unauthorized("Invalid access token"))
        }
    }
}

// ==================== Health Check ====================

pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ==================== Service Info ====================

pub async fn info<D: Device>(State(state): State<Arc<AppState<D>>>) -> Json<InfoResponse> {
    Json(state.info.clone())
}

// ==================== Credential Handlers ====================

pub async fn credentials_list<D: Device>(
    State(state): State<Arc<AppState<D>>>,
    headers: HeaderMap,
    payload: Result<Json<CredentialsListRequest>, JsonRejection>,
) -> Result<Json<CredentialsListResponse>, ApiError> {
    let owner = authenticate(&state, &headers)?;
    let Json(request) = payload?;

    let response = state.service.list_credentials(&owner, &request).await?;
    Ok(Json(response))
}

pub async fn credentials_info<D: Device>(
    State(state): State<Arc<AppState<D>>>,
    headers: HeaderMap,
    payload: Result<Json<CredentialInfoRequest>, JsonRejection>,
) -> Result<Json<CredentialInfoResponse>, ApiError> {
    let owner = authenticate(&state, &headers)?;
    let Json(request) = payload?;

    let response = state.service.credential_info(&owner, &request).await?;
    Ok(Json(response))
}

/// Issue a SAD for one credential.
pub async fn authorize<D: Device>(
    State(state): State<Arc<AppState<D>>>,
    headers: HeaderMap,
    payload: Result<Json<AuthorizeRequest>, JsonRejection>,
) -> Result<Json<AuthorizeResponse>, ApiError> {
    let owner = authenticate(&state, &headers)?;
    let Json(request) = payload?;

    let num_signatures = request.num_signatures.ok_or_else(|| {
        ApiError::bad_request("Missing (or invalid type) integer parameter numSignatures")
    })?;
    let alias = request.credential_id.as_deref().filter(|alias| !alias.is_empty());

    let authorization = state
        .service
        .authorize(&owner, alias, num_signatures)
        .await?;

    Ok(Json(AuthorizeResponse {
        sad: authorization.sad,
        expires_in: authorization.expires_in,
    }))
}

// ==================== Signature Handlers ====================

pub async fn sign_hash<D: Device>(
    State(state): State<Arc<AppState<D>>>,
    headers: HeaderMap,
    payload: Result<Json<SignHashRequest>, JsonRejection>,
) -> Result<Json<SignHashResponse>, ApiError> {
    let owner = authenticate(&state, &headers)?;
    let Json(request) = payload?;
    let request = HashSigningRequest::try_from(request)?;

    let signatures = state.service.sign_hash(&owner, request).await?;

    Ok(Json(SignHashResponse {
        signatures: signatures
            .iter()
            .map(|signature| STANDARD.encode(signature))
            .collect(),
    }))
}
