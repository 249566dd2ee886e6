//! RSSP (Remote Signature Service Provider) core library
//!
//! Signature Activation Data tokens, the hardware session pool, the key-wrap
//! discipline around device-held keys, CSC credential authorization and hash
//! signing, and the external signing protocol for documents.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod client;
pub mod credentials;
pub mod device;
pub mod document;
pub mod error;
pub mod issuer;
pub mod keywrap;
pub mod pool;
pub mod signing;
pub mod store;
pub mod token;
pub mod types;

#[cfg(feature = "pkcs11")]
pub use device::Pkcs11Device;

pub use client::RsspClient;
pub use credentials::NewCredential;
pub use device::{Device, DeviceError, SignMechanism, SoftDevice};
pub use document::{
    ContentSigner, DetachedSignature, DocumentAdapter, ModificationPermission, PdfAdapter,
    PreparedDocument, sign_document,
};
pub use error::RsspError;
pub use issuer::{CertificateIssuer, CertificateRequest, HttpCertificateIssuer, IssuedCertificate};
pub use keywrap::{GeneratedKey, KeyWrapService};
pub use pool::{PoolStats, SessionLease, SessionPool};
pub use signing::{Authorization, HashSigningRequest, SigningService};
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use token::{ACCESS_TOKEN_TYPE, Claims, SAD_TOKEN_TYPE, Token, TokenError, TokenProvider, TokenStatus};
pub use types::{
    AuthorizeRequest, AuthorizeResponse, CertificateStatus, CertificatesMode, Credential,
    CredentialInfoRequest, CredentialInfoResponse, CredentialsListRequest,
    CredentialsListResponse, EcCurve, ErrorCode, ErrorResponse, HashAlgorithm, InfoResponse,
    KeyAlgorithm, SignAlgorithm, SignHashRequest, SignHashResponse,
};
