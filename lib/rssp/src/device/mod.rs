//! Cryptographic device abstraction
//!
//! The narrow set of PKCS#11 operations the session pool and key-wrap
//! service need. `Pkcs11Device` drives a real token through cryptoki;
//! `SoftDevice` implements the same contract in process for development
//! and tests.

#[cfg(feature = "pkcs11")]
mod pkcs11;
mod software;

#[cfg(feature = "pkcs11")]
pub use pkcs11::Pkcs11Device;
pub use software::SoftDevice;

use thiserror::Error;

use crate::types::KeyAlgorithm;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device unavailable: {0}")]
    Unavailable(String),

    #[error("Login failed: {0}")]
    LoginFailed(String),

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Wrap failed: {0}")]
    Wrap(String),

    #[error("Unwrap failed: {0}")]
    Unwrap(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Session error: {0}")]
    Session(String),

    #[cfg(feature = "pkcs11")]
    #[error("PKCS#11 error: {0}")]
    Pkcs11(#[from] cryptoki::error::Error),
}

/// Raw signing mechanism applied to device input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignMechanism {
    /// PKCS#1 v1.5 over a caller-built DigestInfo (`CKM_RSA_PKCS`).
    RsaPkcs,
    /// ECDSA over a digest (`CKM_ECDSA`), returning `r || s`.
    Ecdsa,
}

/// Public and private handles of a freshly generated key pair.
#[derive(Debug, Clone, Copy)]
pub struct KeyPairHandles<O> {
    pub public: O,
    pub private: O,
}

/// Operations against a cryptographic device.
///
/// Objects are session objects: they live only as long as the session that
/// created them and must never be shared between concurrent callers.
pub trait Device: Send + Sync + 'static {
    type Session: Send + 'static;
    type Object: Copy + Send + std::fmt::Debug + 'static;

    /// Open a session and authenticate it with the configured PIN.
    fn open_session(&self) -> Result<Self::Session, DeviceError>;

    fn close_session(&self, session: Self::Session) -> Result<(), DeviceError>;

    /// Generate an extractable, non-persistent AES-256 key.
    fn generate_secret_key(&self, session: &Self::Session) -> Result<Self::Object, DeviceError>;

    fn extract_secret(
        &self,
        session: &Self::Session,
        key: Self::Object,
    ) -> Result<Vec<u8>, DeviceError>;

    /// Load raw AES key bytes as a session object usable for wrap and unwrap.
    fn import_secret(
        &self,
        session: &Self::Session,
        value: &[u8],
    ) -> Result<Self::Object, DeviceError>;

    fn destroy_object(&self, session: &Self::Session, object: Self::Object)
    -> Result<(), DeviceError>;

    fn generate_key_pair(
        &self,
        session: &Self::Session,
        algorithm: &KeyAlgorithm,
    ) -> Result<KeyPairHandles<Self::Object>, DeviceError>;

    /// DER SubjectPublicKeyInfo of a public key object.
    fn public_key_der(
        &self,
        session: &Self::Session,
        algorithm: &KeyAlgorithm,
        public_key: Self::Object,
    ) -> Result<Vec<u8>, DeviceError>;

    fn wrap_key(
        &self,
        session: &Self::Session,
        wrapping_key: Self::Object,
        key: Self::Object,
    ) -> Result<Vec<u8>, DeviceError>;

    /// Unwrap into a sensitive, non-extractable private key session object.
    fn unwrap_key(
        &self,
        session: &Self::Session,
        unwrapping_key: Self::Object,
        wrapped: &[u8],
        algorithm: &KeyAlgorithm,
    ) -> Result<Self::Object, DeviceError>;

    fn sign(
        &self,
        session: &Self::Session,
        mechanism: SignMechanism,
        key: Self::Object,
        data: &[u8],
    ) -> Result<Vec<u8>, DeviceError>;
}
