//! In-process software device
//!
//! Mirrors the token semantics the pool relies on: every session shares one
//! login state, the login is dropped when the last session closes, and
//! objects are scoped to the session that created them. Wrapping uses
//! AES-256-GCM over the PKCS#8 encoding of the private key.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use p256::ecdsa::{SigningKey, VerifyingKey, signature::hazmat::PrehashSigner};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use rand::rngs::OsRng;
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use tracing::debug;
use zeroize::Zeroizing;

use super::{Device, DeviceError, KeyPairHandles, SignMechanism};
use crate::types::KeyAlgorithm;

const SECRET_KEY_LEN: usize = 32;

/// Handle to an object inside a `SoftSession`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SoftHandle(u64);

enum SoftObject {
    Secret(Zeroizing<Vec<u8>>),
    RsaPrivate {
        key: Box<RsaPrivateKey>,
        extractable: bool,
    },
    RsaPublic(RsaPublicKey),
    EcPrivate {
        key: SigningKey,
        extractable: bool,
    },
    EcPublic(VerifyingKey),
}

pub struct SoftSession {
    id: u64,
    objects: Mutex<HashMap<u64, SoftObject>>,
}

impl SoftSession {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Default)]
struct LoginState {
    open_sessions: usize,
    logged_in: bool,
    logins: u64,
    sessions_opened: u64,
}

pub struct SoftDevice {
    state: Mutex<LoginState>,
    max_sessions: Option<usize>,
    close_fault: AtomicBool,
    next_handle: AtomicU64,
    rng: SystemRandom,
}

impl Default for SoftDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoginState::default()),
            max_sessions: None,
            close_fault: AtomicBool::new(false),
            next_handle: AtomicU64::new(1),
            rng: SystemRandom::new(),
        }
    }

    /// Device that refuses to open more than `max_sessions` concurrent sessions.
    pub fn with_session_limit(max_sessions: usize) -> Self {
        Self {
            max_sessions: Some(max_sessions),
            ..Self::new()
        }
    }

    /// Make `close_session` fail, as a token does on `CKR_DEVICE_ERROR`.
    pub fn fail_session_close(&self, fail: bool) {
        self.close_fault.store(fail, Ordering::Relaxed);
    }

    /// Number of times the device went from logged out to logged in.
    pub fn login_count(&self) -> u64 {
        self.state.lock().map(|s| s.logins).unwrap_or(0)
    }

    pub fn sessions_opened(&self) -> u64 {
        self.state.lock().map(|s| s.sessions_opened).unwrap_or(0)
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().map(|s| s.open_sessions).unwrap_or(0)
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.lock().map(|s| s.logged_in).unwrap_or(false)
    }

    fn insert(&self, session: &SoftSession, object: SoftObject) -> Result<SoftHandle, DeviceError> {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        session
            .objects
            .lock()
            .map_err(|_| DeviceError::Session("Object table lock poisoned".into()))?
            .insert(handle, object);
        Ok(SoftHandle(handle))
    }

    fn with_object<T>(
        &self,
        session: &SoftSession,
        handle: SoftHandle,
        f: impl FnOnce(&SoftObject) -> Result<T, DeviceError>,
    ) -> Result<T, DeviceError> {
        let objects = session
            .objects
            .lock()
            .map_err(|_| DeviceError::Session("Object table lock poisoned".into()))?;
        let object = objects
            .get(&handle.0)
            .ok_or_else(|| DeviceError::ObjectNotFound(format!("{:?}", handle)))?;
        f(object)
    }

    fn secret_value(
        &self,
        session: &SoftSession,
        handle: SoftHandle,
    ) -> Result<Zeroizing<Vec<u8>>, DeviceError> {
        self.with_object(session, handle, |object| match object {
            SoftObject::Secret(value) => Ok(value.clone()),
            _ => Err(DeviceError::ObjectNotFound(format!(
                "{:?} is not a secret key",
                handle
            ))),
        })
    }

    fn cipher(value: &[u8]) -> Result<LessSafeKey, DeviceError> {
        let key = UnboundKey::new(&AES_256_GCM, value)
            .map_err(|_| DeviceError::Wrap("invalid wrapping key length".into()))?;
        Ok(LessSafeKey::new(key))
    }
}

impl Device for SoftDevice {
    type Session = SoftSession;
    type Object = SoftHandle;

    fn open_session(&self) -> Result<SoftSession, DeviceError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| DeviceError::Unavailable("Device state lock poisoned".into()))?;

        if let Some(max) = self.max_sessions
            && state.open_sessions >= max
        {
            return Err(DeviceError::Unavailable(format!(
                "session limit of {} reached",
                max
            )));
        }

        state.open_sessions += 1;
        state.sessions_opened += 1;
        if !state.logged_in {
            state.logged_in = true;
            state.logins += 1;
            debug!("Software device logged in");
        }

        Ok(SoftSession {
            id: state.sessions_opened,
            objects: Mutex::new(HashMap::new()),
        })
    }

    fn close_session(&self, session: SoftSession) -> Result<(), DeviceError> {
        if self.close_fault.load(Ordering::Relaxed) {
            return Err(DeviceError::Session(format!(
                "failed to close session {}",
                session.id
            )));
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| DeviceError::Session("Device state lock poisoned".into()))?;
        state.open_sessions = state.open_sessions.saturating_sub(1);
        if state.open_sessions == 0 && state.logged_in {
            state.logged_in = false;
            debug!("Last session closed, software device logged out");
        }
        drop(session);
        Ok(())
    }

    fn generate_secret_key(&self, session: &SoftSession) -> Result<SoftHandle, DeviceError> {
        let mut value = Zeroizing::new(vec![0u8; SECRET_KEY_LEN]);
        self.rng
            .fill(value.as_mut_slice())
            .map_err(|_| DeviceError::KeyGeneration("random source failed".into()))?;
        self.insert(session, SoftObject::Secret(value))
    }

    fn extract_secret(
        &self,
        session: &SoftSession,
        key: SoftHandle,
    ) -> Result<Vec<u8>, DeviceError> {
        Ok(self.secret_value(session, key)?.to_vec())
    }

    fn import_secret(&self, session: &SoftSession, value: &[u8]) -> Result<SoftHandle, DeviceError> {
        if value.len() != SECRET_KEY_LEN {
            return Err(DeviceError::Wrap(format!(
                "secret key must be {} bytes, got {}",
                SECRET_KEY_LEN,
                value.len()
            )));
        }
        self.insert(session, SoftObject::Secret(Zeroizing::new(value.to_vec())))
    }

    fn destroy_object(&self, session: &SoftSession, object: SoftHandle) -> Result<(), DeviceError> {
        session
            .objects
            .lock()
            .map_err(|_| DeviceError::Session("Object table lock poisoned".into()))?
            .remove(&object.0)
            .map(|_| ())
            .ok_or_else(|| DeviceError::ObjectNotFound(format!("{:?}", object)))
    }

    fn generate_key_pair(
        &self,
        session: &SoftSession,
        algorithm: &KeyAlgorithm,
    ) -> Result<KeyPairHandles<SoftHandle>, DeviceError> {
        let (public, private) = match algorithm {
            KeyAlgorithm::Rsa { bits } => {
                let key = RsaPrivateKey::new(&mut OsRng, *bits as usize)
                    .map_err(|e| DeviceError::KeyGeneration(e.to_string()))?;
                let public = SoftObject::RsaPublic(key.to_public_key());
                let private = SoftObject::RsaPrivate {
                    key: Box::new(key),
                    extractable: true,
                };
                (public, private)
            }
            KeyAlgorithm::Ec { .. } => {
                let key = SigningKey::random(&mut OsRng);
                let public = SoftObject::EcPublic(VerifyingKey::from(&key));
                let private = SoftObject::EcPrivate {
                    key,
                    extractable: true,
                };
                (public, private)
            }
        };

        Ok(KeyPairHandles {
            public: self.insert(session, public)?,
            private: self.insert(session, private)?,
        })
    }

    fn public_key_der(
        &self,
        session: &SoftSession,
        _algorithm: &KeyAlgorithm,
        public_key: SoftHandle,
    ) -> Result<Vec<u8>, DeviceError> {
        self.with_object(session, public_key, |object| {
            let der = match object {
                SoftObject::RsaPublic(key) => key.to_public_key_der(),
                SoftObject::EcPublic(key) => key.to_public_key_der(),
                _ => {
                    return Err(DeviceError::ObjectNotFound(format!(
                        "{:?} is not a public key",
                        public_key
                    )));
                }
            };
            der.map(|doc| doc.as_bytes().to_vec())
                .map_err(|e| DeviceError::KeyGeneration(e.to_string()))
        })
    }

    fn wrap_key(
        &self,
        session: &SoftSession,
        wrapping_key: SoftHandle,
        key: SoftHandle,
    ) -> Result<Vec<u8>, DeviceError> {
        let wrapping_value = self.secret_value(session, wrapping_key)?;

        let pkcs8 = self.with_object(session, key, |object| {
            let encoded = match object {
                SoftObject::RsaPrivate {
                    key,
                    extractable: true,
                } => key.to_pkcs8_der(),
                SoftObject::EcPrivate {
                    key,
                    extractable: true,
                } => key.to_pkcs8_der(),
                SoftObject::RsaPrivate { .. } | SoftObject::EcPrivate { .. } => {
                    return Err(DeviceError::Wrap("key is not extractable".into()));
                }
                _ => return Err(DeviceError::Wrap("object is not a private key".into())),
            };
            encoded
                .map(|doc| Zeroizing::new(doc.as_bytes().to_vec()))
                .map_err(|e| DeviceError::Wrap(e.to_string()))
        })?;

        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| DeviceError::Wrap("random source failed".into()))?;

        let cipher = Self::cipher(&wrapping_value)?;
        let mut sealed = pkcs8.to_vec();
        cipher
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                &mut sealed,
            )
            .map_err(|_| DeviceError::Wrap("seal failed".into()))?;

        let mut wrapped = Vec::with_capacity(NONCE_LEN + sealed.len());
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(&sealed);
        Ok(wrapped)
    }

    fn unwrap_key(
        &self,
        session: &SoftSession,
        unwrapping_key: SoftHandle,
        wrapped: &[u8],
        algorithm: &KeyAlgorithm,
    ) -> Result<SoftHandle, DeviceError> {
        if wrapped.len() <= NONCE_LEN {
            return Err(DeviceError::Unwrap("wrapped key too short".into()));
        }
        let unwrapping_value = self.secret_value(session, unwrapping_key)?;
        let cipher = Self::cipher(&unwrapping_value)?;

        let (nonce, sealed) = wrapped.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| DeviceError::Unwrap("invalid nonce".into()))?;
        let mut buffer = Zeroizing::new(sealed.to_vec());
        let pkcs8 = cipher
            .open_in_place(nonce, Aad::empty(), buffer.as_mut_slice())
            .map_err(|_| DeviceError::Unwrap("authentication failed".into()))?;

        let object = match algorithm {
            KeyAlgorithm::Rsa { .. } => SoftObject::RsaPrivate {
                key: Box::new(
                    RsaPrivateKey::from_pkcs8_der(pkcs8)
                        .map_err(|e| DeviceError::Unwrap(e.to_string()))?,
                ),
                extractable: false,
            },
            KeyAlgorithm::Ec { .. } => SoftObject::EcPrivate {
                key: SigningKey::from_pkcs8_der(pkcs8)
                    .map_err(|e| DeviceError::Unwrap(e.to_string()))?,
                extractable: false,
            },
        };
        self.insert(session, object)
    }

    fn sign(
        &self,
        session: &SoftSession,
        mechanism: SignMechanism,
        key: SoftHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, DeviceError> {
        self.with_object(session, key, |object| match (mechanism, object) {
            (SignMechanism::RsaPkcs, SoftObject::RsaPrivate { key, .. }) => key
                .sign(Pkcs1v15Sign::new_unprefixed(), data)
                .map_err(|e| DeviceError::Signing(e.to_string())),
            (SignMechanism::Ecdsa, SoftObject::EcPrivate { key, .. }) => {
                let signature: p256::ecdsa::Signature = key
                    .sign_prehash(data)
                    .map_err(|e| DeviceError::Signing(e.to_string()))?;
                Ok(signature.to_bytes().to_vec())
            }
            _ => Err(DeviceError::Signing(format!(
                "mechanism {:?} does not match key {:?}",
                mechanism, key
            ))),
        })
    }
}
