//! Key wrap service
//!
//! Private keys only ever leave the device wrapped under a process-wide AES
//! key. The wrapping key is held in memory as raw bytes and loaded into a
//! session as a transient object for each wrap or unwrap, then destroyed.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::device::{Device, DeviceError, SignMechanism};
use crate::error::RsspError;
use crate::pool::SessionPool;
use crate::types::KeyAlgorithm;

const WRAPPING_KEY_LEN: usize = 32;

/// Output of key pair generation: only the wrapped private half and the
/// public key cross this boundary.
#[derive(Clone)]
pub struct GeneratedKey {
    pub wrapped_private_key: Vec<u8>,
    /// DER SubjectPublicKeyInfo
    pub public_key: Vec<u8>,
}

pub struct KeyWrapService<D: Device> {
    pool: Arc<SessionPool<D>>,
    wrapping_key: Mutex<Option<Zeroizing<Vec<u8>>>>,
}

impl<D: Device> KeyWrapService<D> {
    pub fn new(pool: Arc<SessionPool<D>>) -> Self {
        Self {
            pool,
            wrapping_key: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool<D>> {
        &self.pool
    }

    pub fn has_wrapping_key(&self) -> bool {
        self.wrapping_key
            .lock()
            .map(|key| key.is_some())
            .unwrap_or(false)
    }

    /// Generate a fresh wrapping key on the device and install it.
    ///
    /// Returns the raw bytes so the caller can persist them; the device
    /// object used to produce them is destroyed before returning.
    pub fn generate_wrapping_key(&self) -> Result<Vec<u8>, RsspError> {
        let lease = self.pool.acquire()?;
        let device = self.pool.device();
        let session = lease.session();

        let key = device
            .generate_secret_key(session)
            .map_err(|e| RsspError::DeviceError(e.to_string()))?;
        let value = device.extract_secret(session, key);
        if let Err(e) = device.destroy_object(session, key) {
            warn!("Failed to destroy transient wrapping key object: {}", e);
        }
        let value = Zeroizing::new(value.map_err(|e| RsspError::DeviceError(e.to_string()))?);
        drop(lease);

        self.set_wrapping_key(&value)?;
        info!("Generated new wrapping key");
        Ok(value.to_vec())
    }

    /// Install a previously generated wrapping key.
    pub fn set_wrapping_key(&self, value: &[u8]) -> Result<(), RsspError> {
        if value.len() != WRAPPING_KEY_LEN {
            return Err(RsspError::InvalidRequest(format!(
                "wrapping key must be {} bytes, got {}",
                WRAPPING_KEY_LEN,
                value.len()
            )));
        }
        let mut slot = self
            .wrapping_key
            .lock()
            .map_err(|_| RsspError::DeviceError("Wrapping key lock poisoned".into()))?;
        *slot = Some(Zeroizing::new(value.to_vec()));
        Ok(())
    }

    fn wrapping_key_value(&self) -> Result<Zeroizing<Vec<u8>>, RsspError> {
        self.wrapping_key
            .lock()
            .map_err(|_| RsspError::DeviceError("Wrapping key lock poisoned".into()))?
            .clone()
            .ok_or(RsspError::WrappingKeyMissing)
    }

    /// Run `f` with the wrapping key loaded into `session` as a transient object.
    fn with_wrapping_key<T>(
        &self,
        session: &D::Session,
        f: impl FnOnce(D::Object) -> Result<T, DeviceError>,
    ) -> Result<T, RsspError> {
        let value = self.wrapping_key_value()?;
        let device = self.pool.device();
        let key = device
            .import_secret(session, &value)
            .map_err(|e| RsspError::DeviceError(e.to_string()))?;

        let result = f(key);
        if let Err(e) = device.destroy_object(session, key) {
            warn!("Failed to destroy transient wrapping key object: {}", e);
        }
        result.map_err(|e| RsspError::DeviceError(e.to_string()))
    }

    /// Wrap a private key object that lives in `session`.
    pub fn wrap(&self, session: &D::Session, key: D::Object) -> Result<Vec<u8>, RsspError> {
        let device = self.pool.device();
        self.with_wrapping_key(session, |wrapping_key| {
            device.wrap_key(session, wrapping_key, key)
        })
    }

    /// Unwrap into a session-scoped, non-extractable key handle.
    pub fn unwrap(
        &self,
        session: &D::Session,
        wrapped: &[u8],
        algorithm: &KeyAlgorithm,
    ) -> Result<D::Object, RsspError> {
        let device = self.pool.device();
        self.with_wrapping_key(session, |unwrapping_key| {
            device.unwrap_key(session, unwrapping_key, wrapped, algorithm)
        })
    }

    /// Generate a key pair and return it wrapped, with its public key.
    pub fn generate_key_pair(&self, algorithm: &KeyAlgorithm) -> Result<GeneratedKey, RsspError> {
        let lease = self.pool.acquire()?;
        let device = self.pool.device();
        let session = lease.session();

        let pair = device
            .generate_key_pair(session, algorithm)
            .map_err(|e| RsspError::DeviceError(e.to_string()))?;

        let result = device
            .public_key_der(session, algorithm, pair.public)
            .map_err(|e| RsspError::DeviceError(e.to_string()))
            .and_then(|public_key| {
                let wrapped_private_key = self.wrap(session, pair.private)?;
                Ok(GeneratedKey {
                    wrapped_private_key,
                    public_key,
                })
            });

        for object in [pair.public, pair.private] {
            if let Err(e) = device.destroy_object(session, object) {
                warn!("Failed to destroy generated key object: {}", e);
            }
        }
        debug!(?algorithm, "Generated wrapped key pair");
        result
    }

    /// Sign each payload in order with a wrapped private key.
    ///
    /// The key is unwrapped once inside a single leased session and destroyed
    /// before the session goes back to the pool.
    pub fn sign(
        &self,
        wrapped: &[u8],
        algorithm: &KeyAlgorithm,
        mechanism: SignMechanism,
        payloads: &[Vec<u8>],
    ) -> Result<Vec<Vec<u8>>, RsspError> {
        let lease = self.pool.acquire()?;
        let device = self.pool.device();
        let session = lease.session();

        let key = self
            .unwrap(session, wrapped, algorithm)
            .map_err(|e| RsspError::FailedSigningData(e.to_string()))?;

        let signatures = payloads
            .iter()
            .map(|payload| {
                device
                    .sign(session, mechanism, key, payload)
                    .map_err(|e| RsspError::FailedSigningData(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>();

        if let Err(e) = device.destroy_object(session, key) {
            warn!("Failed to destroy unwrapped key object: {}", e);
        }
        signatures
    }
}
