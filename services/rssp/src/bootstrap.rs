//! Wiring of the signing stack from configuration

use std::num::NonZeroU32;
use std::sync::Arc;

use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::error::Unspecified;
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};

use rssp::{
    CredentialStore, Device, FileCredentialStore, HttpCertificateIssuer, InfoResponse,
    KeyWrapService, MemoryCredentialStore, RsspError, SessionPool, SigningService, TokenProvider,
};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::config::RsspConfig;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Device initialization failed: {0}")]
    Device(String),

    #[error("Wrapping key file {path}: {reason}")]
    WrappingKey { path: String, reason: String },

    #[error(transparent)]
    Rssp(#[from] RsspError),
}

#[cfg(feature = "pkcs11")]
pub fn open_pkcs11(config: &RsspConfig) -> Result<rssp::Pkcs11Device, BootstrapError> {
    let pin = config
        .hsm_pin
        .clone()
        .ok_or_else(|| BootstrapError::Device("HSM_PIN must be set".to_string()))?;
    rssp::Pkcs11Device::new(&config.pkcs11_library, config.hsm_slot, pin)
        .map_err(|e| BootstrapError::Device(e.to_string()))
}

const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(65_536) {
    Some(iterations) => iterations,
    None => panic!("iteration count must be non-zero"),
};

fn file_key(passphrase: &SecretString, salt: &[u8]) -> Result<LessSafeKey, Unspecified> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        PBKDF2_ITERATIONS,
        salt,
        passphrase.expose_secret().as_bytes(),
        &mut key[..],
    );
    Ok(LessSafeKey::new(UnboundKey::new(&AES_256_GCM, &key[..])?))
}

/// Encrypt a wrapping key for storage: hex of `nonce || ciphertext || tag`
/// under AES-256-GCM with a PBKDF2-HMAC-SHA256 derived key.
fn seal_wrapping_key(
    value: &[u8],
    passphrase: &SecretString,
    salt: &[u8],
) -> Result<String, Unspecified> {
    let key = file_key(passphrase, salt)?;
    let mut nonce = [0u8; NONCE_LEN];
    SystemRandom::new().fill(&mut nonce)?;

    let mut sealed = value.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce),
        Aad::empty(),
        &mut sealed,
    )?;

    let mut out = nonce.to_vec();
    out.extend_from_slice(&sealed);
    Ok(hex::encode(out))
}

fn open_wrapping_key(
    encoded: &str,
    passphrase: &SecretString,
    salt: &[u8],
) -> Result<Zeroizing<Vec<u8>>, String> {
    let bytes = hex::decode(encoded.trim()).map_err(|e| e.to_string())?;
    if bytes.len() <= NONCE_LEN {
        return Err("file is too short".to_string());
    }
    let (nonce, sealed) = bytes.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce).map_err(|_| "bad nonce".to_string())?;

    let key = file_key(passphrase, salt).map_err(|_| "key derivation failed".to_string())?;
    let mut sealed = Zeroizing::new(sealed.to_vec());
    let plain = key
        .open_in_place(nonce, Aad::empty(), sealed.as_mut_slice())
        .map_err(|_| "decryption failed, wrong passphrase or salt".to_string())?;
    Ok(Zeroizing::new(plain.to_vec()))
}

/// Install the wrapping key from `path`, generating and persisting one on
/// first start. The file is encrypted under the configured passphrase.
fn load_wrapping_key<D: Device>(
    wraps: &KeyWrapService<D>,
    config: &RsspConfig,
) -> Result<(), BootstrapError> {
    let Some(path) = config.wrapping_key_file.as_deref() else {
        warn!("WRAPPING_KEY_FILE not set, wrapped keys will not survive restarts");
        wraps.generate_wrapping_key()?;
        return Ok(());
    };
    let fail = |reason: String| BootstrapError::WrappingKey {
        path: path.display().to_string(),
        reason,
    };
    let passphrase = config
        .wrapping_key_passphrase
        .as_ref()
        .ok_or_else(|| fail("WRAPPING_KEY_PASSPHRASE must be set".to_string()))?;
    let salt = &config.wrapping_key_salt;

    if path.exists() {
        let encoded = std::fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
        let value = open_wrapping_key(&encoded, passphrase, salt).map_err(fail)?;
        wraps.set_wrapping_key(&value)?;
        info!("Loaded wrapping key from {}", path.display());
    } else {
        let value = Zeroizing::new(wraps.generate_wrapping_key()?);
        let sealed = seal_wrapping_key(&value, passphrase, salt)
            .map_err(|_| fail("encryption failed".to_string()))?;
        std::fs::write(path, sealed).map_err(|e| fail(e.to_string()))?;
        info!("Generated wrapping key at {}", path.display());
    }
    Ok(())
}

/// Build the credential authorization and signing service over `device`.
pub fn signing_service<D: Device>(
    config: &RsspConfig,
    device: Arc<D>,
) -> Result<SigningService<D>, BootstrapError> {
    let pool = SessionPool::new(device);
    let wraps = Arc::new(KeyWrapService::new(pool));
    load_wrapping_key(&wraps, config)?;

    let store: Arc<dyn CredentialStore> = match &config.credential_dir {
        Some(dir) => {
            info!("Using credential directory {}", dir.display());
            Arc::new(FileCredentialStore::new(dir.clone())?)
        }
        None => {
            warn!("CREDENTIAL_DIR not set, credentials are kept in memory");
            Arc::new(MemoryCredentialStore::new())
        }
    };

    let sad = Arc::new(TokenProvider::sad(
        &config.sad_secret,
        config.sad_lifetime_minutes,
    ));

    let mut service = SigningService::new(store, sad, wraps)
        .with_max_signatures(config.max_signatures)
        .with_key_algorithm(config.key_algorithm);
    if let Some(ca_url) = &config.ca_url {
        info!("Certificates issued by {}", ca_url);
        service = service.with_issuer(Arc::new(HttpCertificateIssuer::new(ca_url)));
    }
    Ok(service)
}

pub fn access_tokens(config: &RsspConfig) -> TokenProvider {
    TokenProvider::access(
        &config.access_token_secret,
        config.access_token_lifetime_minutes,
    )
}

/// CSC `info` document of this service.
pub fn service_info() -> InfoResponse {
    InfoResponse {
        specs: "1.0.4.0".to_string(),
        name: "RSSP".to_string(),
        logo: String::new(),
        region: "EU".to_string(),
        lang: "en-US".to_string(),
        description: "Remote Signature Service Provider".to_string(),
        auth_type: vec!["external".to_string()],
        methods: [
            "credentials/list",
            "credentials/info",
            "credentials/authorize",
            "signatures/signHash",
        ]
        .iter()
        .map(|method| method.to_string())
        .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rssp::SoftDevice;

    fn config(vars: &[(&str, String)]) -> RsspConfig {
        let vars: Vec<(String, String)> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        RsspConfig::from_lookup(move |name| {
            vars.iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        })
        .unwrap()
    }

    fn sealed_file_config(key_file: &std::path::Path, passphrase: &str) -> RsspConfig {
        config(&[
            ("ACCESS_TOKEN_SECRET", "s".to_string()),
            ("WRAPPING_KEY_FILE", key_file.display().to_string()),
            ("WRAPPING_KEY_PASSPHRASE", passphrase.to_string()),
            ("WRAPPING_KEY_SALT", "c2FsdHNhbHQ=".to_string()),
        ])
    }

    #[test]
    fn test_wrapping_key_persisted_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("wrapping.key");
        let config = sealed_file_config(&key_file, "correct horse");

        signing_service(&config, Arc::new(SoftDevice::new())).unwrap();
        let first = std::fs::read_to_string(&key_file).unwrap();

        let service = signing_service(&config, Arc::new(SoftDevice::new())).unwrap();
        assert!(service.key_wrap().has_wrapping_key());
        assert_eq!(std::fs::read_to_string(&key_file).unwrap(), first);
    }

    #[test]
    fn test_wrapping_key_file_does_not_hold_raw_key() {
        let passphrase = SecretString::from("correct horse");
        let salt = b"saltsalt";
        let key = [0x5au8; 32];

        let sealed = seal_wrapping_key(&key, &passphrase, salt).unwrap();
        assert!(!sealed.contains(&hex::encode(key)));
        assert_eq!(hex::decode(&sealed).unwrap().len(), NONCE_LEN + 32 + 16);

        let opened = open_wrapping_key(&sealed, &passphrase, salt).unwrap();
        assert_eq!(opened.as_slice(), key.as_slice());

        let again = seal_wrapping_key(&key, &passphrase, salt).unwrap();
        assert_ne!(sealed, again);
    }

    #[test]
    fn test_wrapping_key_wrong_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("wrapping.key");
        signing_service(
            &sealed_file_config(&key_file, "correct horse"),
            Arc::new(SoftDevice::new()),
        )
        .unwrap();

        assert!(matches!(
            signing_service(
                &sealed_file_config(&key_file, "battery staple"),
                Arc::new(SoftDevice::new())
            ),
            Err(BootstrapError::WrappingKey { .. })
        ));
    }

    #[test]
    fn test_corrupt_wrapping_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("wrapping.key");
        std::fs::write(&key_file, "not hex").unwrap();
        let config = sealed_file_config(&key_file, "correct horse");

        assert!(matches!(
            signing_service(&config, Arc::new(SoftDevice::new())),
            Err(BootstrapError::WrappingKey { .. })
        ));
    }

    #[test]
    fn test_info_lists_signing_methods() {
        let info = service_info();
        assert!(info.methods.contains(&"signatures/signHash".to_string()));
    }
}
