//! Service configuration from the environment

use std::path::PathBuf;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use rssp::KeyAlgorithm;
use secrecy::SecretString;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Software,
    Pkcs11,
}

pub struct RsspConfig {
    pub port: u16,
    pub device: DeviceKind,
    pub pkcs11_library: String,
    pub hsm_slot: usize,
    pub hsm_pin: Option<SecretString>,
    pub sad_secret: SecretString,
    pub sad_lifetime_minutes: i64,
    pub access_token_secret: SecretString,
    pub access_token_lifetime_minutes: i64,
    pub max_signatures: u32,
    pub key_algorithm: KeyAlgorithm,
    /// File-backed credential store; in memory when unset
    pub credential_dir: Option<PathBuf>,
    pub wrapping_key_file: Option<PathBuf>,
    /// Seals the wrapping key file; required with `wrapping_key_file`
    pub wrapping_key_passphrase: Option<SecretString>,
    pub wrapping_key_salt: Vec<u8>,
    pub ca_url: Option<String>,
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

impl RsspConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok().filter(|v| !v.is_empty()))
    }

    /// Build the configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let device = match lookup("RSSP_DEVICE").as_deref() {
            None | Some("software") => DeviceKind::Software,
            Some("pkcs11") => DeviceKind::Pkcs11,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "RSSP_DEVICE",
                    reason: format!("unknown device '{}'", other),
                });
            }
        };

        let hsm_pin = lookup("HSM_PIN").map(SecretString::from);
        if device == DeviceKind::Pkcs11 && hsm_pin.is_none() {
            return Err(ConfigError::Missing("HSM_PIN"));
        }

        let access_token_secret = lookup("ACCESS_TOKEN_SECRET")
            .map(SecretString::from)
            .ok_or(ConfigError::Missing("ACCESS_TOKEN_SECRET"))?;

        let sad_secret = match lookup("SAD_SECRET") {
            Some(secret) => SecretString::from(secret),
            None => {
                warn!("SAD_SECRET not set, using a random secret; SADs will not survive restarts");
                let mut bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                SecretString::from(hex::encode(bytes))
            }
        };

        let rsa_bits: u32 = parse(&lookup, "RSA_KEY_BITS", 2048)?;
        let key_algorithm = match lookup("KEY_ALGORITHM").as_deref() {
            None => KeyAlgorithm::Rsa { bits: rsa_bits },
            Some(value) => match KeyAlgorithm::parse(value) {
                Some(KeyAlgorithm::Rsa { .. }) if value.eq_ignore_ascii_case("rsa") => {
                    KeyAlgorithm::Rsa { bits: rsa_bits }
                }
                Some(algorithm) => algorithm,
                None => {
                    return Err(ConfigError::Invalid {
                        name: "KEY_ALGORITHM",
                        reason: format!("unknown key algorithm '{}'", value),
                    });
                }
            },
        };

        let max_signatures: u32 = parse(&lookup, "CSC_MAX_SIGNATURES", 1)?;
        if max_signatures == 0 {
            return Err(ConfigError::Invalid {
                name: "CSC_MAX_SIGNATURES",
                reason: "must be at least 1".to_string(),
            });
        }

        let wrapping_key_file = lookup("WRAPPING_KEY_FILE").map(PathBuf::from);
        let wrapping_key_passphrase = lookup("WRAPPING_KEY_PASSPHRASE").map(SecretString::from);
        let wrapping_key_salt = match lookup("WRAPPING_KEY_SALT") {
            Some(salt) => BASE64.decode(salt.trim()).map_err(|e| ConfigError::Invalid {
                name: "WRAPPING_KEY_SALT",
                reason: e.to_string(),
            })?,
            None => Vec::new(),
        };
        if wrapping_key_file.is_some() {
            if wrapping_key_passphrase.is_none() {
                return Err(ConfigError::Missing("WRAPPING_KEY_PASSPHRASE"));
            }
            if wrapping_key_salt.is_empty() {
                return Err(ConfigError::Missing("WRAPPING_KEY_SALT"));
            }
        }

        Ok(Self {
            port: parse(&lookup, "PORT", 80)?,
            device,
            pkcs11_library: lookup("PKCS11_LIBRARY")
                .unwrap_or_else(|| "/usr/lib/softhsm/libsofthsm2.so".to_string()),
            hsm_slot: parse(&lookup, "HSM_SLOT", 0)?,
            hsm_pin,
            sad_secret,
            sad_lifetime_minutes: parse(&lookup, "SAD_LIFETIME_MINUTES", 5)?,
            access_token_secret,
            access_token_lifetime_minutes: parse(&lookup, "ACCESS_TOKEN_LIFETIME_MINUTES", 60)?,
            max_signatures,
            key_algorithm,
            credential_dir: lookup("CREDENTIAL_DIR").map(PathBuf::from),
            wrapping_key_file,
            wrapping_key_passphrase,
            wrapping_key_salt,
            ca_url: lookup("CA_URL"),
        })
    }
}
