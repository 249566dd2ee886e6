//! PKCS#11 device backed by cryptoki
//!
//! All generated and unwrapped objects are session objects (`CKA_TOKEN`
//! false); only wrapped key bytes outlive a session.

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as CryptokiError, RvError};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, KeyType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use p256::pkcs8::EncodePublicKey;
use rsa::{BigUint, RsaPublicKey};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use super::{Device, DeviceError, KeyPairHandles, SignMechanism};
use crate::types::KeyAlgorithm;

const AES_KEY_LEN: u64 = 32;

pub struct Pkcs11Device {
    pkcs11: Pkcs11,
    slot: Slot,
    pin: SecretString,
}

impl Pkcs11Device {
    /// Load the PKCS#11 module and select the token in `slot_index`.
    pub fn new(library_path: &str, slot_index: usize, pin: SecretString) -> Result<Self, DeviceError> {
        info!("Loading PKCS#11 module from {}", library_path);
        let pkcs11 = Pkcs11::new(library_path)?;
        pkcs11.initialize(CInitializeArgs::OsThreads)?;

        let slots = pkcs11.get_slots_with_token()?;
        let slot = slots.get(slot_index).copied().ok_or_else(|| {
            DeviceError::Unavailable(format!("No token in slot index {}", slot_index))
        })?;

        Ok(Self { pkcs11, slot, pin })
    }

    fn attribute(
        session: &Session,
        object: ObjectHandle,
        attribute: AttributeType,
    ) -> Result<Attribute, DeviceError> {
        session
            .get_attributes(object, &[attribute])?
            .into_iter()
            .next()
            .ok_or_else(|| DeviceError::ObjectNotFound(format!("{:?} on {:?}", attribute, object)))
    }

    fn private_key_template(algorithm: &KeyAlgorithm, extractable: bool) -> Vec<Attribute> {
        let key_type = match algorithm {
            KeyAlgorithm::Rsa { .. } => KeyType::RSA,
            KeyAlgorithm::Ec { .. } => KeyType::EC,
        };
        vec![
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::KeyType(key_type),
            Attribute::Token(false),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Extractable(extractable),
            Attribute::Sign(true),
        ]
    }
}

/// Strip the DER OCTET STRING wrapper PKCS#11 puts around `CKA_EC_POINT`.
fn ec_point(raw: &[u8]) -> Result<&[u8], DeviceError> {
    match raw {
        [0x04, 0x41, rest @ ..] if rest.len() == 65 => Ok(rest),
        [0x04, ..] if raw.len() == 65 => Ok(raw),
        _ => Err(DeviceError::KeyGeneration(format!(
            "Unexpected EC point format: {} bytes, first byte 0x{:02x}",
            raw.len(),
            raw.first().copied().unwrap_or(0)
        ))),
    }
}

impl Device for Pkcs11Device {
    type Session = Session;
    type Object = ObjectHandle;

    fn open_session(&self) -> Result<Session, DeviceError> {
        let session = self
            .pkcs11
            .open_rw_session(self.slot)
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?;

        let pin = AuthPin::new(self.pin.expose_secret().into());
        match session.login(UserType::User, Some(&pin)) {
            Ok(()) => debug!("Logged in to slot {:?}", self.slot),
            // Login state is per application, later sessions inherit it.
            Err(CryptokiError::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => {}
            Err(e) => return Err(DeviceError::LoginFailed(e.to_string())),
        }

        Ok(session)
    }

    fn close_session(&self, session: Session) -> Result<(), DeviceError> {
        // C_CloseSession runs on drop.
        drop(session);
        Ok(())
    }

    fn generate_secret_key(&self, session: &Session) -> Result<ObjectHandle, DeviceError> {
        let template = vec![
            Attribute::Class(ObjectClass::SECRET_KEY),
            Attribute::KeyType(KeyType::AES),
            Attribute::ValueLen(AES_KEY_LEN.into()),
            Attribute::Token(false),
            Attribute::Sensitive(false),
            Attribute::Extractable(true),
            Attribute::Wrap(true),
            Attribute::Unwrap(true),
        ];
        session
            .generate_key(&Mechanism::AesKeyGen, &template)
            .map_err(|e| DeviceError::KeyGeneration(e.to_string()))
    }

    fn extract_secret(&self, session: &Session, key: ObjectHandle) -> Result<Vec<u8>, DeviceError> {
        match Self::attribute(session, key, AttributeType::Value)? {
            Attribute::Value(value) => Ok(value),
            other => Err(DeviceError::ObjectNotFound(format!(
                "unexpected attribute {:?}",
                other.attribute_type()
            ))),
        }
    }

    fn import_secret(&self, session: &Session, value: &[u8]) -> Result<ObjectHandle, DeviceError> {
        let template = vec![
            Attribute::Class(ObjectClass::SECRET_KEY),
            Attribute::KeyType(KeyType::AES),
            Attribute::Token(false),
            Attribute::Value(value.to_vec()),
            Attribute::Wrap(true),
            Attribute::Unwrap(true),
        ];
        Ok(session.create_object(&template)?)
    }

    fn destroy_object(&self, session: &Session, object: ObjectHandle) -> Result<(), DeviceError> {
        Ok(session.destroy_object(object)?)
    }

    fn generate_key_pair(
        &self,
        session: &Session,
        algorithm: &KeyAlgorithm,
    ) -> Result<KeyPairHandles<ObjectHandle>, DeviceError> {
        let (mechanism, public_template) = match algorithm {
            KeyAlgorithm::Rsa { bits } => (
                Mechanism::RsaPkcsKeyPairGen,
                vec![
                    Attribute::Class(ObjectClass::PUBLIC_KEY),
                    Attribute::KeyType(KeyType::RSA),
                    Attribute::Token(false),
                    Attribute::Verify(true),
                    Attribute::ModulusBits(u64::from(*bits).into()),
                    Attribute::PublicExponent(vec![0x01, 0x00, 0x01]),
                ],
            ),
            KeyAlgorithm::Ec { curve } => (
                Mechanism::EccKeyPairGen,
                vec![
                    Attribute::Class(ObjectClass::PUBLIC_KEY),
                    Attribute::KeyType(KeyType::EC),
                    Attribute::Token(false),
                    Attribute::Verify(true),
                    Attribute::EcParams(curve.der_params().to_vec()),
                ],
            ),
        };
        let private_template = Self::private_key_template(algorithm, true);

        let (public, private) = session
            .generate_key_pair(&mechanism, &public_template, &private_template)
            .map_err(|e| DeviceError::KeyGeneration(e.to_string()))?;

        Ok(KeyPairHandles { public, private })
    }

    fn public_key_der(
        &self,
        session: &Session,
        algorithm: &KeyAlgorithm,
        public_key: ObjectHandle,
    ) -> Result<Vec<u8>, DeviceError> {
        let der = match algorithm {
            KeyAlgorithm::Rsa { .. } => {
                let attrs = session.get_attributes(
                    public_key,
                    &[AttributeType::Modulus, AttributeType::PublicExponent],
                )?;
                let mut modulus = None;
                let mut exponent = None;
                for attr in attrs {
                    match attr {
                        Attribute::Modulus(n) => modulus = Some(n),
                        Attribute::PublicExponent(e) => exponent = Some(e),
                        _ => {}
                    }
                }
                let (Some(n), Some(e)) = (modulus, exponent) else {
                    return Err(DeviceError::KeyGeneration(
                        "RSA public key attributes missing".into(),
                    ));
                };
                RsaPublicKey::new(BigUint::from_bytes_be(&n), BigUint::from_bytes_be(&e))
                    .map_err(|e| DeviceError::KeyGeneration(e.to_string()))?
                    .to_public_key_der()
            }
            KeyAlgorithm::Ec { .. } => {
                let Attribute::EcPoint(raw) =
                    Self::attribute(session, public_key, AttributeType::EcPoint)?
                else {
                    return Err(DeviceError::KeyGeneration("EC point missing".into()));
                };
                p256::PublicKey::from_sec1_bytes(ec_point(&raw)?)
                    .map_err(|e| DeviceError::KeyGeneration(e.to_string()))?
                    .to_public_key_der()
            }
        };

        der.map(|doc| doc.as_bytes().to_vec())
            .map_err(|e| DeviceError::KeyGeneration(e.to_string()))
    }

    fn wrap_key(
        &self,
        session: &Session,
        wrapping_key: ObjectHandle,
        key: ObjectHandle,
    ) -> Result<Vec<u8>, DeviceError> {
        session
            .wrap_key(&Mechanism::AesKeyWrapPad, wrapping_key, key)
            .map_err(|e| DeviceError::Wrap(e.to_string()))
    }

    fn unwrap_key(
        &self,
        session: &Session,
        unwrapping_key: ObjectHandle,
        wrapped: &[u8],
        algorithm: &KeyAlgorithm,
    ) -> Result<ObjectHandle, DeviceError> {
        let template = Self::private_key_template(algorithm, false);
        session
            .unwrap_key(&Mechanism::AesKeyWrapPad, unwrapping_key, wrapped, &template)
            .map_err(|e| DeviceError::Unwrap(e.to_string()))
    }

    fn sign(
        &self,
        session: &Session,
        mechanism: SignMechanism,
        key: ObjectHandle,
        data: &[u8],
    ) -> Result<Vec<u8>, DeviceError> {
        let mechanism = match mechanism {
            SignMechanism::RsaPkcs => Mechanism::RsaPkcs,
            SignMechanism::Ecdsa => Mechanism::Ecdsa,
        };
        session
            .sign(&mechanism, key, data)
            .map_err(|e| DeviceError::Signing(e.to_string()))
    }
}
