//! Key, hash and signature algorithm identifiers

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::device::SignMechanism;

const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const OID_SHA256_WITH_RSA: &str = "1.2.840.113549.1.1.11";
const OID_SHA384_WITH_RSA: &str = "1.2.840.113549.1.1.12";
const OID_SHA512_WITH_RSA: &str = "1.2.840.113549.1.1.13";
const OID_ECDSA_WITH_SHA256: &str = "1.2.840.10045.4.3.2";
const OID_ECDSA_WITH_SHA384: &str = "1.2.840.10045.4.3.3";
const OID_ECDSA_WITH_SHA512: &str = "1.2.840.10045.4.3.4";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn oid(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "2.16.840.1.101.3.4.2.1",
            HashAlgorithm::Sha384 => "2.16.840.1.101.3.4.2.2",
            HashAlgorithm::Sha512 => "2.16.840.1.101.3.4.2.3",
        }
    }

    pub fn from_oid(oid: &str) -> Option<Self> {
        [Self::Sha256, Self::Sha384, Self::Sha512]
            .into_iter()
            .find(|h| h.oid() == oid)
    }

    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Infer the hash algorithm from the length of a digest.
    pub fn from_digest_len(len: usize) -> Option<Self> {
        [Self::Sha256, Self::Sha384, Self::Sha512]
            .into_iter()
            .find(|h| h.digest_len() == len)
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    /// DER prefix of the PKCS#1 DigestInfo structure for this hash.
    fn digest_info_prefix(&self) -> &'static [u8] {
        match self {
            HashAlgorithm::Sha256 => &[
                0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
                0x01, 0x05, 0x00, 0x04, 0x20,
            ],
            HashAlgorithm::Sha384 => &[
                0x30, 0x41, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
                0x02, 0x05, 0x00, 0x04, 0x30,
            ],
            HashAlgorithm::Sha512 => &[
                0x30, 0x51, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02,
                0x03, 0x05, 0x00, 0x04, 0x40,
            ],
        }
    }

    pub fn digest_info(&self, digest: &[u8]) -> Vec<u8> {
        let prefix = self.digest_info_prefix();
        let mut info = Vec::with_capacity(prefix.len() + digest.len());
        info.extend_from_slice(prefix);
        info.extend_from_slice(digest);
        info
    }
}

/// Signature algorithm requested in a signHash call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignAlgorithm {
    /// Plain rsaEncryption; the hash comes from `hashAlgo` or the digest length.
    RsaEncryption,
    RsaWithHash(HashAlgorithm),
    EcdsaWithHash(HashAlgorithm),
}

impl SignAlgorithm {
    pub fn from_oid(oid: &str) -> Option<Self> {
        match oid {
            OID_RSA_ENCRYPTION => Some(SignAlgorithm::RsaEncryption),
            OID_SHA256_WITH_RSA => Some(SignAlgorithm::RsaWithHash(HashAlgorithm::Sha256)),
            OID_SHA384_WITH_RSA => Some(SignAlgorithm::RsaWithHash(HashAlgorithm::Sha384)),
            OID_SHA512_WITH_RSA => Some(SignAlgorithm::RsaWithHash(HashAlgorithm::Sha512)),
            OID_ECDSA_WITH_SHA256 => Some(SignAlgorithm::EcdsaWithHash(HashAlgorithm::Sha256)),
            OID_ECDSA_WITH_SHA384 => Some(SignAlgorithm::EcdsaWithHash(HashAlgorithm::Sha384)),
            OID_ECDSA_WITH_SHA512 => Some(SignAlgorithm::EcdsaWithHash(HashAlgorithm::Sha512)),
            _ => None,
        }
    }

    pub fn oid(&self) -> &'static str {
        match self {
            SignAlgorithm::RsaEncryption => OID_RSA_ENCRYPTION,
            SignAlgorithm::RsaWithHash(HashAlgorithm::Sha256) => OID_SHA256_WITH_RSA,
            SignAlgorithm::RsaWithHash(HashAlgorithm::Sha384) => OID_SHA384_WITH_RSA,
            SignAlgorithm::RsaWithHash(HashAlgorithm::Sha512) => OID_SHA512_WITH_RSA,
            SignAlgorithm::EcdsaWithHash(HashAlgorithm::Sha256) => OID_ECDSA_WITH_SHA256,
            SignAlgorithm::EcdsaWithHash(HashAlgorithm::Sha384) => OID_ECDSA_WITH_SHA384,
            SignAlgorithm::EcdsaWithHash(HashAlgorithm::Sha512) => OID_ECDSA_WITH_SHA512,
        }
    }

    /// Hash algorithm fixed by the OID itself, if any.
    pub fn implied_hash(&self) -> Option<HashAlgorithm> {
        match self {
            SignAlgorithm::RsaEncryption => None,
            SignAlgorithm::RsaWithHash(hash) | SignAlgorithm::EcdsaWithHash(hash) => Some(*hash),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EcCurve {
    #[serde(rename = "P-256")]
    P256,
}

impl EcCurve {
    pub fn name(&self) -> &'static str {
        match self {
            EcCurve::P256 => "P-256",
        }
    }

    pub fn oid(&self) -> &'static str {
        match self {
            EcCurve::P256 => "1.2.840.10045.3.1.7",
        }
    }

    /// DER-encoded named curve OID, as used for `CKA_EC_PARAMS`.
    pub fn der_params(&self) -> &'static [u8] {
        match self {
            EcCurve::P256 => &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07],
        }
    }

    pub fn bit_length(&self) -> u32 {
        match self {
            EcCurve::P256 => 256,
        }
    }
}

/// Kind of key held by a credential.
///
/// Each variant carries what the device needs to generate, unwrap and sign
/// with that key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyAlgorithm {
    Rsa { bits: u32 },
    Ec { curve: EcCurve },
}

impl KeyAlgorithm {
    /// Parse a configuration value such as `rsa`, `rsa-3072` or `ec-p256`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "rsa" => Some(KeyAlgorithm::Rsa { bits: 2048 }),
            "ec" | "ec-p256" | "p-256" | "p256" => Some(KeyAlgorithm::Ec {
                curve: EcCurve::P256,
            }),
            other => other
                .strip_prefix("rsa-")
                .and_then(|bits| bits.parse().ok())
                .map(|bits| KeyAlgorithm::Rsa { bits }),
        }
    }

    /// OID of the key itself (rsaEncryption or id-ecPublicKey).
    pub fn key_oid(&self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa { .. } => OID_RSA_ENCRYPTION,
            KeyAlgorithm::Ec { .. } => OID_EC_PUBLIC_KEY,
        }
    }

    pub fn bit_length(&self) -> u32 {
        match self {
            KeyAlgorithm::Rsa { bits } => *bits,
            KeyAlgorithm::Ec { curve } => curve.bit_length(),
        }
    }

    pub fn curve(&self) -> Option<EcCurve> {
        match self {
            KeyAlgorithm::Rsa { .. } => None,
            KeyAlgorithm::Ec { curve } => Some(*curve),
        }
    }

    /// Signature algorithm OIDs a credential with this key advertises.
    pub fn supported_sign_algorithms(&self) -> Vec<String> {
        let algorithms: &[SignAlgorithm] = match self {
            KeyAlgorithm::Rsa { .. } => &[
                SignAlgorithm::RsaEncryption,
                SignAlgorithm::RsaWithHash(HashAlgorithm::Sha256),
                SignAlgorithm::RsaWithHash(HashAlgorithm::Sha384),
                SignAlgorithm::RsaWithHash(HashAlgorithm::Sha512),
            ],
            KeyAlgorithm::Ec { .. } => &[
                SignAlgorithm::EcdsaWithHash(HashAlgorithm::Sha256),
                SignAlgorithm::EcdsaWithHash(HashAlgorithm::Sha384),
                SignAlgorithm::EcdsaWithHash(HashAlgorithm::Sha512),
            ],
        };
        algorithms.iter().map(|a| a.oid().to_string()).collect()
    }

    pub fn sign_mechanism(&self) -> SignMechanism {
        match self {
            KeyAlgorithm::Rsa { .. } => SignMechanism::RsaPkcs,
            KeyAlgorithm::Ec { .. } => SignMechanism::Ecdsa,
        }
    }

    /// Bytes handed to the device for one digest.
    ///
    /// RSA signs the PKCS#1 DigestInfo with the raw PKCS#1 v1.5 mechanism;
    /// ECDSA signs the digest as is.
    pub fn signing_input(&self, hash: HashAlgorithm, digest: &[u8]) -> Vec<u8> {
        match self {
            KeyAlgorithm::Rsa { .. } => hash.digest_info(digest),
            KeyAlgorithm::Ec { .. } => digest.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_algorithm_oid_round_trip() {
        for oid in [
            OID_RSA_ENCRYPTION,
            OID_SHA256_WITH_RSA,
            OID_SHA512_WITH_RSA,
            OID_ECDSA_WITH_SHA256,
        ] {
            let algorithm = SignAlgorithm::from_oid(oid).unwrap();
            assert_eq!(algorithm.oid(), oid);
        }
        assert!(SignAlgorithm::from_oid("1.2.3.4").is_none());
    }

    #[test]
    fn test_hash_inferred_from_digest_length() {
        assert_eq!(
            HashAlgorithm::from_digest_len(32),
            Some(HashAlgorithm::Sha256)
        );
        assert_eq!(
            HashAlgorithm::from_digest_len(64),
            Some(HashAlgorithm::Sha512)
        );
        assert_eq!(HashAlgorithm::from_digest_len(20), None);
    }

    #[test]
    fn test_digest_info_wraps_sha256() {
        let digest = HashAlgorithm::Sha256.digest(b"test");
        let info = HashAlgorithm::Sha256.digest_info(&digest);
        assert_eq!(info.len(), 19 + 32);
        assert_eq!(info[0], 0x30);
        assert_eq!(&info[19..], digest.as_slice());
    }

    #[test]
    fn test_key_algorithm_parse() {
        assert_eq!(
            KeyAlgorithm::parse("rsa"),
            Some(KeyAlgorithm::Rsa { bits: 2048 })
        );
        assert_eq!(
            KeyAlgorithm::parse("RSA-3072"),
            Some(KeyAlgorithm::Rsa { bits: 3072 })
        );
        assert_eq!(
            KeyAlgorithm::parse("ec-p256"),
            Some(KeyAlgorithm::Ec {
                curve: EcCurve::P256
            })
        );
        assert_eq!(KeyAlgorithm::parse("dsa"), None);
    }

    #[test]
    fn test_rsa_credential_does_not_advertise_ecdsa() {
        let supported = KeyAlgorithm::Rsa { bits: 2048 }.supported_sign_algorithms();
        assert!(supported.contains(&OID_SHA256_WITH_RSA.to_string()));
        assert!(!supported.contains(&OID_ECDSA_WITH_SHA256.to_string()));
    }
}
