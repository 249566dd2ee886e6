//! Detached CMS SignedData
//!
//! The remote signature is computed over the DER of the signed attributes,
//! which carry the digest of the document content. The result is wrapped
//! with the credential's certificates into a single-signer SignedData.

use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{
    CertificateSet, EncapsulatedContentInfo, SignedAttributes, SignedData, SignerIdentifier,
    SignerInfo, SignerInfos,
};
use der::asn1::{Null, ObjectIdentifier, OctetString, SetOfVec};
use der::{Any, Decode, Encode, Sequence};
use sha2::{Digest, Sha256};
use x509_cert::Certificate;
use x509_cert::attr::Attribute;
use x509_cert::spki::AlgorithmIdentifierOwned;

use crate::error::RsspError;
use crate::types::SignAlgorithm;

const ID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
const ID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");
const ID_CONTENT_TYPE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.3");
const ID_MESSAGE_DIGEST: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");
const ID_SIGNING_CERTIFICATE_V2: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.2.47");
const ID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");

/// ESSCertIDv2 with the default SHA-256 hash algorithm and no issuer serial.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct EssCertIdV2 {
    cert_hash: OctetString,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct SigningCertificateV2 {
    certs: Vec<EssCertIdV2>,
}

fn encoding(e: der::Error) -> RsspError {
    RsspError::FailedSigningData(format!("CMS encoding failed: {}", e))
}

fn attribute(oid: ObjectIdentifier, value: der::Result<Any>) -> Result<Attribute, RsspError> {
    Ok(Attribute {
        oid,
        values: SetOfVec::try_from(vec![value.map_err(encoding)?]).map_err(encoding)?,
    })
}

fn sha256_identifier() -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: ID_SHA256,
        parameters: None,
    }
}

/// A SignedData waiting for the signature over its signed attributes.
pub struct DetachedSignature {
    certificates: Vec<Certificate>,
    signed_attributes: SignedAttributes,
}

impl DetachedSignature {
    /// `certificates` are DER encoded, signer first. `content_digest` is the
    /// SHA-256 of the signed content.
    pub fn new(certificates: &[Vec<u8>], content_digest: &[u8]) -> Result<Self, RsspError> {
        let signer = certificates.first().ok_or_else(|| {
            RsspError::FailedSigningData("Credential has no certificate".to_string())
        })?;
        let parsed = certificates
            .iter()
            .map(|der| Certificate::from_der(der))
            .collect::<Result<Vec<_>, _>>()
            .map_err(encoding)?;

        let signing_certificate = SigningCertificateV2 {
            certs: vec![EssCertIdV2 {
                cert_hash: OctetString::new(Sha256::digest(signer).to_vec()).map_err(encoding)?,
            }],
        };
        let digest = OctetString::new(content_digest.to_vec()).map_err(encoding)?;

        let signed_attributes = SetOfVec::try_from(vec![
            attribute(ID_CONTENT_TYPE, Any::encode_from(&ID_DATA))?,
            attribute(ID_MESSAGE_DIGEST, Any::encode_from(&digest))?,
            attribute(
                ID_SIGNING_CERTIFICATE_V2,
                Any::encode_from(&signing_certificate),
            )?,
        ])
        .map_err(encoding)?;

        Ok(Self {
            certificates: parsed,
            signed_attributes,
        })
    }

    /// The bytes the signer actually signs: the DER `SET OF` attributes.
    pub fn signed_attributes_der(&self) -> Result<Vec<u8>, RsspError> {
        self.signed_attributes.to_der().map_err(encoding)
    }

    /// Encode the `ContentInfo` carrying `signature` made with `algorithm`.
    ///
    /// ECDSA signatures arrive as `r || s` and are re-encoded as DER.
    pub fn finish(self, algorithm: SignAlgorithm, signature: &[u8]) -> Result<Vec<u8>, RsspError> {
        let signer = self.certificates.first().ok_or_else(|| {
            RsspError::FailedSigningData("Credential has no certificate".to_string())
        })?;
        let sid = SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
            issuer: signer.tbs_certificate.issuer.clone(),
            serial_number: signer.tbs_certificate.serial_number.clone(),
        });

        let oid = ObjectIdentifier::new(algorithm.oid())
            .map_err(|e| RsspError::AlgorithmNotSupported(e.to_string()))?;
        let (parameters, signature) = match algorithm {
            SignAlgorithm::EcdsaWithHash(_) => {
                let signature = p256::ecdsa::Signature::from_slice(signature).map_err(|e| {
                    RsspError::FailedSigningData(format!("Invalid ECDSA signature: {}", e))
                })?;
                (None, signature.to_der().as_bytes().to_vec())
            }
            SignAlgorithm::RsaEncryption | SignAlgorithm::RsaWithHash(_) => (
                Some(Any::encode_from(&Null).map_err(encoding)?),
                signature.to_vec(),
            ),
        };

        let signer_info = SignerInfo {
            version: CmsVersion::V1,
            sid,
            digest_alg: sha256_identifier(),
            signed_attrs: Some(self.signed_attributes),
            signature_algorithm: AlgorithmIdentifierOwned { oid, parameters },
            signature: OctetString::new(signature).map_err(encoding)?,
            unsigned_attrs: None,
        };

        let certificates = self
            .certificates
            .into_iter()
            .map(CertificateChoices::Certificate)
            .collect::<Vec<_>>();
        let signed_data = SignedData {
            version: CmsVersion::V1,
            digest_algorithms: SetOfVec::try_from(vec![sha256_identifier()]).map_err(encoding)?,
            encap_content_info: EncapsulatedContentInfo {
                econtent_type: ID_DATA,
                econtent: None,
            },
            certificates: Some(CertificateSet(
                SetOfVec::try_from(certificates).map_err(encoding)?,
            )),
            crls: None,
            signer_infos: SignerInfos(SetOfVec::try_from(vec![signer_info]).map_err(encoding)?),
        };

        ContentInfo {
            content_type: ID_SIGNED_DATA,
            content: Any::encode_from(&signed_data).map_err(encoding)?,
        }
        .to_der()
        .map_err(encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HashAlgorithm;
    use der::asn1::BitString;
    use p256::ecdsa::signature::Verifier;
    use p256::ecdsa::{SigningKey, VerifyingKey, signature::Signer};
    use p256::pkcs8::EncodePublicKey;
    use std::str::FromStr;
    use std::time::Duration;
    use x509_cert::certificate::{TbsCertificate, Version};
    use x509_cert::name::Name;
    use x509_cert::serial_number::SerialNumber;
    use x509_cert::spki::SubjectPublicKeyInfoOwned;
    use x509_cert::time::Validity;

    const ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");

    /// Certificate for `key` carrying a placeholder issuer signature.
    fn certificate(key: &VerifyingKey, subject: &str) -> Vec<u8> {
        let spki = key.to_public_key_der().unwrap();
        let algorithm = AlgorithmIdentifierOwned {
            oid: ECDSA_WITH_SHA256,
            parameters: None,
        };
        Certificate {
            tbs_certificate: TbsCertificate {
                version: Version::V3,
                serial_number: SerialNumber::new(&[0x01, 0x42]).unwrap(),
                signature: algorithm.clone(),
                issuer: Name::from_str("CN=Test CA").unwrap(),
                validity: Validity::from_now(Duration::from_secs(3600)).unwrap(),
                subject: Name::from_str(subject).unwrap(),
                subject_public_key_info: SubjectPublicKeyInfoOwned::from_der(spki.as_bytes())
                    .unwrap(),
                issuer_unique_id: None,
                subject_unique_id: None,
                extensions: None,
            },
            signature_algorithm: algorithm,
            signature: BitString::from_bytes(&[0]).unwrap(),
        }
        .to_der()
        .unwrap()
    }

    fn attribute_value(info: &SignerInfo, oid: ObjectIdentifier) -> Any {
        info.signed_attrs
            .as_ref()
            .unwrap()
            .iter()
            .find(|attribute| attribute.oid == oid)
            .unwrap()
            .values
            .get(0)
            .unwrap()
            .clone()
    }

    #[test]
    fn test_signed_data_verifies_over_signed_attributes() {
        let key = SigningKey::random(&mut rand::thread_rng());
        let leaf = certificate(key.verifying_key(), "CN=u1");
        let root = certificate(key.verifying_key(), "CN=Test CA");
        let content_digest = HashAlgorithm::Sha256.digest(b"document content");

        let pending = DetachedSignature::new(&[leaf.clone(), root], &content_digest).unwrap();
        let signed_attributes = pending.signed_attributes_der().unwrap();
        let signature: p256::ecdsa::Signature = key.sign(&signed_attributes);
        let encoded = pending
            .finish(
                SignAlgorithm::EcdsaWithHash(HashAlgorithm::Sha256),
                &signature.to_bytes(),
            )
            .unwrap();

        let info = ContentInfo::from_der(&encoded).unwrap();
        assert_eq!(info.content_type, ID_SIGNED_DATA);
        let signed_data = SignedData::from_der(&info.content.to_der().unwrap()).unwrap();
        assert!(signed_data.encap_content_info.econtent.is_none());
        assert_eq!(signed_data.certificates.as_ref().unwrap().0.len(), 2);

        let signer = signed_data.signer_infos.0.get(0).unwrap();
        assert_eq!(signer.signature_algorithm.oid, ECDSA_WITH_SHA256);
        match &signer.sid {
            SignerIdentifier::IssuerAndSerialNumber(sid) => {
                assert_eq!(sid.issuer.to_string(), "CN=Test CA");
            }
            other => panic!("unexpected signer identifier {:?}", other),
        }

        let digest = attribute_value(signer, ID_MESSAGE_DIGEST)
            .decode_as::<OctetString>()
            .unwrap();
        assert_eq!(digest.as_bytes(), content_digest.as_slice());

        let essential = attribute_value(signer, ID_SIGNING_CERTIFICATE_V2)
            .decode_as::<SigningCertificateV2>()
            .unwrap();
        assert_eq!(
            essential.certs[0].cert_hash.as_bytes(),
            Sha256::digest(&leaf).as_slice()
        );

        let attributes_der = signer.signed_attrs.as_ref().unwrap().to_der().unwrap();
        assert_eq!(attributes_der, signed_attributes);
        let der_signature =
            p256::ecdsa::DerSignature::try_from(signer.signature.as_bytes()).unwrap();
        key.verifying_key()
            .verify(&attributes_der, &der_signature)
            .unwrap();
    }

    #[test]
    fn test_rsa_signature_kept_verbatim() {
        let key = SigningKey::random(&mut rand::thread_rng());
        let leaf = certificate(key.verifying_key(), "CN=u1");
        let pending = DetachedSignature::new(&[leaf], &[7u8; 32]).unwrap();

        let encoded = pending
            .finish(SignAlgorithm::RsaWithHash(HashAlgorithm::Sha256), &[0xaa; 128])
            .unwrap();
        let info = ContentInfo::from_der(&encoded).unwrap();
        let signed_data = SignedData::from_der(&info.content.to_der().unwrap()).unwrap();
        let signer = signed_data.signer_infos.0.get(0).unwrap();
        assert_eq!(signer.signature.as_bytes(), &[0xaa; 128][..]);
        assert!(signer.signature_algorithm.parameters.is_some());
    }

    #[test]
    fn test_requires_a_certificate() {
        assert!(matches!(
            DetachedSignature::new(&[], &[0u8; 32]),
            Err(RsspError::FailedSigningData(_))
        ));
        assert!(matches!(
            DetachedSignature::new(&[b"not der".to_vec()], &[0u8; 32]),
            Err(RsspError::FailedSigningData(_))
        ));
    }

    #[test]
    fn test_malformed_ecdsa_signature_rejected() {
        let key = SigningKey::random(&mut rand::thread_rng());
        let leaf = certificate(key.verifying_key(), "CN=u1");
        let pending = DetachedSignature::new(&[leaf], &[0u8; 32]).unwrap();
        assert!(matches!(
            pending.finish(SignAlgorithm::EcdsaWithHash(HashAlgorithm::Sha256), &[1, 2, 3]),
            Err(RsspError::FailedSigningData(_))
        ));
    }
}
