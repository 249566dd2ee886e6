#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end document signing
//!
//! Serves the router on an ephemeral port and signs a PDF through the HTTP
//! client, then checks the CMS container against the credential's key.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use cms::content_info::ContentInfo;
use cms::signed_data::{SignedData, SignerInfo};
use der::asn1::{BitString, ObjectIdentifier, OctetString};
use der::{Any, Decode, Encode, SliceReader};
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use rssp::{
    CertificateIssuer, CertificateRequest, Credential, EcCurve, IssuedCertificate, KeyAlgorithm,
    KeyWrapService, MemoryCredentialStore, NewCredential, PdfAdapter, RsspClient, RsspError,
    SessionPool, SigningService, SoftDevice, TokenProvider, sign_document,
};
use rssp_service::{bootstrap, handlers::AppState, server::create_router};
use secrecy::SecretString;
use sha2::{Digest, Sha256};
use x509_cert::Certificate;
use x509_cert::certificate::{TbsCertificate, Version};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::time::Validity;

const ID_MESSAGE_DIGEST: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");
const SHA256_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
const ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");

/// Issues structurally valid certificates over the requested public key.
struct DerIssuer;

fn certificate(spki: &[u8], subject: &str, serial: u8) -> Vec<u8> {
    let algorithm = AlgorithmIdentifierOwned {
        oid: SHA256_WITH_RSA,
        parameters: None,
    };
    Certificate {
        tbs_certificate: TbsCertificate {
            version: Version::V3,
            serial_number: SerialNumber::new(&[serial]).unwrap(),
            signature: algorithm.clone(),
            issuer: Name::from_str("CN=Test CA").unwrap(),
            validity: Validity::from_now(Duration::from_secs(86_400)).unwrap(),
            subject: Name::from_str(subject).unwrap(),
            subject_public_key_info: SubjectPublicKeyInfoOwned::from_der(spki).unwrap(),
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

#[async_trait]
impl CertificateIssuer for DerIssuer {
    async fn issue(&self, request: &CertificateRequest) -> Result<IssuedCertificate, RsspError> {
        let spki = STANDARD.decode(&request.public_key).unwrap();
        Ok(IssuedCertificate {
            certificate: STANDARD.encode(certificate(&spki, &request.subject_dn, 2)),
            certificate_chain: vec![STANDARD.encode(certificate(&spki, "CN=Test CA", 1))],
            issuer_dn: "CN=Test CA".into(),
            subject_dn: request.subject_dn.clone(),
            serial_number: "02".into(),
            valid_from: "20250101000000Z".into(),
            valid_to: "20990101000000Z".into(),
        })
    }
}

fn build_pdf() -> Vec<u8> {
    let objects = [
        "<< /Type /Catalog /Pages 2 0 R >>",
        "<< /Type /Pages /Kids [3 0 R] /Count 1 >>",
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >>",
    ];
    let mut out = b"%PDF-1.7\n".to_vec();
    let mut offsets = Vec::new();
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, body).as_bytes());
    }
    let xref = out.len();
    out.extend_from_slice(b"xref\n0 4\n0000000000 65535 f\r\n");
    for offset in offsets {
        out.extend_from_slice(format!("{:010} 00000 n\r\n", offset).as_bytes());
    }
    out.extend_from_slice(
        format!("trailer\n<< /Size 4 /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n", xref).as_bytes(),
    );
    out
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> usize {
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|position| position + from)
        .unwrap()
}

struct SignedPdf {
    credential: Credential,
    original: Vec<u8>,
    signed: Vec<u8>,
}

/// Provision `alias` for u1, serve the API and sign a PDF through it.
async fn sign_over_http(key_algorithm: KeyAlgorithm) -> SignedPdf {
    let pool = SessionPool::new(Arc::new(SoftDevice::new()));
    let wraps = Arc::new(KeyWrapService::new(pool));
    wraps.generate_wrapping_key().unwrap();
    let sad = Arc::new(TokenProvider::sad(
        &SecretString::from("sad-secret".to_string()),
        5,
    ));
    let service = SigningService::new(Arc::new(MemoryCredentialStore::new()), sad, wraps)
        .with_key_algorithm(key_algorithm)
        .with_issuer(Arc::new(DerIssuer));
    let state = Arc::new(AppState {
        service,
        access_tokens: TokenProvider::access(&SecretString::from("access-secret".to_string()), 60),
        info: bootstrap::service_info(),
    });

    let credential = state
        .service
        .create_credential(NewCredential {
            owner: "u1".into(),
            alias: "a1".into(),
            subject_dn: "CN=u1".into(),
            country: None,
            description: None,
        })
        .await
        .unwrap();
    let token = state.access_tokens.issue("u1").unwrap().raw;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, create_router(state)).await.unwrap();
    });

    let client = RsspClient::new(&format!("http://{}", address), token).with_credential("a1");
    let original = build_pdf();
    let signed = sign_document(&PdfAdapter::new(), &client, &original).await;
    server.abort();

    SignedPdf {
        credential,
        original,
        signed: signed.unwrap(),
    }
}

/// Signed byte ranges and the decoded signer of a signed PDF.
fn inspect(pdf: &SignedPdf) -> (Vec<u8>, SignedData) {
    let signed = &pdf.signed;
    assert!(signed.starts_with(&pdf.original));

    let contents_start = find(signed, b"<", find(signed, b"/Contents", pdf.original.len()));
    let contents_end = find(signed, b">", contents_start) + 1;

    let range_open = find(signed, b"[", find(signed, b"/ByteRange", pdf.original.len()));
    let range_close = find(signed, b"]", range_open);
    let range: Vec<usize> = String::from_utf8_lossy(&signed[range_open + 1..range_close])
        .split_ascii_whitespace()
        .map(|value| value.parse().unwrap())
        .collect();
    assert_eq!(
        range,
        vec![
            0,
            contents_start,
            contents_end,
            signed.len() - contents_end
        ]
    );

    let mut covered = signed[..contents_start].to_vec();
    covered.extend_from_slice(&signed[contents_end..]);

    let container = hex::decode(&signed[contents_start + 1..contents_end - 1]).unwrap();
    let mut reader = SliceReader::new(&container).unwrap();
    let info = ContentInfo::decode(&mut reader).unwrap();
    let signed_data = SignedData::from_der(&info.content.to_der().unwrap()).unwrap();
    (covered, signed_data)
}

fn message_digest(signer: &SignerInfo) -> Vec<u8> {
    let value: Any = signer
        .signed_attrs
        .as_ref()
        .unwrap()
        .iter()
        .find(|attribute| attribute.oid == ID_MESSAGE_DIGEST)
        .unwrap()
        .values
        .get(0)
        .unwrap()
        .clone();
    value.decode_as::<OctetString>().unwrap().as_bytes().to_vec()
}

#[tokio::test]
async fn test_sign_pdf_with_rsa_credential_over_http() {
    let pdf = sign_over_http(KeyAlgorithm::Rsa { bits: 1024 }).await;
    let (covered, signed_data) = inspect(&pdf);

    assert_eq!(signed_data.certificates.as_ref().unwrap().0.len(), 2);
    let signer = signed_data.signer_infos.0.get(0).unwrap();
    assert_eq!(signer.signature_algorithm.oid, SHA256_WITH_RSA);
    assert_eq!(message_digest(signer), Sha256::digest(&covered).to_vec());

    let attributes = signer.signed_attrs.as_ref().unwrap().to_der().unwrap();
    let public = RsaPublicKey::from_public_key_der(&pdf.credential.public_key).unwrap();
    public
        .verify(
            Pkcs1v15Sign::new::<Sha256>(),
            &Sha256::digest(&attributes),
            signer.signature.as_bytes(),
        )
        .unwrap();
}

#[tokio::test]
async fn test_sign_pdf_with_ec_credential_over_http() {
    use p256::ecdsa::{DerSignature, VerifyingKey, signature::Verifier};

    let pdf = sign_over_http(KeyAlgorithm::Ec {
        curve: EcCurve::P256,
    })
    .await;
    let (covered, signed_data) = inspect(&pdf);

    let signer = signed_data.signer_infos.0.get(0).unwrap();
    assert_eq!(signer.signature_algorithm.oid, ECDSA_WITH_SHA256);
    assert_eq!(message_digest(signer), Sha256::digest(&covered).to_vec());

    let attributes = signer.signed_attrs.as_ref().unwrap().to_der().unwrap();
    let public = VerifyingKey::from_public_key_der(&pdf.credential.public_key).unwrap();
    let signature = DerSignature::try_from(signer.signature.as_bytes()).unwrap();
    public.verify(&attributes, &signature).unwrap();
}

#[tokio::test]
async fn test_unknown_credential_leaves_no_document() {
    let pool = SessionPool::new(Arc::new(SoftDevice::new()));
    let wraps = Arc::new(KeyWrapService::new(pool));
    wraps.generate_wrapping_key().unwrap();
    let sad = Arc::new(TokenProvider::sad(
        &SecretString::from("sad-secret".to_string()),
        5,
    ));
    let state = Arc::new(AppState {
        service: SigningService::new(Arc::new(MemoryCredentialStore::new()), sad, wraps),
        access_tokens: TokenProvider::access(&SecretString::from("access-secret".to_string()), 60),
        info: bootstrap::service_info(),
    });
    let token = state.access_tokens.issue("u1").unwrap().raw;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, create_router(state)).await.unwrap();
    });

    let client = RsspClient::new(&format!("http://{}", address), token).with_credential("missing");
    let result = sign_document(&PdfAdapter::new(), &client, &build_pdf()).await;
    server.abort();

    assert!(matches!(result, Err(RsspError::ServerError(..))));
}
