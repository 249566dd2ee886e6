//! Signed, time-bounded bearer tokens
//!
//! Used for Signature Activation Data (SAD) and for the access tokens that
//! authenticate callers of the CSC API. Both are HS512 JWTs with a `type`
//! claim, so one provider instance never accepts the other's tokens.

use chrono::Utc;
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::RsspError;

pub const SAD_TOKEN_TYPE: &str = "SAD";
pub const ACCESS_TOKEN_TYPE: &str = "access";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(rename = "type")]
    pub token_type: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(
        rename = "credentialID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub credential_id: Option<String>,
    #[serde(
        rename = "numSignatures",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub num_signatures: Option<u32>,
}

/// A token together with its encoded form.
#[derive(Debug, Clone)]
pub struct Token {
    pub raw: String,
    pub claims: Claims,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Token expired")]
    Expired,

    #[error("Unsupported token format: {0}")]
    UnsupportedFormat(String),
}

/// Outcome of validating a token against a provider.
#[derive(Debug, Clone)]
pub enum TokenStatus {
    Valid(Token),
    Expired,
    Malformed(String),
    WrongType { expected: String, found: String },
}

pub struct TokenProvider {
    token_type: String,
    lifetime_seconds: i64,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenProvider {
    pub fn new(token_type: impl Into<String>, secret: &SecretString, lifetime_minutes: i64) -> Self {
        let secret = secret.expose_secret().as_bytes();

        let mut validation = Validation::new(Algorithm::HS512);
        // No clock-skew tolerance between issuer and validator.
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "iat", "sub"]);

        Self {
            token_type: token_type.into(),
            lifetime_seconds: lifetime_minutes * 60,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn sad(secret: &SecretString, lifetime_minutes: i64) -> Self {
        Self::new(SAD_TOKEN_TYPE, secret, lifetime_minutes)
    }

    pub fn access(secret: &SecretString, lifetime_minutes: i64) -> Self {
        Self::new(ACCESS_TOKEN_TYPE, secret, lifetime_minutes)
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    pub fn lifetime_seconds(&self) -> i64 {
        self.lifetime_seconds
    }

    /// Issue a token for `subject` valid for the configured lifetime.
    pub fn issue(&self, subject: &str) -> Result<Token, RsspError> {
        self.sign_claims(self.claims_at(subject, Utc::now().timestamp()))
    }

    /// Issue a SAD bound to one credential and a signature quota.
    pub fn issue_bound(
        &self,
        subject: &str,
        credential_id: &str,
        num_signatures: u32,
    ) -> Result<Token, RsspError> {
        let mut claims = self.claims_at(subject, Utc::now().timestamp());
        claims.credential_id = Some(credential_id.to_string());
        claims.num_signatures = Some(num_signatures);
        self.sign_claims(claims)
    }

    /// Decode and verify a token without looking at its type.
    pub fn parse(&self, raw: &str) -> Result<Token, TokenError> {
        let data = decode::<Claims>(raw, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature => {
                    TokenError::Malformed("signature verification failed".to_string())
                }
                ErrorKind::Json(_) | ErrorKind::MissingRequiredClaim(_) => {
                    TokenError::UnsupportedFormat(e.to_string())
                }
                _ => TokenError::Malformed(e.to_string()),
            }
        })?;

        Ok(Token {
            raw: raw.to_string(),
            claims: data.claims,
        })
    }

    /// Parse and check the type tag matches this provider.
    pub fn validate(&self, raw: &str) -> TokenStatus {
        match self.parse(raw) {
            Ok(token) if token.claims.token_type == self.token_type => TokenStatus::Valid(token),
            Ok(token) => TokenStatus::WrongType {
                expected: self.token_type.clone(),
                found: token.claims.token_type,
            },
            Err(TokenError::Expired) => TokenStatus::Expired,
            Err(e) => TokenStatus::Malformed(e.to_string()),
        }
    }

    fn claims_at(&self, subject: &str, issued_at: i64) -> Claims {
        Claims {
            sub: subject.to_string(),
            token_type: self.token_type.clone(),
            iat: issued_at,
            exp: issued_at + self.lifetime_seconds,
            credential_id: None,
            num_signatures: None,
        }
    }

    fn sign_claims(&self, claims: Claims) -> Result<Token, RsspError> {
        let raw = encode(&Header::new(Algorithm::HS512), &claims, &self.encoding_key)
            .map_err(|e| RsspError::TokenError(e.to_string()))?;
        Ok(Token { raw, claims })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    #[test]
    fn test_issue_then_validate_recovers_subject() {
        let provider = TokenProvider::sad(&secret("sad-secret"), 5);
        for subject in ["u1", "alice@example.com", ""] {
            let token = provider.issue(subject).unwrap();
            match provider.validate(&token.raw) {
                TokenStatus::Valid(parsed) => {
                    assert_eq!(parsed.claims.sub, subject);
                    assert_eq!(parsed.claims.token_type, SAD_TOKEN_TYPE);
                }
                other => panic!("expected valid token, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_expiry_is_lifetime_after_issue() {
        let provider = TokenProvider::sad(&secret("sad-secret"), 5);
        let token = provider.issue("u1").unwrap();
        assert_eq!(token.claims.exp - token.claims.iat, 300);
        assert_eq!(provider.lifetime_seconds(), 300);
    }

    #[test]
    fn test_bound_claims_survive_round_trip() {
        let provider = TokenProvider::sad(&secret("sad-secret"), 5);
        let token = provider.issue_bound("u1", "a1", 1).unwrap();
        let parsed = provider.parse(&token.raw).unwrap();
        assert_eq!(parsed.claims.credential_id.as_deref(), Some("a1"));
        assert_eq!(parsed.claims.num_signatures, Some(1));
    }

    #[test]
    fn test_expired_token_fails_with_expired() {
        let provider = TokenProvider::sad(&secret("sad-secret"), 5);
        let issued_at = Utc::now().timestamp() - 600;
        let token = provider
            .sign_claims(provider.claims_at("u1", issued_at))
            .unwrap();

        assert_eq!(provider.parse(&token.raw).unwrap_err(), TokenError::Expired);
        assert!(matches!(provider.validate(&token.raw), TokenStatus::Expired));
    }

    #[test]
    fn test_foreign_secret_is_malformed() {
        let issuer = TokenProvider::sad(&secret("one"), 5);
        let validator = TokenProvider::sad(&secret("two"), 5);
        let token = issuer.issue("u1").unwrap();

        assert!(matches!(
            validator.parse(&token.raw),
            Err(TokenError::Malformed(_))
        ));
        assert!(matches!(
            validator.validate(&token.raw),
            TokenStatus::Malformed(_)
        ));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let provider = TokenProvider::sad(&secret("sad-secret"), 5);
        assert!(matches!(
            provider.validate("not-a-token"),
            TokenStatus::Malformed(_)
        ));
    }

    #[test]
    fn test_signed_token_with_foreign_claims_is_unsupported_format() {
        let provider = TokenProvider::sad(&secret("sad-secret"), 5);
        let key = EncodingKey::from_secret(b"sad-secret");
        let now = Utc::now().timestamp();

        let untyped = serde_json::json!({ "sub": "u1", "iat": now, "exp": now + 300 });
        let numeric_subject =
            serde_json::json!({ "sub": 42, "type": SAD_TOKEN_TYPE, "iat": now, "exp": now + 300 });

        for claims in [untyped, numeric_subject] {
            let raw = encode(&Header::new(Algorithm::HS512), &claims, &key).unwrap();
            assert!(matches!(
                provider.parse(&raw),
                Err(TokenError::UnsupportedFormat(_))
            ));
            assert!(matches!(
                provider.validate(&raw),
                TokenStatus::Malformed(_)
            ));
        }
    }

    #[test]
    fn test_access_token_is_wrong_type_for_sad_provider() {
        let shared = secret("shared");
        let access = TokenProvider::access(&shared, 60);
        let sad = TokenProvider::sad(&shared, 5);
        let token = access.issue("u1").unwrap();

        match sad.validate(&token.raw) {
            TokenStatus::WrongType { expected, found } => {
                assert_eq!(expected, SAD_TOKEN_TYPE);
                assert_eq!(found, ACCESS_TOKEN_TYPE);
            }
            other => panic!("expected wrong type, got {:?}", other),
        }
    }
}
