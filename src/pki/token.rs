//! Join tokens for edges that have no certificate yet
//!
//! A token is an HS256 JWT keyed with the CA private key. The join token handed
//! to operators prefixes it with the hex SHA-256 of the CA certificate so the
//! edge can pin the CA it downloads from `/ca.crt`:
//!
//! ```text
//! <sha256(ca.der) hex>.<header>.<claims>.<signature>
//! ```

use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Token verification failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// Signature does not match the CA key
    #[error("invalid token signature")]
    InvalidSignature,

    /// `exp` is in the past
    #[error("token expired")]
    Expired,

    /// Structurally a JWT but rejected by validation
    #[error("invalid token: {0}")]
    Invalid(String),

    /// Not decodable at all (bad base64, JSON or UTF-8)
    #[error("malformed token: {0}")]
    Malformed(String),
}

impl TokenError {
    /// Whether the failure means "not authenticated" rather than "bad request"
    pub fn is_unauthorized(&self) -> bool {
        !matches!(self, TokenError::Malformed(_))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iat: u64,
    exp: u64,
}

fn unix_now() -> u64 {
    ::time::OffsetDateTime::now_utc().unix_timestamp().max(0) as u64
}

/// Sign a token valid for `ttl`
pub fn generate_token(ca_key_der: &[u8], ttl: Duration) -> Result<String, crate::Error> {
    let now = unix_now();
    sign_claims(ca_key_der, now, now + ttl.as_secs())
}

fn sign_claims(ca_key_der: &[u8], iat: u64, exp: u64) -> Result<String, crate::Error> {
    encode(
        &Header::new(Algorithm::HS256),
        &Claims { iat, exp },
        &EncodingKey::from_secret(ca_key_der),
    )
    .map_err(|e| crate::Error::credential(format!("failed to sign token: {}", e)))
}

/// Verify a bare JWT or a join token against the CA key
pub fn verify_token(token: &str, ca_key_der: &[u8]) -> Result<(), TokenError> {
    let jwt = strip_ca_hash(token);

    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;

    decode::<Claims>(jwt, &DecodingKey::from_secret(ca_key_der), &validation)
        .map(|_| ())
        .map_err(|e| match e.kind() {
            ErrorKind::InvalidSignature => TokenError::InvalidSignature,
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                TokenError::Malformed(e.to_string())
            }
            _ => TokenError::Invalid(e.to_string()),
        })
}

/// Hex SHA-256 digest of the CA certificate DER
pub fn ca_hash(ca_cert_der: &[u8]) -> String {
    aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, ca_cert_der)
        .as_ref()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Build the operator-facing join token
pub fn join_token(ca_cert_der: &[u8], jwt: &str) -> String {
    format!("{}.{}", ca_hash(ca_cert_der), jwt)
}

fn strip_ca_hash(token: &str) -> &str {
    match token.split_once('.') {
        Some((prefix, rest))
            if prefix.len() == 64
                && prefix.bytes().all(|b| b.is_ascii_hexdigit())
                && rest.matches('.').count() == 2 =>
        {
            rest
        }
        _ => token,
    }
}
