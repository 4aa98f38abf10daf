//! Time-windowed bearer tokens gating the WebSocket upgrade.
//!
//! Format: `base64([8-byte expiry][32-byte HMAC-SHA256])`, the HMAC
//! covering the expiry and the caller identification header.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ring::hmac;

use crate::{
    crypto::AesCryptor,
    error::{MagicLinkError, Result},
};

/// How long a token is accepted after being issued.
pub const TOKEN_VALIDITY_SECS: u64 = 30;

const TOKEN_BYTES: usize = 8 + 32;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

fn signed_data(expiry: u64, subject: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + subject.len());
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(subject.as_bytes());
    data
}

/// Issues a token for `subject`, valid for [`TOKEN_VALIDITY_SECS`].
pub fn issue_token(cryptor: &AesCryptor, subject: &str) -> String {
    issue_token_at(cryptor, subject, now_secs())
}

fn issue_token_at(cryptor: &AesCryptor, subject: &str, issued_at: u64) -> String {
    let expiry = issued_at + TOKEN_VALIDITY_SECS;
    let key = hmac::Key::new(hmac::HMAC_SHA256, cryptor.secret());
    let tag = hmac::sign(&key, &signed_data(expiry, subject));
    let mut token = Vec::with_capacity(TOKEN_BYTES);
    token.extend_from_slice(&expiry.to_be_bytes());
    token.extend_from_slice(tag.as_ref());
    BASE64.encode(token)
}

/// Verifies a token issued for `subject`.
pub fn verify_token(cryptor: &AesCryptor, subject: &str, token: &str) -> Result<()> {
    let token = BASE64
        .decode(token.trim())
        .map_err(|_| MagicLinkError::Token("token is not valid base64".into()))?;
    if token.len() != TOKEN_BYTES {
        return Err(MagicLinkError::Token(format!(
            "invalid token length: expected {}, got {}",
            TOKEN_BYTES,
            token.len()
        )));
    }
    let (expiry_bytes, tag) = token.split_at(8);
    let mut expiry = [0u8; 8];
    expiry.copy_from_slice(expiry_bytes);
    let expiry = u64::from_be_bytes(expiry);
    if now_secs() > expiry {
        return Err(MagicLinkError::Token("token expired".into()));
    }
    let key = hmac::Key::new(hmac::HMAC_SHA256, cryptor.secret());
    hmac::verify(&key, &signed_data(expiry, subject), tag)
        .map_err(|_| MagicLinkError::Token("invalid token signature".into()))
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
pub fn strip_bearer(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ").map(str::trim)
}
