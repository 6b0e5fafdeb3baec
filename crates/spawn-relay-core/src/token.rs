//! HMAC identity tokens.
//!
//! A token binds an identity to an expiry time. Clients present it in their
//! `hello` frame; the relay checks it against the claimed identity.
//! Format: hex of `[8-byte big-endian expiry][32-byte HMAC-SHA256]`.

use crate::error::{RelayError, RelayResult};
use ring::hmac;
use std::time::{SystemTime, UNIX_EPOCH};

const EXPIRY_LEN: usize = 8;
const TAG_LEN: usize = 32;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn signed_data(expiry: u64, identity: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(EXPIRY_LEN + identity.len());
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(identity.as_bytes());
    data
}

/// Create an identity token valid for `ttl_secs`.
pub fn create_token(secret: &[u8], identity: &str, ttl_secs: u64) -> String {
    let expiry = now_secs().saturating_add(ttl_secs);
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, &signed_data(expiry, identity));

    let mut token = Vec::with_capacity(EXPIRY_LEN + TAG_LEN);
    token.extend_from_slice(&expiry.to_be_bytes());
    token.extend_from_slice(tag.as_ref());
    hex::encode(token)
}

/// Verify an identity token.
///
/// Checks both the HMAC signature and the expiry time.
pub fn verify_token(secret: &[u8], identity: &str, token: &str) -> RelayResult<()> {
    let raw = hex::decode(token).map_err(|_| RelayError::Token("token is not hex".into()))?;
    if raw.len() != EXPIRY_LEN + TAG_LEN {
        return Err(RelayError::Token(format!(
            "invalid token length: expected {}, got {}",
            EXPIRY_LEN + TAG_LEN,
            raw.len()
        )));
    }

    let (expiry_bytes, tag) = raw.split_at(EXPIRY_LEN);
    let mut expiry_buf = [0u8; EXPIRY_LEN];
    expiry_buf.copy_from_slice(expiry_bytes);
    let expiry = u64::from_be_bytes(expiry_buf);

    if now_secs() > expiry {
        return Err(RelayError::Token("token expired".into()));
    }

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, &signed_data(expiry, identity), tag)
        .map_err(|_| RelayError::Token("invalid token signature".into()))
}

/// Generate a random 32-byte token secret.
pub fn generate_secret() -> RelayResult<Vec<u8>> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret)
        .map_err(|_| RelayError::Other("system RNG failure".into()))?;
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_verify() {
        let secret = generate_secret().unwrap();
        let token = create_token(&secret, "user-1", 3600);
        assert_eq!(token.len(), 2 * (EXPIRY_LEN + TAG_LEN));
        assert!(verify_token(&secret, "user-1", &token).is_ok());
    }

    #[test]
    fn wrong_identity() {
        let secret = generate_secret().unwrap();
        let token = create_token(&secret, "user-1", 3600);
        assert!(verify_token(&secret, "user-2", &token).is_err());
    }

    #[test]
    fn wrong_secret() {
        let token = create_token(&generate_secret().unwrap(), "user-1", 3600);
        assert!(verify_token(&generate_secret().unwrap(), "user-1", &token).is_err());
    }

    #[test]
    fn expired_token() {
        let secret = generate_secret().unwrap();
        let key = hmac::Key::new(hmac::HMAC_SHA256, &secret);
        let expiry = 1u64;
        let tag = hmac::sign(&key, &signed_data(expiry, "user-1"));
        let mut raw = expiry.to_be_bytes().to_vec();
        raw.extend_from_slice(tag.as_ref());

        let err = verify_token(&secret, "user-1", &hex::encode(raw)).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn invalid_length() {
        let secret = generate_secret().unwrap();
        assert!(verify_token(&secret, "user-1", "00ff").is_err());
        assert!(verify_token(&secret, "user-1", "zz").is_err());
    }
}
