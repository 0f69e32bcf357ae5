//! Token Verifier: decrypts and validates per-request capability tokens.
//!
//! Tokens are delivered as the first path segment: a URL-safe, unpadded
//! base64 string that decodes to `nonce(24 bytes) || sealed_payload`. The
//! original node sealed this with NaCl `box.OpenAfterPrecomputation`; the
//! nearest AEAD construction available in this corpus with the same 24-byte
//! nonce / 32-byte key shape is `XChaCha20Poly1305`, so that's what's used
//! here (see DESIGN.md). The sealed plaintext is unchanged: JSON
//! `{"expires": <RFC3339>, "hash": "<chapter hash>"}`.

use base64::Engine;
use chacha20poly1305::{
    AeadCore, KeyInit, XChaCha20Poly1305, XNonce,
    aead::{Aead, generic_array::GenericArray},
};
use serde::Deserialize;

const NONCE_LEN: usize = 24;

#[derive(Debug, Deserialize)]
struct TokenPayload {
    expires: chrono::DateTime<chrono::FixedOffset>,
    hash: String,
}

/// Result of verifying a token against a chapter hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Token is valid for this chapter and not expired.
    Ok,
    /// Empty token, decode/decrypt failure, malformed payload, or wrong chapter.
    Forbidden,
    /// Token decrypted and parsed fine, but its expiry is in the past.
    Gone,
}

impl Verdict {
    /// HTTP status code this verdict maps to (`OK` has no response implication).
    pub fn status(self) -> Option<http::StatusCode> {
        match self {
            Verdict::Ok => None,
            Verdict::Forbidden => Some(http::StatusCode::FORBIDDEN),
            Verdict::Gone => Some(http::StatusCode::GONE),
        }
    }
}

/// Verifies a sealed token string against the chapter hash it claims to authorize.
pub fn verify(token: &str, chapter_hash: &str, token_key: &[u8; 32], now: chrono::DateTime<chrono::Utc>) -> Verdict {
    if token.is_empty() {
        return Verdict::Forbidden;
    }

    let Ok(raw) = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(token) else {
        return Verdict::Forbidden;
    };
    if raw.len() <= NONCE_LEN {
        return Verdict::Forbidden;
    }

    let (nonce_bytes, sealed) = raw.split_at(NONCE_LEN);
    let nonce = XNonce::clone_from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(token_key));

    let Ok(plaintext) = cipher.decrypt(&nonce, sealed) else {
        return Verdict::Forbidden;
    };

    let Ok(payload) = serde_json::from_slice::<TokenPayload>(&plaintext) else {
        return Verdict::Forbidden;
    };

    if payload.expires < now {
        return Verdict::Gone;
    }

    if payload.hash != chapter_hash {
        return Verdict::Forbidden;
    }

    Verdict::Ok
}

/// Seals a token payload the way the control plane would, for tests.
#[cfg(test)]
pub fn seal(expires: chrono::DateTime<chrono::Utc>, hash: &str, token_key: &[u8; 32]) -> String {
    let payload = serde_json::json!({
        "expires": expires.to_rfc3339(),
        "hash": hash,
    });
    let plaintext = serde_json::to_vec(&payload).unwrap();

    let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(token_key));
    let nonce = XChaCha20Poly1305::generate_nonce(&mut rand::thread_rng());
    let sealed = cipher.encrypt(&nonce, plaintext.as_ref()).unwrap();

    let mut raw = nonce.to_vec();
    raw.extend_from_slice(&sealed);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const KEY: [u8; 32] = [9u8; 32];
    const CHAPTER: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn valid_token_verifies_ok() {
        let now = chrono::Utc::now();
        let token = seal(now + Duration::hours(1), CHAPTER, &KEY);
        assert_eq!(verify(&token, CHAPTER, &KEY, now), Verdict::Ok);
    }

    #[test]
    fn expired_token_is_gone() {
        let now = chrono::Utc::now();
        let token = seal(now - Duration::seconds(1), CHAPTER, &KEY);
        assert_eq!(verify(&token, CHAPTER, &KEY, now), Verdict::Gone);
    }

    #[test]
    fn wrong_chapter_is_forbidden() {
        let now = chrono::Utc::now();
        let token = seal(now + Duration::hours(1), "ffffffffffffffffffffffffffffffff", &KEY);
        assert_eq!(verify(&token, CHAPTER, &KEY, now), Verdict::Forbidden);
    }

    #[test]
    fn tampered_token_is_forbidden() {
        let now = chrono::Utc::now();
        let mut token = seal(now + Duration::hours(1), CHAPTER, &KEY).into_bytes();
        let last = token.len() - 2;
        token[last] ^= 0xFF;
        let token = String::from_utf8(token).unwrap_or_default();
        assert_eq!(verify(&token, CHAPTER, &KEY, now), Verdict::Forbidden);
    }

    #[test]
    fn empty_token_is_forbidden() {
        assert_eq!(verify("", CHAPTER, &KEY, chrono::Utc::now()), Verdict::Forbidden);
    }
}
