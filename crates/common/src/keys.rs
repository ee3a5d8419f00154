//! API key hashing
//!
//! Raw keys never leave the request path; the registry only holds the
//! SHA-256 hex digest.

use sha2::{Digest, Sha256};

/// Hash a raw API key into the stored hex digest
pub fn hash_api_key(raw_key: &str) -> String {
    hex::encode(Sha256::digest(raw_key.as_bytes()))
}

/// Check a presented raw key against a stored digest.
///
/// The digest comparison does not short-circuit on the first differing byte.
pub fn verify_api_key(raw_key: &str, stored_hash: &str) -> bool {
    let presented = hash_api_key(raw_key);
    let stored = stored_hash.trim().to_ascii_lowercase();

    if presented.len() != stored.len() {
        return false;
    }

    presented
        .bytes()
        .zip(stored.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_hex() {
        let hash = hash_api_key("secret-key");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_api_key("secret-key"));
        assert_ne!(hash, hash_api_key("secret-key2"));
    }

    #[test]
    fn test_verify_accepts_matching_key() {
        let stored = hash_api_key("k-123");
        assert!(verify_api_key("k-123", &stored));
        assert!(verify_api_key("k-123", &stored.to_uppercase()));
    }

    #[test]
    fn test_verify_rejects_wrong_or_malformed() {
        let stored = hash_api_key("k-123");
        assert!(!verify_api_key("k-124", &stored));
        assert!(!verify_api_key("k-123", "deadbeef"));
        assert!(!verify_api_key("k-123", ""));
    }
}
