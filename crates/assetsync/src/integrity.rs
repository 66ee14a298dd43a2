//! # Integrity
//!
//! Content-addressable verification of asset bytes using SHA-256.

use sha2::{Digest, Sha256};

/// Length of a hex encoded SHA-256 digest
pub const DIGEST_HEX_LEN: usize = 64;

/// Compute the lowercase hex SHA-256 digest of `bytes`
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Check `bytes` against an expected hex digest (case-insensitive)
pub fn verify(bytes: &[u8], expected: &str) -> bool {
    digest(bytes).eq_ignore_ascii_case(expected.trim())
}

/// Whether `value` looks like a hex encoded SHA-256 digest
pub fn is_valid_digest(value: &str) -> bool {
    value.len() == DIGEST_HEX_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_digest_known_value() {
        assert_eq!(digest(b"hello"), HELLO_SHA256);
    }

    #[test]
    fn test_verify() {
        assert!(verify(b"hello", HELLO_SHA256));
        assert!(verify(b"hello", &HELLO_SHA256.to_uppercase()));
        assert!(!verify(b"hello!", HELLO_SHA256));
        assert!(!verify(b"hello", "not-a-digest"));
    }

    #[test]
    fn test_is_valid_digest() {
        assert!(is_valid_digest(HELLO_SHA256));
        assert!(!is_valid_digest(&HELLO_SHA256[1..]));
        assert!(!is_valid_digest(&"z".repeat(64)));
    }
}
