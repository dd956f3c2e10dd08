//! Storage keys derived from token signatures.

use sha2::{Digest, Sha256};

/// Longest signature stored verbatim as a primary key.
pub const MAX_SIGNATURE_LENGTH: usize = 128;

/// Returns the primary key for a token signature.
///
/// Short signatures are used as-is; longer ones (JWT access tokens) are
/// replaced by their lowercase hex SHA-256.
#[must_use]
pub fn storage_signature(signature: &str) -> String {
    if signature.len() > MAX_SIGNATURE_LENGTH {
        hex::encode(Sha256::digest(signature.as_bytes()))
    } else {
        signature.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_signature_is_kept() {
        assert_eq!(storage_signature("abc"), "abc");
        let exact = "x".repeat(MAX_SIGNATURE_LENGTH);
        assert_eq!(storage_signature(&exact), exact);
    }

    #[test]
    fn test_long_signature_is_hashed() {
        let jwt = "e".repeat(MAX_SIGNATURE_LENGTH + 1);
        let key = storage_signature(&jwt);
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(key, storage_signature(&jwt));
    }
}
