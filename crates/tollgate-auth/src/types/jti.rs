//! Blacklisted client assertion JWT IDs.

use sha2::{Digest, Sha256};
use time::OffsetDateTime;

/// A used assertion JTI, keyed by the hex SHA-256 of the raw value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistedJti {
    pub signature: String,
    pub expires_at: OffsetDateTime,
}

impl BlacklistedJti {
    /// Creates a blacklist entry for a raw JTI.
    #[must_use]
    pub fn new(jti: &str, expires_at: OffsetDateTime) -> Self {
        Self {
            signature: jti_signature(jti),
            expires_at,
        }
    }

    /// Returns `true` while the entry still blocks reuse.
    #[must_use]
    pub fn is_active(&self, now: OffsetDateTime) -> bool {
        self.expires_at > now
    }
}

/// Storage key of a raw JTI.
#[must_use]
pub fn jti_signature(jti: &str) -> String {
    hex::encode(Sha256::digest(jti.as_bytes()))
}
