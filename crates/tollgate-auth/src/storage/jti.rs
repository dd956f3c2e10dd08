//! JWT ID (JTI) blacklist storage for replay prevention.
//!
//! Entries are keyed by [`crate::types::jti_signature`]. Uniqueness of the
//! key within a network is what makes concurrent replays fail.

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::AuthResult;
use crate::context::RequestContext;
use crate::types::BlacklistedJti;

#[async_trait]
pub trait JtiStorage: Send + Sync {
    /// Returns the entry for a JTI signature, expired or not.
    async fn find_jti(
        &self,
        ctx: &RequestContext,
        signature: &str,
    ) -> AuthResult<Option<BlacklistedJti>>;

    /// Inserts an entry.
    ///
    /// # Errors
    ///
    /// Returns `JtiKnown` if the signature is already blacklisted.
    async fn insert_jti(&self, ctx: &RequestContext, entry: &BlacklistedJti) -> AuthResult<()>;

    /// Removes entries that expired at or before `now`.
    async fn delete_expired_jtis(&self, ctx: &RequestContext, now: OffsetDateTime)
    -> AuthResult<u64>;
}
