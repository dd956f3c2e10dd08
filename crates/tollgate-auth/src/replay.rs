//! Replay Guard and nonce issuance.
//!
//! JTIs of client assertions are blacklisted until they expire. Nonces are
//! the encrypted expiry with the access token as associated data, so a
//! nonce only validates against the token it was issued for.

use std::sync::Arc;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::AuthResult;
use crate::cipher::Cipher;
use crate::context::RequestContext;
use crate::engine::Dependencies;
use crate::error::AuthError;
use crate::storage::AuthStorage;
use crate::types::{BlacklistedJti, jti_signature};

/// JTI blacklist and token-bound nonces.
pub struct ReplayGuard {
    storage: Arc<dyn AuthStorage>,
    cipher: Arc<dyn Cipher>,
}

impl ReplayGuard {
    /// Creates the guard from the engine dependencies.
    #[must_use]
    pub fn new(deps: &Dependencies) -> Self {
        Self {
            storage: Arc::clone(&deps.storage),
            cipher: Arc::clone(&deps.cipher),
        }
    }

    /// Fails with `JtiKnown` if the JTI is blacklisted and not yet expired.
    ///
    /// # Errors
    ///
    /// Returns `JtiKnown` on replay and storage errors otherwise.
    pub async fn is_jti_used(&self, ctx: &RequestContext, jti: &str) -> AuthResult<()> {
        let entry = self.storage.find_jti(ctx, &jti_signature(jti)).await?;
        match entry {
            Some(entry) if entry.is_active(OffsetDateTime::now_utc()) => {
                tracing::warn!("client assertion JTI replayed");
                Err(AuthError::jti_known("JTI has already been used"))
            }
            _ => Ok(()),
        }
    }

    /// Blacklists a JTI until `expires_at`.
    ///
    /// # Errors
    ///
    /// Returns `JtiKnown` if a concurrent request marked it first.
    pub async fn mark_jti_used(
        &self,
        ctx: &RequestContext,
        jti: &str,
        expires_at: OffsetDateTime,
    ) -> AuthResult<()> {
        let purged = self
            .storage
            .delete_expired_jtis(ctx, OffsetDateTime::now_utc())
            .await?;
        if purged > 0 {
            tracing::debug!(purged, "purged expired JTIs");
        }
        self.storage
            .insert_jti(ctx, &BlacklistedJti::new(jti, expires_at))
            .await
    }

    /// Issues a nonce bound to `access_token`, valid until `expires_at`.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if encryption fails.
    pub fn new_nonce(&self, access_token: &str, expires_at: OffsetDateTime) -> AuthResult<String> {
        let plaintext = expires_at
            .format(&Rfc3339)
            .map_err(|e| AuthError::internal(format!("unable to format nonce expiry: {e}")))?;
        self.cipher
            .encrypt(plaintext.as_bytes(), access_token.as_bytes())
    }

    /// Checks a nonce against the access token it was issued for.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the nonce belongs to another token, is
    /// malformed or has expired.
    pub fn is_nonce_valid(&self, access_token: &str, nonce: &str) -> AuthResult<()> {
        let plaintext = self
            .cipher
            .decrypt(nonce, access_token.as_bytes())
            .map_err(|_| AuthError::invalid_request("nonce is invalid"))?;
        let expires_at = std::str::from_utf8(&plaintext)
            .ok()
            .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
            .ok_or_else(|| AuthError::invalid_request("nonce is malformed"))?;

        if expires_at <= OffsetDateTime::now_utc() {
            return Err(AuthError::invalid_request("nonce has expired"));
        }
        Ok(())
    }
}
