//! Refresh Rotation Manager.
//!
//! Revocation and rotation of refresh tokens. With a rotation grace period
//! configured, a presented refresh token stays usable for a short window
//! after its first use so that a client retrying a lost response does not
//! lose the grant; it never yields a second independent token.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::AuthResult;
use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::engine::Dependencies;
use crate::error::AuthError;
use crate::signature::storage_signature;
use crate::storage::AuthStorage;
use crate::types::SessionKind;
use crate::util::after;

/// Revokes and rotates refresh tokens.
pub struct RotationManager {
    storage: Arc<dyn AuthStorage>,
    config: Arc<EngineConfig>,
}

impl RotationManager {
    /// Creates the manager from the engine dependencies.
    #[must_use]
    pub fn new(deps: &Dependencies) -> Self {
        Self {
            storage: Arc::clone(&deps.storage),
            config: Arc::clone(&deps.config),
        }
    }

    /// Deactivates every refresh token of a request immediately.
    ///
    /// # Errors
    ///
    /// Returns storage errors only.
    pub async fn revoke(&self, ctx: &RequestContext, request_id: &str) -> AuthResult<()> {
        let revoked = self
            .storage
            .deactivate_token_sessions_by_request_id(ctx, SessionKind::Refresh, request_id)
            .await?;
        tracing::debug!(request_id, revoked, "revoked refresh tokens");
        Ok(())
    }

    /// Deletes every access token of a request.
    ///
    /// # Errors
    ///
    /// Returns storage errors only.
    pub async fn revoke_access_tokens(
        &self,
        ctx: &RequestContext,
        request_id: &str,
    ) -> AuthResult<()> {
        let deleted = self
            .storage
            .delete_token_sessions_by_request_id(ctx, SessionKind::Access, request_id)
            .await?;
        tracing::debug!(request_id, deleted, "revoked access tokens");
        Ok(())
    }

    /// Revokes a refresh token, leaving it usable for the grace period.
    ///
    /// The window opens at most once: a second call on an already used
    /// token is a logged no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the refresh token does not exist.
    pub async fn revoke_with_grace_period(
        &self,
        ctx: &RequestContext,
        request_id: &str,
        signature: &str,
    ) -> AuthResult<()> {
        let grace = self.config.refresh.effective_grace_period();
        if grace.is_zero() {
            return self.revoke(ctx, request_id).await;
        }

        let now = OffsetDateTime::now_utc();
        let claimed = self
            .storage
            .claim_refresh_token_grace(
                ctx,
                &storage_signature(signature),
                now,
                after(now, grace),
            )
            .await?;

        if claimed {
            tracing::info!(request_id, grace = ?grace, "refresh token grace period started");
        } else {
            tracing::info!(request_id, "refresh token already used; grace period unchanged");
        }
        Ok(())
    }

    /// Retires the presented refresh token and the access tokens issued
    /// with it, ahead of issuing a new pair.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no active refresh token was retired
    /// - `SerializationFailure` on a concurrent rotation
    pub async fn rotate(
        &self,
        ctx: &RequestContext,
        request_id: &str,
        signature: &str,
    ) -> AuthResult<()> {
        if self.config.refresh.effective_grace_period().is_zero() {
            return self.rotate_strict(ctx, request_id).await;
        }
        self.rotate_graceful(ctx, request_id, signature).await
    }

    async fn rotate_strict(&self, ctx: &RequestContext, request_id: &str) -> AuthResult<()> {
        self.storage
            .delete_token_sessions_by_request_id(ctx, SessionKind::Access, request_id)
            .await?;
        let deactivated = self
            .storage
            .deactivate_token_sessions_by_request_id(ctx, SessionKind::Refresh, request_id)
            .await?;
        if deactivated == 0 {
            return Err(AuthError::not_found("active refresh token"));
        }
        tracing::debug!(request_id, "rotated refresh token");
        Ok(())
    }

    async fn rotate_graceful(
        &self,
        ctx: &RequestContext,
        request_id: &str,
        signature: &str,
    ) -> AuthResult<()> {
        let linked = self
            .storage
            .retire_refresh_token(ctx, &storage_signature(signature), OffsetDateTime::now_utc())
            .await?;

        match linked {
            Some(access_signature) => {
                self.storage
                    .delete_token_session(ctx, SessionKind::Access, &access_signature)
                    .await?;
            }
            None => {
                self.storage
                    .delete_token_sessions_by_request_id(ctx, SessionKind::Access, request_id)
                    .await?;
            }
        }
        tracing::debug!(request_id, "rotated refresh token within grace period");
        Ok(())
    }
}
