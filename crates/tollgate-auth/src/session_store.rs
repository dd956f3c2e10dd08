//! Token Session Store.
//!
//! Uniform create/get/deactivate/delete for every [`SessionKind`], on top of
//! a [`TokenSessionStorage`] backend. This layer owns:
//! - the storage key ([`storage_signature`]),
//! - session (de)serialization and encryption at rest,
//! - the "exists but inactive" and expiry signals on read,
//! - lifespan clamping for flushes.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::AuthResult;
use crate::cipher::Cipher;
use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::engine::Dependencies;
use crate::error::AuthError;
use crate::signature::storage_signature;
use crate::storage::{AuthStorage, ClientDirectory, TokenSessionRow};
use crate::types::{Form, Request, Session, SessionKind};
use crate::util::{after, flush_bound};

/// Session payloads starting with this byte are plaintext JSON.
const PLAINTEXT_MARKER: char = '{';

/// Persists and reconstructs token sessions.
pub struct TokenSessionStore {
    storage: Arc<dyn AuthStorage>,
    clients: Arc<dyn ClientDirectory>,
    cipher: Arc<dyn Cipher>,
    config: Arc<EngineConfig>,
}

impl TokenSessionStore {
    /// Creates the store from the engine dependencies.
    #[must_use]
    pub fn new(deps: &Dependencies) -> Self {
        Self {
            storage: Arc::clone(&deps.storage),
            clients: Arc::clone(&deps.clients),
            cipher: Arc::clone(&deps.cipher),
            config: Arc::clone(&deps.config),
        }
    }

    // -------------------------------------------------------------------------
    // Session payload
    // -------------------------------------------------------------------------

    /// Serializes a session, encrypting it when configured.
    pub(crate) fn seal_session(&self, session: &Session) -> AuthResult<String> {
        let json = serde_json::to_string(session)?;
        if self.config.encryption.encrypt_session_data {
            self.cipher.encrypt(json.as_bytes(), &[])
        } else {
            Ok(json)
        }
    }

    /// Restores a session written by [`Self::seal_session`].
    ///
    /// Decryption failures are returned, never treated as plaintext.
    pub(crate) fn open_session(&self, data: &str) -> AuthResult<Session> {
        if data.starts_with(PLAINTEXT_MARKER) {
            return Ok(serde_json::from_str(data)?);
        }
        let plaintext = self
            .cipher
            .decrypt(data, &[])
            .map_err(|e| AuthError::internal(format!("unable to decrypt session data: {e}")))?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Rebuilds the generic request columns shared by token and device rows.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn reconstruct(
        &self,
        ctx: &RequestContext,
        request_id: &str,
        requested_at: OffsetDateTime,
        client_id: &str,
        scopes: (&[String], &[String]),
        audiences: (&[String], &[String]),
        form_data: &str,
        session_data: &str,
    ) -> AuthResult<Request> {
        let client = self.clients.get_client(ctx, client_id).await?;
        Ok(Request {
            id: request_id.to_string(),
            requested_at,
            client,
            requested_scope: scopes.0.to_vec(),
            granted_scope: scopes.1.to_vec(),
            requested_audience: audiences.0.to_vec(),
            granted_audience: audiences.1.to_vec(),
            form: Form::parse(form_data),
            session: self.open_session(session_data)?,
        })
    }

    fn to_row(
        &self,
        kind: SessionKind,
        signature: &str,
        request: &Request,
        access_token_signature: Option<&str>,
    ) -> AuthResult<TokenSessionRow> {
        Ok(TokenSessionRow {
            signature: storage_signature(signature),
            request_id: request.id.clone(),
            challenge_id: request.session.consent_challenge.clone(),
            requested_at: request.requested_at,
            client_id: request.client.id.clone(),
            requested_scope: request.requested_scope.clone(),
            granted_scope: request.granted_scope.clone(),
            requested_audience: request.requested_audience.clone(),
            granted_audience: request.granted_audience.clone(),
            form_data: request.form.encode(),
            subject: request.session.subject.clone(),
            active: true,
            session_data: self.seal_session(&request.session)?,
            expires_at: request.session.expires_at(kind.expiry_type()),
            first_used_at: None,
            access_token_signature: access_token_signature.map(storage_signature),
        })
    }

    async fn from_row(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        row: &TokenSessionRow,
    ) -> AuthResult<Request> {
        let mut request = self
            .reconstruct(
                ctx,
                &row.request_id,
                row.requested_at,
                &row.client_id,
                (&row.requested_scope, &row.granted_scope),
                (&row.requested_audience, &row.granted_audience),
                &row.form_data,
                &row.session_data,
            )
            .await?;
        // The column wins over the serialized session; grace periods move it.
        if let Some(expires_at) = row.expires_at {
            request
                .session
                .set_expires_at(kind.expiry_type(), expires_at);
        }
        Ok(request)
    }

    fn within_grace_period(&self, row: &TokenSessionRow, now: OffsetDateTime) -> bool {
        let grace = self.config.refresh.effective_grace_period();
        !grace.is_zero()
            && row
                .first_used_at
                .is_some_and(|used| after(used, grace) > now)
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Stores a session for a token signature.
    ///
    /// # Errors
    ///
    /// Returns `SerializationFailure` on a concurrent write conflict; the
    /// caller should retry the whole request.
    pub async fn create(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        signature: &str,
        request: &Request,
    ) -> AuthResult<()> {
        let row = self.to_row(kind, signature, request, None)?;
        tracing::debug!(
            kind = %kind,
            request_id = %row.request_id,
            client_id = %row.client_id,
            "creating token session"
        );
        self.storage.create_token_session(ctx, kind, row).await
    }

    /// Stores a refresh session linked to the access token issued with it.
    ///
    /// # Errors
    ///
    /// Same as [`Self::create`].
    pub async fn create_refresh(
        &self,
        ctx: &RequestContext,
        signature: &str,
        access_token_signature: Option<&str>,
        request: &Request,
    ) -> AuthResult<()> {
        let row = self.to_row(
            SessionKind::Refresh,
            signature,
            request,
            access_token_signature,
        )?;
        tracing::debug!(request_id = %row.request_id, "creating refresh token session");
        self.storage
            .create_token_session(ctx, SessionKind::Refresh, row)
            .await
    }

    /// Loads the request stored for a token signature.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no session exists in this network
    /// - `InvalidatedAuthorizeCode` (codes) or `InactiveToken` (other kinds),
    ///   carrying the request, if the session was deactivated
    /// - `TokenExpired` if the session is active but past its expiry
    pub async fn get(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        signature: &str,
    ) -> AuthResult<Request> {
        let key = storage_signature(signature);
        let row = self
            .storage
            .find_token_session(ctx, kind, &key)
            .await?
            .ok_or_else(|| AuthError::not_found(format!("{kind} session")))?;
        let request = self.from_row(ctx, kind, &row).await?;
        let now = OffsetDateTime::now_utc();

        if !row.active {
            if kind == SessionKind::Refresh && self.within_grace_period(&row, now) {
                tracing::debug!(request_id = %row.request_id, "refresh token used within grace period");
                return Ok(request);
            }
            return Err(match kind {
                SessionKind::Code => AuthError::invalidated_authorize_code(request),
                _ => AuthError::inactive_token(request),
            });
        }

        if row.expires_at.is_some_and(|expires_at| expires_at <= now) {
            return Err(AuthError::token_expired(format!("{kind} session expired")));
        }

        Ok(request)
    }

    /// Deactivates a session. Idempotent.
    ///
    /// Returns `1` if this call flipped an active session and `0` if it was
    /// already inactive or missing, which lets redemption stay at most once.
    ///
    /// # Errors
    ///
    /// Returns storage errors only.
    pub async fn deactivate(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        signature: &str,
    ) -> AuthResult<u64> {
        self.storage
            .deactivate_token_session(ctx, kind, &storage_signature(signature))
            .await
    }

    /// Deactivates every session of a request.
    ///
    /// # Errors
    ///
    /// Returns storage errors only.
    pub async fn deactivate_by_request_id(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        request_id: &str,
    ) -> AuthResult<u64> {
        self.storage
            .deactivate_token_sessions_by_request_id(ctx, kind, request_id)
            .await
    }

    /// Deletes a session. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns storage errors only.
    pub async fn delete(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        signature: &str,
    ) -> AuthResult<()> {
        self.storage
            .delete_token_session(ctx, kind, &storage_signature(signature))
            .await?;
        Ok(())
    }

    /// Deletes every session of a request.
    ///
    /// # Errors
    ///
    /// Returns storage errors only.
    pub async fn delete_by_request_id(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        request_id: &str,
    ) -> AuthResult<u64> {
        self.storage
            .delete_token_sessions_by_request_id(ctx, kind, request_id)
            .await
    }

    /// Deletes every access token issued to a client.
    ///
    /// # Errors
    ///
    /// Returns storage errors only.
    pub async fn delete_access_tokens_for_client(
        &self,
        ctx: &RequestContext,
        client_id: &str,
    ) -> AuthResult<u64> {
        self.storage
            .delete_token_sessions_by_client(ctx, SessionKind::Access, client_id)
            .await
    }

    /// Deletes sessions of `kind` requested before
    /// `min(not_after, now - lifespan(kind))`.
    ///
    /// # Errors
    ///
    /// Returns storage errors only.
    pub async fn flush_expired(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        not_after: OffsetDateTime,
        limit: usize,
        batch_size: usize,
    ) -> AuthResult<u64> {
        let Some(bound) = flush_bound(not_after, self.config.lifespans.for_kind(kind)) else {
            return Ok(0);
        };
        let deleted = self
            .storage
            .flush_token_sessions(ctx, kind, bound, limit, batch_size.max(1))
            .await?;
        tracing::info!(kind = %kind, deleted, "flushed expired token sessions");
        Ok(deleted)
    }
}
