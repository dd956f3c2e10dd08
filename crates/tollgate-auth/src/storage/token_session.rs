//! Token session persistence (code, access, refresh, PKCE, OIDC).

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::AuthResult;
use crate::context::RequestContext;
use crate::types::SessionKind;

/// A stored token session, one table per [`SessionKind`].
#[derive(Debug, Clone, PartialEq)]
pub struct TokenSessionRow {
    /// Storage signature (primary key together with the network id).
    pub signature: String,
    pub request_id: String,
    /// Consent challenge the grant was issued through, if any.
    pub challenge_id: Option<String>,
    pub requested_at: OffsetDateTime,
    pub client_id: String,
    pub requested_scope: Vec<String>,
    pub granted_scope: Vec<String>,
    pub requested_audience: Vec<String>,
    pub granted_audience: Vec<String>,
    /// URL-encoded, sanitized request form.
    pub form_data: String,
    pub subject: String,
    pub active: bool,
    /// Session JSON, or its ciphertext when encryption is enabled.
    pub session_data: String,
    pub expires_at: Option<OffsetDateTime>,
    /// Refresh only: when the token was first presented.
    pub first_used_at: Option<OffsetDateTime>,
    /// Refresh only: storage signature of the access token issued with it.
    pub access_token_signature: Option<String>,
}

/// Token session storage.
#[async_trait]
pub trait TokenSessionStorage: Send + Sync {
    /// Inserts a session.
    ///
    /// # Errors
    ///
    /// Returns `SerializationFailure` on a concurrent write conflict and
    /// `Conflict` if the signature already exists.
    async fn create_token_session(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        row: TokenSessionRow,
    ) -> AuthResult<()>;

    /// Looks up a session by storage signature, active or not.
    async fn find_token_session(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        signature: &str,
    ) -> AuthResult<Option<TokenSessionRow>>;

    /// Marks a session inactive. Already-inactive or missing rows are fine.
    ///
    /// Returns the number of rows that were active before the call.
    async fn deactivate_token_session(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        signature: &str,
    ) -> AuthResult<u64>;

    /// Marks every active session of a request inactive.
    async fn deactivate_token_sessions_by_request_id(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        request_id: &str,
    ) -> AuthResult<u64>;

    /// Deletes a session. Missing rows are fine.
    async fn delete_token_session(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        signature: &str,
    ) -> AuthResult<u64>;

    /// Deletes every session of a request.
    async fn delete_token_sessions_by_request_id(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        request_id: &str,
    ) -> AuthResult<u64>;

    /// Deletes every session issued to a client.
    async fn delete_token_sessions_by_client(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        client_id: &str,
    ) -> AuthResult<u64>;

    /// Deletes sessions requested before `not_after`, ordered by signature,
    /// `batch_size` rows per statement and at most `limit` rows in total.
    async fn flush_token_sessions(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        not_after: OffsetDateTime,
        limit: usize,
        batch_size: usize,
    ) -> AuthResult<u64>;

    /// Marks a refresh token as used and inactive and moves its expiry to
    /// `expires_at`, only if it was never used before.
    ///
    /// Returns `false` when the token was already used.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no refresh session has this signature.
    async fn claim_refresh_token_grace(
        &self,
        ctx: &RequestContext,
        signature: &str,
        used_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> AuthResult<bool>;

    /// Deactivates a refresh token, recording `used_at` as its first use if
    /// none was recorded, and returns its linked access token signature.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no refresh session has this signature.
    async fn retire_refresh_token(
        &self,
        ctx: &RequestContext,
        signature: &str,
        used_at: OffsetDateTime,
    ) -> AuthResult<Option<String>>;
}
