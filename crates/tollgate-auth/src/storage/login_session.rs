//! Remembered login sessions.

use async_trait::async_trait;

use crate::AuthResult;
use crate::context::RequestContext;
use crate::types::LoginSession;

#[async_trait]
pub trait LoginSessionStorage: Send + Sync {
    /// Inserts or replaces a login session.
    async fn upsert_login_session(
        &self,
        ctx: &RequestContext,
        session: &LoginSession,
    ) -> AuthResult<()>;

    async fn find_login_session(
        &self,
        ctx: &RequestContext,
        id: &str,
    ) -> AuthResult<Option<LoginSession>>;

    /// Deletes a login session and returns it.
    async fn delete_login_session(
        &self,
        ctx: &RequestContext,
        id: &str,
    ) -> AuthResult<Option<LoginSession>>;

    async fn delete_login_sessions_by_subject(
        &self,
        ctx: &RequestContext,
        subject: &str,
    ) -> AuthResult<u64>;
}
