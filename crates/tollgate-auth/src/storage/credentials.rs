//! Resource owner authentication for the password grant.

use async_trait::async_trait;

use crate::AuthResult;
use crate::context::RequestContext;

#[async_trait]
pub trait ResourceOwnerAuthenticator: Send + Sync {
    /// Checks a username and password and returns the subject.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `InvalidGrant` for unknown credentials.
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        username: &str,
        password: &str,
    ) -> AuthResult<String>;
}
