//! Client directory collaborator.

use async_trait::async_trait;

use crate::AuthResult;
use crate::context::RequestContext;
use crate::types::Client;

/// Read-only access to registered clients.
///
/// Client registration lives outside the engine.
#[async_trait]
pub trait ClientDirectory: Send + Sync {
    /// Resolves a client by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `InvalidClient` if the client is unknown.
    async fn get_client(&self, ctx: &RequestContext, client_id: &str) -> AuthResult<Client>;
}
