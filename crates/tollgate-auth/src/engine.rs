//! Engine wiring.
//!
//! [`Dependencies`] is built once at startup and [`TokenEngine`] builds
//! every service from it. The engine keeps no token state between calls;
//! each request re-reads the store.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::AuthResult;
use crate::challenge::ChallengeCoordinator;
use crate::cipher::Cipher;
use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::device::DeviceAuthorizationManager;
use crate::error::AuthError;
use crate::grant::{self, GrantHandler};
use crate::replay::ReplayGuard;
use crate::rotation::RotationManager;
use crate::session_store::TokenSessionStore;
use crate::storage::{AuthStorage, ClientDirectory, ResourceOwnerAuthenticator};
use crate::strategy::TokenStrategy;
use crate::types::{
    AccessRequest, AccessResponse, DeviceAuthorizeResponse, Request, SessionKind,
};

/// Collaborators shared by every service.
#[derive(Clone)]
pub struct Dependencies {
    pub config: Arc<EngineConfig>,
    pub storage: Arc<dyn AuthStorage>,
    pub clients: Arc<dyn ClientDirectory>,
    pub strategy: Arc<dyn TokenStrategy>,
    pub cipher: Arc<dyn Cipher>,
    /// Required by the password grant only.
    pub authenticator: Option<Arc<dyn ResourceOwnerAuthenticator>>,
}

impl std::fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dependencies")
            .field("config", &self.config)
            .field("authenticator", &self.authenticator.is_some())
            .finish_non_exhaustive()
    }
}

/// Rows removed by [`TokenEngine::flush_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Per token session kind, in flush order.
    pub token_sessions: Vec<(SessionKind, u64)>,
    pub device_sessions: u64,
    pub flows: u64,
}

impl FlushReport {
    /// Total rows removed.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.token_sessions.iter().map(|(_, n)| n).sum::<u64>() + self.device_sessions + self.flows
    }
}

/// The authorization challenge and token session engine.
pub struct TokenEngine {
    deps: Dependencies,
    sessions: TokenSessionStore,
    challenges: ChallengeCoordinator,
    rotation: RotationManager,
    devices: DeviceAuthorizationManager,
    replay: ReplayGuard,
}

impl TokenEngine {
    /// Builds every service from the dependencies.
    #[must_use]
    pub fn new(deps: Dependencies) -> Self {
        Self {
            sessions: TokenSessionStore::new(&deps),
            challenges: ChallengeCoordinator::new(&deps),
            rotation: RotationManager::new(&deps),
            devices: DeviceAuthorizationManager::new(&deps),
            replay: ReplayGuard::new(&deps),
            deps,
        }
    }

    pub fn sessions(&self) -> &TokenSessionStore {
        &self.sessions
    }

    pub fn challenges(&self) -> &ChallengeCoordinator {
        &self.challenges
    }

    pub fn rotation(&self) -> &RotationManager {
        &self.rotation
    }

    pub fn devices(&self) -> &DeviceAuthorizationManager {
        &self.devices
    }

    pub fn replay(&self) -> &ReplayGuard {
        &self.replay
    }

    pub fn config(&self) -> &EngineConfig {
        &self.deps.config
    }

    pub(crate) fn storage(&self) -> &dyn AuthStorage {
        self.deps.storage.as_ref()
    }

    pub(crate) fn strategy(&self) -> &dyn TokenStrategy {
        self.deps.strategy.as_ref()
    }

    pub(crate) fn authenticator(&self) -> Option<&dyn ResourceOwnerAuthenticator> {
        self.deps.authenticator.as_deref()
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    /// Token endpoint: validates the grant, then issues tokens.
    ///
    /// # Errors
    ///
    /// Returns the grant's protocol error; map it to the wire with
    /// [`AuthError::to_error_response`].
    pub async fn handle_token_request(
        &self,
        ctx: &RequestContext,
        mut request: AccessRequest,
    ) -> AuthResult<AccessResponse> {
        let grant_type = request
            .grant_types
            .first()
            .cloned()
            .ok_or_else(|| AuthError::invalid_request("grant_type is required"))?;
        let handler = GrantHandler::for_grant_type(&grant_type)?;
        if handler == GrantHandler::Implicit {
            return Err(AuthError::unsupported_grant_type(grant_type));
        }

        grant::hydrate_requested(&mut request.request);
        handler.validate(self, ctx, &mut request).await?;

        let mut response = AccessResponse::default();
        handler
            .populate(self, ctx, &mut request, &mut response)
            .await?;

        tracing::debug!(
            grant_type = %grant_type,
            client_id = %request.request.client.id,
            refresh = response.refresh_token.is_some(),
            "token issued"
        );
        Ok(response)
    }

    /// Authorize endpoint, `code` response type: stores the code session
    /// and its PKCE and OIDC companions. Returns the code.
    ///
    /// # Errors
    ///
    /// - `UnauthorizedClient` if the client may not use the code flow
    /// - `InvalidRequest` for a malformed PKCE challenge
    pub async fn issue_authorization_code(
        &self,
        ctx: &RequestContext,
        request: &mut Request,
    ) -> AuthResult<String> {
        grant::authorization_code::issue(self, ctx, request).await
    }

    /// Authorize endpoint, `token` response type.
    ///
    /// # Errors
    ///
    /// - `UnauthorizedClient` if the client may not use the implicit flow
    /// - `InvalidScope` if a requested scope is not allowed
    pub async fn authorize_implicit(
        &self,
        ctx: &RequestContext,
        request: Request,
    ) -> AuthResult<AccessResponse> {
        let mut request = AccessRequest::new(GrantHandler::Implicit.grant_type().as_str(), request);
        grant::hydrate_requested(&mut request.request);
        GrantHandler::Implicit
            .validate(self, ctx, &mut request)
            .await?;
        let mut response = AccessResponse::default();
        GrantHandler::Implicit
            .populate(self, ctx, &mut request, &mut response)
            .await?;
        Ok(response)
    }

    /// Device authorization endpoint.
    ///
    /// # Errors
    ///
    /// See [`DeviceAuthorizationManager::authorize_device`].
    pub async fn authorize_device(
        &self,
        ctx: &RequestContext,
        mut request: Request,
    ) -> AuthResult<DeviceAuthorizeResponse> {
        grant::hydrate_requested(&mut request);
        self.devices.authorize_device(ctx, request).await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Flushes every session kind, device sessions and flows requested
    /// before `not_after`, clamped per kind to its lifespan.
    ///
    /// # Errors
    ///
    /// Returns the first storage error; rows deleted before it stay deleted.
    pub async fn flush_all(
        &self,
        ctx: &RequestContext,
        not_after: OffsetDateTime,
    ) -> AuthResult<FlushReport> {
        let limit = self.deps.config.flush.limit;
        let batch_size = self.deps.config.flush.batch_size;

        let mut report = FlushReport::default();
        for kind in SessionKind::ALL {
            let deleted = self
                .sessions
                .flush_expired(ctx, kind, not_after, limit, batch_size)
                .await?;
            report.token_sessions.push((kind, deleted));
        }
        report.device_sessions = self
            .devices
            .flush_expired(ctx, not_after, limit, batch_size)
            .await?;
        report.flows = self
            .challenges
            .flush_flows(ctx, not_after, limit, batch_size)
            .await?;

        tracing::info!(total = report.total(), "flush completed");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_report_total() {
        let report = FlushReport {
            token_sessions: vec![(SessionKind::Code, 2), (SessionKind::Access, 3)],
            device_sessions: 1,
            flows: 4,
        };
        assert_eq!(report.total(), 10);
        assert_eq!(FlushReport::default().total(), 0);
    }
}
