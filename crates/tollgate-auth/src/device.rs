//! Device Authorization Manager (RFC 8628).
//!
//! A device session is one row reachable three ways: by device code
//! signature (the polling device), by user code signature (the user at the
//! verification page) and by request id (revocation). The user code moves
//! once from `unused` to `used` or `rejected`; the device code is
//! deactivated when tokens are issued for it.

use std::sync::Arc;

use time::OffsetDateTime;
use url::Url;

use crate::AuthResult;
use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::engine::Dependencies;
use crate::error::AuthError;
use crate::session_store::TokenSessionStore;
use crate::signature::storage_signature;
use crate::storage::{AuthStorage, DeviceSessionRow, DeviceSessionUpdate};
use crate::strategy::TokenStrategy;
use crate::types::{
    DeviceAuthorizeResponse, DeviceRequest, GrantType, Request, TokenType, UserCodeState,
};
use crate::util::{after, flush_bound};

/// Attempts at drawing a user code that is not already taken.
const USER_CODE_ATTEMPTS: usize = 3;

/// Manages device and user code sessions.
pub struct DeviceAuthorizationManager {
    storage: Arc<dyn AuthStorage>,
    strategy: Arc<dyn TokenStrategy>,
    config: Arc<EngineConfig>,
    sessions: TokenSessionStore,
}

impl DeviceAuthorizationManager {
    /// Creates the manager from the engine dependencies.
    #[must_use]
    pub fn new(deps: &Dependencies) -> Self {
        Self {
            storage: Arc::clone(&deps.storage),
            strategy: Arc::clone(&deps.strategy),
            config: Arc::clone(&deps.config),
            sessions: TokenSessionStore::new(deps),
        }
    }

    /// Device authorization endpoint logic.
    ///
    /// Issues a device code and a user code that expire together and
    /// stores the session under both.
    ///
    /// # Errors
    ///
    /// - `UnauthorizedClient` if the client may not use the device grant
    /// - `InvalidScope` if a requested scope is not allowed
    /// - `ExistingUserCodeSignature` if no free user code was found
    pub async fn authorize_device(
        &self,
        ctx: &RequestContext,
        mut request: Request,
    ) -> AuthResult<DeviceAuthorizeResponse> {
        if !request.client.allows_grant(GrantType::DeviceCode) {
            return Err(AuthError::unauthorized_client(format!(
                "client '{}' may not use the device authorization grant",
                request.client.id
            )));
        }
        if let Some(scope) = request.client.first_disallowed_scope(&request.requested_scope) {
            return Err(AuthError::invalid_scope(format!(
                "scope '{scope}' is not allowed for this client"
            )));
        }

        let lifespan = self.config.lifespans.device_user_code;
        let expires_at = after(OffsetDateTime::now_utc(), lifespan);
        request
            .session
            .set_expires_at(TokenType::DeviceCode, expires_at);
        request.session.set_expires_at(TokenType::UserCode, expires_at);

        let (device_code, device_signature) =
            self.strategy.generate(TokenType::DeviceCode, &request)?;

        let mut attempt = 0;
        let user_code = loop {
            attempt += 1;
            let (user_code, user_signature) =
                self.strategy.generate(TokenType::UserCode, &request)?;
            match self
                .create_session(ctx, &device_signature, &user_signature, &request)
                .await
            {
                Ok(()) => break user_code,
                Err(AuthError::ExistingUserCodeSignature { .. }) if attempt < USER_CODE_ATTEMPTS => {
                    tracing::debug!(attempt, "user code collision, drawing a new one");
                }
                Err(e) => return Err(e),
            }
        };

        let mut complete = Url::parse(&self.config.device.verification_uri).map_err(|e| {
            AuthError::misconfiguration(format!("device verification URI is invalid: {e}"))
        })?;
        complete.query_pairs_mut().append_pair("user_code", &user_code);

        tracing::debug!(
            request_id = %request.id,
            client_id = %request.client.id,
            "device authorization started"
        );

        Ok(DeviceAuthorizeResponse {
            device_code,
            user_code,
            verification_uri: self.config.device.verification_uri.clone(),
            verification_uri_complete: complete.to_string(),
            expires_in: i64::try_from(lifespan.as_secs()).unwrap_or(i64::MAX),
            interval: i64::try_from(self.config.device.polling_interval.as_secs())
                .unwrap_or(i64::MAX),
        })
    }

    /// Stores a device session under both signatures.
    ///
    /// # Errors
    ///
    /// Returns `ExistingUserCodeSignature` if the user code is taken.
    pub async fn create_session(
        &self,
        ctx: &RequestContext,
        device_signature: &str,
        user_signature: &str,
        request: &Request,
    ) -> AuthResult<()> {
        let row = DeviceSessionRow {
            device_code_signature: storage_signature(device_signature),
            user_code_signature: storage_signature(user_signature),
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
            session_data: self.sessions.seal_session(&request.session)?,
            expires_at: request.session.expires_at(TokenType::DeviceCode),
            user_code_state: UserCodeState::Unused,
            device_code_active: true,
        };
        self.storage.create_device_session(ctx, row).await
    }

    async fn from_row(&self, ctx: &RequestContext, row: &DeviceSessionRow) -> AuthResult<DeviceRequest> {
        let request = self
            .sessions
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
        Ok(DeviceRequest {
            request,
            user_code_state: row.user_code_state,
            device_code_active: row.device_code_active,
        })
    }

    /// Loads the session polled by a device.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, or `InactiveToken` with the session once the
    /// device code was redeemed.
    pub async fn get_device_code_session(
        &self,
        ctx: &RequestContext,
        device_signature: &str,
    ) -> AuthResult<DeviceRequest> {
        let row = self
            .storage
            .find_device_session_by_device_code(ctx, &storage_signature(device_signature))
            .await?
            .ok_or_else(|| AuthError::not_found("device code session"))?;
        let device = self.from_row(ctx, &row).await?;
        if !device.device_code_active {
            return Err(AuthError::inactive_device(device));
        }
        Ok(device)
    }

    /// Loads the session a user is about to approve or deny.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, `InactiveToken` with the session once the user
    /// code was used or rejected, or `TokenExpired` once it has expired.
    pub async fn get_user_code_session(
        &self,
        ctx: &RequestContext,
        user_signature: &str,
    ) -> AuthResult<DeviceRequest> {
        let row = self
            .storage
            .find_device_session_by_user_code(ctx, &storage_signature(user_signature))
            .await?
            .ok_or_else(|| AuthError::not_found("user code session"))?;
        let device = self.from_row(ctx, &row).await?;
        if device.user_code_state.is_terminal() {
            return Err(AuthError::inactive_device(device));
        }
        if device
            .request
            .session
            .is_expired(TokenType::UserCode, OffsetDateTime::now_utc())
        {
            return Err(AuthError::token_expired("user code expired"));
        }
        Ok(device)
    }

    /// Loads a device session by request id, whatever its state.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the request has no device session.
    pub async fn get_by_request_id(
        &self,
        ctx: &RequestContext,
        request_id: &str,
    ) -> AuthResult<DeviceRequest> {
        let row = self
            .storage
            .find_device_session_by_request_id(ctx, request_id)
            .await?
            .ok_or_else(|| AuthError::not_found("device session"))?;
        self.from_row(ctx, &row).await
    }

    /// Writes the consent outcome of `request` onto an existing session.
    ///
    /// Returns `false` if the user code was no longer in `expected`.
    ///
    /// # Errors
    ///
    /// Returns storage errors only.
    pub async fn update_by_signature(
        &self,
        ctx: &RequestContext,
        device_signature: &str,
        request: &Request,
        state: UserCodeState,
        expected: Option<UserCodeState>,
    ) -> AuthResult<bool> {
        let update = DeviceSessionUpdate {
            granted_scope: request.granted_scope.clone(),
            granted_audience: request.granted_audience.clone(),
            subject: request.session.subject.clone(),
            challenge_id: request.session.consent_challenge.clone(),
            session_data: self.sessions.seal_session(&request.session)?,
            user_code_state: state,
        };
        self.storage
            .update_device_session(ctx, &storage_signature(device_signature), update, expected)
            .await
    }

    /// Approves a user code, attaching what the user granted.
    ///
    /// # Errors
    ///
    /// Returns `NotFound`, or `InactiveToken` with the session if the user
    /// code was already used or rejected, including by a concurrent request.
    pub async fn approve_user_code(
        &self,
        ctx: &RequestContext,
        user_signature: &str,
        granted_scope: &[String],
        granted_audience: &[String],
        subject: &str,
        consent_challenge: Option<&str>,
    ) -> AuthResult<DeviceRequest> {
        let mut device = self.get_user_code_session(ctx, user_signature).await?;
        for scope in granted_scope {
            device.request.grant_scope(scope.clone());
        }
        for audience in granted_audience {
            device.request.grant_audience(audience.clone());
        }
        device.request.session.subject = subject.to_string();
        device.request.session.consent_challenge = consent_challenge.map(str::to_string);

        self.decide(ctx, user_signature, device, UserCodeState::Used)
            .await
    }

    /// Rejects a user code.
    ///
    /// # Errors
    ///
    /// Same as [`Self::approve_user_code`].
    pub async fn deny_user_code(
        &self,
        ctx: &RequestContext,
        user_signature: &str,
    ) -> AuthResult<DeviceRequest> {
        let device = self.get_user_code_session(ctx, user_signature).await?;
        self.decide(ctx, user_signature, device, UserCodeState::Rejected)
            .await
    }

    async fn decide(
        &self,
        ctx: &RequestContext,
        user_signature: &str,
        mut device: DeviceRequest,
        state: UserCodeState,
    ) -> AuthResult<DeviceRequest> {
        let row = self
            .storage
            .find_device_session_by_user_code(ctx, &storage_signature(user_signature))
            .await?
            .ok_or_else(|| AuthError::not_found("user code session"))?;

        let applied = self
            .update_by_signature(
                ctx,
                &row.device_code_signature,
                &device.request,
                state,
                Some(UserCodeState::Unused),
            )
            .await?;

        if !applied {
            tracing::warn!(request_id = %device.request.id, "user code already decided");
            return match self.get_user_code_session(ctx, user_signature).await {
                Ok(_) => Err(AuthError::conflict("user code changed concurrently")),
                Err(e) => Err(e),
            };
        }

        device.user_code_state = state;
        tracing::debug!(request_id = %device.request.id, state = ?state, "user code decided");
        Ok(device)
    }

    /// Deactivates a device code after tokens were issued for it.
    ///
    /// Returns `1` if this call deactivated it and `0` if it already was.
    ///
    /// # Errors
    ///
    /// Returns storage errors only.
    pub async fn invalidate_device_code(
        &self,
        ctx: &RequestContext,
        device_signature: &str,
    ) -> AuthResult<u64> {
        self.storage
            .invalidate_device_code(ctx, &storage_signature(device_signature))
            .await
    }

    /// Deletes device sessions requested before
    /// `min(not_after, now - device_user_code)`.
    ///
    /// # Errors
    ///
    /// Returns storage errors only.
    pub async fn flush_expired(
        &self,
        ctx: &RequestContext,
        not_after: OffsetDateTime,
        limit: usize,
        batch_size: usize,
    ) -> AuthResult<u64> {
        let Some(bound) = flush_bound(not_after, self.config.lifespans.device_user_code) else {
            return Ok(0);
        };
        let deleted = self
            .storage
            .flush_device_sessions(ctx, bound, limit, batch_size.max(1))
            .await?;
        tracing::info!(deleted, "flushed device sessions");
        Ok(deleted)
    }
}
