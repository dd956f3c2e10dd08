//! Authorization Challenge Coordinator.
//!
//! Drives one authorization request through the login and consent
//! sub-challenges. Each step loads the flow, applies the pure transition on
//! [`Flow`] and persists it with a compare-and-set on the previous state, so
//! two concurrent submissions can never both win. The loser observes the
//! state the winner produced.

use std::sync::Arc;

use time::OffsetDateTime;

use crate::AuthResult;
use crate::config::EngineConfig;
use crate::context::RequestContext;
use crate::engine::Dependencies;
use crate::error::AuthError;
use crate::storage::{AuthStorage, ClientDirectory};
use crate::transaction::in_transaction;
use crate::types::{
    Flow, FlowState, HandledConsent, HandledLogin, LoginSession, Request, SessionKind,
};
use crate::util::flush_bound;

/// Coordinates login and consent for authorization flows.
pub struct ChallengeCoordinator {
    storage: Arc<dyn AuthStorage>,
    clients: Arc<dyn ClientDirectory>,
    config: Arc<EngineConfig>,
}

impl ChallengeCoordinator {
    /// Creates the coordinator from the engine dependencies.
    #[must_use]
    pub fn new(deps: &Dependencies) -> Self {
        Self {
            storage: Arc::clone(&deps.storage),
            clients: Arc::clone(&deps.clients),
            config: Arc::clone(&deps.config),
        }
    }

    // =========================================================================
    // Flow lifecycle
    // =========================================================================

    /// Starts a flow in the login-pending state.
    ///
    /// # Errors
    ///
    /// Returns `InvalidClient` if the client cannot be resolved.
    pub async fn create_flow(
        &self,
        ctx: &RequestContext,
        client_id: &str,
        requested_scope: Vec<String>,
        requested_audience: Vec<String>,
        request_url: &str,
    ) -> AuthResult<Flow> {
        let client = self
            .clients
            .get_client(ctx, client_id)
            .await
            .map_err(|e| match e {
                AuthError::NotFound { .. } => {
                    AuthError::invalid_client(format!("client '{client_id}' is unknown"))
                }
                other => other,
            })?;

        let flow = Flow::new(client.id, requested_scope, requested_audience, request_url);
        self.storage.create_flow(ctx, &flow).await?;
        tracing::debug!(
            login_challenge = %flow.login_challenge,
            client_id = %flow.client_id,
            "created authorization flow"
        );
        Ok(flow)
    }

    /// Loads the login request for a login challenge.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the challenge is unknown in this network.
    pub async fn get_login_request(
        &self,
        ctx: &RequestContext,
        login_challenge: &str,
    ) -> AuthResult<Flow> {
        self.storage
            .find_flow(ctx, login_challenge)
            .await?
            .ok_or_else(|| AuthError::not_found("login request"))
    }

    /// Loads the consent request for a consent challenge.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the challenge is unknown in this network.
    pub async fn get_consent_request(
        &self,
        ctx: &RequestContext,
        consent_challenge: &str,
    ) -> AuthResult<Flow> {
        self.storage
            .find_flow_by_consent_challenge(ctx, consent_challenge)
            .await?
            .ok_or_else(|| AuthError::not_found("consent request"))
    }

    /// Records the login provider's decision.
    ///
    /// An accepted login also confirms a login session for the subject in
    /// the same transaction. The session carries the `remember` flag.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown challenge and `Conflict` if the
    /// login was already handled, including by a concurrent request.
    pub async fn handle_login(
        &self,
        ctx: &RequestContext,
        login_challenge: &str,
        handled: HandledLogin,
    ) -> AuthResult<Flow> {
        in_transaction(self.storage.as_ref(), ctx, |tx| async move {
            let mut flow = self.get_login_request(&tx, login_challenge).await?;
            let previous = flow.state;
            let accepted = handled.error.is_none();
            let remember = handled.remember;
            flow.handle_login(handled, OffsetDateTime::now_utc())?;

            if accepted {
                let session = LoginSession::new(flow.subject.clone(), remember);
                self.storage.upsert_login_session(&tx, &session).await?;
                flow.login_session_id = Some(session.id);
            }

            if !self.storage.update_flow(&tx, &flow, previous).await? {
                return Err(AuthError::conflict(format!(
                    "login challenge {login_challenge} was already handled"
                )));
            }
            tracing::debug!(
                login_challenge = %flow.login_challenge,
                denied = flow.login_error.is_some(),
                "handled login request"
            );
            Ok(flow)
        })
        .await
    }

    /// Redeems a login verifier exactly once.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown verifier and `InvalidRequest` if it
    /// was already redeemed.
    pub async fn verify_and_invalidate_login(
        &self,
        ctx: &RequestContext,
        verifier: &str,
    ) -> AuthResult<Flow> {
        let mut flow = self
            .storage
            .find_flow_by_login_verifier(ctx, verifier)
            .await?
            .ok_or_else(|| AuthError::not_found("login verifier"))?;
        let previous = flow.state;
        flow.invalidate_login()?;

        if !self.storage.update_flow(ctx, &flow, previous).await? {
            tracing::warn!(login_challenge = %flow.login_challenge, "login verifier replayed");
            return Err(AuthError::invalid_request(
                "login verifier has already been used",
            ));
        }
        Ok(flow)
    }

    /// Opens the consent sub-challenge of a flow whose login was redeemed.
    ///
    /// # Errors
    ///
    /// Returns `AccessDenied` for a rejected login and `InvalidRequest` if
    /// the flow is not waiting for consent to start.
    pub async fn create_consent_request(
        &self,
        ctx: &RequestContext,
        login_challenge: &str,
    ) -> AuthResult<Flow> {
        let mut flow = self.get_login_request(ctx, login_challenge).await?;
        let previous = flow.state;
        flow.begin_consent()?;

        if !self.storage.update_flow(ctx, &flow, previous).await? {
            return Err(AuthError::invalid_request(
                "consent request was already created",
            ));
        }
        Ok(flow)
    }

    /// Records the consent provider's decision.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown challenge and `Conflict` if consent
    /// was already handled, including by a concurrent request.
    pub async fn handle_consent(
        &self,
        ctx: &RequestContext,
        consent_challenge: &str,
        handled: HandledConsent,
    ) -> AuthResult<Flow> {
        let mut flow = self.get_consent_request(ctx, consent_challenge).await?;
        let previous = flow.state;
        flow.handle_consent(handled, OffsetDateTime::now_utc())?;

        if !self.storage.update_flow(ctx, &flow, previous).await? {
            return Err(AuthError::conflict(format!(
                "consent challenge {consent_challenge} was already handled"
            )));
        }
        tracing::debug!(
            consent_challenge,
            denied = flow.consent_error.is_some(),
            "handled consent request"
        );
        Ok(flow)
    }

    /// Redeems a consent verifier exactly once.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown verifier and `InvalidRequest` if it
    /// was already redeemed.
    pub async fn verify_and_invalidate_consent(
        &self,
        ctx: &RequestContext,
        verifier: &str,
    ) -> AuthResult<Flow> {
        let mut flow = self
            .storage
            .find_flow_by_consent_verifier(ctx, verifier)
            .await?
            .ok_or_else(|| AuthError::not_found("consent verifier"))?;
        let previous = flow.state;
        flow.invalidate_consent()?;

        if !self.storage.update_flow(ctx, &flow, previous).await? {
            tracing::warn!(login_challenge = %flow.login_challenge, "consent verifier replayed");
            return Err(AuthError::invalid_request(
                "consent verifier has already been used",
            ));
        }
        Ok(flow)
    }

    /// Remembered consent decisions still inside their `remember_for`
    /// window, newest first. May be empty.
    ///
    /// # Errors
    ///
    /// Returns storage errors only.
    pub async fn find_remembered_consent(
        &self,
        ctx: &RequestContext,
        client_id: &str,
        subject: &str,
    ) -> AuthResult<Vec<Flow>> {
        let now = OffsetDateTime::now_utc();
        let flows = self
            .storage
            .find_remembered_consents(ctx, client_id, subject)
            .await?;
        Ok(flows
            .into_iter()
            .filter(|flow| flow.remembered_consent_is_valid(now))
            .collect())
    }

    /// Deletes unfinished or denied flows older than
    /// `min(not_after, now - login_consent_request)`.
    ///
    /// # Errors
    ///
    /// Returns storage errors only.
    pub async fn flush_flows(
        &self,
        ctx: &RequestContext,
        not_after: OffsetDateTime,
        limit: usize,
        batch_size: usize,
    ) -> AuthResult<u64> {
        let Some(bound) = flush_bound(not_after, self.config.lifespans.login_consent_request)
        else {
            return Ok(0);
        };
        let deleted = self
            .storage
            .flush_flows(ctx, bound, limit, batch_size.max(1))
            .await?;
        tracing::info!(deleted, "flushed authorization flows");
        Ok(deleted)
    }

    // =========================================================================
    // Login sessions
    // =========================================================================

    /// Creates or refreshes a login session.
    ///
    /// # Errors
    ///
    /// Returns storage errors only.
    pub async fn confirm_login_session(
        &self,
        ctx: &RequestContext,
        session: &LoginSession,
    ) -> AuthResult<()> {
        self.storage.upsert_login_session(ctx, session).await
    }

    /// Loads a login session the subject asked to be remembered.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session is unknown or not remembered.
    pub async fn get_remembered_login_session(
        &self,
        ctx: &RequestContext,
        id: &str,
    ) -> AuthResult<LoginSession> {
        self.storage
            .find_login_session(ctx, id)
            .await?
            .filter(|session| session.remember)
            .ok_or_else(|| AuthError::not_found("login session"))
    }

    /// Deletes a login session and returns it.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session is unknown.
    pub async fn delete_login_session(
        &self,
        ctx: &RequestContext,
        id: &str,
    ) -> AuthResult<LoginSession> {
        self.storage
            .delete_login_session(ctx, id)
            .await?
            .ok_or_else(|| AuthError::not_found("login session"))
    }

    /// Deletes every login session of a subject.
    ///
    /// # Errors
    ///
    /// Returns storage errors only.
    pub async fn revoke_subject_login_sessions(
        &self,
        ctx: &RequestContext,
        subject: &str,
    ) -> AuthResult<u64> {
        self.storage
            .delete_login_sessions_by_subject(ctx, subject)
            .await
    }

    /// Revokes a subject's consents, optionally for one client, together
    /// with every access and refresh token issued through them.
    ///
    /// Returns the number of flows deleted.
    ///
    /// # Errors
    ///
    /// Returns storage errors; nothing is deleted on error.
    pub async fn revoke_subject_consent_sessions(
        &self,
        ctx: &RequestContext,
        subject: &str,
        client_id: Option<&str>,
    ) -> AuthResult<u64> {
        let storage = self.storage.as_ref();
        let deleted = in_transaction(storage, ctx, |tx| async move {
            let challenges = storage
                .find_consent_challenges_by_subject(&tx, subject, client_id)
                .await?;
            for challenge in &challenges {
                for kind in [SessionKind::Access, SessionKind::Refresh] {
                    storage
                        .delete_token_sessions_by_request_id(&tx, kind, challenge)
                        .await?;
                }
            }
            storage
                .delete_flows_by_consent_challenges(&tx, &challenges)
                .await
        })
        .await?;

        tracing::info!(subject, client_id = ?client_id, deleted, "revoked consent sessions");
        Ok(deleted)
    }
}

/// Applies a redeemed consent to the request that will be issued tokens.
///
/// The request id becomes the consent challenge so that revoking the
/// consent later finds every token issued through it.
///
/// # Errors
///
/// Returns `AccessDenied` if the login or consent was rejected and
/// `InvalidRequest` if the consent verifier was not redeemed.
pub fn apply_consent(flow: &Flow, request: &mut Request) -> AuthResult<()> {
    if let Some(error) = flow.consent_error.as_ref().or(flow.login_error.as_ref()) {
        return Err(AuthError::access_denied(format!(
            "{}: {}",
            error.error, error.error_description
        )));
    }
    if flow.state != FlowState::ConsentUsed {
        return Err(AuthError::invalid_request(
            "consent verifier has not been redeemed",
        ));
    }
    let challenge = flow
        .consent_challenge
        .clone()
        .ok_or_else(|| AuthError::internal("flow has no consent challenge"))?;

    request.id = challenge.clone();
    request.requested_scope = flow.requested_scope.clone();
    request.requested_audience = flow.requested_audience.clone();
    for scope in &flow.granted_scope {
        request.grant_scope(scope.clone());
    }
    for audience in &flow.granted_audience {
        request.grant_audience(audience.clone());
    }
    request.session.subject = flow.subject.clone();
    request.session.consent_challenge = Some(challenge);
    request.session.id_token_claims.extend(flow.session_claims.clone());
    if !flow.acr.is_empty() {
        request
            .session
            .id_token_claims
            .insert("acr".to_string(), serde_json::json!(flow.acr));
    }
    Ok(())
}
