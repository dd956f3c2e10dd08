//! Token endpoint grant handlers.
//!
//! One variant per grant type, each with the same two phases: `validate`
//! checks the request and loads whatever it redeems, `populate` persists
//! the new sessions and fills the response.

pub mod authorization_code;
pub mod client_credentials;
pub mod device_code;
pub mod implicit;
pub mod password;
pub mod refresh_token;

use time::OffsetDateTime;

use crate::AuthResult;
use crate::context::RequestContext;
use crate::engine::TokenEngine;
use crate::error::AuthError;
use crate::types::{AccessRequest, AccessResponse, GrantType, Request, SessionKind, TokenType};
use crate::util::{after, split_space};

/// Form keys persisted with a session. Credentials never are.
pub(crate) const STORED_FORM_KEYS: &[&str] = &[
    "grant_type",
    "response_type",
    "client_id",
    "scope",
    "audience",
    "redirect_uri",
    "state",
    "nonce",
    "code_challenge",
    "code_challenge_method",
    "username",
];

/// A token endpoint grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantHandler {
    AuthorizationCode,
    Implicit,
    ClientCredentials,
    RefreshToken,
    DeviceCode,
    Password,
}

impl GrantHandler {
    /// Selects the handler for a `grant_type` value.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedGrantType` for an unknown grant.
    pub fn for_grant_type(grant_type: &str) -> AuthResult<Self> {
        match GrantType::parse(grant_type) {
            Some(GrantType::AuthorizationCode) => Ok(Self::AuthorizationCode),
            Some(GrantType::Implicit) => Ok(Self::Implicit),
            Some(GrantType::ClientCredentials) => Ok(Self::ClientCredentials),
            Some(GrantType::RefreshToken) => Ok(Self::RefreshToken),
            Some(GrantType::DeviceCode) => Ok(Self::DeviceCode),
            Some(GrantType::Password) => Ok(Self::Password),
            None => Err(AuthError::unsupported_grant_type(grant_type)),
        }
    }

    /// The grant type this handler serves.
    #[must_use]
    pub fn grant_type(self) -> GrantType {
        match self {
            Self::AuthorizationCode => GrantType::AuthorizationCode,
            Self::Implicit => GrantType::Implicit,
            Self::ClientCredentials => GrantType::ClientCredentials,
            Self::RefreshToken => GrantType::RefreshToken,
            Self::DeviceCode => GrantType::DeviceCode,
            Self::Password => GrantType::Password,
        }
    }

    /// Checks the request and loads what it redeems into it.
    ///
    /// # Errors
    ///
    /// Returns the grant's protocol error.
    pub async fn validate(
        self,
        engine: &TokenEngine,
        ctx: &RequestContext,
        request: &mut AccessRequest,
    ) -> AuthResult<()> {
        match self {
            Self::AuthorizationCode => authorization_code::validate(engine, ctx, request).await,
            Self::Implicit => implicit::validate(request),
            Self::ClientCredentials => client_credentials::validate(request),
            Self::RefreshToken => refresh_token::validate(engine, ctx, request).await,
            Self::DeviceCode => device_code::validate(engine, ctx, request).await,
            Self::Password => password::validate(engine, ctx, request).await,
        }
    }

    /// Persists the issued sessions and fills the response.
    ///
    /// # Errors
    ///
    /// Returns the grant's protocol error; nothing is persisted on error.
    pub async fn populate(
        self,
        engine: &TokenEngine,
        ctx: &RequestContext,
        request: &mut AccessRequest,
        response: &mut AccessResponse,
    ) -> AuthResult<()> {
        match self {
            Self::AuthorizationCode => {
                authorization_code::populate(engine, ctx, request, response).await
            }
            Self::Implicit => implicit::populate(engine, ctx, request, response).await,
            Self::ClientCredentials => {
                client_credentials::populate(engine, ctx, request, response).await
            }
            Self::RefreshToken => refresh_token::populate(engine, ctx, request, response).await,
            Self::DeviceCode => device_code::populate(engine, ctx, request, response).await,
            Self::Password => password::populate(engine, ctx, request, response).await,
        }
    }
}

// =============================================================================
// Shared helpers
// =============================================================================

/// Fills the requested scope and audience from the form when the caller
/// left them empty.
pub(crate) fn hydrate_requested(request: &mut Request) {
    if request.requested_scope.is_empty() {
        request.requested_scope = split_space(request.form.get("scope"));
    }
    if request.requested_audience.is_empty() {
        request.requested_audience = split_space(request.form.get("audience"));
    }
}

/// Fails with `UnauthorizedClient` unless the client may use the grant.
pub(crate) fn require_grant(request: &Request, grant_type: GrantType) -> AuthResult<()> {
    if request.client.allows_grant(grant_type) {
        return Ok(());
    }
    Err(AuthError::unauthorized_client(format!(
        "client '{}' may not use the '{grant_type}' grant",
        request.client.id
    )))
}

/// Fails with `InvalidScope` or `InvalidRequest` unless the client may use
/// every requested scope and audience.
pub(crate) fn require_requested_allowed(request: &Request) -> AuthResult<()> {
    if let Some(scope) = request.client.first_disallowed_scope(&request.requested_scope) {
        return Err(AuthError::invalid_scope(format!(
            "scope '{scope}' is not allowed for this client"
        )));
    }
    if let Some(audience) = request
        .client
        .first_disallowed_audience(&request.requested_audience)
    {
        return Err(AuthError::invalid_request(format!(
            "audience '{audience}' is not allowed for this client"
        )));
    }
    Ok(())
}

/// Reads a required form parameter.
pub(crate) fn required_param<'a>(request: &'a Request, key: &str) -> AuthResult<&'a str> {
    request
        .form
        .get(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError::invalid_request(format!("{key} is required")))
}

/// Copies what a redeemed grant stored onto the token request.
///
/// The request keeps its own form and client; identity, scopes, audience
/// and session come from the stored request.
pub(crate) fn merge_stored(request: &mut Request, stored: Request) {
    request.id = stored.id;
    request.requested_at = stored.requested_at;
    request.requested_scope = stored.requested_scope;
    request.granted_scope = stored.granted_scope;
    request.requested_audience = stored.requested_audience;
    request.granted_audience = stored.granted_audience;
    request.session = stored.session;
}

/// Maps redemption lookup failures onto `InvalidGrant`.
pub(crate) fn redemption_error(what: &str, err: AuthError) -> AuthError {
    match err {
        AuthError::NotFound { .. } => AuthError::invalid_grant(format!("{what} is unknown")),
        AuthError::TokenExpired { .. } => AuthError::invalid_grant(format!("{what} has expired")),
        AuthError::InvalidRequest { message } => AuthError::invalid_grant(message),
        other => other,
    }
}

/// Returns `true` if a refresh token should accompany the access token.
pub(crate) fn should_issue_refresh(engine: &TokenEngine, request: &Request) -> bool {
    let scopes = &engine.config().refresh.refresh_token_scopes;
    request.client.allows_grant(GrantType::RefreshToken)
        && (scopes.is_empty() || request.has_any_granted_scope(scopes))
}

fn lifespan_secs(engine: &TokenEngine, token_type: TokenType) -> i64 {
    i64::try_from(engine.config().lifespans.for_token(token_type).as_secs()).unwrap_or(i64::MAX)
}

/// Issues an access token, returning its signature.
pub(crate) async fn issue_access_token(
    engine: &TokenEngine,
    ctx: &RequestContext,
    request: &mut Request,
    response: &mut AccessResponse,
) -> AuthResult<String> {
    let expires_at = after(OffsetDateTime::now_utc(), engine.config().lifespans.access_token);
    request
        .session
        .set_expires_at(TokenType::AccessToken, expires_at);

    let (token, signature) = engine.strategy().generate(TokenType::AccessToken, request)?;
    engine
        .sessions()
        .create(
            ctx,
            SessionKind::Access,
            &signature,
            &request.sanitize(STORED_FORM_KEYS),
        )
        .await?;

    response.access_token = token;
    response.expires_in = lifespan_secs(engine, TokenType::AccessToken);
    response.scope = (!request.granted_scope.is_empty()).then(|| request.granted_scope.join(" "));
    Ok(signature)
}

/// Issues a refresh token linked to an access token.
pub(crate) async fn issue_refresh_token(
    engine: &TokenEngine,
    ctx: &RequestContext,
    request: &mut Request,
    access_signature: &str,
    response: &mut AccessResponse,
) -> AuthResult<()> {
    let expires_at = after(OffsetDateTime::now_utc(), engine.config().lifespans.refresh_token);
    request
        .session
        .set_expires_at(TokenType::RefreshToken, expires_at);

    let (token, signature) = engine.strategy().generate(TokenType::RefreshToken, request)?;
    engine
        .sessions()
        .create_refresh(
            ctx,
            &signature,
            Some(access_signature),
            &request.sanitize(STORED_FORM_KEYS),
        )
        .await?;
    response.refresh_token = Some(token);
    Ok(())
}

/// Revokes every access and refresh token of a request after a replay.
pub(crate) async fn revoke_request_tokens(
    engine: &TokenEngine,
    ctx: &RequestContext,
    request_id: &str,
) -> AuthResult<()> {
    engine.rotation().revoke_access_tokens(ctx, request_id).await?;
    engine.rotation().revoke(ctx, request_id).await
}
