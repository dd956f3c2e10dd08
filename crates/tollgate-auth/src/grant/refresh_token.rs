//! Refresh token grant (RFC 6749 section 6) with rotation.

use super::{
    issue_access_token, issue_refresh_token, merge_stored, redemption_error, require_grant,
    required_param,
};
use crate::AuthResult;
use crate::context::RequestContext;
use crate::engine::TokenEngine;
use crate::error::AuthError;
use crate::transaction::in_transaction;
use crate::types::{AccessRequest, AccessResponse, GrantType, Request, SessionKind, TokenType};

fn refresh_signature(engine: &TokenEngine, request: &Request) -> AuthResult<(String, String)> {
    let token = required_param(request, "refresh_token")?.to_string();
    let signature = engine
        .strategy()
        .signature(TokenType::RefreshToken, &token)
        .map_err(|e| redemption_error("refresh token", e))?;
    Ok((token, signature))
}

pub(super) async fn validate(
    engine: &TokenEngine,
    ctx: &RequestContext,
    access: &mut AccessRequest,
) -> AuthResult<()> {
    let request = &mut access.request;
    require_grant(request, GrantType::RefreshToken)?;
    let (token, signature) = refresh_signature(engine, request)?;

    let stored = match engine
        .sessions()
        .get(ctx, SessionKind::Refresh, &signature)
        .await
    {
        Ok(stored) => stored,
        Err(AuthError::InactiveToken { session }) => {
            let request_id = session.request().id.clone();
            tracing::warn!(%request_id, "inactive refresh token presented; revoking grant");
            let signature = signature.clone();
            in_transaction(engine.storage(), ctx, |tx| async move {
                engine
                    .sessions()
                    .delete(&tx, SessionKind::Refresh, &signature)
                    .await?;
                super::revoke_request_tokens(engine, &tx, &request_id).await
            })
            .await?;
            return Err(AuthError::invalid_grant(
                "refresh token has been used or revoked",
            ));
        }
        Err(e) => return Err(redemption_error("refresh token", e)),
    };

    engine
        .strategy()
        .validate(TokenType::RefreshToken, &stored, &token)
        .map_err(|e| redemption_error("refresh token", e))?;

    let scopes = &engine.config().refresh.refresh_token_scopes;
    if !scopes.is_empty() && !stored.has_any_granted_scope(scopes) {
        return Err(AuthError::invalid_scope(format!(
            "refresh tokens require one of the scopes: {}",
            scopes.join(" ")
        )));
    }
    if stored.client.id != request.client.id {
        return Err(AuthError::invalid_grant(
            "refresh token was issued to another client",
        ));
    }

    let granted_scope = stored.granted_scope.clone();
    let granted_audience = stored.granted_audience.clone();
    merge_stored(request, stored);
    request.granted_scope.clear();
    request.granted_audience.clear();

    for scope in granted_scope {
        if !request.client.allows_scope(&scope) {
            return Err(AuthError::invalid_scope(format!(
                "scope '{scope}' is no longer allowed for this client"
            )));
        }
        request.grant_scope(scope);
    }
    for audience in granted_audience {
        if !request.client.allows_audience(&audience) {
            return Err(AuthError::invalid_request(format!(
                "audience '{audience}' is no longer allowed for this client"
            )));
        }
        request.grant_audience(audience);
    }
    Ok(())
}

pub(super) async fn populate(
    engine: &TokenEngine,
    ctx: &RequestContext,
    access: &mut AccessRequest,
    response: &mut AccessResponse,
) -> AuthResult<()> {
    let (_, signature) = refresh_signature(engine, &access.request)?;
    let request = &mut access.request;
    let request_id = request.id.clone();

    in_transaction(engine.storage(), ctx, |tx| async move {
        engine
            .rotation()
            .rotate(&tx, &request_id, &signature)
            .await?;
        let access_signature = issue_access_token(engine, &tx, request, response).await?;
        issue_refresh_token(engine, &tx, request, &access_signature, response).await
    })
    .await
    .map_err(|e| match e {
        AuthError::SerializationFailure { .. } => {
            AuthError::invalid_request("concurrent refresh detected, retry the request")
        }
        AuthError::NotFound { .. }
        | AuthError::InactiveToken { .. }
        | AuthError::InvalidatedAuthorizeCode { .. } => {
            AuthError::invalid_request("refresh token is no longer active")
        }
        other => other,
    })
}
