//! Authorization code grant (RFC 6749 section 4.1) with PKCE (RFC 7636).

use time::OffsetDateTime;

use super::{
    STORED_FORM_KEYS, issue_access_token, issue_refresh_token, merge_stored, redemption_error,
    require_grant, required_param, revoke_request_tokens, should_issue_refresh,
};
use crate::AuthResult;
use crate::context::RequestContext;
use crate::engine::TokenEngine;
use crate::error::AuthError;
use crate::pkce::{PkceChallenge, PkceChallengeMethod, PkceVerifier};
use crate::transaction::in_transaction;
use crate::types::{AccessRequest, AccessResponse, GrantType, Request, SessionKind, TokenType};
use crate::util::after;

const OPENID_SCOPE: &str = "openid";

/// Stores a new authorization code with its PKCE and OIDC companions.
pub(crate) async fn issue(
    engine: &TokenEngine,
    ctx: &RequestContext,
    request: &mut Request,
) -> AuthResult<String> {
    require_grant(request, GrantType::AuthorizationCode)?;
    if !request.client.allows_response_type("code") {
        return Err(AuthError::unauthorized_client(format!(
            "client '{}' may not use the 'code' response type",
            request.client.id
        )));
    }

    let pkce = match request.form.get("code_challenge") {
        Some(challenge) => {
            let method = PkceChallengeMethod::parse(request.form.get("code_challenge_method"))?;
            Some(PkceChallenge::new(challenge, method)?)
        }
        None => None,
    };

    let expires_at = after(
        OffsetDateTime::now_utc(),
        engine.config().lifespans.authorization_code,
    );
    request
        .session
        .set_expires_at(TokenType::AuthorizeCode, expires_at);

    let (code, signature) = engine.strategy().generate(TokenType::AuthorizeCode, request)?;
    let stored = request.sanitize(STORED_FORM_KEYS);
    let sessions = engine.sessions();
    let has_pkce = pkce.is_some();

    in_transaction(engine.storage(), ctx, |tx| async move {
        sessions
            .create(&tx, SessionKind::Code, &signature, &stored)
            .await?;
        if has_pkce {
            sessions
                .create(&tx, SessionKind::Pkce, &signature, &stored)
                .await?;
        }
        if stored.has_granted_scope(OPENID_SCOPE) {
            sessions
                .create(&tx, SessionKind::Oidc, &signature, &stored)
                .await?;
        }
        Ok(())
    })
    .await?;

    tracing::debug!(request_id = %request.id, pkce = has_pkce, "authorization code issued");
    Ok(code)
}

fn code_signature(engine: &TokenEngine, request: &Request) -> AuthResult<(String, String)> {
    let code = required_param(request, "code")?.to_string();
    let signature = engine
        .strategy()
        .signature(TokenType::AuthorizeCode, &code)
        .map_err(|e| redemption_error("authorization code", e))?;
    Ok((code, signature))
}

pub(super) async fn validate(
    engine: &TokenEngine,
    ctx: &RequestContext,
    access: &mut AccessRequest,
) -> AuthResult<()> {
    let request = &mut access.request;
    require_grant(request, GrantType::AuthorizationCode)?;
    let (code, signature) = code_signature(engine, request)?;

    let stored = match engine.sessions().get(ctx, SessionKind::Code, &signature).await {
        Ok(stored) => stored,
        Err(AuthError::InvalidatedAuthorizeCode { session }) => {
            let request_id = session.request().id.clone();
            tracing::warn!(%request_id, "authorization code reused; revoking issued tokens");
            in_transaction(engine.storage(), ctx, |tx| async move {
                revoke_request_tokens(engine, &tx, &request_id).await
            })
            .await?;
            return Err(AuthError::invalid_grant(
                "authorization code has already been used",
            ));
        }
        Err(e) => return Err(redemption_error("authorization code", e)),
    };

    engine
        .strategy()
        .validate(TokenType::AuthorizeCode, &stored, &code)
        .map_err(|e| redemption_error("authorization code", e))?;

    if stored.client.id != request.client.id {
        return Err(AuthError::invalid_grant(
            "authorization code was issued to another client",
        ));
    }
    if let Some(expected) = stored.form.get("redirect_uri")
        && request.form.get("redirect_uri") != Some(expected)
    {
        return Err(AuthError::invalid_grant(
            "redirect_uri does not match the authorization request",
        ));
    }

    verify_pkce(engine, ctx, &signature, request).await?;
    merge_stored(request, stored);
    Ok(())
}

async fn verify_pkce(
    engine: &TokenEngine,
    ctx: &RequestContext,
    signature: &str,
    request: &Request,
) -> AuthResult<()> {
    let pkce = match engine.sessions().get(ctx, SessionKind::Pkce, signature).await {
        Ok(pkce) => pkce,
        Err(AuthError::NotFound { .. }) => return Ok(()),
        Err(e) => return Err(redemption_error("PKCE session", e)),
    };

    let challenge = pkce
        .form
        .get("code_challenge")
        .ok_or_else(|| AuthError::internal("PKCE session has no code_challenge"))?;
    let method = PkceChallengeMethod::parse(pkce.form.get("code_challenge_method"))?;
    let challenge = PkceChallenge::new(challenge, method)?;

    let verifier = request
        .form
        .get("code_verifier")
        .ok_or_else(|| AuthError::invalid_grant("code_verifier is required"))?;
    challenge.verify(&PkceVerifier::new(verifier)?)?;

    engine
        .sessions()
        .delete(ctx, SessionKind::Pkce, signature)
        .await
}

pub(super) async fn populate(
    engine: &TokenEngine,
    ctx: &RequestContext,
    access: &mut AccessRequest,
    response: &mut AccessResponse,
) -> AuthResult<()> {
    let (_, signature) = code_signature(engine, &access.request)?;
    let request = &mut access.request;

    in_transaction(engine.storage(), ctx, |tx| async move {
        let invalidated = engine
            .sessions()
            .deactivate(&tx, SessionKind::Code, &signature)
            .await?;
        if invalidated == 0 {
            return Err(AuthError::invalid_grant(
                "authorization code has already been used",
            ));
        }

        let access_signature = issue_access_token(engine, &tx, request, response).await?;
        if should_issue_refresh(engine, request) {
            issue_refresh_token(engine, &tx, request, &access_signature, response).await?;
        }

        if request.has_granted_scope(OPENID_SCOPE) {
            match engine.sessions().get(&tx, SessionKind::Oidc, &signature).await {
                Ok(_) => {
                    response.id_token = engine.strategy().id_token(request)?;
                    engine
                        .sessions()
                        .delete(&tx, SessionKind::Oidc, &signature)
                        .await?;
                }
                Err(AuthError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    })
    .await
}
