//! Resource owner password credentials grant (RFC 6749 section 4.3).

use super::{
    issue_access_token, issue_refresh_token, require_grant, require_requested_allowed,
    required_param, should_issue_refresh,
};
use crate::AuthResult;
use crate::context::RequestContext;
use crate::engine::TokenEngine;
use crate::error::AuthError;
use crate::transaction::in_transaction;
use crate::types::{AccessRequest, AccessResponse, GrantType};

pub(super) async fn validate(
    engine: &TokenEngine,
    ctx: &RequestContext,
    access: &mut AccessRequest,
) -> AuthResult<()> {
    let request = &mut access.request;
    require_grant(request, GrantType::Password)?;
    require_requested_allowed(request)?;

    let username = required_param(request, "username")?.to_string();
    let password = required_param(request, "password")?.to_string();
    let authenticator = engine
        .authenticator()
        .ok_or_else(|| AuthError::unsupported_grant_type(GrantType::Password.as_str()))?;

    let subject = authenticator
        .authenticate(ctx, &username, &password)
        .await
        .map_err(|e| match e {
            AuthError::NotFound { .. } | AuthError::InvalidGrant { .. } => {
                AuthError::invalid_grant("unable to authenticate the resource owner")
            }
            other => other,
        })?;

    request.form.remove("password");
    request.session.subject = subject;
    request.session.username = username;
    for scope in request.requested_scope.clone() {
        request.grant_scope(scope);
    }
    for audience in request.requested_audience.clone() {
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
    let request = &mut access.request;
    in_transaction(engine.storage(), ctx, |tx| async move {
        let access_signature = issue_access_token(engine, &tx, request, response).await?;
        if should_issue_refresh(engine, request) {
            issue_refresh_token(engine, &tx, request, &access_signature, response).await?;
        }
        Ok(())
    })
    .await
}
