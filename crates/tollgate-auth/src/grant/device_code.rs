//! Device code grant (RFC 8628 section 3.4).

use super::{
    issue_access_token, issue_refresh_token, merge_stored, redemption_error, require_grant,
    required_param, revoke_request_tokens, should_issue_refresh,
};
use crate::AuthResult;
use crate::context::RequestContext;
use crate::engine::TokenEngine;
use crate::error::AuthError;
use crate::transaction::in_transaction;
use crate::types::{AccessRequest, AccessResponse, GrantType, Request, TokenType, UserCodeState};

fn device_signature(engine: &TokenEngine, request: &Request) -> AuthResult<(String, String)> {
    let code = required_param(request, "device_code")?.to_string();
    let signature = engine
        .strategy()
        .signature(TokenType::DeviceCode, &code)
        .map_err(|e| redemption_error("device code", e))?;
    Ok((code, signature))
}

pub(super) async fn validate(
    engine: &TokenEngine,
    ctx: &RequestContext,
    access: &mut AccessRequest,
) -> AuthResult<()> {
    let request = &mut access.request;
    require_grant(request, GrantType::DeviceCode)?;
    let (code, signature) = device_signature(engine, request)?;

    let device = match engine.devices().get_device_code_session(ctx, &signature).await {
        Ok(device) => device,
        Err(AuthError::InactiveToken { session }) => {
            let request_id = session.request().id.clone();
            tracing::warn!(%request_id, "device code reused; revoking issued tokens");
            in_transaction(engine.storage(), ctx, |tx| async move {
                revoke_request_tokens(engine, &tx, &request_id).await
            })
            .await?;
            return Err(AuthError::invalid_grant("device code has already been used"));
        }
        Err(e) => return Err(redemption_error("device code", e)),
    };

    engine
        .strategy()
        .validate(TokenType::DeviceCode, &device.request, &code)
        .map_err(|e| redemption_error("device code", e))?;

    match device.user_code_state {
        UserCodeState::Unused => return Err(AuthError::AuthorizationPending),
        UserCodeState::Rejected => {
            return Err(AuthError::access_denied("the user denied the device"));
        }
        UserCodeState::Used => {}
    }

    if device.request.client.id != request.client.id {
        return Err(AuthError::invalid_grant(
            "device code was issued to another client",
        ));
    }

    merge_stored(request, device.request);
    Ok(())
}

pub(super) async fn populate(
    engine: &TokenEngine,
    ctx: &RequestContext,
    access: &mut AccessRequest,
    response: &mut AccessResponse,
) -> AuthResult<()> {
    let (_, signature) = device_signature(engine, &access.request)?;
    let request = &mut access.request;

    in_transaction(engine.storage(), ctx, |tx| async move {
        let invalidated = engine
            .devices()
            .invalidate_device_code(&tx, &signature)
            .await?;
        if invalidated == 0 {
            return Err(AuthError::invalid_grant("device code has already been used"));
        }

        let access_signature = issue_access_token(engine, &tx, request, response).await?;
        if should_issue_refresh(engine, request) {
            issue_refresh_token(engine, &tx, request, &access_signature, response).await?;
        }
        Ok(())
    })
    .await
}
