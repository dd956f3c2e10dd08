//! Client credentials grant (RFC 6749 section 4.4).
//!
//! Client authentication happens before the engine is called; this grant
//! only checks what the authenticated client may obtain.

use super::{issue_access_token, require_grant, require_requested_allowed};
use crate::AuthResult;
use crate::context::RequestContext;
use crate::engine::TokenEngine;
use crate::error::AuthError;
use crate::types::{AccessRequest, AccessResponse, GrantType};

pub(super) fn validate(access: &mut AccessRequest) -> AuthResult<()> {
    let request = &mut access.request;
    require_grant(request, GrantType::ClientCredentials)?;
    if request.client.public {
        return Err(AuthError::invalid_client(
            "public clients may not use the client_credentials grant",
        ));
    }
    require_requested_allowed(request)?;

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
    issue_access_token(engine, ctx, &mut access.request, response).await?;
    Ok(())
}
