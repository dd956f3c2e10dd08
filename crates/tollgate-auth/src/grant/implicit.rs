//! Implicit grant (RFC 6749 section 4.2), served by the authorize endpoint.

use super::{issue_access_token, require_grant, require_requested_allowed};
use crate::AuthResult;
use crate::context::RequestContext;
use crate::engine::TokenEngine;
use crate::error::AuthError;
use crate::types::{AccessRequest, AccessResponse, GrantType};

pub(super) fn validate(access: &mut AccessRequest) -> AuthResult<()> {
    let request = &mut access.request;
    require_grant(request, GrantType::Implicit)?;
    if !request.client.allows_response_type("token") {
        return Err(AuthError::unauthorized_client(format!(
            "client '{}' may not use the 'token' response type",
            request.client.id
        )));
    }
    require_requested_allowed(request)
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
