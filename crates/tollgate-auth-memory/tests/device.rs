//! RFC 8628 device authorization against the in-memory store.

mod common;

use time::{Duration, OffsetDateTime};
use tollgate_auth::prelude::*;

use common::*;

fn device_request(scope: &str) -> Request {
    let mut request = Request::new(device_client(), Session::default());
    request.form.set("scope", scope);
    request
}

async fn poll(h: &Harness, ctx: &RequestContext, device_code: &str) -> AuthResult<AccessResponse> {
    h.engine
        .handle_token_request(
            ctx,
            token_request(GrantType::DeviceCode, device_client(), &[("device_code", device_code)]),
        )
        .await
}

#[tokio::test]
async fn test_device_flow() {
    let h = harness();
    let ctx = ctx();

    let authorization = h
        .engine
        .authorize_device(&ctx, device_request("offline photos"))
        .await
        .unwrap();
    assert!(authorization.device_code.starts_with("tg_dc_"));
    assert_eq!(authorization.user_code.len(), 8);
    assert_eq!(authorization.expires_in, 15 * 60);
    assert_eq!(authorization.interval, 5);
    assert!(
        authorization
            .verification_uri_complete
            .ends_with(&format!("?user_code={}", authorization.user_code))
    );

    let err = poll(&h, &ctx, &authorization.device_code).await.unwrap_err();
    assert!(matches!(err, AuthError::AuthorizationPending));
    assert_eq!(err.oauth_error_code(), "authorization_pending");

    let user_signature = h.signature(TokenType::UserCode, &authorization.user_code);
    let pending = h
        .engine
        .devices()
        .get_user_code_session(&ctx, &user_signature)
        .await
        .unwrap();
    assert_eq!(pending.user_code_state, UserCodeState::Unused);
    assert_eq!(pending.request.requested_scope, vec!["offline", "photos"]);

    let approved = h
        .engine
        .devices()
        .approve_user_code(
            &ctx,
            &user_signature,
            &["offline".to_string(), "photos".to_string()],
            &[],
            "alice",
            None,
        )
        .await
        .unwrap();
    assert_eq!(approved.user_code_state, UserCodeState::Used);

    let err = h
        .engine
        .devices()
        .get_user_code_session(&ctx, &user_signature)
        .await
        .unwrap_err();
    assert!(err.is_inactive());
    assert_eq!(
        err.inactive_device_request().map(|d| d.user_code_state),
        Some(UserCodeState::Used)
    );

    let response = poll(&h, &ctx, &authorization.device_code).await.unwrap();
    assert!(response.refresh_token.is_some());
    let session = h.access_session(&ctx, &response.access_token).await.unwrap();
    assert_eq!(session.session.subject, "alice");
    assert_eq!(session.granted_scope, vec!["offline", "photos"]);

    // A second poll is a replay and revokes what was issued.
    let err = poll(&h, &ctx, &authorization.device_code).await.unwrap_err();
    assert_eq!(err.oauth_error_code(), "invalid_grant");
    assert!(h.access_session(&ctx, &response.access_token).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_denied_device() {
    let h = harness();
    let ctx = ctx();
    let authorization = h
        .engine
        .authorize_device(&ctx, device_request("photos"))
        .await
        .unwrap();
    let user_signature = h.signature(TokenType::UserCode, &authorization.user_code);

    h.engine
        .devices()
        .deny_user_code(&ctx, &user_signature)
        .await
        .unwrap();

    let err = poll(&h, &ctx, &authorization.device_code).await.unwrap_err();
    assert_eq!(err.oauth_error_code(), "access_denied");

    let err = h
        .engine
        .devices()
        .approve_user_code(&ctx, &user_signature, &[], &[], "alice", None)
        .await
        .unwrap_err();
    assert!(err.is_inactive());
}

#[tokio::test]
async fn test_concurrent_approval_decides_once() {
    let h = harness();
    let ctx = ctx();
    let authorization = h
        .engine
        .authorize_device(&ctx, device_request("photos"))
        .await
        .unwrap();
    let user_signature = h.signature(TokenType::UserCode, &authorization.user_code);
    let devices = h.engine.devices();
    let scope = ["photos".to_string()];

    let (approve, deny) = tokio::join!(
        devices.approve_user_code(&ctx, &user_signature, &scope, &[], "alice", None),
        devices.deny_user_code(&ctx, &user_signature),
    );
    assert_eq!(
        [approve.is_ok(), deny.is_ok()].iter().filter(|ok| **ok).count(),
        1
    );

    let device_signature = h.signature(TokenType::DeviceCode, &authorization.device_code);
    let polled = devices
        .get_device_code_session(&ctx, &device_signature)
        .await
        .unwrap();
    let decided = devices
        .get_by_request_id(&ctx, &polled.request.id)
        .await
        .unwrap();
    assert_eq!(decided.user_code_state, polled.user_code_state);
    let expected = if approve.is_ok() {
        UserCodeState::Used
    } else {
        UserCodeState::Rejected
    };
    assert_eq!(decided.user_code_state, expected);
}

#[tokio::test]
async fn test_device_authorization_checks_client() {
    let h = harness();
    let ctx = ctx();

    let mut request = Request::new(web_client(), Session::default());
    request.form.set("scope", "photos");
    let err = h.engine.authorize_device(&ctx, request).await.unwrap_err();
    assert_eq!(err.oauth_error_code(), "unauthorized_client");

    let err = h
        .engine
        .authorize_device(&ctx, device_request("admin"))
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "invalid_scope");
}

#[tokio::test]
async fn test_unknown_user_code() {
    let h = harness();
    let err = h
        .engine
        .devices()
        .get_user_code_session(&ctx(), &h.signature(TokenType::UserCode, "BCDFGHJK"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

/// Stores a device session whose codes expired a few minutes ago.
async fn expired_device_session(h: &Harness, ctx: &RequestContext) -> (String, String) {
    let mut request = device_request("photos");
    request.requested_scope = vec!["photos".into()];
    let expired = OffsetDateTime::now_utc() - Duration::minutes(5);
    request.session.set_expires_at(TokenType::DeviceCode, expired);
    request.session.set_expires_at(TokenType::UserCode, expired);

    let (device_code, device_signature) =
        h.strategy.generate(TokenType::DeviceCode, &request).unwrap();
    let (user_code, user_signature) = h.strategy.generate(TokenType::UserCode, &request).unwrap();
    h.engine
        .devices()
        .create_session(ctx, &device_signature, &user_signature, &request)
        .await
        .unwrap();
    (device_code, user_code)
}

#[tokio::test]
async fn test_expired_user_code_cannot_be_decided() {
    let h = harness();
    let ctx = ctx();
    let (_, user_code) = expired_device_session(&h, &ctx).await;
    let user_signature = h.signature(TokenType::UserCode, &user_code);
    let devices = h.engine.devices();

    let err = devices
        .get_user_code_session(&ctx, &user_signature)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::TokenExpired { .. }));

    let err = devices
        .approve_user_code(&ctx, &user_signature, &["photos".to_string()], &[], "alice", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::TokenExpired { .. }));
    assert!(devices.deny_user_code(&ctx, &user_signature).await.is_err());
}

#[tokio::test]
async fn test_expired_pending_device_code_is_invalid_grant() {
    let h = harness();
    let ctx = ctx();
    let (device_code, _) = expired_device_session(&h, &ctx).await;

    let err = poll(&h, &ctx, &device_code).await.unwrap_err();
    assert_eq!(err.oauth_error_code(), "invalid_grant");
}
