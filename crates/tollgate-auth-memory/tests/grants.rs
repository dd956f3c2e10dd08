//! Token endpoint grants end to end against the in-memory store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tollgate_auth::pkce::{PkceChallenge, PkceChallengeMethod, PkceVerifier};
use tollgate_auth::prelude::*;
use tollgate_auth::storage::TokenSessionStorage;
use tollgate_auth_memory::MemoryResourceOwners;

use common::*;

// =============================================================================
// Authorization code
// =============================================================================

#[tokio::test]
async fn test_authorization_code_with_pkce() {
    let h = harness();
    let ctx = ctx();

    let verifier = PkceVerifier::generate();
    let challenge = PkceChallenge::from_verifier(&verifier, PkceChallengeMethod::S256);
    let mut request = authorize_request(web_client(), "alice", &["openid", "offline"]);
    request.form.set("code_challenge", challenge.as_str());
    request.form.set("code_challenge_method", "S256");
    let code = h
        .engine
        .issue_authorization_code(&ctx, &mut request)
        .await
        .unwrap();

    let params = [("code", code.as_str()), ("redirect_uri", REDIRECT_URI)];
    let err = h
        .engine
        .handle_token_request(&ctx, token_request(GrantType::AuthorizationCode, web_client(), &params))
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "invalid_grant");

    let wrong = PkceVerifier::generate();
    let err = h
        .engine
        .handle_token_request(
            &ctx,
            token_request(
                GrantType::AuthorizationCode,
                web_client(),
                &[
                    ("code", code.as_str()),
                    ("redirect_uri", REDIRECT_URI),
                    ("code_verifier", wrong.as_str()),
                ],
            ),
        )
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "invalid_grant");

    let response = h
        .engine
        .handle_token_request(
            &ctx,
            token_request(
                GrantType::AuthorizationCode,
                web_client(),
                &[
                    ("code", code.as_str()),
                    ("redirect_uri", REDIRECT_URI),
                    ("code_verifier", verifier.as_str()),
                ],
            ),
        )
        .await
        .unwrap();

    assert!(response.access_token.starts_with("tg_at_"));
    assert!(response.refresh_token.is_some());
    assert_eq!(response.scope.as_deref(), Some("openid offline"));
    assert_eq!(response.expires_in, 3600);

    let session = h.access_session(&ctx, &response.access_token).await.unwrap();
    assert_eq!(session.session.subject, "alice");
    assert_eq!(session.client.id, "web");
}

#[tokio::test]
async fn test_authorization_code_redirect_uri_must_match() {
    let h = harness();
    let ctx = ctx();
    let mut request = authorize_request(web_client(), "alice", &["photos"]);
    let code = h
        .engine
        .issue_authorization_code(&ctx, &mut request)
        .await
        .unwrap();

    let err = h
        .engine
        .handle_token_request(
            &ctx,
            token_request(
                GrantType::AuthorizationCode,
                web_client(),
                &[("code", code.as_str()), ("redirect_uri", "https://evil.example.com/cb")],
            ),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidGrant { .. }));
}

#[tokio::test]
async fn test_authorization_code_replay_revokes_tokens() {
    let h = harness();
    let ctx = ctx();
    let mut request = authorize_request(web_client(), "alice", &["offline"]);
    let code = h
        .engine
        .issue_authorization_code(&ctx, &mut request)
        .await
        .unwrap();
    let params = [("code", code.as_str()), ("redirect_uri", REDIRECT_URI)];

    let response = h
        .engine
        .handle_token_request(&ctx, token_request(GrantType::AuthorizationCode, web_client(), &params))
        .await
        .unwrap();
    let refresh_token = response.refresh_token.clone().unwrap();
    h.access_session(&ctx, &response.access_token).await.unwrap();

    let err = h
        .engine
        .handle_token_request(&ctx, token_request(GrantType::AuthorizationCode, web_client(), &params))
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "invalid_grant");

    assert!(
        h.access_session(&ctx, &response.access_token)
            .await
            .unwrap_err()
            .is_not_found()
    );
    assert!(
        h.refresh_session(&ctx, &refresh_token)
            .await
            .unwrap_err()
            .is_inactive()
    );
}

#[tokio::test]
async fn test_expired_authorization_code() {
    let h = harness();
    let ctx = ctx();
    let mut request = authorize_request(web_client(), "alice", &["photos"]);
    let expired = time::OffsetDateTime::now_utc() - time::Duration::minutes(1);
    request.session.set_expires_at(TokenType::AuthorizeCode, expired);
    let (code, signature) = h.strategy.generate(TokenType::AuthorizeCode, &request).unwrap();
    h.engine
        .sessions()
        .create(&ctx, SessionKind::Code, &signature, &request)
        .await
        .unwrap();

    let err = h
        .engine
        .handle_token_request(
            &ctx,
            token_request(
                GrantType::AuthorizationCode,
                web_client(),
                &[("code", code.as_str()), ("redirect_uri", REDIRECT_URI)],
            ),
        )
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "invalid_grant");
}

#[tokio::test]
async fn test_concurrent_code_redemption_issues_once() {
    let h = harness();
    let ctx = ctx();
    let mut request = authorize_request(web_client(), "alice", &["photos"]);
    let code = h
        .engine
        .issue_authorization_code(&ctx, &mut request)
        .await
        .unwrap();
    let params = [("code", code.as_str()), ("redirect_uri", REDIRECT_URI)];

    let (first, second) = tokio::join!(
        h.engine
            .handle_token_request(&ctx, token_request(GrantType::AuthorizationCode, web_client(), &params)),
        h.engine
            .handle_token_request(&ctx, token_request(GrantType::AuthorizationCode, web_client(), &params)),
    );
    assert_eq!(
        [first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(),
        1
    );
}

#[tokio::test]
async fn test_sessions_are_tenant_scoped() {
    let h = harness();
    let tenant_a = ctx();
    let tenant_b = ctx();

    let response = h
        .code_exchange(&tenant_a, authorize_request(web_client(), "alice", &["photos"]))
        .await;

    assert!(
        h.access_session(&tenant_b, &response.access_token)
            .await
            .unwrap_err()
            .is_not_found()
    );
    let session = h.access_session(&tenant_a, &response.access_token).await.unwrap();
    assert_eq!(session.session.subject, "alice");
}

// =============================================================================
// Implicit
// =============================================================================

#[tokio::test]
async fn test_implicit_is_authorize_endpoint_only() {
    let h = harness();
    let ctx = ctx();

    let mut request = Request::new(web_client(), Session::new("alice"));
    request.form.set("response_type", "token");
    request.form.set("scope", "photos.read");
    let response = h.engine.authorize_implicit(&ctx, request).await.unwrap();
    assert_eq!(response.scope.as_deref(), None);
    assert!(response.refresh_token.is_none());
    h.access_session(&ctx, &response.access_token).await.unwrap();

    let err = h
        .engine
        .handle_token_request(&ctx, token_request(GrantType::Implicit, web_client(), &[]))
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "unsupported_grant_type");
}

// =============================================================================
// Client credentials
// =============================================================================

#[tokio::test]
async fn test_client_credentials() {
    let h = harness();
    let ctx = ctx();

    let response = h
        .engine
        .handle_token_request(
            &ctx,
            token_request(
                GrantType::ClientCredentials,
                service_client(),
                &[("scope", "photos.read"), ("audience", "https://api.example.com")],
            ),
        )
        .await
        .unwrap();
    assert_eq!(response.scope.as_deref(), Some("photos.read"));
    assert!(response.refresh_token.is_none());

    let session = h.access_session(&ctx, &response.access_token).await.unwrap();
    assert_eq!(session.granted_audience, vec!["https://api.example.com"]);
    assert!(session.session.subject.is_empty());

    let err = h
        .engine
        .handle_token_request(
            &ctx,
            token_request(GrantType::ClientCredentials, service_client(), &[("scope", "admin")]),
        )
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "invalid_scope");
}

#[tokio::test]
async fn test_client_credentials_rejects_public_clients() {
    let h = harness();
    let mut public = service_client();
    public.public = true;

    let err = h
        .engine
        .handle_token_request(&ctx(), token_request(GrantType::ClientCredentials, public, &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidClient { .. }));
}

// =============================================================================
// Refresh token
// =============================================================================

#[tokio::test]
async fn test_strict_refresh_rotation() {
    let h = harness();
    let ctx = ctx();
    let first = h
        .code_exchange(&ctx, authorize_request(web_client(), "alice", &["offline", "photos"]))
        .await;
    let refresh_1 = first.refresh_token.clone().unwrap();

    let second = h.refresh(&ctx, web_client(), &refresh_1).await.unwrap();
    let refresh_2 = second.refresh_token.clone().unwrap();
    assert_ne!(refresh_1, refresh_2);
    assert_eq!(second.scope.as_deref(), Some("offline photos"));

    assert!(h.access_session(&ctx, &first.access_token).await.unwrap_err().is_not_found());
    assert!(h.refresh_session(&ctx, &refresh_1).await.unwrap_err().is_inactive());
    let session = h.access_session(&ctx, &second.access_token).await.unwrap();
    assert_eq!(session.session.subject, "alice");

    // Reuse of a rotated token revokes the whole grant.
    let err = h.refresh(&ctx, web_client(), &refresh_1).await.unwrap_err();
    assert_eq!(err.oauth_error_code(), "invalid_grant");
    assert!(h.access_session(&ctx, &second.access_token).await.unwrap_err().is_not_found());
    assert!(h.refresh_session(&ctx, &refresh_2).await.unwrap_err().is_inactive());
}

#[tokio::test]
async fn test_refresh_requires_same_client() {
    let h = harness();
    let ctx = ctx();
    let first = h
        .code_exchange(&ctx, authorize_request(web_client(), "alice", &["offline"]))
        .await;

    let err = h
        .refresh(&ctx, service_client(), first.refresh_token.as_deref().unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "invalid_grant");
}

#[tokio::test]
async fn test_refresh_without_offline_scope_is_not_issued() {
    let h = harness();
    let response = h
        .code_exchange(&ctx(), authorize_request(web_client(), "alice", &["photos"]))
        .await;
    assert!(response.refresh_token.is_none());
}

#[tokio::test]
async fn test_graceful_refresh_rotation() {
    let h = harness_with(grace_config(Duration::from_secs(30)), None);
    let ctx = ctx();
    let first = h
        .code_exchange(&ctx, authorize_request(web_client(), "alice", &["offline"]))
        .await;
    let refresh_1 = first.refresh_token.clone().unwrap();

    let second = h.refresh(&ctx, web_client(), &refresh_1).await.unwrap();
    let third = h.refresh(&ctx, web_client(), &refresh_1).await.unwrap();

    assert!(h.access_session(&ctx, &first.access_token).await.unwrap_err().is_not_found());
    h.access_session(&ctx, &second.access_token).await.unwrap();
    h.access_session(&ctx, &third.access_token).await.unwrap();
    h.refresh_session(&ctx, &refresh_1).await.unwrap();
}

#[tokio::test]
async fn test_grace_period_opens_once() {
    let h = harness_with(grace_config(Duration::from_secs(60)), None);
    let ctx = ctx();
    let response = h
        .code_exchange(&ctx, authorize_request(web_client(), "alice", &["offline"]))
        .await;
    let refresh_token = response.refresh_token.unwrap();
    let signature = h.signature(TokenType::RefreshToken, &refresh_token);
    let request_id = h.refresh_session(&ctx, &refresh_token).await.unwrap().id;

    h.engine
        .rotation()
        .revoke_with_grace_period(&ctx, &request_id, &signature)
        .await
        .unwrap();
    let claimed = h
        .storage
        .find_token_session(&ctx, SessionKind::Refresh, &signature)
        .await
        .unwrap()
        .unwrap();
    assert!(!claimed.active);
    assert!(claimed.first_used_at.is_some());

    h.engine
        .rotation()
        .revoke_with_grace_period(&ctx, &request_id, &signature)
        .await
        .unwrap();
    let again = h
        .storage
        .find_token_session(&ctx, SessionKind::Refresh, &signature)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.expires_at, claimed.expires_at);
    assert_eq!(again.first_used_at, claimed.first_used_at);

    // Still usable inside the window.
    h.refresh_session(&ctx, &refresh_token).await.unwrap();

    let err = h
        .engine
        .rotation()
        .revoke_with_grace_period(&ctx, &request_id, "unknown-signature")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

// =============================================================================
// Password
// =============================================================================

fn owners() -> Arc<MemoryResourceOwners> {
    let owners = MemoryResourceOwners::new();
    owners.add("alice", "correct horse", "user-1").unwrap();
    Arc::new(owners)
}

#[tokio::test]
async fn test_password_grant() {
    let h = harness_with(config(), Some(owners()));
    let ctx = ctx();

    let response = h
        .engine
        .handle_token_request(
            &ctx,
            token_request(
                GrantType::Password,
                password_client(),
                &[
                    ("username", "alice"),
                    ("password", "correct horse"),
                    ("scope", "offline photos"),
                ],
            ),
        )
        .await
        .unwrap();
    assert!(response.refresh_token.is_some());

    let session = h.access_session(&ctx, &response.access_token).await.unwrap();
    assert_eq!(session.session.subject, "user-1");
    assert_eq!(session.session.username, "alice");
    assert_eq!(session.form.get("password"), None);
    assert_eq!(session.form.get("username"), Some("alice"));

    for (username, password) in [("alice", "wrong"), ("mallory", "correct horse")] {
        let err = h
            .engine
            .handle_token_request(
                &ctx,
                token_request(
                    GrantType::Password,
                    password_client(),
                    &[("username", username), ("password", password)],
                ),
            )
            .await
            .unwrap_err();
        assert_eq!(err.oauth_error_code(), "invalid_grant");
    }
}

#[tokio::test]
async fn test_password_grant_without_authenticator() {
    let h = harness();
    let err = h
        .engine
        .handle_token_request(
            &ctx(),
            token_request(
                GrantType::Password,
                password_client(),
                &[("username", "alice"), ("password", "correct horse")],
            ),
        )
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "unsupported_grant_type");
}

#[tokio::test]
async fn test_unknown_grant_type() {
    let h = harness();
    let request = AccessRequest::new(
        "urn:example:saml",
        Request::new(web_client(), Session::default()),
    );
    let err = h.engine.handle_token_request(&ctx(), request).await.unwrap_err();
    assert_eq!(err.oauth_error_code(), "unsupported_grant_type");
}
