//! Login and consent challenges against the in-memory store.

mod common;

use tollgate_auth::challenge::apply_consent;
use tollgate_auth::prelude::*;
use tollgate_auth::types::{LoginSession, RequestDenied};

use common::*;

const REQUEST_URL: &str = "https://auth.example.com/oauth2/auth?client_id=web";

async fn start(h: &Harness, ctx: &RequestContext) -> Flow {
    h.engine
        .challenges()
        .create_flow(
            ctx,
            "web",
            vec!["openid".into(), "offline".into()],
            vec![],
            REQUEST_URL,
        )
        .await
        .unwrap()
}

/// Drives a flow to `ConsentUsed` with the given consent decision.
async fn complete(h: &Harness, ctx: &RequestContext, consent: HandledConsent) -> Flow {
    let challenges = h.engine.challenges();
    let flow = start(h, ctx).await;
    challenges
        .handle_login(ctx, &flow.login_challenge, HandledLogin::accept("alice"))
        .await
        .unwrap();
    challenges
        .verify_and_invalidate_login(ctx, &flow.login_verifier)
        .await
        .unwrap();
    let flow = challenges
        .create_consent_request(ctx, &flow.login_challenge)
        .await
        .unwrap();
    let consent_challenge = flow.consent_challenge.clone().unwrap();
    let flow = challenges
        .handle_consent(ctx, &consent_challenge, consent)
        .await
        .unwrap();
    challenges
        .verify_and_invalidate_consent(ctx, flow.consent_verifier.as_deref().unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_full_flow_issues_tokens() {
    let h = harness();
    let ctx = ctx();

    let flow = complete(
        &h,
        &ctx,
        HandledConsent::grant(vec!["openid".into(), "offline".into()], vec![]),
    )
    .await;
    assert_eq!(flow.state, FlowState::ConsentUsed);
    assert_eq!(flow.subject, "alice");

    let mut request = authorize_request(web_client(), "", &[]);
    apply_consent(&flow, &mut request).unwrap();
    let response = h.code_exchange(&ctx, request).await;

    let session = h.access_session(&ctx, &response.access_token).await.unwrap();
    assert_eq!(Some(&session.id), flow.consent_challenge.as_ref());
    assert_eq!(session.session.consent_challenge, flow.consent_challenge);
    assert_eq!(session.session.subject, "alice");
}

#[tokio::test]
async fn test_unknown_client_is_invalid_client() {
    let h = harness();
    let err = h
        .engine
        .challenges()
        .create_flow(&ctx(), "nobody", vec![], vec![], REQUEST_URL)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidClient { .. }));
}

#[tokio::test]
async fn test_login_is_handled_once() {
    let h = harness();
    let ctx = ctx();
    let challenges = h.engine.challenges();
    let flow = start(&h, &ctx).await;

    let (first, second) = tokio::join!(
        challenges.handle_login(&ctx, &flow.login_challenge, HandledLogin::accept("alice")),
        challenges.handle_login(&ctx, &flow.login_challenge, HandledLogin::accept("mallory")),
    );
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes.iter().any(|r| matches!(r, Err(e) if e.is_conflict())));

    let stored = challenges
        .get_login_request(&ctx, &flow.login_challenge)
        .await
        .unwrap();
    assert_eq!(stored.state, FlowState::LoginUnused);
}

#[tokio::test]
async fn test_verifiers_are_single_use() {
    let h = harness();
    let ctx = ctx();
    let challenges = h.engine.challenges();
    let flow = start(&h, &ctx).await;

    let err = challenges
        .verify_and_invalidate_login(&ctx, &flow.login_verifier)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidRequest { .. }));

    challenges
        .handle_login(&ctx, &flow.login_challenge, HandledLogin::accept("alice"))
        .await
        .unwrap();
    challenges
        .verify_and_invalidate_login(&ctx, &flow.login_verifier)
        .await
        .unwrap();
    let err = challenges
        .verify_and_invalidate_login(&ctx, &flow.login_verifier)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidRequest { .. }));

    let flow = challenges
        .create_consent_request(&ctx, &flow.login_challenge)
        .await
        .unwrap();
    let consent_challenge = flow.consent_challenge.clone().unwrap();
    let err = challenges
        .create_consent_request(&ctx, &flow.login_challenge)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidRequest { .. }));

    let flow = challenges
        .handle_consent(&ctx, &consent_challenge, HandledConsent::grant(vec![], vec![]))
        .await
        .unwrap();
    let err = challenges
        .handle_consent(&ctx, &consent_challenge, HandledConsent::grant(vec![], vec![]))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let verifier = flow.consent_verifier.unwrap();
    challenges
        .verify_and_invalidate_consent(&ctx, &verifier)
        .await
        .unwrap();
    let err = challenges
        .verify_and_invalidate_consent(&ctx, &verifier)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidRequest { .. }));

    assert!(
        challenges
            .verify_and_invalidate_consent(&ctx, "unknown")
            .await
            .unwrap_err()
            .is_not_found()
    );
}

#[tokio::test]
async fn test_rejected_login_denies_consent() {
    let h = harness();
    let ctx = ctx();
    let challenges = h.engine.challenges();
    let flow = start(&h, &ctx).await;

    let denied = RequestDenied::new("login_required", "bad credentials");
    let flow = challenges
        .handle_login(&ctx, &flow.login_challenge, HandledLogin::reject(denied))
        .await
        .unwrap();
    assert_eq!(flow.state, FlowState::LoginError);

    challenges
        .verify_and_invalidate_login(&ctx, &flow.login_verifier)
        .await
        .unwrap();
    let err = challenges
        .create_consent_request(&ctx, &flow.login_challenge)
        .await
        .unwrap_err();
    assert_eq!(err.oauth_error_code(), "access_denied");
}

#[tokio::test]
async fn test_remembered_login_session() {
    let h = harness();
    let ctx = ctx();
    let challenges = h.engine.challenges();
    let flow = start(&h, &ctx).await;

    let mut login = HandledLogin::accept("alice");
    login.remember = true;
    let flow = challenges
        .handle_login(&ctx, &flow.login_challenge, login)
        .await
        .unwrap();
    let session_id = flow.login_session_id.clone().unwrap();

    let session = challenges
        .get_remembered_login_session(&ctx, &session_id)
        .await
        .unwrap();
    assert_eq!(session.subject, "alice");

    let forgotten = LoginSession::new("bob", false);
    challenges
        .confirm_login_session(&ctx, &forgotten)
        .await
        .unwrap();
    assert!(
        challenges
            .get_remembered_login_session(&ctx, &forgotten.id)
            .await
            .unwrap_err()
            .is_not_found()
    );

    challenges.delete_login_session(&ctx, &forgotten.id).await.unwrap();
    assert!(
        challenges
            .delete_login_session(&ctx, &forgotten.id)
            .await
            .unwrap_err()
            .is_not_found()
    );

    assert_eq!(
        challenges
            .revoke_subject_login_sessions(&ctx, "alice")
            .await
            .unwrap(),
        1
    );
    assert!(
        challenges
            .get_remembered_login_session(&ctx, &session_id)
            .await
            .unwrap_err()
            .is_not_found()
    );
}

#[tokio::test]
async fn test_login_without_remember_records_session() {
    let h = harness();
    let ctx = ctx();
    let challenges = h.engine.challenges();
    let flow = start(&h, &ctx).await;

    let flow = challenges
        .handle_login(&ctx, &flow.login_challenge, HandledLogin::accept("alice"))
        .await
        .unwrap();
    let session_id = flow.login_session_id.clone().unwrap();
    assert!(
        challenges
            .get_remembered_login_session(&ctx, &session_id)
            .await
            .unwrap_err()
            .is_not_found()
    );

    let denied = start(&h, &ctx).await;
    let denied = challenges
        .handle_login(
            &ctx,
            &denied.login_challenge,
            HandledLogin::reject(RequestDenied::new("login_required", "no")),
        )
        .await
        .unwrap();
    assert!(denied.login_session_id.is_none());

    assert_eq!(
        challenges
            .revoke_subject_login_sessions(&ctx, "alice")
            .await
            .unwrap(),
        1
    );
    assert!(
        challenges
            .delete_login_session(&ctx, &session_id)
            .await
            .unwrap_err()
            .is_not_found()
    );
}

#[tokio::test]
async fn test_remembered_consent() {
    let h = harness();
    let ctx = ctx();

    let mut remembered = HandledConsent::grant(vec!["openid".into()], vec![]);
    remembered.remember = true;
    let flow = complete(&h, &ctx, remembered).await;
    complete(&h, &ctx, HandledConsent::grant(vec!["openid".into()], vec![])).await;

    let found = h
        .engine
        .challenges()
        .find_remembered_consent(&ctx, "web", "alice")
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].login_challenge, flow.login_challenge);

    assert!(
        h.engine
            .challenges()
            .find_remembered_consent(&ctx, "web", "bob")
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_revoke_consent_sessions() {
    let h = harness();
    let ctx = ctx();

    let flow = complete(
        &h,
        &ctx,
        HandledConsent::grant(vec!["openid".into(), "offline".into()], vec![]),
    )
    .await;
    let mut request = authorize_request(web_client(), "", &[]);
    apply_consent(&flow, &mut request).unwrap();
    let response = h.code_exchange(&ctx, request).await;

    let deleted = h
        .engine
        .challenges()
        .revoke_subject_consent_sessions(&ctx, "alice", Some("web"))
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    assert!(h.access_session(&ctx, &response.access_token).await.unwrap_err().is_not_found());
    assert!(
        h.refresh_session(&ctx, response.refresh_token.as_deref().unwrap())
            .await
            .unwrap_err()
            .is_not_found()
    );
    assert!(
        h.engine
            .challenges()
            .get_login_request(&ctx, &flow.login_challenge)
            .await
            .unwrap_err()
            .is_not_found()
    );
}
