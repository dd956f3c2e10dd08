//! Authorization flow and login session tables.

use async_trait::async_trait;
use time::OffsetDateTime;

use tollgate_auth::AuthResult;
use tollgate_auth::context::{NetworkId, RequestContext};
use tollgate_auth::error::AuthError;
use tollgate_auth::storage::{FlowStorage, LoginSessionStorage};
use tollgate_auth::types::{Flow, FlowState, LoginSession};

use crate::storage::{Key, MemoryAuthStorage, MemoryState, select_keys};

fn find_by<'a>(
    state: &'a MemoryState,
    nid: NetworkId,
    matches: impl Fn(&Flow) -> bool,
) -> Option<&'a Flow> {
    state
        .flows
        .iter()
        .find(|((row_nid, _), flow)| *row_nid == nid && matches(flow))
        .map(|(_, flow)| flow)
}

/// Rejects a flow whose unique values collide with another flow.
fn check_unique(state: &MemoryState, nid: NetworkId, flow: &Flow) -> AuthResult<()> {
    let collides = find_by(state, nid, |other| {
        other.login_challenge != flow.login_challenge
            && (other.login_verifier == flow.login_verifier
                || (flow.consent_challenge.is_some()
                    && other.consent_challenge == flow.consent_challenge)
                || (flow.consent_verifier.is_some()
                    && other.consent_verifier == flow.consent_verifier))
    });
    match collides {
        Some(_) => Err(AuthError::conflict("flow challenge or verifier already exists")),
        None => Ok(()),
    }
}

#[async_trait]
impl FlowStorage for MemoryAuthStorage {
    async fn create_flow(&self, ctx: &RequestContext, flow: &Flow) -> AuthResult<()> {
        let nid = ctx.nid();
        let key = (nid, flow.login_challenge.clone());
        self.with_state(ctx, |state| {
            if state.flows.contains_key(&key) {
                return Err(AuthError::conflict("login challenge already exists"));
            }
            check_unique(state, nid, flow)?;
            state.flows.insert(key, flow.clone());
            Ok(())
        })
        .await
    }

    async fn find_flow(
        &self,
        ctx: &RequestContext,
        login_challenge: &str,
    ) -> AuthResult<Option<Flow>> {
        let key = (ctx.nid(), login_challenge.to_string());
        self.with_state(ctx, |state| Ok(state.flows.get(&key).cloned()))
            .await
    }

    async fn find_flow_by_consent_challenge(
        &self,
        ctx: &RequestContext,
        consent_challenge: &str,
    ) -> AuthResult<Option<Flow>> {
        let nid = ctx.nid();
        self.with_state(ctx, |state| {
            Ok(find_by(state, nid, |flow| {
                flow.consent_challenge.as_deref() == Some(consent_challenge)
            })
            .cloned())
        })
        .await
    }

    async fn find_flow_by_login_verifier(
        &self,
        ctx: &RequestContext,
        verifier: &str,
    ) -> AuthResult<Option<Flow>> {
        let nid = ctx.nid();
        self.with_state(ctx, |state| {
            Ok(find_by(state, nid, |flow| flow.login_verifier == verifier).cloned())
        })
        .await
    }

    async fn find_flow_by_consent_verifier(
        &self,
        ctx: &RequestContext,
        verifier: &str,
    ) -> AuthResult<Option<Flow>> {
        let nid = ctx.nid();
        self.with_state(ctx, |state| {
            Ok(find_by(state, nid, |flow| {
                flow.consent_verifier.as_deref() == Some(verifier)
            })
            .cloned())
        })
        .await
    }

    async fn update_flow(
        &self,
        ctx: &RequestContext,
        flow: &Flow,
        expected: FlowState,
    ) -> AuthResult<bool> {
        let nid = ctx.nid();
        let key = (nid, flow.login_challenge.clone());
        self.with_state(ctx, |state| {
            match state.flows.get(&key) {
                Some(current) if current.state == expected => {}
                _ => return Ok(false),
            }
            check_unique(state, nid, flow)?;
            state.flows.insert(key, flow.clone());
            Ok(true)
        })
        .await
    }

    async fn find_remembered_consents(
        &self,
        ctx: &RequestContext,
        client_id: &str,
        subject: &str,
    ) -> AuthResult<Vec<Flow>> {
        let nid = ctx.nid();
        self.with_state(ctx, |state| {
            let mut flows: Vec<Flow> = state
                .flows
                .iter()
                .filter(|((row_nid, _), flow)| {
                    *row_nid == nid
                        && flow.client_id == client_id
                        && flow.subject == subject
                        && flow.consent_remember
                        && flow.consent_error.is_none()
                        && matches!(flow.state, FlowState::ConsentUnused | FlowState::ConsentUsed)
                })
                .map(|(_, flow)| flow.clone())
                .collect();
            flows.sort_by(|a, b| b.consent_handled_at.cmp(&a.consent_handled_at));
            Ok(flows)
        })
        .await
    }

    async fn find_consent_challenges_by_subject(
        &self,
        ctx: &RequestContext,
        subject: &str,
        client_id: Option<&str>,
    ) -> AuthResult<Vec<String>> {
        let nid = ctx.nid();
        self.with_state(ctx, |state| {
            let mut challenges: Vec<String> = state
                .flows
                .iter()
                .filter(|((row_nid, _), flow)| {
                    *row_nid == nid
                        && flow.subject == subject
                        && client_id.is_none_or(|id| flow.client_id == id)
                })
                .filter_map(|(_, flow)| flow.consent_challenge.clone())
                .collect();
            challenges.sort();
            Ok(challenges)
        })
        .await
    }

    async fn delete_flows_by_consent_challenges(
        &self,
        ctx: &RequestContext,
        consent_challenges: &[String],
    ) -> AuthResult<u64> {
        let nid = ctx.nid();
        self.with_state(ctx, |state| {
            let before = state.flows.len();
            state.flows.retain(|(row_nid, _), flow| {
                !(*row_nid == nid
                    && flow
                        .consent_challenge
                        .as_ref()
                        .is_some_and(|c| consent_challenges.contains(c)))
            });
            Ok((before - state.flows.len()) as u64)
        })
        .await
    }

    async fn flush_flows(
        &self,
        ctx: &RequestContext,
        not_after: OffsetDateTime,
        limit: usize,
        batch_size: usize,
    ) -> AuthResult<u64> {
        let nid = ctx.nid();
        self.with_state(ctx, |state| {
            let keys: Vec<Key> = select_keys(state.flows.iter(), nid, limit, |flow| {
                (flow.state != FlowState::ConsentUsed || flow.has_error())
                    && flow.requested_at < not_after
            });
            let mut deleted = 0;
            for batch in keys.chunks(batch_size.max(1)) {
                for key in batch {
                    if state.flows.remove(key).is_some() {
                        deleted += 1;
                    }
                }
            }
            Ok(deleted)
        })
        .await
    }
}

#[async_trait]
impl LoginSessionStorage for MemoryAuthStorage {
    async fn upsert_login_session(
        &self,
        ctx: &RequestContext,
        session: &LoginSession,
    ) -> AuthResult<()> {
        let key = (ctx.nid(), session.id.clone());
        self.with_state(ctx, |state| {
            state.login_sessions.insert(key, session.clone());
            Ok(())
        })
        .await
    }

    async fn find_login_session(
        &self,
        ctx: &RequestContext,
        id: &str,
    ) -> AuthResult<Option<LoginSession>> {
        let key = (ctx.nid(), id.to_string());
        self.with_state(ctx, |state| Ok(state.login_sessions.get(&key).cloned()))
            .await
    }

    async fn delete_login_session(
        &self,
        ctx: &RequestContext,
        id: &str,
    ) -> AuthResult<Option<LoginSession>> {
        let key = (ctx.nid(), id.to_string());
        self.with_state(ctx, |state| Ok(state.login_sessions.remove(&key)))
            .await
    }

    async fn delete_login_sessions_by_subject(
        &self,
        ctx: &RequestContext,
        subject: &str,
    ) -> AuthResult<u64> {
        let nid = ctx.nid();
        self.with_state(ctx, |state| {
            let before = state.login_sessions.len();
            state
                .login_sessions
                .retain(|(row_nid, _), session| !(*row_nid == nid && session.subject == subject));
            Ok((before - state.login_sessions.len()) as u64)
        })
        .await
    }
}
