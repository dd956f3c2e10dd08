//! Authorization flow persistence.

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::AuthResult;
use crate::context::RequestContext;
use crate::types::{Flow, FlowState};

/// Storage for the login/consent flow aggregate.
///
/// Login challenge, login verifier, consent challenge and consent verifier
/// are each unique within a network.
#[async_trait]
pub trait FlowStorage: Send + Sync {
    /// Inserts a new flow.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the login challenge already exists.
    async fn create_flow(&self, ctx: &RequestContext, flow: &Flow) -> AuthResult<()>;

    /// Looks up a flow by login challenge.
    async fn find_flow(&self, ctx: &RequestContext, login_challenge: &str)
    -> AuthResult<Option<Flow>>;

    /// Looks up a flow by consent challenge.
    async fn find_flow_by_consent_challenge(
        &self,
        ctx: &RequestContext,
        consent_challenge: &str,
    ) -> AuthResult<Option<Flow>>;

    /// Looks up a flow by login verifier.
    async fn find_flow_by_login_verifier(
        &self,
        ctx: &RequestContext,
        verifier: &str,
    ) -> AuthResult<Option<Flow>>;

    /// Looks up a flow by consent verifier.
    async fn find_flow_by_consent_verifier(
        &self,
        ctx: &RequestContext,
        verifier: &str,
    ) -> AuthResult<Option<Flow>>;

    /// Replaces a flow if its stored state still equals `expected`.
    ///
    /// Returns `false` if another request moved the flow first.
    async fn update_flow(
        &self,
        ctx: &RequestContext,
        flow: &Flow,
        expected: FlowState,
    ) -> AuthResult<bool>;

    /// Flows of `subject` and `client_id` whose consent was remembered and
    /// not denied, newest consent first.
    async fn find_remembered_consents(
        &self,
        ctx: &RequestContext,
        client_id: &str,
        subject: &str,
    ) -> AuthResult<Vec<Flow>>;

    /// Consent challenges issued to a subject, optionally for one client.
    async fn find_consent_challenges_by_subject(
        &self,
        ctx: &RequestContext,
        subject: &str,
        client_id: Option<&str>,
    ) -> AuthResult<Vec<String>>;

    /// Deletes the flows holding any of the consent challenges.
    async fn delete_flows_by_consent_challenges(
        &self,
        ctx: &RequestContext,
        consent_challenges: &[String],
    ) -> AuthResult<u64>;

    /// Deletes unfinished or denied flows requested before `not_after`,
    /// ordered by login challenge.
    async fn flush_flows(
        &self,
        ctx: &RequestContext,
        not_after: OffsetDateTime,
        limit: usize,
        batch_size: usize,
    ) -> AuthResult<u64>;
}
