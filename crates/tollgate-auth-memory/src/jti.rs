//! JTI blacklist table.

use async_trait::async_trait;
use time::OffsetDateTime;

use tollgate_auth::AuthResult;
use tollgate_auth::context::RequestContext;
use tollgate_auth::error::AuthError;
use tollgate_auth::storage::JtiStorage;
use tollgate_auth::types::BlacklistedJti;

use crate::storage::MemoryAuthStorage;

#[async_trait]
impl JtiStorage for MemoryAuthStorage {
    async fn find_jti(
        &self,
        ctx: &RequestContext,
        signature: &str,
    ) -> AuthResult<Option<BlacklistedJti>> {
        let key = (ctx.nid(), signature.to_string());
        self.with_state(ctx, |state| Ok(state.jtis.get(&key).cloned()))
            .await
    }

    async fn insert_jti(&self, ctx: &RequestContext, entry: &BlacklistedJti) -> AuthResult<()> {
        let key = (ctx.nid(), entry.signature.clone());
        self.with_state(ctx, |state| {
            if state.jtis.contains_key(&key) {
                return Err(AuthError::jti_known("JTI has already been used"));
            }
            state.jtis.insert(key, entry.clone());
            Ok(())
        })
        .await
    }

    async fn delete_expired_jtis(
        &self,
        ctx: &RequestContext,
        now: OffsetDateTime,
    ) -> AuthResult<u64> {
        let nid = ctx.nid();
        self.with_state(ctx, |state| {
            let before = state.jtis.len();
            state
                .jtis
                .retain(|(row_nid, _), entry| *row_nid != nid || entry.is_active(now));
            Ok((before - state.jtis.len()) as u64)
        })
        .await
    }
}
