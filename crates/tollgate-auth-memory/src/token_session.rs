//! Token session tables.

use async_trait::async_trait;
use time::OffsetDateTime;

use tollgate_auth::AuthResult;
use tollgate_auth::context::RequestContext;
use tollgate_auth::error::AuthError;
use tollgate_auth::storage::{TokenSessionRow, TokenSessionStorage};
use tollgate_auth::types::SessionKind;

use crate::storage::{MemoryAuthStorage, select_keys};

#[async_trait]
impl TokenSessionStorage for MemoryAuthStorage {
    async fn create_token_session(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        row: TokenSessionRow,
    ) -> AuthResult<()> {
        let key = (ctx.nid(), row.signature.clone());
        self.with_state(ctx, |state| {
            let table = state.tokens(kind);
            if table.contains_key(&key) {
                return Err(AuthError::conflict(format!("{kind} session already exists")));
            }
            table.insert(key, row);
            Ok(())
        })
        .await
    }

    async fn find_token_session(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        signature: &str,
    ) -> AuthResult<Option<TokenSessionRow>> {
        let key = (ctx.nid(), signature.to_string());
        self.with_state(ctx, |state| Ok(state.tokens(kind).get(&key).cloned()))
            .await
    }

    async fn deactivate_token_session(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        signature: &str,
    ) -> AuthResult<u64> {
        let key = (ctx.nid(), signature.to_string());
        self.with_state(ctx, |state| {
            Ok(match state.tokens(kind).get_mut(&key) {
                Some(row) if row.active => {
                    row.active = false;
                    1
                }
                _ => 0,
            })
        })
        .await
    }

    async fn deactivate_token_sessions_by_request_id(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        request_id: &str,
    ) -> AuthResult<u64> {
        let nid = ctx.nid();
        self.with_state(ctx, |state| {
            let mut count = 0;
            for ((row_nid, _), row) in state.tokens(kind).iter_mut() {
                if *row_nid == nid && row.request_id == request_id && row.active {
                    row.active = false;
                    count += 1;
                }
            }
            Ok(count)
        })
        .await
    }

    async fn delete_token_session(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        signature: &str,
    ) -> AuthResult<u64> {
        let key = (ctx.nid(), signature.to_string());
        self.with_state(ctx, |state| Ok(u64::from(state.tokens(kind).remove(&key).is_some())))
            .await
    }

    async fn delete_token_sessions_by_request_id(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        request_id: &str,
    ) -> AuthResult<u64> {
        let nid = ctx.nid();
        self.with_state(ctx, |state| {
            let table = state.tokens(kind);
            let before = table.len();
            table.retain(|(row_nid, _), row| !(*row_nid == nid && row.request_id == request_id));
            Ok((before - table.len()) as u64)
        })
        .await
    }

    async fn delete_token_sessions_by_client(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        client_id: &str,
    ) -> AuthResult<u64> {
        let nid = ctx.nid();
        self.with_state(ctx, |state| {
            let table = state.tokens(kind);
            let before = table.len();
            table.retain(|(row_nid, _), row| !(*row_nid == nid && row.client_id == client_id));
            Ok((before - table.len()) as u64)
        })
        .await
    }

    async fn flush_token_sessions(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        not_after: OffsetDateTime,
        limit: usize,
        batch_size: usize,
    ) -> AuthResult<u64> {
        let nid = ctx.nid();
        self.with_state(ctx, |state| {
            let table = state.tokens(kind);
            let keys = select_keys(table.iter(), nid, limit, |row| {
                row.requested_at < not_after
            });
            let mut deleted = 0;
            for batch in keys.chunks(batch_size.max(1)) {
                for key in batch {
                    if table.remove(key).is_some() {
                        deleted += 1;
                    }
                }
            }
            Ok(deleted)
        })
        .await
    }

    async fn claim_refresh_token_grace(
        &self,
        ctx: &RequestContext,
        signature: &str,
        used_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> AuthResult<bool> {
        let key = (ctx.nid(), signature.to_string());
        self.with_state(ctx, |state| {
            let row = state
                .tokens(SessionKind::Refresh)
                .get_mut(&key)
                .ok_or_else(|| AuthError::not_found("refresh session"))?;
            if row.first_used_at.is_some() {
                return Ok(false);
            }
            row.first_used_at = Some(used_at);
            row.expires_at = Some(expires_at);
            row.active = false;
            Ok(true)
        })
        .await
    }

    async fn retire_refresh_token(
        &self,
        ctx: &RequestContext,
        signature: &str,
        used_at: OffsetDateTime,
    ) -> AuthResult<Option<String>> {
        let key = (ctx.nid(), signature.to_string());
        self.with_state(ctx, |state| {
            let row = state
                .tokens(SessionKind::Refresh)
                .get_mut(&key)
                .ok_or_else(|| AuthError::not_found("refresh session"))?;
            row.active = false;
            row.first_used_at.get_or_insert(used_at);
            Ok(row.access_token_signature.clone())
        })
        .await
    }
}
