//! Device session table with its user code index.

use async_trait::async_trait;
use time::OffsetDateTime;

use tollgate_auth::AuthResult;
use tollgate_auth::context::RequestContext;
use tollgate_auth::error::AuthError;
use tollgate_auth::storage::{DeviceSessionRow, DeviceSessionStorage, DeviceSessionUpdate};
use tollgate_auth::types::UserCodeState;

use crate::storage::{MemoryAuthStorage, select_keys};

#[async_trait]
impl DeviceSessionStorage for MemoryAuthStorage {
    async fn create_device_session(
        &self,
        ctx: &RequestContext,
        row: DeviceSessionRow,
    ) -> AuthResult<()> {
        let nid = ctx.nid();
        let device_key = (nid, row.device_code_signature.clone());
        let user_key = (nid, row.user_code_signature.clone());
        self.with_state(ctx, |state| {
            if state.user_codes.contains_key(&user_key) {
                return Err(AuthError::existing_user_code_signature(
                    "user code signature already exists",
                ));
            }
            if state.device_sessions.contains_key(&device_key) {
                return Err(AuthError::conflict("device code signature already exists"));
            }
            state
                .user_codes
                .insert(user_key, row.device_code_signature.clone());
            state.device_sessions.insert(device_key, row);
            Ok(())
        })
        .await
    }

    async fn find_device_session_by_device_code(
        &self,
        ctx: &RequestContext,
        device_code_signature: &str,
    ) -> AuthResult<Option<DeviceSessionRow>> {
        let key = (ctx.nid(), device_code_signature.to_string());
        self.with_state(ctx, |state| Ok(state.device_sessions.get(&key).cloned()))
            .await
    }

    async fn find_device_session_by_user_code(
        &self,
        ctx: &RequestContext,
        user_code_signature: &str,
    ) -> AuthResult<Option<DeviceSessionRow>> {
        let nid = ctx.nid();
        let key = (nid, user_code_signature.to_string());
        self.with_state(ctx, |state| {
            Ok(state
                .user_codes
                .get(&key)
                .and_then(|device| state.device_sessions.get(&(nid, device.clone())))
                .cloned())
        })
        .await
    }

    async fn find_device_session_by_request_id(
        &self,
        ctx: &RequestContext,
        request_id: &str,
    ) -> AuthResult<Option<DeviceSessionRow>> {
        let nid = ctx.nid();
        self.with_state(ctx, |state| {
            Ok(state
                .device_sessions
                .iter()
                .find(|((row_nid, _), row)| *row_nid == nid && row.request_id == request_id)
                .map(|(_, row)| row.clone()))
        })
        .await
    }

    async fn update_device_session(
        &self,
        ctx: &RequestContext,
        device_code_signature: &str,
        update: DeviceSessionUpdate,
        expected_state: Option<UserCodeState>,
    ) -> AuthResult<bool> {
        let key = (ctx.nid(), device_code_signature.to_string());
        self.with_state(ctx, |state| {
            let Some(row) = state.device_sessions.get_mut(&key) else {
                return Ok(false);
            };
            if expected_state.is_some_and(|expected| row.user_code_state != expected) {
                return Ok(false);
            }
            row.granted_scope = update.granted_scope;
            row.granted_audience = update.granted_audience;
            row.subject = update.subject;
            row.challenge_id = update.challenge_id;
            row.session_data = update.session_data;
            row.user_code_state = update.user_code_state;
            Ok(true)
        })
        .await
    }

    async fn invalidate_device_code(
        &self,
        ctx: &RequestContext,
        device_code_signature: &str,
    ) -> AuthResult<u64> {
        let key = (ctx.nid(), device_code_signature.to_string());
        self.with_state(ctx, |state| {
            Ok(match state.device_sessions.get_mut(&key) {
                Some(row) if row.device_code_active => {
                    row.device_code_active = false;
                    1
                }
                _ => 0,
            })
        })
        .await
    }

    async fn flush_device_sessions(
        &self,
        ctx: &RequestContext,
        not_after: OffsetDateTime,
        limit: usize,
        batch_size: usize,
    ) -> AuthResult<u64> {
        let nid = ctx.nid();
        self.with_state(ctx, |state| {
            let keys = select_keys(state.device_sessions.iter(), nid, limit, |row| {
                row.requested_at < not_after
            });
            let mut deleted = 0;
            for batch in keys.chunks(batch_size.max(1)) {
                for key in batch {
                    if let Some(row) = state.device_sessions.remove(key) {
                        state.user_codes.remove(&(nid, row.user_code_signature));
                        deleted += 1;
                    }
                }
            }
            Ok(deleted)
        })
        .await
    }
}
