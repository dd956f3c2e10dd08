//! In-memory storage state and transactions.
//!
//! All tables live in one [`MemoryState`] behind an async mutex. A
//! transaction holds the mutex for its whole lifetime together with a
//! snapshot taken at begin; rollback restores the snapshot. Calls outside a
//! transaction lock the mutex per operation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use tollgate_auth::AuthResult;
use tollgate_auth::context::{NetworkId, RequestContext, TransactionHandle};
use tollgate_auth::error::AuthError;
use tollgate_auth::storage::{DeviceSessionRow, TokenSessionRow};
use tollgate_auth::transaction::Transactional;
use tollgate_auth::types::{BlacklistedJti, Flow, LoginSession, SessionKind};

/// Primary key of a row: tenant plus the table's own key.
pub(crate) type Key = (NetworkId, String);

/// Every table of the backend.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryState {
    pub(crate) token_sessions: HashMap<SessionKind, HashMap<Key, TokenSessionRow>>,
    /// Keyed by device code signature.
    pub(crate) device_sessions: HashMap<Key, DeviceSessionRow>,
    /// User code signature to device code signature.
    pub(crate) user_codes: HashMap<Key, String>,
    /// Keyed by login challenge.
    pub(crate) flows: HashMap<Key, Flow>,
    pub(crate) login_sessions: HashMap<Key, LoginSession>,
    pub(crate) jtis: HashMap<Key, BlacklistedJti>,
}

impl MemoryState {
    pub(crate) fn tokens(&mut self, kind: SessionKind) -> &mut HashMap<Key, TokenSessionRow> {
        self.token_sessions.entry(kind).or_default()
    }
}

/// Backend transaction: the held state lock and the state at begin.
struct MemoryTransaction {
    guard: Mutex<Option<OwnedMutexGuard<MemoryState>>>,
    snapshot: MemoryState,
}

/// In-memory implementation of every storage trait.
///
/// Cloning shares the underlying tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuthStorage {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryAuthStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` against the state, inside the context's transaction if it
    /// carries one.
    pub(crate) async fn with_state<T>(
        &self,
        ctx: &RequestContext,
        f: impl FnOnce(&mut MemoryState) -> AuthResult<T>,
    ) -> AuthResult<T> {
        if let Some(handle) = ctx.transaction() {
            let tx = handle
                .downcast::<MemoryTransaction>()
                .ok_or_else(|| AuthError::internal("context carries a foreign transaction"))?;
            let mut slot = ctx.run(async { Ok(tx.guard.lock().await) }).await?;
            let state = slot
                .as_mut()
                .ok_or_else(|| AuthError::internal("transaction already finished"))?;
            return f(state);
        }

        let mut state = ctx.run(async { Ok(self.state.lock().await) }).await?;
        f(&mut state)
    }

    async fn finish(&self, handle: TransactionHandle, commit: bool) -> AuthResult<()> {
        let tx = handle
            .downcast::<MemoryTransaction>()
            .ok_or_else(|| AuthError::internal("context carries a foreign transaction"))?;
        let mut slot = tx.guard.lock().await;
        let mut guard = slot
            .take()
            .ok_or_else(|| AuthError::internal("transaction already finished"))?;
        if !commit {
            *guard = tx.snapshot.clone();
            tracing::debug!("in-memory transaction rolled back");
        }
        Ok(())
    }
}

#[async_trait]
impl Transactional for MemoryAuthStorage {
    async fn begin_owned(&self, ctx: &RequestContext) -> AuthResult<TransactionHandle> {
        let state = Arc::clone(&self.state);
        let guard = ctx.run(async { Ok(state.lock_owned().await) }).await?;
        let snapshot = MemoryState::clone(&guard);
        Ok(TransactionHandle::new(MemoryTransaction {
            guard: Mutex::new(Some(guard)),
            snapshot,
        }))
    }

    async fn commit_owned(&self, handle: TransactionHandle) -> AuthResult<()> {
        self.finish(handle, true).await
    }

    async fn rollback_owned(&self, handle: TransactionHandle) -> AuthResult<()> {
        self.finish(handle, false).await
    }
}

/// Returns the keys of `rows` matching `keep` within the tenant, ordered by
/// key and capped at `limit`.
pub(crate) fn select_keys<'a, V: 'a>(
    rows: impl Iterator<Item = (&'a Key, &'a V)>,
    nid: NetworkId,
    limit: usize,
    keep: impl Fn(&V) -> bool,
) -> Vec<Key> {
    let mut keys: Vec<Key> = rows
        .filter(|((row_nid, _), row)| *row_nid == nid && keep(row))
        .map(|(key, _)| key.clone())
        .collect();
    keys.sort_by(|a, b| a.1.cmp(&b.1));
    keys.truncate(limit);
    keys
}

#[cfg(test)]
mod tests {
    use tollgate_auth::transaction::in_transaction;
    use tollgate_auth::types::LoginSession;

    use super::*;

    fn key(ctx: &RequestContext, id: &str) -> Key {
        (ctx.nid(), id.to_string())
    }

    #[tokio::test]
    async fn test_rollback_restores_snapshot() {
        let storage = MemoryAuthStorage::new();
        let ctx = RequestContext::new(NetworkId::random());
        let session = LoginSession::new("alice", true);
        let id = session.id.clone();

        let result = in_transaction(&storage, &ctx, |tx| {
            let storage = storage.clone();
            async move {
                storage
                    .with_state(&tx, |state| {
                        state.login_sessions.insert(key(&tx, &session.id), session);
                        Ok(())
                    })
                    .await?;
                Err::<(), _>(AuthError::conflict("abort"))
            }
        })
        .await;
        assert!(result.is_err());

        let present = storage
            .with_state(&ctx, |state| Ok(state.login_sessions.contains_key(&key(&ctx, &id))))
            .await
            .unwrap();
        assert!(!present);
    }

    #[tokio::test]
    async fn test_commit_keeps_writes() {
        let storage = MemoryAuthStorage::new();
        let ctx = RequestContext::new(NetworkId::random());
        let session = LoginSession::new("alice", false);
        let id = session.id.clone();

        in_transaction(&storage, &ctx, |tx| {
            let storage = storage.clone();
            async move {
                storage
                    .with_state(&tx, |state| {
                        state.login_sessions.insert(key(&tx, &session.id), session);
                        Ok(())
                    })
                    .await
            }
        })
        .await
        .unwrap();

        let present = storage
            .with_state(&ctx, |state| Ok(state.login_sessions.contains_key(&key(&ctx, &id))))
            .await
            .unwrap();
        assert!(present);
    }

    #[test]
    fn test_select_keys_orders_and_limits() {
        let nid = NetworkId::random();
        let other = NetworkId::random();
        let mut rows = HashMap::new();
        for id in ["c", "a", "b"] {
            rows.insert((nid, id.to_string()), 1);
        }
        rows.insert((other, "0".to_string()), 1);

        let keys = select_keys(rows.iter(), nid, 2, |_| true);
        assert_eq!(keys, vec![(nid, "a".to_string()), (nid, "b".to_string())]);
    }
}
