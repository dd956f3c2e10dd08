//! Ambient transactions.
//!
//! A call that finds no transaction on its context opens one and decides its
//! outcome. A call that finds one joins it: its commit and rollback are
//! no-ops and the outermost owner decides.

use std::future::Future;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::AuthResult;
use crate::context::{RequestContext, TransactionHandle};

/// Backend transaction support.
///
/// Backends implement the `*_owned` primitives; the join semantics are
/// provided on top of them.
#[async_trait]
pub trait Transactional: Send + Sync {
    /// Opens a new backend transaction.
    async fn begin_owned(&self, ctx: &RequestContext) -> AuthResult<TransactionHandle>;

    /// Commits a transaction opened by [`Transactional::begin_owned`].
    async fn commit_owned(&self, handle: TransactionHandle) -> AuthResult<()>;

    /// Rolls back a transaction opened by [`Transactional::begin_owned`].
    async fn rollback_owned(&self, handle: TransactionHandle) -> AuthResult<()>;

    /// Returns a context carrying a transaction, joining an existing one.
    async fn begin_tx(&self, ctx: &RequestContext) -> AuthResult<RequestContext> {
        if let Some(existing) = ctx.transaction() {
            return Ok(ctx.with_transaction(existing.joined()));
        }
        let handle = self.begin_owned(ctx).await?;
        Ok(ctx.with_transaction(handle))
    }

    /// Commits the context's transaction if the context owns it.
    async fn commit(&self, ctx: RequestContext) -> AuthResult<()> {
        match ctx.transaction() {
            Some(handle) if handle.is_owner() => self.commit_owned(handle.clone()).await,
            _ => Ok(()),
        }
    }

    /// Rolls back the context's transaction if the context owns it.
    async fn rollback(&self, ctx: RequestContext) -> AuthResult<()> {
        match ctx.transaction() {
            Some(handle) if handle.is_owner() => self.rollback_owned(handle.clone()).await,
            _ => Ok(()),
        }
    }
}

/// Runs `body` inside a transaction.
///
/// Commits when the body succeeds. On error the transaction is rolled back
/// and the body's error is returned; a failed rollback is only logged.
///
/// # Errors
///
/// Returns the body's error, or the error of opening or committing the
/// transaction.
pub async fn in_transaction<S, T, F, Fut>(storage: &S, ctx: &RequestContext, body: F) -> AuthResult<T>
where
    S: Transactional + ?Sized,
    F: FnOnce(RequestContext) -> Fut,
    Fut: Future<Output = AuthResult<T>>,
{
    let tx_ctx = storage.begin_tx(ctx).await?;
    match body(tx_ctx.clone()).await {
        Ok(value) => {
            storage.commit(tx_ctx).await?;
            Ok(value)
        }
        Err(err) => {
            debug!(error = %err, "rolling back transaction");
            if let Err(rollback_err) = storage.rollback(tx_ctx).await {
                warn!(error = %rollback_err, "transaction rollback failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::context::NetworkId;
    use crate::error::AuthError;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<&'static str>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transactional for Recorder {
        async fn begin_owned(&self, _ctx: &RequestContext) -> AuthResult<TransactionHandle> {
            self.events.lock().unwrap().push("begin");
            Ok(TransactionHandle::new(()))
        }

        async fn commit_owned(&self, _handle: TransactionHandle) -> AuthResult<()> {
            self.events.lock().unwrap().push("commit");
            Ok(())
        }

        async fn rollback_owned(&self, _handle: TransactionHandle) -> AuthResult<()> {
            self.events.lock().unwrap().push("rollback");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_commits_on_success() {
        let storage = Recorder::default();
        let ctx = RequestContext::new(NetworkId::random());
        let value = in_transaction(&storage, &ctx, |_tx| async { Ok(1) })
            .await
            .unwrap();
        assert_eq!(value, 1);
        assert_eq!(storage.events(), vec!["begin", "commit"]);
    }

    #[tokio::test]
    async fn test_rolls_back_on_error() {
        let storage = Recorder::default();
        let ctx = RequestContext::new(NetworkId::random());
        let err = in_transaction(&storage, &ctx, |_tx| async {
            Err::<(), _>(AuthError::conflict("consent already handled"))
        })
        .await
        .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(storage.events(), vec!["begin", "rollback"]);
    }

    #[tokio::test]
    async fn test_nested_call_joins_outer_transaction() {
        let storage = Recorder::default();
        let ctx = RequestContext::new(NetworkId::random());
        in_transaction(&storage, &ctx, |outer| {
            let storage = &storage;
            async move {
                in_transaction(storage, &outer, |inner| async move {
                    assert!(!inner.transaction().is_some_and(|t| t.is_owner()));
                    Ok(())
                })
                .await
            }
        })
        .await
        .unwrap();
        assert_eq!(storage.events(), vec!["begin", "commit"]);
    }
}
