//! Store handle, connection selection and transactions.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx_core::pool::PoolConnection;
use sqlx_core::query::query;
use sqlx_postgres::{PgConnection, PgPool, PgTransaction, Postgres};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument};

use tollgate_auth::AuthResult;
use tollgate_auth::context::{RequestContext, TransactionHandle};
use tollgate_auth::error::AuthError;
use tollgate_auth::transaction::Transactional;

use crate::config::PostgresConfig;
use crate::error::{Result, storage_error};
use crate::migrations;
use crate::pool::{create_pool, mask_password};

type TransactionSlot = Arc<Mutex<Option<PgTransaction<'static>>>>;

/// Transaction attached to a [`RequestContext`].
///
/// The slot is emptied on commit or rollback; an unfinished transaction is
/// rolled back by sqlx when dropped.
struct PostgresTransaction {
    tx: TransactionSlot,
}

/// A connection to run one storage call on.
pub(crate) enum Connection {
    Pooled(PoolConnection<Postgres>),
    Transaction(OwnedMutexGuard<Option<PgTransaction<'static>>>),
}

impl Connection {
    pub(crate) fn get(&mut self) -> AuthResult<&mut PgConnection> {
        match self {
            Self::Pooled(conn) => Ok(&mut **conn),
            Self::Transaction(guard) => {
                let slot: &mut Option<PgTransaction<'static>> = guard;
                slot.as_mut()
                    .map(|tx| &mut **tx)
                    .ok_or_else(|| AuthError::internal("transaction already finished"))
            }
        }
    }
}

/// PostgreSQL implementation of every storage trait.
///
/// Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct PostgresAuthStorage {
    pool: PgPool,
}

impl PostgresAuthStorage {
    /// Wraps an existing pool. The schema must already be migrated.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects with retry and applies migrations if configured to.
    ///
    /// # Errors
    ///
    /// Returns an error if the database stays unreachable after the
    /// configured retries or a migration fails.
    #[instrument(skip(config), fields(url = %mask_password(&config.url)))]
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = create_pool(config).await?;
        if config.migrate_on_connect {
            migrations::run(&pool).await?;
        }
        Ok(Self::new(pool))
    }

    /// Applies pending embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns `Migration` if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        migrations::run(&self.pool).await
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The context's transaction connection, or a pooled one.
    pub(crate) async fn connection(&self, ctx: &RequestContext) -> AuthResult<Connection> {
        if let Some(handle) = ctx.transaction() {
            let tx = handle
                .downcast::<PostgresTransaction>()
                .ok_or_else(|| AuthError::internal("context carries a foreign transaction"))?;
            let slot = Arc::clone(&tx.tx);
            let guard = ctx.run(async { Ok(slot.lock_owned().await) }).await?;
            return Ok(Connection::Transaction(guard));
        }

        let conn = ctx
            .run(async { self.pool.acquire().await.map_err(storage_error) })
            .await?;
        Ok(Connection::Pooled(conn))
    }

    async fn finish(&self, handle: TransactionHandle, commit: bool) -> AuthResult<()> {
        let tx = handle
            .downcast::<PostgresTransaction>()
            .ok_or_else(|| AuthError::internal("context carries a foreign transaction"))?;
        let inner = tx
            .tx
            .lock()
            .await
            .take()
            .ok_or_else(|| AuthError::internal("transaction already finished"))?;
        if commit {
            inner.commit().await.map_err(storage_error)?;
            debug!("transaction committed");
        } else {
            inner.rollback().await.map_err(storage_error)?;
            debug!("transaction rolled back");
        }
        Ok(())
    }
}

#[async_trait]
impl Transactional for PostgresAuthStorage {
    async fn begin_owned(&self, ctx: &RequestContext) -> AuthResult<TransactionHandle> {
        let tx = ctx
            .run(async {
                let mut tx = self.pool.begin().await.map_err(storage_error)?;
                query::<Postgres>("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
                    .execute(&mut *tx)
                    .await
                    .map_err(storage_error)?;
                Ok(tx)
            })
            .await?;
        Ok(TransactionHandle::new(PostgresTransaction {
            tx: Arc::new(Mutex::new(Some(tx))),
        }))
    }

    async fn commit_owned(&self, handle: TransactionHandle) -> AuthResult<()> {
        self.finish(handle, true).await
    }

    async fn rollback_owned(&self, handle: TransactionHandle) -> AuthResult<()> {
        self.finish(handle, false).await
    }
}

/// Converts a row limit for binding.
pub(crate) fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}
