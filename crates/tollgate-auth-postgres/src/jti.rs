//! Assertion JTI blacklist (`tollgate_oauth2_jti_blacklist`).

use async_trait::async_trait;
use sqlx_core::query::query;
use sqlx_core::row::Row;
use sqlx_postgres::Postgres;
use time::OffsetDateTime;

use tollgate_auth::AuthResult;
use tollgate_auth::context::RequestContext;
use tollgate_auth::error::AuthError;
use tollgate_auth::storage::JtiStorage;
use tollgate_auth::types::BlacklistedJti;

use crate::error::{storage_error, unique_error};
use crate::storage::PostgresAuthStorage;

#[async_trait]
impl JtiStorage for PostgresAuthStorage {
    async fn find_jti(
        &self,
        ctx: &RequestContext,
        signature: &str,
    ) -> AuthResult<Option<BlacklistedJti>> {
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            let row = query::<Postgres>(
                "SELECT signature, expires_at FROM tollgate_oauth2_jti_blacklist \
                 WHERE signature = $1 AND nid = $2",
            )
            .bind(signature)
            .bind(ctx.nid().as_uuid())
            .fetch_optional(conn.get()?)
            .await
            .map_err(storage_error)?;
            row.map(|row| {
                Ok::<_, sqlx_core::Error>(BlacklistedJti {
                    signature: row.try_get("signature")?,
                    expires_at: row.try_get("expires_at")?,
                })
            })
            .transpose()
            .map_err(storage_error)
        })
        .await
    }

    async fn insert_jti(&self, ctx: &RequestContext, entry: &BlacklistedJti) -> AuthResult<()> {
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            query::<Postgres>(
                "INSERT INTO tollgate_oauth2_jti_blacklist (signature, nid, expires_at) \
                 VALUES ($1, $2, $3)",
            )
            .bind(&entry.signature)
            .bind(ctx.nid().as_uuid())
            .bind(entry.expires_at)
            .execute(conn.get()?)
            .await
            .map_err(|e| unique_error(e, |_| AuthError::jti_known("JTI has already been used")))?;
            Ok(())
        })
        .await
    }

    async fn delete_expired_jtis(
        &self,
        ctx: &RequestContext,
        now: OffsetDateTime,
    ) -> AuthResult<u64> {
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            let result = query::<Postgres>(
                "DELETE FROM tollgate_oauth2_jti_blacklist WHERE nid = $1 AND expires_at <= $2",
            )
            .bind(ctx.nid().as_uuid())
            .bind(now)
            .execute(conn.get()?)
            .await
            .map_err(storage_error)?;
            Ok(result.rows_affected())
        })
        .await
    }
}
