//! Token session tables (`tollgate_oauth2_{code,access,refresh,pkce,oidc}`).

use async_trait::async_trait;
use sqlx_core::query::query;
use sqlx_core::query_scalar::query_scalar;
use sqlx_core::row::Row;
use sqlx_postgres::{PgRow, Postgres};
use time::OffsetDateTime;

use tollgate_auth::AuthResult;
use tollgate_auth::context::RequestContext;
use tollgate_auth::error::AuthError;
use tollgate_auth::storage::{TokenSessionRow, TokenSessionStorage};
use tollgate_auth::types::SessionKind;

use crate::error::{storage_error, unique_error};
use crate::storage::{PostgresAuthStorage, sql_limit};

const COLUMNS: &str = "signature, request_id, challenge_id, requested_at, client_id, \
    requested_scope, granted_scope, requested_audience, granted_audience, form_data, \
    subject, active, session_data, expires_at";

/// Select list for `kind`; only refresh rows carry rotation columns.
fn select_columns(kind: SessionKind) -> String {
    match kind {
        SessionKind::Refresh => format!("{COLUMNS}, first_used_at, access_token_signature"),
        _ => format!(
            "{COLUMNS}, NULL::TIMESTAMPTZ AS first_used_at, NULL::TEXT AS access_token_signature"
        ),
    }
}

/// `$1, $2, ..., $n`
fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("${i}")).collect::<Vec<_>>().join(", ")
}

fn decode_row(row: &PgRow) -> Result<TokenSessionRow, sqlx_core::Error> {
    Ok(TokenSessionRow {
        signature: row.try_get("signature")?,
        request_id: row.try_get("request_id")?,
        challenge_id: row.try_get("challenge_id")?,
        requested_at: row.try_get("requested_at")?,
        client_id: row.try_get("client_id")?,
        requested_scope: row.try_get("requested_scope")?,
        granted_scope: row.try_get("granted_scope")?,
        requested_audience: row.try_get("requested_audience")?,
        granted_audience: row.try_get("granted_audience")?,
        form_data: row.try_get("form_data")?,
        subject: row.try_get("subject")?,
        active: row.try_get("active")?,
        session_data: row.try_get("session_data")?,
        expires_at: row.try_get("expires_at")?,
        first_used_at: row.try_get("first_used_at")?,
        access_token_signature: row.try_get("access_token_signature")?,
    })
}

#[async_trait]
impl TokenSessionStorage for PostgresAuthStorage {
    async fn create_token_session(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        row: TokenSessionRow,
    ) -> AuthResult<()> {
        let table = kind.table_name();
        let sql = match kind {
            SessionKind::Refresh => format!(
                "INSERT INTO {table} (nid, {COLUMNS}, first_used_at, access_token_signature) \
                 VALUES ({})",
                placeholders(17)
            ),
            _ => format!("INSERT INTO {table} (nid, {COLUMNS}) VALUES ({})", placeholders(15)),
        };

        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            let mut insert = query::<Postgres>(&sql)
                .bind(ctx.nid().as_uuid())
                .bind(row.signature)
                .bind(row.request_id)
                .bind(row.challenge_id)
                .bind(row.requested_at)
                .bind(row.client_id)
                .bind(row.requested_scope)
                .bind(row.granted_scope)
                .bind(row.requested_audience)
                .bind(row.granted_audience)
                .bind(row.form_data)
                .bind(row.subject)
                .bind(row.active)
                .bind(row.session_data)
                .bind(row.expires_at);
            if kind == SessionKind::Refresh {
                insert = insert
                    .bind(row.first_used_at)
                    .bind(row.access_token_signature);
            }
            insert.execute(conn.get()?).await.map_err(|e| {
                unique_error(e, |_| {
                    AuthError::conflict(format!("{kind} session already exists"))
                })
            })?;
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
        let sql = format!(
            "SELECT {} FROM {} WHERE signature = $1 AND nid = $2",
            select_columns(kind),
            kind.table_name()
        );
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            let row = query::<Postgres>(&sql)
                .bind(signature)
                .bind(ctx.nid().as_uuid())
                .fetch_optional(conn.get()?)
                .await
                .map_err(storage_error)?;
            row.as_ref()
                .map(decode_row)
                .transpose()
                .map_err(storage_error)
        })
        .await
    }

    async fn deactivate_token_session(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        signature: &str,
    ) -> AuthResult<u64> {
        let sql = format!(
            "UPDATE {} SET active = FALSE WHERE signature = $1 AND nid = $2 AND active",
            kind.table_name()
        );
        self.execute_keyed(ctx, &sql, signature).await
    }

    async fn deactivate_token_sessions_by_request_id(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        request_id: &str,
    ) -> AuthResult<u64> {
        let sql = format!(
            "UPDATE {} SET active = FALSE WHERE request_id = $1 AND nid = $2 AND active",
            kind.table_name()
        );
        self.execute_keyed(ctx, &sql, request_id).await
    }

    async fn delete_token_session(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        signature: &str,
    ) -> AuthResult<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE signature = $1 AND nid = $2",
            kind.table_name()
        );
        self.execute_keyed(ctx, &sql, signature).await
    }

    async fn delete_token_sessions_by_request_id(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        request_id: &str,
    ) -> AuthResult<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE request_id = $1 AND nid = $2",
            kind.table_name()
        );
        self.execute_keyed(ctx, &sql, request_id).await
    }

    async fn delete_token_sessions_by_client(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        client_id: &str,
    ) -> AuthResult<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE client_id = $1 AND nid = $2",
            kind.table_name()
        );
        self.execute_keyed(ctx, &sql, client_id).await
    }

    async fn flush_token_sessions(
        &self,
        ctx: &RequestContext,
        kind: SessionKind,
        not_after: OffsetDateTime,
        limit: usize,
        batch_size: usize,
    ) -> AuthResult<u64> {
        let select = format!(
            "SELECT signature FROM {} WHERE nid = $1 AND requested_at < $2 \
             ORDER BY signature LIMIT $3",
            kind.table_name()
        );
        let delete = format!(
            "DELETE FROM {} WHERE nid = $1 AND signature = ANY($2)",
            kind.table_name()
        );
        self.flush_keys(ctx, &select, &delete, not_after, limit, batch_size)
            .await
    }

    async fn claim_refresh_token_grace(
        &self,
        ctx: &RequestContext,
        signature: &str,
        used_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> AuthResult<bool> {
        let nid = ctx.nid().as_uuid();
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            let claimed = query::<Postgres>(
                "UPDATE tollgate_oauth2_refresh \
                 SET first_used_at = $3, expires_at = $4, active = FALSE \
                 WHERE signature = $1 AND nid = $2 AND first_used_at IS NULL",
            )
            .bind(signature)
            .bind(nid)
            .bind(used_at)
            .bind(expires_at)
            .execute(conn.get()?)
            .await
            .map_err(storage_error)?
            .rows_affected();
            if claimed > 0 {
                return Ok(true);
            }

            let exists: bool = query_scalar(
                "SELECT EXISTS(SELECT 1 FROM tollgate_oauth2_refresh \
                 WHERE signature = $1 AND nid = $2)",
            )
            .bind(signature)
            .bind(nid)
            .fetch_one(conn.get()?)
            .await
            .map_err(storage_error)?;
            if exists {
                Ok(false)
            } else {
                Err(AuthError::not_found("refresh session"))
            }
        })
        .await
    }

    async fn retire_refresh_token(
        &self,
        ctx: &RequestContext,
        signature: &str,
        used_at: OffsetDateTime,
    ) -> AuthResult<Option<String>> {
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            let access: Option<Option<String>> = query_scalar(
                "UPDATE tollgate_oauth2_refresh \
                 SET active = FALSE, first_used_at = COALESCE(first_used_at, $3) \
                 WHERE signature = $1 AND nid = $2 \
                 RETURNING access_token_signature",
            )
            .bind(signature)
            .bind(ctx.nid().as_uuid())
            .bind(used_at)
            .fetch_optional(conn.get()?)
            .await
            .map_err(storage_error)?;
            access.ok_or_else(|| AuthError::not_found("refresh session"))
        })
        .await
    }
}

impl PostgresAuthStorage {
    /// Runs a statement bound to `($1 = key, $2 = nid)` and returns the
    /// affected row count.
    pub(crate) async fn execute_keyed(
        &self,
        ctx: &RequestContext,
        sql: &str,
        key: &str,
    ) -> AuthResult<u64> {
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            let result = query::<Postgres>(sql)
                .bind(key)
                .bind(ctx.nid().as_uuid())
                .execute(conn.get()?)
                .await
                .map_err(storage_error)?;
            Ok(result.rows_affected())
        })
        .await
    }

    /// Selects up to `limit` expired keys with `select` and removes them
    /// with `delete`, `batch_size` keys per statement.
    ///
    /// `select` binds `($1 = nid, $2 = not_after, $3 = limit)`; `delete`
    /// binds `($1 = nid, $2 = keys)`.
    pub(crate) async fn flush_keys(
        &self,
        ctx: &RequestContext,
        select: &str,
        delete: &str,
        not_after: OffsetDateTime,
        limit: usize,
        batch_size: usize,
    ) -> AuthResult<u64> {
        let nid = ctx.nid().as_uuid();
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            let keys: Vec<String> = query_scalar(select)
                .bind(nid)
                .bind(not_after)
                .bind(sql_limit(limit))
                .fetch_all(conn.get()?)
                .await
                .map_err(storage_error)?;

            let mut deleted = 0;
            for batch in keys.chunks(batch_size.max(1)) {
                deleted += query::<Postgres>(delete)
                    .bind(nid)
                    .bind(batch.to_vec())
                    .execute(conn.get()?)
                    .await
                    .map_err(storage_error)?
                    .rows_affected();
            }
            Ok(deleted)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(3), "$1, $2, $3");
    }

    #[test]
    fn test_only_refresh_selects_rotation_columns() {
        assert!(select_columns(SessionKind::Refresh).ends_with("first_used_at, access_token_signature"));
        assert!(select_columns(SessionKind::Access).contains("NULL::TEXT AS access_token_signature"));
    }
}
