//! Device authorization table (`tollgate_oauth2_device_auth_codes`).

use async_trait::async_trait;
use sqlx_core::query::query;
use sqlx_core::row::Row;
use sqlx_postgres::{PgRow, Postgres};
use time::OffsetDateTime;

use tollgate_auth::AuthResult;
use tollgate_auth::context::RequestContext;
use tollgate_auth::error::AuthError;
use tollgate_auth::storage::{DeviceSessionRow, DeviceSessionStorage, DeviceSessionUpdate};
use tollgate_auth::types::UserCodeState;

use crate::error::{storage_error, unique_error};
use crate::storage::PostgresAuthStorage;

const TABLE: &str = "tollgate_oauth2_device_auth_codes";
const USER_CODE_CONSTRAINT: &str = "tollgate_oauth2_device_auth_codes_user_code_key";

const COLUMNS: &str = "device_code_signature, user_code_signature, request_id, challenge_id, \
    requested_at, client_id, requested_scope, granted_scope, requested_audience, \
    granted_audience, form_data, subject, session_data, expires_at, user_code_state, \
    device_code_active";

fn decode_row(row: &PgRow) -> Result<DeviceSessionRow, sqlx_core::Error> {
    let state: i16 = row.try_get("user_code_state")?;
    let user_code_state = UserCodeState::from_code(state).ok_or_else(|| {
        sqlx_core::Error::Decode(format!("unknown user code state {state}").into())
    })?;
    Ok(DeviceSessionRow {
        device_code_signature: row.try_get("device_code_signature")?,
        user_code_signature: row.try_get("user_code_signature")?,
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
        session_data: row.try_get("session_data")?,
        expires_at: row.try_get("expires_at")?,
        user_code_state,
        device_code_active: row.try_get("device_code_active")?,
    })
}

impl PostgresAuthStorage {
    /// Finds the device session whose `column` equals `value`.
    async fn find_device_session_by(
        &self,
        ctx: &RequestContext,
        column: &str,
        value: &str,
    ) -> AuthResult<Option<DeviceSessionRow>> {
        let sql = format!("SELECT {COLUMNS} FROM {TABLE} WHERE {column} = $1 AND nid = $2 LIMIT 1");
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            let row = query::<Postgres>(&sql)
                .bind(value)
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
}

#[async_trait]
impl DeviceSessionStorage for PostgresAuthStorage {
    async fn create_device_session(
        &self,
        ctx: &RequestContext,
        row: DeviceSessionRow,
    ) -> AuthResult<()> {
        let sql = format!(
            "INSERT INTO {TABLE} (nid, {COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        );
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            query::<Postgres>(&sql)
                .bind(ctx.nid().as_uuid())
                .bind(row.device_code_signature)
                .bind(row.user_code_signature)
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
                .bind(row.session_data)
                .bind(row.expires_at)
                .bind(row.user_code_state.code())
                .bind(row.device_code_active)
                .execute(conn.get()?)
                .await
                .map_err(|e| {
                    unique_error(e, |constraint| match constraint {
                        Some(USER_CODE_CONSTRAINT) => AuthError::existing_user_code_signature(
                            "user code signature already exists",
                        ),
                        _ => AuthError::conflict("device code signature already exists"),
                    })
                })?;
            Ok(())
        })
        .await
    }

    async fn find_device_session_by_device_code(
        &self,
        ctx: &RequestContext,
        device_code_signature: &str,
    ) -> AuthResult<Option<DeviceSessionRow>> {
        self.find_device_session_by(ctx, "device_code_signature", device_code_signature)
            .await
    }

    async fn find_device_session_by_user_code(
        &self,
        ctx: &RequestContext,
        user_code_signature: &str,
    ) -> AuthResult<Option<DeviceSessionRow>> {
        self.find_device_session_by(ctx, "user_code_signature", user_code_signature)
            .await
    }

    async fn find_device_session_by_request_id(
        &self,
        ctx: &RequestContext,
        request_id: &str,
    ) -> AuthResult<Option<DeviceSessionRow>> {
        self.find_device_session_by(ctx, "request_id", request_id)
            .await
    }

    async fn update_device_session(
        &self,
        ctx: &RequestContext,
        device_code_signature: &str,
        update: DeviceSessionUpdate,
        expected_state: Option<UserCodeState>,
    ) -> AuthResult<bool> {
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            let result = query::<Postgres>(
                "UPDATE tollgate_oauth2_device_auth_codes \
                 SET granted_scope = $3, granted_audience = $4, subject = $5, \
                     challenge_id = $6, session_data = $7, user_code_state = $8 \
                 WHERE device_code_signature = $1 AND nid = $2 \
                   AND ($9::SMALLINT IS NULL OR user_code_state = $9)",
            )
            .bind(device_code_signature)
            .bind(ctx.nid().as_uuid())
            .bind(update.granted_scope)
            .bind(update.granted_audience)
            .bind(update.subject)
            .bind(update.challenge_id)
            .bind(update.session_data)
            .bind(update.user_code_state.code())
            .bind(expected_state.map(UserCodeState::code))
            .execute(conn.get()?)
            .await
            .map_err(storage_error)?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn invalidate_device_code(
        &self,
        ctx: &RequestContext,
        device_code_signature: &str,
    ) -> AuthResult<u64> {
        self.execute_keyed(
            ctx,
            "UPDATE tollgate_oauth2_device_auth_codes SET device_code_active = FALSE \
             WHERE device_code_signature = $1 AND nid = $2 AND device_code_active",
            device_code_signature,
        )
        .await
    }

    async fn flush_device_sessions(
        &self,
        ctx: &RequestContext,
        not_after: OffsetDateTime,
        limit: usize,
        batch_size: usize,
    ) -> AuthResult<u64> {
        self.flush_keys(
            ctx,
            "SELECT device_code_signature FROM tollgate_oauth2_device_auth_codes \
             WHERE nid = $1 AND requested_at < $2 \
             ORDER BY device_code_signature LIMIT $3",
            "DELETE FROM tollgate_oauth2_device_auth_codes \
             WHERE nid = $1 AND device_code_signature = ANY($2)",
            not_after,
            limit,
            batch_size,
        )
        .await
    }
}
