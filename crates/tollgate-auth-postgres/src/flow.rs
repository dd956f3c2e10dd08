//! Flow and login session tables.
//!
//! A flow is stored whole as JSONB. The key, verifier, state and lookup
//! columns beside it are rewritten from the flow on every write.

use async_trait::async_trait;
use sqlx_core::query::query;
use sqlx_core::query_scalar::query_scalar;
use sqlx_core::row::Row;
use sqlx_core::types::Json;
use sqlx_postgres::{PgRow, Postgres};
use time::OffsetDateTime;

use tollgate_auth::AuthResult;
use tollgate_auth::context::RequestContext;
use tollgate_auth::error::AuthError;
use tollgate_auth::storage::{FlowStorage, LoginSessionStorage};
use tollgate_auth::types::{Flow, FlowState, LoginSession};

use crate::error::{storage_error, unique_error};
use crate::storage::PostgresAuthStorage;

fn flow_conflict(_constraint: Option<&str>) -> AuthError {
    AuthError::conflict("flow challenge or verifier already exists")
}

impl PostgresAuthStorage {
    /// Finds the flow whose `column` equals `value`.
    async fn find_flow_by(
        &self,
        ctx: &RequestContext,
        column: &str,
        value: &str,
    ) -> AuthResult<Option<Flow>> {
        let sql = format!("SELECT data FROM tollgate_oauth2_flow WHERE {column} = $1 AND nid = $2");
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            let data: Option<Json<Flow>> = query_scalar(&sql)
                .bind(value)
                .bind(ctx.nid().as_uuid())
                .fetch_optional(conn.get()?)
                .await
                .map_err(storage_error)?;
            Ok(data.map(|Json(flow)| flow))
        })
        .await
    }
}

#[async_trait]
impl FlowStorage for PostgresAuthStorage {
    async fn create_flow(&self, ctx: &RequestContext, flow: &Flow) -> AuthResult<()> {
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            query::<Postgres>(
                "INSERT INTO tollgate_oauth2_flow \
                 (login_challenge, nid, login_verifier, consent_challenge, consent_verifier, \
                  state, subject, client_id, consent_remember, has_error, consent_handled_at, \
                  requested_at, data) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            )
            .bind(&flow.login_challenge)
            .bind(ctx.nid().as_uuid())
            .bind(&flow.login_verifier)
            .bind(&flow.consent_challenge)
            .bind(&flow.consent_verifier)
            .bind(flow.state.code())
            .bind(&flow.subject)
            .bind(&flow.client_id)
            .bind(flow.consent_remember)
            .bind(flow.has_error())
            .bind(flow.consent_handled_at)
            .bind(flow.requested_at)
            .bind(Json(flow))
            .execute(conn.get()?)
            .await
            .map_err(|e| unique_error(e, flow_conflict))?;
            Ok(())
        })
        .await
    }

    async fn find_flow(
        &self,
        ctx: &RequestContext,
        login_challenge: &str,
    ) -> AuthResult<Option<Flow>> {
        self.find_flow_by(ctx, "login_challenge", login_challenge)
            .await
    }

    async fn find_flow_by_consent_challenge(
        &self,
        ctx: &RequestContext,
        consent_challenge: &str,
    ) -> AuthResult<Option<Flow>> {
        self.find_flow_by(ctx, "consent_challenge", consent_challenge)
            .await
    }

    async fn find_flow_by_login_verifier(
        &self,
        ctx: &RequestContext,
        verifier: &str,
    ) -> AuthResult<Option<Flow>> {
        self.find_flow_by(ctx, "login_verifier", verifier).await
    }

    async fn find_flow_by_consent_verifier(
        &self,
        ctx: &RequestContext,
        verifier: &str,
    ) -> AuthResult<Option<Flow>> {
        self.find_flow_by(ctx, "consent_verifier", verifier).await
    }

    async fn update_flow(
        &self,
        ctx: &RequestContext,
        flow: &Flow,
        expected: FlowState,
    ) -> AuthResult<bool> {
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            let result = query::<Postgres>(
                "UPDATE tollgate_oauth2_flow \
                 SET login_verifier = $3, consent_challenge = $4, consent_verifier = $5, \
                     state = $6, subject = $7, client_id = $8, consent_remember = $9, \
                     has_error = $10, consent_handled_at = $11, requested_at = $12, data = $13 \
                 WHERE login_challenge = $1 AND nid = $2 AND state = $14",
            )
            .bind(&flow.login_challenge)
            .bind(ctx.nid().as_uuid())
            .bind(&flow.login_verifier)
            .bind(&flow.consent_challenge)
            .bind(&flow.consent_verifier)
            .bind(flow.state.code())
            .bind(&flow.subject)
            .bind(&flow.client_id)
            .bind(flow.consent_remember)
            .bind(flow.has_error())
            .bind(flow.consent_handled_at)
            .bind(flow.requested_at)
            .bind(Json(flow))
            .bind(expected.code())
            .execute(conn.get()?)
            .await
            .map_err(|e| unique_error(e, flow_conflict))?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn find_remembered_consents(
        &self,
        ctx: &RequestContext,
        client_id: &str,
        subject: &str,
    ) -> AuthResult<Vec<Flow>> {
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            let flows: Vec<Json<Flow>> = query_scalar(
                "SELECT data FROM tollgate_oauth2_flow \
                 WHERE nid = $1 AND client_id = $2 AND subject = $3 \
                   AND consent_remember AND NOT has_error AND state IN ($4, $5) \
                 ORDER BY consent_handled_at DESC NULLS LAST",
            )
            .bind(ctx.nid().as_uuid())
            .bind(client_id)
            .bind(subject)
            .bind(FlowState::ConsentUnused.code())
            .bind(FlowState::ConsentUsed.code())
            .fetch_all(conn.get()?)
            .await
            .map_err(storage_error)?;
            Ok(flows.into_iter().map(|Json(flow)| flow).collect())
        })
        .await
    }

    async fn find_consent_challenges_by_subject(
        &self,
        ctx: &RequestContext,
        subject: &str,
        client_id: Option<&str>,
    ) -> AuthResult<Vec<String>> {
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            query_scalar(
                "SELECT consent_challenge FROM tollgate_oauth2_flow \
                 WHERE nid = $1 AND subject = $2 AND consent_challenge IS NOT NULL \
                   AND ($3::TEXT IS NULL OR client_id = $3) \
                 ORDER BY consent_challenge",
            )
            .bind(ctx.nid().as_uuid())
            .bind(subject)
            .bind(client_id)
            .fetch_all(conn.get()?)
            .await
            .map_err(storage_error)
        })
        .await
    }

    async fn delete_flows_by_consent_challenges(
        &self,
        ctx: &RequestContext,
        consent_challenges: &[String],
    ) -> AuthResult<u64> {
        if consent_challenges.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            let result = query::<Postgres>(
                "DELETE FROM tollgate_oauth2_flow \
                 WHERE nid = $1 AND consent_challenge = ANY($2)",
            )
            .bind(ctx.nid().as_uuid())
            .bind(consent_challenges.to_vec())
            .execute(conn.get()?)
            .await
            .map_err(storage_error)?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn flush_flows(
        &self,
        ctx: &RequestContext,
        not_after: OffsetDateTime,
        limit: usize,
        batch_size: usize,
    ) -> AuthResult<u64> {
        // Completed flows back remembered consent and are kept unless they
        // ended in an error.
        let select = format!(
            "SELECT login_challenge FROM tollgate_oauth2_flow \
             WHERE nid = $1 AND requested_at < $2 AND (state <> {} OR has_error) \
             ORDER BY login_challenge LIMIT $3",
            FlowState::ConsentUsed.code()
        );
        self.flush_keys(
            ctx,
            &select,
            "DELETE FROM tollgate_oauth2_flow WHERE nid = $1 AND login_challenge = ANY($2)",
            not_after,
            limit,
            batch_size,
        )
        .await
    }
}

fn decode_login_session(row: &PgRow) -> Result<LoginSession, sqlx_core::Error> {
    Ok(LoginSession {
        id: row.try_get("id")?,
        subject: row.try_get("subject")?,
        authenticated_at: row.try_get("authenticated_at")?,
        remember: row.try_get("remember")?,
    })
}

#[async_trait]
impl LoginSessionStorage for PostgresAuthStorage {
    async fn upsert_login_session(
        &self,
        ctx: &RequestContext,
        session: &LoginSession,
    ) -> AuthResult<()> {
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            query::<Postgres>(
                "INSERT INTO tollgate_oauth2_authentication_session \
                 (id, nid, subject, authenticated_at, remember) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (id, nid) DO UPDATE SET \
                     subject = EXCLUDED.subject, \
                     authenticated_at = EXCLUDED.authenticated_at, \
                     remember = EXCLUDED.remember",
            )
            .bind(&session.id)
            .bind(ctx.nid().as_uuid())
            .bind(&session.subject)
            .bind(session.authenticated_at)
            .bind(session.remember)
            .execute(conn.get()?)
            .await
            .map_err(storage_error)?;
            Ok(())
        })
        .await
    }

    async fn find_login_session(
        &self,
        ctx: &RequestContext,
        id: &str,
    ) -> AuthResult<Option<LoginSession>> {
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            let row = query::<Postgres>(
                "SELECT id, subject, authenticated_at, remember \
                 FROM tollgate_oauth2_authentication_session WHERE id = $1 AND nid = $2",
            )
            .bind(id)
            .bind(ctx.nid().as_uuid())
            .fetch_optional(conn.get()?)
            .await
            .map_err(storage_error)?;
            row.as_ref()
                .map(decode_login_session)
                .transpose()
                .map_err(storage_error)
        })
        .await
    }

    async fn delete_login_session(
        &self,
        ctx: &RequestContext,
        id: &str,
    ) -> AuthResult<Option<LoginSession>> {
        let mut conn = self.connection(ctx).await?;
        ctx.run(async {
            let row = query::<Postgres>(
                "DELETE FROM tollgate_oauth2_authentication_session WHERE id = $1 AND nid = $2 \
                 RETURNING id, subject, authenticated_at, remember",
            )
            .bind(id)
            .bind(ctx.nid().as_uuid())
            .fetch_optional(conn.get()?)
            .await
            .map_err(storage_error)?;
            row.as_ref()
                .map(decode_login_session)
                .transpose()
                .map_err(storage_error)
        })
        .await
    }

    async fn delete_login_sessions_by_subject(
        &self,
        ctx: &RequestContext,
        subject: &str,
    ) -> AuthResult<u64> {
        self.execute_keyed(
            ctx,
            "DELETE FROM tollgate_oauth2_authentication_session WHERE subject = $1 AND nid = $2",
            subject,
        )
        .await
    }
}
