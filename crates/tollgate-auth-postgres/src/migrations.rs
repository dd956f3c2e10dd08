//! Embedded schema migrations.
//!
//! Applied once at startup, never from inside a request. Applied versions
//! are tracked in `_sqlx_migrations`.

use std::borrow::Cow;

use sqlx_core::migrate::{Migration, MigrationType, Migrator};
use sqlx_postgres::PgPool;
use tracing::{info, instrument};

use crate::error::{PostgresError, Result};

/// (version, description, sql), in apply order.
const EMBEDDED: &[(i64, &str, &str)] = &[(
    20260101000001,
    "tollgate_schema",
    include_str!("../migrations/20260101000001_tollgate_schema.sql"),
)];

fn build_migrations() -> Vec<Migration> {
    EMBEDDED
        .iter()
        .map(|(version, description, sql)| Migration {
            version: *version,
            description: Cow::Borrowed(description),
            migration_type: MigrationType::Simple,
            sql: Cow::Borrowed(sql),
            checksum: Cow::Borrowed(&[]),
            no_tx: false,
        })
        .collect()
}

/// Applies every pending embedded migration.
///
/// # Errors
///
/// Returns `Migration` if a migration fails to apply.
#[instrument(skip(pool))]
pub async fn run(pool: &PgPool) -> Result<()> {
    let migrations = build_migrations();
    info!(count = migrations.len(), "Applying embedded migrations");

    let migrator = Migrator {
        migrations: Cow::Owned(migrations),
        ignore_missing: false,
        locking: true,
        no_tx: false,
    };
    migrator
        .run(pool)
        .await
        .map_err(|e| PostgresError::Migration(e.to_string()))?;

    info!("Migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered() {
        let migrations = build_migrations();
        assert!(!migrations.is_empty());
        assert!(migrations.windows(2).all(|w| w[0].version < w[1].version));
    }

    #[test]
    fn test_schema_creates_every_table() {
        let sql = EMBEDDED[0].2;
        for table in [
            "tollgate_oauth2_code",
            "tollgate_oauth2_access",
            "tollgate_oauth2_refresh",
            "tollgate_oauth2_pkce",
            "tollgate_oauth2_oidc",
            "tollgate_oauth2_device_auth_codes",
            "tollgate_oauth2_flow",
            "tollgate_oauth2_authentication_session",
            "tollgate_oauth2_jti_blacklist",
        ] {
            assert!(
                sql.contains(&format!("CREATE TABLE IF NOT EXISTS {table} ")),
                "missing {table}"
            );
        }
    }
}
