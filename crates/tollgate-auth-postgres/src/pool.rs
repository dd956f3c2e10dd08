//! Connection pool construction.

use std::time::Duration;

use sqlx_core::pool::PoolOptions;
use sqlx_postgres::{PgPool, Postgres};
use tracing::{debug, info, instrument, warn};

use crate::config::PostgresConfig;
use crate::error::{PostgresError, Result};

/// Type alias for PostgreSQL pool options.
pub type PgPoolOptions = PoolOptions<Postgres>;

/// Creates a connection pool, retrying the first connection with the
/// backoff in `config.retry`.
#[instrument(skip(config), fields(url = %mask_password(&config.url)))]
pub async fn create_pool(config: &PostgresConfig) -> Result<PgPool> {
    config.validate()?;

    info!(
        max_connections = config.max_connections,
        acquire_timeout = ?config.acquire_timeout,
        retries = config.retry.attempts,
        "Creating PostgreSQL connection pool"
    );

    let options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections((config.max_connections / 4).max(1))
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(Duration::from_secs(1800))
        .test_before_acquire(false);

    let mut attempt = 0;
    loop {
        match options.clone().connect(&config.url).await {
            Ok(pool) => {
                debug!(attempt, "PostgreSQL connection pool created");
                return Ok(pool);
            }
            Err(err) if attempt < config.retry.attempts => {
                attempt += 1;
                let delay = config.retry.delay(attempt);
                warn!(
                    attempt,
                    retry_in = ?delay,
                    error = %err,
                    "PostgreSQL connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(PostgresError::from(err)),
        }
    }
}

/// Masks the password in a database URL for logging.
pub(crate) fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.find('@')
        && let Some(colon_pos) = url[..at_pos].rfind(':')
    {
        let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
        if colon_pos > scheme_end {
            return format!("{}:****{}", &url[..colon_pos], &url[at_pos..]);
        }
    }
    url.to_string()
}
