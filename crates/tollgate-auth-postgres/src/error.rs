//! Error types for the PostgreSQL storage backend.
//!
//! Driver errors never leave this crate: storage methods map them onto
//! [`AuthError`] through [`storage_error`] or [`unique_error`].

use sqlx_core::error::Error as SqlxError;
use tollgate_auth::error::AuthError;

/// PostgreSQL error code for serialization failure (40001).
pub const PG_SERIALIZATION_FAILURE: &str = "40001";

/// PostgreSQL error code for deadlock detected (40P01).
pub const PG_DEADLOCK_DETECTED: &str = "40P01";

/// PostgreSQL error code for unique violation (23505).
pub const PG_UNIQUE_VIOLATION: &str = "23505";

/// Checks if a sqlx error has a specific PostgreSQL error code.
pub fn has_pg_error_code(err: &SqlxError, code: &str) -> bool {
    if let SqlxError::Database(db_err) = err {
        db_err.code().as_deref() == Some(code)
    } else {
        false
    }
}

/// Name of the violated constraint, if the database reported one.
fn violated_constraint(err: &SqlxError) -> Option<&str> {
    match err {
        SqlxError::Database(db_err) => db_err.constraint(),
        _ => None,
    }
}

/// Maps a driver error onto the engine taxonomy.
///
/// Serialization failures and deadlocks become `SerializationFailure`;
/// unique violations become `Conflict`; anything else is `Storage`.
pub(crate) fn storage_error(err: SqlxError) -> AuthError {
    unique_error(err, |_| AuthError::conflict("row already exists"))
}

/// Like [`storage_error`], but builds the unique-violation error from the
/// violated constraint name.
pub(crate) fn unique_error(
    err: SqlxError,
    on_unique: impl FnOnce(Option<&str>) -> AuthError,
) -> AuthError {
    if has_pg_error_code(&err, PG_SERIALIZATION_FAILURE)
        || has_pg_error_code(&err, PG_DEADLOCK_DETECTED)
    {
        return AuthError::serialization_failure(err.to_string());
    }
    if has_pg_error_code(&err, PG_UNIQUE_VIOLATION) {
        return on_unique(violated_constraint(&err));
    }
    AuthError::storage(err.to_string())
}

/// Errors raised while setting the backend up.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database connection error.
    #[error("Database connection error: {0}")]
    Connection(#[from] SqlxError),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl PostgresError {
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<PostgresError> for AuthError {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::Connection(e) => storage_error(e),
            PostgresError::Migration(e) => AuthError::storage(format!("Migration error: {e}")),
            PostgresError::Config { message } => AuthError::misconfiguration(message),
        }
    }
}

/// Result type alias for backend setup.
pub type Result<T> = std::result::Result<T, PostgresError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PostgresError::config("max_connections must be at least 1");
        assert!(err.to_string().contains("Configuration error"));

        let err = PostgresError::Migration("checksum mismatch".into());
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_non_database_errors_are_storage() {
        assert!(!has_pg_error_code(&SqlxError::RowNotFound, PG_UNIQUE_VIOLATION));
        let err = storage_error(SqlxError::PoolTimedOut);
        assert!(matches!(err, AuthError::Storage { .. }));
        assert!(err.is_server_error());
    }

    #[test]
    fn test_setup_errors_convert() {
        let err: AuthError = PostgresError::config("bad url").into();
        assert!(matches!(err, AuthError::Misconfiguration { .. }));

        let err: AuthError = PostgresError::Migration("boom".into()).into();
        assert!(matches!(err, AuthError::Storage { .. }));
    }
}
