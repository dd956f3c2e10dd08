//! PostgreSQL storage backend for the tollgate engine.
//!
//! Implements every storage trait of `tollgate-auth`:
//!
//! - token sessions, one table per session kind
//! - device authorization sessions
//! - login/consent flows and remembered login sessions
//! - the assertion JTI blacklist
//!
//! Every row carries the tenant's network id. Transactions run at
//! `REPEATABLE READ`; a concurrent writer surfaces as
//! `AuthError::SerializationFailure`, which callers may retry.
//!
//! # Example
//!
//! ```ignore
//! use tollgate_auth_postgres::{PostgresAuthStorage, PostgresConfig};
//!
//! let storage = PostgresAuthStorage::connect(&PostgresConfig::new(url)).await?;
//! let deps = Dependencies { storage: Arc::new(storage), /* ... */ };
//! ```

pub mod config;
mod device;
pub mod error;
mod flow;
mod jti;
pub mod migrations;
pub mod pool;
pub mod storage;
mod token_session;

pub use config::{ConnectRetry, PostgresConfig};
pub use error::PostgresError;
pub use pool::create_pool;
pub use sqlx_postgres::PgPool;
pub use storage::PostgresAuthStorage;
