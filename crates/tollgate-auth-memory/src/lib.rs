//! In-memory storage backend for the tollgate engine.
//!
//! Implements every storage trait of `tollgate-auth` on process memory,
//! plus a static client directory and resource owner accounts. Suitable
//! for tests and single-node deployments; nothing survives a restart.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tollgate_auth::{EngineConfig, TokenEngine};
//! use tollgate_auth_memory::{MemoryClientDirectory, dependencies};
//!
//! let clients = Arc::new(MemoryClientDirectory::new());
//! let engine = TokenEngine::new(dependencies(config, clients, None)?);
//! ```

mod device;
pub mod directory;
mod flow;
mod jti;
pub mod storage;
mod token_session;

use std::sync::Arc;

use tollgate_auth::cipher::AesGcmCipher;
use tollgate_auth::config::EngineConfig;
use tollgate_auth::engine::Dependencies;
use tollgate_auth::error::AuthError;
use tollgate_auth::strategy::HmacTokenStrategy;
use tollgate_auth::AuthResult;

pub use directory::{MemoryClientDirectory, MemoryResourceOwners};
pub use storage::MemoryAuthStorage;

/// Wires engine dependencies around a fresh in-memory store.
///
/// The first system secret keys both the token strategy and the session
/// cipher.
///
/// # Errors
///
/// Returns `Misconfiguration` if the configuration is invalid or has no
/// system secret.
pub fn dependencies(
    config: EngineConfig,
    clients: Arc<MemoryClientDirectory>,
    owners: Option<Arc<MemoryResourceOwners>>,
) -> AuthResult<Dependencies> {
    config
        .validate()
        .map_err(|e| AuthError::misconfiguration(e.to_string()))?;
    let secret = config
        .encryption
        .system_secrets
        .first()
        .ok_or_else(|| AuthError::misconfiguration("at least one system secret is required"))?;

    let strategy = HmacTokenStrategy::new(secret.as_bytes())?
        .with_user_code_length(config.device.user_code_length);
    let cipher = AesGcmCipher::new(&config.encryption.system_secrets)?;

    Ok(Dependencies {
        config: Arc::new(config),
        storage: Arc::new(MemoryAuthStorage::new()),
        clients,
        strategy: Arc::new(strategy),
        cipher: Arc::new(cipher),
        authenticator: owners.map(|o| o as Arc<dyn tollgate_auth::storage::ResourceOwnerAuthenticator>),
    })
}
