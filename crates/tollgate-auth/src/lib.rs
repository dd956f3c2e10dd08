//! # tollgate-auth
//!
//! Authorization challenge and token session engine for an OAuth 2.0 /
//! OpenID Connect authorization server.
//!
//! This crate provides:
//! - The login/consent challenge state machine
//! - A uniform session store for every token kind
//! - Refresh token rotation with an optional grace period
//! - RFC 8628 device authorization
//! - JTI replay protection and token-bound nonces
//! - Token endpoint grant handlers
//!
//! Persistence is pluggable through the traits in [`storage`]; see the
//! `tollgate-auth-memory` and `tollgate-auth-postgres` crates.
//!
//! ## Modules
//!
//! - [`config`] - Engine configuration and validation
//! - [`context`] - Request context, tenancy and cancellation
//! - [`transaction`] - Ambient transactions with join semantics
//! - [`session_store`] - Token session persistence
//! - [`challenge`] - Login and consent coordinator
//! - [`rotation`] - Refresh token rotation and revocation
//! - [`device`] - Device authorization sessions
//! - [`replay`] - JTI blacklist and nonces
//! - [`grant`] - Token endpoint grant handlers
//! - [`engine`] - Dependency wiring

pub mod challenge;
pub mod cipher;
pub mod config;
pub mod context;
pub mod device;
pub mod engine;
pub mod error;
pub mod grant;
pub mod observability;
pub mod pkce;
pub mod replay;
pub mod rotation;
pub mod session_store;
pub mod signature;
pub mod storage;
pub mod strategy;
pub mod transaction;
pub mod types;
pub mod util;

pub use cipher::{AesGcmCipher, Cipher};
pub use config::{ConfigError, EngineConfig, load_config};
pub use context::{NetworkId, RequestContext, StaticTenantResolver, TenantResolver};
pub use engine::{Dependencies, FlushReport, TokenEngine};
pub use error::{AuthError, ErrorCategory, ErrorResponse, StoredSession};
pub use grant::GrantHandler;
pub use storage::{AuthStorage, ClientDirectory, ResourceOwnerAuthenticator};
pub use strategy::{HmacTokenStrategy, TokenStrategy};
pub use transaction::{Transactional, in_transaction};

/// Type alias for engine results.
pub type AuthResult<T> = Result<T, AuthError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use tollgate_auth::prelude::*;
/// ```
pub mod prelude {
    pub use crate::AuthResult;
    pub use crate::cipher::{AesGcmCipher, Cipher};
    pub use crate::config::EngineConfig;
    pub use crate::context::{NetworkId, RequestContext};
    pub use crate::engine::{Dependencies, TokenEngine};
    pub use crate::error::{AuthError, ErrorCategory};
    pub use crate::storage::{AuthStorage, ClientDirectory, ResourceOwnerAuthenticator};
    pub use crate::strategy::{HmacTokenStrategy, TokenStrategy};
    pub use crate::types::{
        AccessRequest, AccessResponse, Client, DeviceRequest, Flow, FlowState, GrantType,
        HandledConsent, HandledLogin, Request, Session, SessionKind, TokenType, UserCodeState,
    };
}
