//! Storage traits implemented by backends.
//!
//! Backends persist rows and enforce atomicity (compare-and-set updates,
//! unique constraints); hashing, encryption, client resolution and
//! active/expiry checks happen in the engine services on top of them.
//!
//! Every method takes a [`crate::context::RequestContext`] and must:
//! - scope the query by its network id,
//! - run inside its ambient transaction when one is present,
//! - abort when the context is cancelled.
//!
//! # Implementations
//!
//! - `tollgate-auth-memory` - in-process backend
//! - `tollgate-auth-postgres` - PostgreSQL backend

pub mod client;
pub mod credentials;
pub mod device;
pub mod flow;
pub mod jti;
pub mod login_session;
pub mod token_session;

pub use client::ClientDirectory;
pub use credentials::ResourceOwnerAuthenticator;
pub use device::{DeviceSessionRow, DeviceSessionStorage, DeviceSessionUpdate};
pub use flow::FlowStorage;
pub use jti::JtiStorage;
pub use login_session::LoginSessionStorage;
pub use token_session::{TokenSessionRow, TokenSessionStorage};

use crate::transaction::Transactional;

/// Everything the engine needs from a backend.
pub trait AuthStorage:
    TokenSessionStorage
    + FlowStorage
    + LoginSessionStorage
    + DeviceSessionStorage
    + JtiStorage
    + Transactional
{
}

impl<T> AuthStorage for T where
    T: TokenSessionStorage
        + FlowStorage
        + LoginSessionStorage
        + DeviceSessionStorage
        + JtiStorage
        + Transactional
{
}
