//! Static collaborators: client directory and resource owner accounts.

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use async_trait::async_trait;
use dashmap::DashMap;

use tollgate_auth::AuthResult;
use tollgate_auth::context::RequestContext;
use tollgate_auth::error::AuthError;
use tollgate_auth::storage::{ClientDirectory, ResourceOwnerAuthenticator};
use tollgate_auth::types::Client;

/// Clients registered in process.
#[derive(Debug, Default)]
pub struct MemoryClientDirectory {
    clients: DashMap<String, Client>,
}

impl MemoryClientDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a client.
    pub fn register(&self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Removes a client.
    pub fn remove(&self, client_id: &str) -> Option<Client> {
        self.clients.remove(client_id).map(|(_, client)| client)
    }
}

#[async_trait]
impl ClientDirectory for MemoryClientDirectory {
    async fn get_client(&self, _ctx: &RequestContext, client_id: &str) -> AuthResult<Client> {
        self.clients
            .get(client_id)
            .map(|client| client.clone())
            .ok_or_else(|| AuthError::not_found(format!("client '{client_id}'")))
    }
}

struct Account {
    subject: String,
    password_hash: String,
}

/// Username/password accounts for the password grant.
///
/// Passwords are stored as Argon2id PHC strings.
#[derive(Default)]
pub struct MemoryResourceOwners {
    accounts: DashMap<String, Account>,
}

impl MemoryResourceOwners {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an account, hashing its password.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if hashing fails.
    pub fn add(&self, username: &str, password: &str, subject: &str) -> AuthResult<()> {
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AuthError::internal(format!("password hashing failed: {e}")))?
            .to_string();
        self.accounts.insert(
            username.to_string(),
            Account {
                subject: subject.to_string(),
                password_hash,
            },
        );
        Ok(())
    }
}

impl std::fmt::Debug for MemoryResourceOwners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryResourceOwners")
            .field("accounts", &self.accounts.len())
            .finish()
    }
}

#[async_trait]
impl ResourceOwnerAuthenticator for MemoryResourceOwners {
    async fn authenticate(
        &self,
        _ctx: &RequestContext,
        username: &str,
        password: &str,
    ) -> AuthResult<String> {
        let account = self
            .accounts
            .get(username)
            .ok_or_else(|| AuthError::not_found("resource owner"))?;
        let parsed = PasswordHash::new(&account.password_hash)
            .map_err(|e| AuthError::internal(format!("stored password hash is invalid: {e}")))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| {
                tracing::debug!(username, "resource owner password rejected");
                AuthError::invalid_grant("wrong password")
            })?;
        Ok(account.subject.clone())
    }
}
