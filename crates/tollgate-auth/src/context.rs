//! Per-request context: tenant, cancellation, deadline and ambient transaction.
//!
//! Every storage call takes a [`RequestContext`]. Backends scope every query
//! by [`RequestContext::nid`] and wrap the query future in
//! [`RequestContext::run`] so a cancelled request aborts the query instead of
//! finishing it in the background.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::AuthResult;
use crate::error::AuthError;

// =============================================================================
// Network Id
// =============================================================================

/// Tenant identifier carried by every persisted row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(pub Uuid);

impl NetworkId {
    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Generates a new random network id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Supplies the network id for an incoming request.
pub trait TenantResolver: Send + Sync {
    /// Resolves the tenant from an optional host or routing hint.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the hint names no known tenant.
    fn resolve(&self, host_hint: Option<&str>) -> AuthResult<NetworkId>;
}

/// Resolver for single-tenant deployments.
#[derive(Debug, Clone, Copy)]
pub struct StaticTenantResolver {
    nid: NetworkId,
}

impl StaticTenantResolver {
    /// Creates a resolver that always answers `nid`.
    #[must_use]
    pub fn new(nid: NetworkId) -> Self {
        Self { nid }
    }
}

impl TenantResolver for StaticTenantResolver {
    fn resolve(&self, _host_hint: Option<&str>) -> AuthResult<NetworkId> {
        Ok(self.nid)
    }
}

// =============================================================================
// Transaction Handle
// =============================================================================

/// Opaque handle to a backend transaction attached to a context.
///
/// The backend decides what lives in the slot. Only the context that opened
/// the transaction owns it; joined contexts commit and roll back as no-ops.
#[derive(Clone)]
pub struct TransactionHandle {
    slot: Arc<dyn Any + Send + Sync>,
    owner: bool,
}

impl TransactionHandle {
    /// Creates an owning handle around a backend transaction.
    #[must_use]
    pub fn new<T: Any + Send + Sync>(slot: T) -> Self {
        Self {
            slot: Arc::new(slot),
            owner: true,
        }
    }

    /// Returns a non-owning handle to the same transaction.
    #[must_use]
    pub fn joined(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            owner: false,
        }
    }

    /// Returns `true` if this handle opened the transaction.
    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Returns the backend transaction if it has type `T`.
    #[must_use]
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.slot).downcast::<T>().ok()
    }
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Request Context
// =============================================================================

/// Caller-supplied context for one engine call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    nid: NetworkId,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
    transaction: Option<TransactionHandle>,
}

impl RequestContext {
    /// Creates a context for a tenant with no deadline.
    #[must_use]
    pub fn new(nid: NetworkId) -> Self {
        Self {
            nid,
            cancellation: CancellationToken::new(),
            deadline: None,
            transaction: None,
        }
    }

    /// Uses a caller-owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Aborts store calls once `timeout` has elapsed from now.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Aborts store calls at `deadline`.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// The tenant every query is scoped to.
    #[must_use]
    pub fn nid(&self) -> NetworkId {
        self.nid
    }

    /// The cancellation token of this request.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// The ambient transaction, if one is open.
    #[must_use]
    pub fn transaction(&self) -> Option<&TransactionHandle> {
        self.transaction.as_ref()
    }

    /// Returns a copy of this context carrying `handle`.
    #[must_use]
    pub fn with_transaction(&self, handle: TransactionHandle) -> Self {
        Self {
            transaction: Some(handle),
            ..self.clone()
        }
    }

    /// Returns `true` if the request was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Runs a store future, aborting it on cancellation or deadline.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the token fires or the deadline passes first,
    /// otherwise the future's own result.
    pub async fn run<T, F>(&self, fut: F) -> AuthResult<T>
    where
        F: Future<Output = AuthResult<T>>,
    {
        if self.cancellation.is_cancelled() {
            return Err(AuthError::cancelled("request was cancelled"));
        }

        let guarded = async {
            tokio::select! {
                biased;
                () = self.cancellation.cancelled() => {
                    Err(AuthError::cancelled("request was cancelled"))
                }
                result = fut => result,
            }
        };

        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, guarded)
                .await
                .unwrap_or_else(|_| Err(AuthError::cancelled("request deadline exceeded"))),
            None => guarded.await,
        }
    }
}
