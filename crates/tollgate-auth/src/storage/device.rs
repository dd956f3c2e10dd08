//! Device/user code session persistence.

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::AuthResult;
use crate::context::RequestContext;
use crate::types::UserCodeState;

/// A device session: one row reachable by device code, user code and
/// request id.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSessionRow {
    pub device_code_signature: String,
    pub user_code_signature: String,
    pub request_id: String,
    pub challenge_id: Option<String>,
    pub requested_at: OffsetDateTime,
    pub client_id: String,
    pub requested_scope: Vec<String>,
    pub granted_scope: Vec<String>,
    pub requested_audience: Vec<String>,
    pub granted_audience: Vec<String>,
    pub form_data: String,
    pub subject: String,
    pub session_data: String,
    pub expires_at: Option<OffsetDateTime>,
    pub user_code_state: UserCodeState,
    pub device_code_active: bool,
}

/// Fields written when the user decides on a device session.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSessionUpdate {
    pub granted_scope: Vec<String>,
    pub granted_audience: Vec<String>,
    pub subject: String,
    pub challenge_id: Option<String>,
    pub session_data: String,
    pub user_code_state: UserCodeState,
}

/// Device session storage.
#[async_trait]
pub trait DeviceSessionStorage: Send + Sync {
    /// Inserts a device session.
    ///
    /// # Errors
    ///
    /// Returns `ExistingUserCodeSignature` if the user code signature is
    /// already taken in this network.
    async fn create_device_session(
        &self,
        ctx: &RequestContext,
        row: DeviceSessionRow,
    ) -> AuthResult<()>;

    async fn find_device_session_by_device_code(
        &self,
        ctx: &RequestContext,
        device_code_signature: &str,
    ) -> AuthResult<Option<DeviceSessionRow>>;

    async fn find_device_session_by_user_code(
        &self,
        ctx: &RequestContext,
        user_code_signature: &str,
    ) -> AuthResult<Option<DeviceSessionRow>>;

    async fn find_device_session_by_request_id(
        &self,
        ctx: &RequestContext,
        request_id: &str,
    ) -> AuthResult<Option<DeviceSessionRow>>;

    /// Applies `update` to the session, if its user code state still equals
    /// `expected_state` (when given).
    ///
    /// Returns `false` if no row matched.
    async fn update_device_session(
        &self,
        ctx: &RequestContext,
        device_code_signature: &str,
        update: DeviceSessionUpdate,
        expected_state: Option<UserCodeState>,
    ) -> AuthResult<bool>;

    /// Marks the device code inactive.
    async fn invalidate_device_code(
        &self,
        ctx: &RequestContext,
        device_code_signature: &str,
    ) -> AuthResult<u64>;

    /// Deletes sessions requested before `not_after`.
    async fn flush_device_sessions(
        &self,
        ctx: &RequestContext,
        not_after: OffsetDateTime,
        limit: usize,
        batch_size: usize,
    ) -> AuthResult<u64>;
}
