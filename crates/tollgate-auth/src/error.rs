//! Error taxonomy for the token session engine.
//!
//! Storage backends map their driver errors onto [`AuthError`] so that
//! callers can branch on "absent", "exists but inactive", "retry" and
//! "replay" without ever seeing a raw driver error. Protocol-facing code
//! turns an error into an RFC 6749 shaped body with
//! [`AuthError::to_error_response`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{DeviceRequest, Request};

/// The stored session reconstructed alongside an inactive-token error.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredSession {
    /// A code, access, refresh, PKCE or OIDC session.
    Token(Request),
    /// A device authorization session.
    Device(DeviceRequest),
}

impl StoredSession {
    /// Returns the generic request, regardless of the session kind.
    #[must_use]
    pub fn request(&self) -> &Request {
        match self {
            Self::Token(request) => request,
            Self::Device(device) => &device.request,
        }
    }
}

/// Errors that can occur while handling authorization challenges and token
/// sessions.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The row does not exist (for this tenant).
    #[error("Not found: {message}")]
    NotFound {
        /// What was looked up.
        message: String,
    },

    /// A challenge or consent was submitted twice.
    #[error("Conflict: {message}")]
    Conflict {
        /// Description of the conflicting state.
        message: String,
    },

    /// The token exists but is no longer active.
    #[error("Token is inactive")]
    InactiveToken {
        /// The reconstructed session.
        session: Box<StoredSession>,
    },

    /// The authorization code exists but was already exchanged.
    #[error("Authorization code has already been used")]
    InvalidatedAuthorizeCode {
        /// The reconstructed session.
        session: Box<StoredSession>,
    },

    /// The token exists and is active but its expiry has passed.
    #[error("Token expired: {message}")]
    TokenExpired {
        /// Which token expired.
        message: String,
    },

    /// A concurrent write conflicted with this one; retry the whole request.
    #[error("Serialization failure: {message}")]
    SerializationFailure {
        /// Driver-provided detail.
        message: String,
    },

    /// The client assertion JWT ID was already used.
    #[error("JTI is already known: {message}")]
    JtiKnown {
        /// Description of the replay.
        message: String,
    },

    /// The user code signature collides with an existing device session.
    #[error("User code signature already exists: {message}")]
    ExistingUserCodeSignature {
        /// Driver-provided detail.
        message: String,
    },

    /// Signing or encryption key material is missing or invalid.
    #[error("Misconfiguration: {message}")]
    Misconfiguration {
        /// What is misconfigured.
        message: String,
    },

    /// The request is malformed or arrived in the wrong state.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Description of why the request is invalid.
        message: String,
    },

    /// The client could not be resolved or authenticated.
    #[error("Invalid client: {message}")]
    InvalidClient {
        /// Description of why the client is invalid.
        message: String,
    },

    /// The client is not allowed to use the requested grant.
    #[error("Unauthorized client: {message}")]
    UnauthorizedClient {
        /// Description of the missing permission.
        message: String,
    },

    /// The grant (code, refresh token, device code, credentials) is invalid.
    #[error("Invalid grant: {message}")]
    InvalidGrant {
        /// Description of why the grant is invalid.
        message: String,
    },

    /// The requested scope is not allowed or was never granted.
    #[error("Invalid scope: {message}")]
    InvalidScope {
        /// Description of the scope problem.
        message: String,
    },

    /// No handler exists for the grant type.
    #[error("Unsupported grant type: {grant_type}")]
    UnsupportedGrantType {
        /// The unsupported grant type.
        grant_type: String,
    },

    /// The device flow user has not decided yet.
    #[error("Authorization pending")]
    AuthorizationPending,

    /// The resource owner or the login/consent provider denied the request.
    #[error("Access denied: {message}")]
    AccessDenied {
        /// Description of the denial.
        message: String,
    },

    /// The caller cancelled the operation or its deadline passed.
    #[error("Cancelled: {message}")]
    Cancelled {
        /// Why the operation was aborted.
        message: String,
    },

    /// The storage backend failed.
    #[error("Storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// An unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl AuthError {
    // -------------------------------------------------------------------------
    // Constructor Methods
    // -------------------------------------------------------------------------

    /// Creates a `NotFound` error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Creates a `Conflict` error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates an `InactiveToken` error carrying the reconstructed request.
    #[must_use]
    pub fn inactive_token(request: Request) -> Self {
        Self::InactiveToken {
            session: Box::new(StoredSession::Token(request)),
        }
    }

    /// Creates an `InactiveToken` error carrying a device request.
    #[must_use]
    pub fn inactive_device(request: DeviceRequest) -> Self {
        Self::InactiveToken {
            session: Box::new(StoredSession::Device(request)),
        }
    }

    /// Creates an `InvalidatedAuthorizeCode` error.
    #[must_use]
    pub fn invalidated_authorize_code(request: Request) -> Self {
        Self::InvalidatedAuthorizeCode {
            session: Box::new(StoredSession::Token(request)),
        }
    }

    /// Creates a `TokenExpired` error.
    #[must_use]
    pub fn token_expired(message: impl Into<String>) -> Self {
        Self::TokenExpired {
            message: message.into(),
        }
    }

    /// Creates a `SerializationFailure` error.
    #[must_use]
    pub fn serialization_failure(message: impl Into<String>) -> Self {
        Self::SerializationFailure {
            message: message.into(),
        }
    }

    /// Creates a `JtiKnown` error.
    #[must_use]
    pub fn jti_known(message: impl Into<String>) -> Self {
        Self::JtiKnown {
            message: message.into(),
        }
    }

    /// Creates an `ExistingUserCodeSignature` error.
    #[must_use]
    pub fn existing_user_code_signature(message: impl Into<String>) -> Self {
        Self::ExistingUserCodeSignature {
            message: message.into(),
        }
    }

    /// Creates a `Misconfiguration` error.
    #[must_use]
    pub fn misconfiguration(message: impl Into<String>) -> Self {
        Self::Misconfiguration {
            message: message.into(),
        }
    }

    /// Creates an `InvalidRequest` error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates an `InvalidClient` error.
    #[must_use]
    pub fn invalid_client(message: impl Into<String>) -> Self {
        Self::InvalidClient {
            message: message.into(),
        }
    }

    /// Creates an `UnauthorizedClient` error.
    #[must_use]
    pub fn unauthorized_client(message: impl Into<String>) -> Self {
        Self::UnauthorizedClient {
            message: message.into(),
        }
    }

    /// Creates an `InvalidGrant` error.
    #[must_use]
    pub fn invalid_grant(message: impl Into<String>) -> Self {
        Self::InvalidGrant {
            message: message.into(),
        }
    }

    /// Creates an `InvalidScope` error.
    #[must_use]
    pub fn invalid_scope(message: impl Into<String>) -> Self {
        Self::InvalidScope {
            message: message.into(),
        }
    }

    /// Creates an `UnsupportedGrantType` error.
    #[must_use]
    pub fn unsupported_grant_type(grant_type: impl Into<String>) -> Self {
        Self::UnsupportedGrantType {
            grant_type: grant_type.into(),
        }
    }

    /// Creates an `AccessDenied` error.
    #[must_use]
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::AccessDenied {
            message: message.into(),
        }
    }

    /// Creates a `Cancelled` error.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Creates a `Storage` error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates an `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    // -------------------------------------------------------------------------
    // Predicate Methods
    // -------------------------------------------------------------------------

    /// Returns `true` if this is a `NotFound` error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if this is a `Conflict` error.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns `true` if the row exists but is inactive (possible replay).
    #[must_use]
    pub fn is_inactive(&self) -> bool {
        matches!(
            self,
            Self::InactiveToken { .. } | Self::InvalidatedAuthorizeCode { .. }
        )
    }

    /// Returns `true` if the caller should retry the whole request.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SerializationFailure { .. })
    }

    /// Returns `true` if this is a client error (4xx category).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::Conflict { .. }
                | Self::InactiveToken { .. }
                | Self::InvalidatedAuthorizeCode { .. }
                | Self::TokenExpired { .. }
                | Self::SerializationFailure { .. }
                | Self::JtiKnown { .. }
                | Self::InvalidRequest { .. }
                | Self::InvalidClient { .. }
                | Self::UnauthorizedClient { .. }
                | Self::InvalidGrant { .. }
                | Self::InvalidScope { .. }
                | Self::UnsupportedGrantType { .. }
                | Self::AuthorizationPending
                | Self::AccessDenied { .. }
        )
    }

    /// Returns `true` if this is a server error (5xx category).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::ExistingUserCodeSignature { .. }
                | Self::Misconfiguration { .. }
                | Self::Cancelled { .. }
                | Self::Storage { .. }
                | Self::Internal { .. }
        )
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Returns the request reconstructed for an inactive token, if any.
    #[must_use]
    pub fn inactive_request(&self) -> Option<&Request> {
        match self {
            Self::InactiveToken { session } | Self::InvalidatedAuthorizeCode { session } => {
                Some(session.request())
            }
            _ => None,
        }
    }

    /// Returns the device request reconstructed for an inactive device or
    /// user code, if any.
    #[must_use]
    pub fn inactive_device_request(&self) -> Option<&DeviceRequest> {
        match self {
            Self::InactiveToken { session } => match session.as_ref() {
                StoredSession::Device(device) => Some(device),
                StoredSession::Token(_) => None,
            },
            _ => None,
        }
    }

    /// Returns the error category for logging purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. }
            | Self::InactiveToken { .. }
            | Self::InvalidatedAuthorizeCode { .. }
            | Self::TokenExpired { .. } => ErrorCategory::Token,
            Self::Conflict { .. } | Self::InvalidRequest { .. } => ErrorCategory::Validation,
            Self::SerializationFailure { .. } => ErrorCategory::Concurrency,
            Self::JtiKnown { .. } => ErrorCategory::Replay,
            Self::InvalidClient { .. }
            | Self::UnauthorizedClient { .. }
            | Self::InvalidGrant { .. } => ErrorCategory::Authentication,
            Self::InvalidScope { .. }
            | Self::AuthorizationPending
            | Self::AccessDenied { .. } => ErrorCategory::Authorization,
            Self::UnsupportedGrantType { .. } => ErrorCategory::Validation,
            Self::Misconfiguration { .. } => ErrorCategory::Configuration,
            Self::ExistingUserCodeSignature { .. }
            | Self::Cancelled { .. }
            | Self::Storage { .. } => ErrorCategory::Infrastructure,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Returns the OAuth 2.0 error code for this error.
    #[must_use]
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. }
            | Self::InactiveToken { .. }
            | Self::InvalidatedAuthorizeCode { .. }
            | Self::TokenExpired { .. }
            | Self::InvalidGrant { .. } => "invalid_grant",
            Self::Conflict { .. }
            | Self::SerializationFailure { .. }
            | Self::InvalidRequest { .. } => "invalid_request",
            Self::JtiKnown { .. } | Self::InvalidClient { .. } => "invalid_client",
            Self::UnauthorizedClient { .. } => "unauthorized_client",
            Self::InvalidScope { .. } => "invalid_scope",
            Self::UnsupportedGrantType { .. } => "unsupported_grant_type",
            Self::AuthorizationPending => "authorization_pending",
            Self::AccessDenied { .. } => "access_denied",
            Self::ExistingUserCodeSignature { .. }
            | Self::Misconfiguration { .. }
            | Self::Cancelled { .. }
            | Self::Storage { .. }
            | Self::Internal { .. } => "server_error",
        }
    }

    /// Builds the wire-level error body for this error.
    ///
    /// Server-side failures get a generic description so that storage
    /// details never reach the client.
    #[must_use]
    pub fn to_error_response(&self) -> ErrorResponse {
        let description = match self {
            Self::NotFound { .. } => {
                "The provided grant is malformed, unknown, or was issued to another client."
                    .to_string()
            }
            Self::InactiveToken { .. } => "The token is no longer active.".to_string(),
            Self::InvalidatedAuthorizeCode { .. } => {
                "The authorization code has already been used.".to_string()
            }
            Self::SerializationFailure { .. } => {
                "Multiple concurrent requests used the same grant. Please retry the request."
                    .to_string()
            }
            Self::JtiKnown { .. } => "The client assertion has already been used.".to_string(),
            Self::AuthorizationPending => {
                "The user has not yet completed the authorization.".to_string()
            }
            _ if self.is_server_error() => {
                "The authorization server encountered an unexpected condition.".to_string()
            }
            other => other.to_string(),
        };
        ErrorResponse {
            error: self.oauth_error_code().to_string(),
            error_description: Some(description),
        }
    }
}

/// RFC 6749 section 5.2 error response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// The error code.
    pub error: String,

    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

/// Categories of engine errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Client or grant authentication.
    Authentication,
    /// Scope, consent and user decisions.
    Authorization,
    /// Token lookups and lifecycle.
    Token,
    /// Request validation.
    Validation,
    /// Concurrent write conflicts.
    Concurrency,
    /// Replayed one-time identifiers.
    Replay,
    /// Storage and cancellation.
    Infrastructure,
    /// Key material and configuration.
    Configuration,
    /// Internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication"),
            Self::Authorization => write!(f, "authorization"),
            Self::Token => write!(f, "token"),
            Self::Validation => write!(f, "validation"),
            Self::Concurrency => write!(f, "concurrency"),
            Self::Replay => write!(f, "replay"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("session serialization failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Client, Session, UserCodeState};

    fn request() -> Request {
        Request::new(Client::new("c1"), Session::new("alice"))
    }

    #[test]
    fn test_error_display() {
        let err = AuthError::not_found("access token");
        assert_eq!(err.to_string(), "Not found: access token");

        let err = AuthError::conflict("login already handled");
        assert_eq!(err.to_string(), "Conflict: login already handled");

        let err = AuthError::inactive_token(request());
        assert_eq!(err.to_string(), "Token is inactive");

        let err = AuthError::unsupported_grant_type("urn:custom");
        assert_eq!(err.to_string(), "Unsupported grant type: urn:custom");
    }

    #[test]
    fn test_inactive_errors_carry_request() {
        let err = AuthError::invalidated_authorize_code(request());
        assert!(err.is_inactive());
        assert_eq!(err.inactive_request().map(|r| r.client.id.as_str()), Some("c1"));
        assert!(err.inactive_device_request().is_none());

        let device = DeviceRequest::new(request());
        let err = AuthError::inactive_device(device);
        assert_eq!(
            err.inactive_device_request().map(|d| d.user_code_state),
            Some(UserCodeState::Unused)
        );
        assert!(err.inactive_request().is_some());

        assert!(AuthError::not_found("x").inactive_request().is_none());
    }

    #[test]
    fn test_error_predicates() {
        let err = AuthError::serialization_failure("could not serialize access");
        assert!(err.is_retryable());
        assert!(err.is_client_error());
        assert!(!err.is_server_error());

        let err = AuthError::storage("connection reset");
        assert!(err.is_server_error());
        assert!(!err.is_client_error());

        assert!(AuthError::not_found("x").is_not_found());
        assert!(AuthError::conflict("x").is_conflict());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            AuthError::jti_known("jti-1").category(),
            ErrorCategory::Replay
        );
        assert_eq!(
            AuthError::serialization_failure("x").category(),
            ErrorCategory::Concurrency
        );
        assert_eq!(
            AuthError::misconfiguration("no secret").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(ErrorCategory::Infrastructure.to_string(), "infrastructure");
    }

    #[test]
    fn test_oauth_error_code() {
        assert_eq!(
            AuthError::invalidated_authorize_code(request()).oauth_error_code(),
            "invalid_grant"
        );
        assert_eq!(
            AuthError::inactive_token(request()).oauth_error_code(),
            "invalid_grant"
        );
        assert_eq!(
            AuthError::AuthorizationPending.oauth_error_code(),
            "authorization_pending"
        );
        assert_eq!(
            AuthError::serialization_failure("x").oauth_error_code(),
            "invalid_request"
        );
        assert_eq!(
            AuthError::existing_user_code_signature("x").oauth_error_code(),
            "server_error"
        );
    }

    #[test]
    fn test_error_response_hides_internal_detail() {
        let body = AuthError::storage("duplicate key value violates pkey").to_error_response();
        assert_eq!(body.error, "server_error");
        let description = body.error_description.unwrap_or_default();
        assert!(!description.contains("pkey"));

        let body = AuthError::invalid_scope("scope 'admin' not allowed").to_error_response();
        assert_eq!(body.error, "invalid_scope");
        assert!(body.error_description.unwrap_or_default().contains("admin"));

        let json = serde_json::to_value(AuthError::AuthorizationPending.to_error_response())
            .unwrap();
        assert_eq!(json["error"], "authorization_pending");
    }
}
