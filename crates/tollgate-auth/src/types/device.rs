//! RFC 8628 device authorization session types.

use serde::{Deserialize, Serialize};

use super::request::Request;

/// State of the user code in a device session.
///
/// `Unused` moves once to either `Used` or `Rejected`; both are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserCodeState {
    /// The user has not acted yet.
    #[default]
    Unused,
    /// The user approved the device.
    Used,
    /// The user declined the device.
    Rejected,
}

impl UserCodeState {
    /// Persisted numeric code.
    #[must_use]
    pub fn code(self) -> i16 {
        match self {
            Self::Unused => 0,
            Self::Used => 1,
            Self::Rejected => 2,
        }
    }

    /// Parses a persisted numeric code.
    #[must_use]
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::Unused),
            1 => Some(Self::Used),
            2 => Some(Self::Rejected),
            _ => None,
        }
    }

    /// Returns `true` once the user has decided.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Unused)
    }
}

/// A device flow requester.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRequest {
    pub request: Request,
    pub user_code_state: UserCodeState,
    pub device_code_active: bool,
}

impl DeviceRequest {
    /// Wraps a request as a fresh device session.
    #[must_use]
    pub fn new(request: Request) -> Self {
        Self {
            request,
            user_code_state: UserCodeState::Unused,
            device_code_active: true,
        }
    }
}

/// Response of the device authorization endpoint (RFC 8628 section 3.2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAuthorizeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    /// Seconds until both codes expire.
    pub expires_in: i64,
    /// Minimum polling interval in seconds.
    pub interval: i64,
}
