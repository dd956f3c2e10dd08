//! Domain types shared by the engine and its storage backends.

pub mod client;
pub mod device;
pub mod flow;
pub mod jti;
pub mod request;
pub mod session;

pub use client::{Client, GrantType};
pub use device::{DeviceAuthorizeResponse, DeviceRequest, UserCodeState};
pub use flow::{
    Flow, FlowState, HandledConsent, HandledLogin, LoginSession, RequestDenied,
};
pub use jti::{BlacklistedJti, jti_signature};
pub use request::{AccessRequest, AccessResponse, Form, Request};
pub use session::{Session, SessionKind, TokenType};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

/// Generates an opaque challenge identifier.
#[must_use]
pub fn new_challenge_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Generates a random URL-safe token (verifiers, CSRF values).
#[must_use]
pub fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
