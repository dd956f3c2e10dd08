//! Authorization flow aggregate and its login/consent state machine.
//!
//! ```text
//!   LoginInitialized ──handle_login──▶ LoginUnused ─┐
//!          │                                        ├─invalidate_login──▶ LoginUsed
//!          └───────handle_login(err)──▶ LoginError ─┘                        │
//!                                                                     begin_consent
//!                                                                            ▼
//!   ConsentUsed ◀──invalidate_consent── ConsentUnused ◀──handle_consent── ConsentInitialized
//!        ▲                                                                    │
//!        └──────────invalidate_consent── ConsentError ◀──handle_consent(err)──┘
//! ```
//!
//! Every transition is a pure method on [`Flow`]; persisting it is the
//! coordinator's job, which does so with a compare-and-set on the previous
//! state.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use super::{new_challenge_id, random_token};
use crate::error::AuthError;
use crate::AuthResult;

// =============================================================================
// Flow State
// =============================================================================

/// Persisted state of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i16", try_from = "i16")]
pub enum FlowState {
    /// Waiting for the login provider.
    LoginInitialized,
    /// Login accepted, verifier not yet redeemed.
    LoginUnused,
    /// Login verifier redeemed.
    LoginUsed,
    /// Waiting for the consent provider.
    ConsentInitialized,
    /// Consent accepted, verifier not yet redeemed.
    ConsentUnused,
    /// Consent verifier redeemed.
    ConsentUsed,
    /// Login rejected, verifier not yet redeemed.
    LoginError,
    /// Consent rejected, verifier not yet redeemed.
    ConsentError,
}

impl FlowState {
    /// Persisted numeric code.
    #[must_use]
    pub fn code(self) -> i16 {
        match self {
            Self::LoginInitialized => 1,
            Self::LoginUnused => 2,
            Self::LoginUsed => 3,
            Self::ConsentInitialized => 4,
            Self::ConsentUnused => 5,
            Self::ConsentUsed => 6,
            Self::LoginError => 128,
            Self::ConsentError => 129,
        }
    }

    /// Parses a persisted numeric code.
    #[must_use]
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(Self::LoginInitialized),
            2 => Some(Self::LoginUnused),
            3 => Some(Self::LoginUsed),
            4 => Some(Self::ConsentInitialized),
            5 => Some(Self::ConsentUnused),
            6 => Some(Self::ConsentUsed),
            128 => Some(Self::LoginError),
            129 => Some(Self::ConsentError),
            _ => None,
        }
    }
}

impl From<FlowState> for i16 {
    fn from(state: FlowState) -> Self {
        state.code()
    }
}

impl TryFrom<i16> for FlowState {
    type Error = String;

    fn try_from(code: i16) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("unknown flow state {code}"))
    }
}

// =============================================================================
// Provider Decisions
// =============================================================================

/// A denial reported by the login or consent provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDenied {
    pub error: String,
    #[serde(default)]
    pub error_description: String,
}

impl RequestDenied {
    /// Creates a denial with an OAuth error code.
    #[must_use]
    pub fn new(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            error_description: description.into(),
        }
    }
}

/// The login provider's answer to a login challenge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandledLogin {
    pub subject: String,
    pub remember: bool,
    /// Seconds the login session is remembered; 0 means for the browser session.
    pub remember_for: i64,
    pub acr: String,
    pub amr: Vec<String>,
    pub context: serde_json::Value,
    pub error: Option<RequestDenied>,
}

impl HandledLogin {
    /// Accepts the login for a subject.
    #[must_use]
    pub fn accept(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Self::default()
        }
    }

    /// Rejects the login.
    #[must_use]
    pub fn reject(error: RequestDenied) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

/// The consent provider's answer to a consent challenge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandledConsent {
    pub granted_scope: Vec<String>,
    pub granted_audience: Vec<String>,
    pub remember: bool,
    /// Seconds the decision is remembered; 0 means forever.
    pub remember_for: i64,
    pub session_claims: serde_json::Map<String, serde_json::Value>,
    pub error: Option<RequestDenied>,
}

impl HandledConsent {
    /// Grants the given scopes and audience.
    #[must_use]
    pub fn grant(scope: Vec<String>, audience: Vec<String>) -> Self {
        Self {
            granted_scope: scope,
            granted_audience: audience,
            ..Self::default()
        }
    }

    /// Rejects the consent.
    #[must_use]
    pub fn reject(error: RequestDenied) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

// =============================================================================
// Flow
// =============================================================================

/// One authorization attempt spanning login and consent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// The flow id, handed to the login provider.
    pub login_challenge: String,
    pub login_verifier: String,
    pub login_csrf: String,

    pub client_id: String,
    pub request_url: String,
    pub requested_scope: Vec<String>,
    pub requested_audience: Vec<String>,

    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub login_session_id: Option<String>,
    #[serde(default)]
    pub login_remember: bool,
    #[serde(default)]
    pub login_remember_for: i64,
    #[serde(default)]
    pub acr: String,
    #[serde(default)]
    pub amr: Vec<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub login_authenticated_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub login_error: Option<RequestDenied>,
    #[serde(default)]
    pub context: serde_json::Value,

    #[serde(default)]
    pub consent_challenge: Option<String>,
    #[serde(default)]
    pub consent_verifier: Option<String>,
    #[serde(default)]
    pub consent_csrf: Option<String>,
    #[serde(default)]
    pub granted_scope: Vec<String>,
    #[serde(default)]
    pub granted_audience: Vec<String>,
    #[serde(default)]
    pub consent_remember: bool,
    #[serde(default)]
    pub consent_remember_for: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub consent_handled_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub consent_error: Option<RequestDenied>,
    #[serde(default)]
    pub session_claims: serde_json::Map<String, serde_json::Value>,

    pub state: FlowState,

    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
}

impl Flow {
    /// Starts a flow in [`FlowState::LoginInitialized`].
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        requested_scope: Vec<String>,
        requested_audience: Vec<String>,
        request_url: impl Into<String>,
    ) -> Self {
        Self {
            login_challenge: new_challenge_id(),
            login_verifier: random_token(),
            login_csrf: random_token(),
            client_id: client_id.into(),
            request_url: request_url.into(),
            requested_scope,
            requested_audience,
            subject: String::new(),
            login_session_id: None,
            login_remember: false,
            login_remember_for: 0,
            acr: String::new(),
            amr: Vec::new(),
            login_authenticated_at: None,
            login_error: None,
            context: serde_json::Value::Null,
            consent_challenge: None,
            consent_verifier: None,
            consent_csrf: None,
            granted_scope: Vec::new(),
            granted_audience: Vec::new(),
            consent_remember: false,
            consent_remember_for: 0,
            consent_handled_at: None,
            consent_error: None,
            session_claims: serde_json::Map::new(),
            state: FlowState::LoginInitialized,
            requested_at: OffsetDateTime::now_utc(),
        }
    }

    /// Records the login provider's decision.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` once the login was already handled.
    pub fn handle_login(&mut self, handled: HandledLogin, now: OffsetDateTime) -> AuthResult<()> {
        if self.state != FlowState::LoginInitialized {
            return Err(AuthError::conflict(format!(
                "login challenge {} was already handled",
                self.login_challenge
            )));
        }

        if let Some(error) = handled.error {
            self.login_error = Some(error);
            self.state = FlowState::LoginError;
            return Ok(());
        }

        if handled.subject.is_empty() {
            return Err(AuthError::invalid_request("login subject must not be empty"));
        }

        self.subject = handled.subject;
        self.login_remember = handled.remember;
        self.login_remember_for = handled.remember_for;
        self.acr = handled.acr;
        self.amr = handled.amr;
        self.context = handled.context;
        self.login_authenticated_at = Some(now);
        self.state = FlowState::LoginUnused;
        Ok(())
    }

    /// Redeems the login verifier.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the verifier was already redeemed or the
    /// login was never handled.
    pub fn invalidate_login(&mut self) -> AuthResult<()> {
        match self.state {
            FlowState::LoginUnused | FlowState::LoginError => {
                self.state = FlowState::LoginUsed;
                Ok(())
            }
            FlowState::LoginInitialized => Err(AuthError::invalid_request(
                "login request has not been handled yet",
            )),
            _ => Err(AuthError::invalid_request(
                "login verifier has already been used",
            )),
        }
    }

    /// Opens the consent sub-challenge after the login verifier was redeemed.
    ///
    /// # Errors
    ///
    /// Returns `AccessDenied` if the login was rejected and `InvalidRequest`
    /// if the flow is not in [`FlowState::LoginUsed`].
    pub fn begin_consent(&mut self) -> AuthResult<()> {
        if self.state != FlowState::LoginUsed {
            return Err(AuthError::invalid_request(format!(
                "consent cannot start from flow state {}",
                self.state.code()
            )));
        }
        if let Some(error) = &self.login_error {
            return Err(AuthError::access_denied(error.error_description.clone()));
        }

        self.consent_challenge = Some(new_challenge_id());
        self.consent_verifier = Some(random_token());
        self.consent_csrf = Some(random_token());
        self.state = FlowState::ConsentInitialized;
        Ok(())
    }

    /// Records the consent provider's decision.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if consent was already handled and
    /// `InvalidRequest` if consent was never requested.
    pub fn handle_consent(
        &mut self,
        handled: HandledConsent,
        now: OffsetDateTime,
    ) -> AuthResult<()> {
        match self.state {
            FlowState::ConsentInitialized => {}
            FlowState::ConsentUnused | FlowState::ConsentUsed | FlowState::ConsentError => {
                return Err(AuthError::conflict(format!(
                    "consent challenge {} was already handled",
                    self.consent_challenge.as_deref().unwrap_or_default()
                )));
            }
            _ => {
                return Err(AuthError::invalid_request(
                    "consent has not been requested for this flow",
                ));
            }
        }

        self.consent_handled_at = Some(now);
        if let Some(error) = handled.error {
            self.consent_error = Some(error);
            self.state = FlowState::ConsentError;
            return Ok(());
        }

        self.granted_scope = handled.granted_scope;
        self.granted_audience = handled.granted_audience;
        self.consent_remember = handled.remember;
        self.consent_remember_for = handled.remember_for;
        self.session_claims = handled.session_claims;
        self.state = FlowState::ConsentUnused;
        Ok(())
    }

    /// Redeems the consent verifier.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the verifier was already redeemed or the
    /// consent was never handled.
    pub fn invalidate_consent(&mut self) -> AuthResult<()> {
        match self.state {
            FlowState::ConsentUnused | FlowState::ConsentError => {
                self.state = FlowState::ConsentUsed;
                Ok(())
            }
            FlowState::ConsentUsed => Err(AuthError::invalid_request(
                "consent verifier has already been used",
            )),
            _ => Err(AuthError::invalid_request(
                "consent request has not been handled yet",
            )),
        }
    }

    /// Returns `true` if a remembered consent decision is still usable.
    #[must_use]
    pub fn remembered_consent_is_valid(&self, now: OffsetDateTime) -> bool {
        if !self.consent_remember || self.consent_error.is_some() {
            return false;
        }
        if !matches!(self.state, FlowState::ConsentUnused | FlowState::ConsentUsed) {
            return false;
        }
        if self.consent_remember_for <= 0 {
            return true;
        }
        // A window past the representable range never closes.
        self.consent_handled_at.is_some_and(|handled| {
            handled
                .checked_add(Duration::seconds(self.consent_remember_for))
                .is_none_or(|until| until >= now)
        })
    }

    /// Returns `true` if the flow ended in a denial.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.login_error.is_some() || self.consent_error.is_some()
    }
}

// =============================================================================
// Login Session
// =============================================================================

/// A remembered authentication of a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginSession {
    pub id: String,
    pub subject: String,
    #[serde(with = "time::serde::rfc3339")]
    pub authenticated_at: OffsetDateTime,
    pub remember: bool,
}

impl LoginSession {
    /// Creates a login session for a subject authenticated now.
    #[must_use]
    pub fn new(subject: impl Into<String>, remember: bool) -> Self {
        Self {
            id: new_challenge_id(),
            subject: subject.into(),
            authenticated_at: OffsetDateTime::now_utc(),
            remember,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow() -> Flow {
        Flow::new(
            "c1",
            vec!["openid".into()],
            vec![],
            "https://auth/oauth2/auth?client_id=c1",
        )
    }

    fn consented(remember_for: i64) -> Flow {
        let now = OffsetDateTime::now_utc();
        let mut flow = flow();
        flow.handle_login(HandledLogin::accept("alice"), now).unwrap();
        flow.invalidate_login().unwrap();
        flow.begin_consent().unwrap();
        let mut consent = HandledConsent::grant(vec!["openid".into()], vec![]);
        consent.remember = true;
        consent.remember_for = remember_for;
        flow.handle_consent(consent, now).unwrap();
        flow
    }

    #[test]
    fn test_happy_path() {
        let now = OffsetDateTime::now_utc();
        let mut flow = flow();
        assert_eq!(flow.state, FlowState::LoginInitialized);

        flow.handle_login(HandledLogin::accept("alice"), now).unwrap();
        assert_eq!(flow.state, FlowState::LoginUnused);
        assert_eq!(flow.login_authenticated_at, Some(now));

        flow.invalidate_login().unwrap();
        flow.begin_consent().unwrap();
        assert!(flow.consent_challenge.is_some());
        assert!(flow.consent_verifier.is_some());

        flow.handle_consent(HandledConsent::grant(vec!["openid".into()], vec![]), now)
            .unwrap();
        assert_eq!(flow.state, FlowState::ConsentUnused);
        flow.invalidate_consent().unwrap();
        assert_eq!(flow.state, FlowState::ConsentUsed);
    }

    #[test]
    fn test_login_handled_twice_conflicts() {
        let now = OffsetDateTime::now_utc();
        let mut flow = flow();
        flow.handle_login(HandledLogin::accept("alice"), now).unwrap();
        let err = flow
            .handle_login(HandledLogin::accept("mallory"), now)
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(flow.subject, "alice");
    }

    #[test]
    fn test_login_verifier_single_use() {
        let mut flow = flow();
        assert!(matches!(
            flow.invalidate_login(),
            Err(AuthError::InvalidRequest { .. })
        ));
        flow.handle_login(HandledLogin::accept("alice"), OffsetDateTime::now_utc())
            .unwrap();
        flow.invalidate_login().unwrap();
        assert!(matches!(
            flow.invalidate_login(),
            Err(AuthError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_rejected_login_cannot_reach_consent() {
        let mut flow = flow();
        flow.handle_login(
            HandledLogin::reject(RequestDenied::new("access_denied", "user cancelled")),
            OffsetDateTime::now_utc(),
        )
        .unwrap();
        assert_eq!(flow.state, FlowState::LoginError);
        flow.invalidate_login().unwrap();
        assert!(matches!(
            flow.begin_consent(),
            Err(AuthError::AccessDenied { .. })
        ));
    }

    #[test]
    fn test_consent_before_request_is_invalid() {
        let mut flow = flow();
        let err = flow
            .handle_consent(HandledConsent::default(), OffsetDateTime::now_utc())
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidRequest { .. }));
    }

    #[test]
    fn test_consent_handled_twice_conflicts() {
        let mut flow = consented(0);
        let err = flow
            .handle_consent(HandledConsent::default(), OffsetDateTime::now_utc())
            .unwrap_err();
        assert!(err.is_conflict());

        flow.invalidate_consent().unwrap();
        let err = flow
            .handle_consent(HandledConsent::default(), OffsetDateTime::now_utc())
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_consent_denial_is_terminal() {
        let now = OffsetDateTime::now_utc();
        let mut flow = flow();
        flow.handle_login(HandledLogin::accept("alice"), now).unwrap();
        flow.invalidate_login().unwrap();
        flow.begin_consent().unwrap();
        flow.handle_consent(
            HandledConsent::reject(RequestDenied::new("access_denied", "no")),
            now,
        )
        .unwrap();
        assert_eq!(flow.state, FlowState::ConsentError);
        assert!(flow.has_error());
        assert!(!flow.remembered_consent_is_valid(now));
    }

    #[test]
    fn test_remembered_consent_window() {
        let flow = consented(60);
        let now = OffsetDateTime::now_utc();
        assert!(flow.remembered_consent_is_valid(now));
        assert!(!flow.remembered_consent_is_valid(now + Duration::seconds(61)));

        let forever = consented(0);
        assert!(forever.remembered_consent_is_valid(now + Duration::days(365)));
    }

    #[test]
    fn test_remembered_consent_with_huge_window() {
        let flow = consented(i64::MAX);
        let now = OffsetDateTime::now_utc();
        assert!(flow.remembered_consent_is_valid(now));
        assert!(flow.remembered_consent_is_valid(now + Duration::days(365 * 100)));
    }

    #[test]
    fn test_flow_state_serializes_as_code() {
        let json = serde_json::to_value(flow()).unwrap();
        assert_eq!(json["state"], 1);
        let back: Flow = serde_json::from_value(json).unwrap();
        assert_eq!(back.state, FlowState::LoginInitialized);
        assert!(FlowState::try_from(42).is_err());
    }
}
