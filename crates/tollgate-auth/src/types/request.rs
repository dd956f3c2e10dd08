//! Generic requester stored with every token session.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::client::{Client, GrantType};
use super::session::Session;

// =============================================================================
// Form
// =============================================================================

/// URL-encoded request parameters, kept in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Form(BTreeMap<String, Vec<String>>);

impl Form {
    /// Creates an empty form.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses an `application/x-www-form-urlencoded` string.
    #[must_use]
    pub fn parse(encoded: &str) -> Self {
        let mut form = Self::new();
        for (key, value) in url::form_urlencoded::parse(encoded.as_bytes()) {
            form.append(key.into_owned(), value.into_owned());
        }
        form
    }

    /// Encodes the form as `application/x-www-form-urlencoded`.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, values) in &self.0 {
            for value in values {
                serializer.append_pair(key, value);
            }
        }
        serializer.finish()
    }

    /// Returns the first value for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Replaces all values of a key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), vec![value.into()]);
    }

    /// Adds a value to a key.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    /// Removes a key.
    pub fn remove(&mut self, key: &str) {
        self.0.remove(key);
    }

    /// Keeps only the listed keys.
    pub fn retain_keys(&mut self, allowed: &[&str]) {
        self.0.retain(|key, _| allowed.contains(&key.as_str()));
    }

    /// Returns `true` if the form has no parameters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// =============================================================================
// Request
// =============================================================================

/// A requester: the authorization or token request a session was issued for.
///
/// Cloning produces an independent deep copy, including the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Request identifier shared by every token issued for the same grant.
    pub id: String,

    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,

    pub client: Client,

    pub requested_scope: Vec<String>,

    pub granted_scope: Vec<String>,

    pub requested_audience: Vec<String>,

    pub granted_audience: Vec<String>,

    pub form: Form,

    pub session: Session,
}

impl Request {
    /// Creates a request with a fresh id, requested now.
    #[must_use]
    pub fn new(client: Client, session: Session) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            requested_at: OffsetDateTime::now_utc(),
            client,
            requested_scope: Vec::new(),
            granted_scope: Vec::new(),
            requested_audience: Vec::new(),
            granted_audience: Vec::new(),
            form: Form::new(),
            session,
        }
    }

    /// Grants a scope, ignoring duplicates.
    pub fn grant_scope(&mut self, scope: impl Into<String>) {
        let scope = scope.into();
        if !self.granted_scope.contains(&scope) {
            self.granted_scope.push(scope);
        }
    }

    /// Grants an audience, ignoring duplicates.
    pub fn grant_audience(&mut self, audience: impl Into<String>) {
        let audience = audience.into();
        if !self.granted_audience.contains(&audience) {
            self.granted_audience.push(audience);
        }
    }

    /// Returns `true` if the scope was granted.
    #[must_use]
    pub fn has_granted_scope(&self, scope: &str) -> bool {
        self.granted_scope.iter().any(|s| s == scope)
    }

    /// Returns `true` if any of the scopes was granted.
    #[must_use]
    pub fn has_any_granted_scope(&self, scopes: &[String]) -> bool {
        scopes.iter().any(|s| self.has_granted_scope(s))
    }

    /// Returns a copy whose form only carries the allowed keys.
    ///
    /// Secrets such as `password` or `client_secret` never reach storage
    /// unless explicitly allowed.
    #[must_use]
    pub fn sanitize(&self, allowed_keys: &[&str]) -> Self {
        let mut copy = self.clone();
        copy.form.retain_keys(allowed_keys);
        copy
    }
}

// =============================================================================
// Token Endpoint
// =============================================================================

/// A token endpoint request.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessRequest {
    /// The underlying requester.
    pub request: Request,

    /// Grant types named in the request.
    pub grant_types: Vec<String>,
}

impl AccessRequest {
    /// Creates a token request for one grant type.
    #[must_use]
    pub fn new(grant_type: impl Into<String>, request: Request) -> Self {
        Self {
            request,
            grant_types: vec![grant_type.into()],
        }
    }

    /// Returns `true` if the request names exactly this grant type.
    #[must_use]
    pub fn has_grant_type(&self, grant_type: GrantType) -> bool {
        self.grant_types.iter().any(|g| g == grant_type.as_str())
    }
}

/// Token endpoint success response (RFC 6749 section 5.1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessResponse {
    pub access_token: String,

    pub token_type: String,

    /// Seconds until the access token expires.
    pub expires_in: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl Default for AccessResponse {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            token_type: "bearer".to_string(),
            expires_in: 0,
            scope: None,
            refresh_token: None,
            id_token: None,
        }
    }
}
