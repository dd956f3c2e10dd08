//! OAuth 2.0 client registration as seen by the engine.
//!
//! Clients are owned by an external directory; the engine only reads them
//! through [`crate::storage::ClientDirectory`].

use serde::{Deserialize, Serialize};

// =============================================================================
// Grant Type
// =============================================================================

/// OAuth 2.0 grant types a client may be allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrantType {
    /// Authorization Code flow.
    #[serde(rename = "authorization_code")]
    AuthorizationCode,
    /// Implicit flow (authorize endpoint issues the access token).
    #[serde(rename = "implicit")]
    Implicit,
    /// Client Credentials flow (confidential clients only).
    #[serde(rename = "client_credentials")]
    ClientCredentials,
    /// Refresh Token flow.
    #[serde(rename = "refresh_token")]
    RefreshToken,
    /// RFC 8628 Device Authorization Grant.
    #[serde(rename = "urn:ietf:params:oauth:grant-type:device_code")]
    DeviceCode,
    /// Resource Owner Password Credentials flow.
    #[serde(rename = "password")]
    Password,
}

impl GrantType {
    /// Returns the OAuth 2.0 `grant_type` parameter value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::Implicit => "implicit",
            Self::ClientCredentials => "client_credentials",
            Self::RefreshToken => "refresh_token",
            Self::DeviceCode => "urn:ietf:params:oauth:grant-type:device_code",
            Self::Password => "password",
        }
    }

    /// Parses a `grant_type` parameter value.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "authorization_code" => Some(Self::AuthorizationCode),
            "implicit" => Some(Self::Implicit),
            "client_credentials" => Some(Self::ClientCredentials),
            "refresh_token" => Some(Self::RefreshToken),
            "urn:ietf:params:oauth:grant-type:device_code" => Some(Self::DeviceCode),
            "password" => Some(Self::Password),
            _ => None,
        }
    }
}

impl std::fmt::Display for GrantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Client
// =============================================================================

/// A registered OAuth 2.0 client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// Unique client identifier.
    pub id: String,

    /// Hashed client secret, for confidential clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_hash: Option<String>,

    /// Whether the client is public (cannot keep a secret).
    #[serde(default)]
    pub public: bool,

    /// Scopes the client may request. A scope also allows its dotted children.
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Grant types the client may use.
    #[serde(default)]
    pub grant_types: Vec<GrantType>,

    /// Response types the client may request at the authorize endpoint.
    #[serde(default)]
    pub response_types: Vec<String>,

    /// Registered redirect URIs.
    #[serde(default)]
    pub redirect_uris: Vec<String>,

    /// Audiences the client may request.
    #[serde(default)]
    pub audience: Vec<String>,

    /// Browser origins allowed to call the token endpoint.
    #[serde(default)]
    pub allowed_cors_origins: Vec<String>,
}

impl Client {
    /// Creates a public client with no permissions.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret_hash: None,
            public: true,
            scopes: Vec::new(),
            grant_types: Vec::new(),
            response_types: Vec::new(),
            redirect_uris: Vec::new(),
            audience: Vec::new(),
            allowed_cors_origins: Vec::new(),
        }
    }

    /// Returns `true` if the client may use the grant type.
    #[must_use]
    pub fn allows_grant(&self, grant_type: GrantType) -> bool {
        self.grant_types.contains(&grant_type)
    }

    /// Returns `true` if the client may request the response type.
    #[must_use]
    pub fn allows_response_type(&self, response_type: &str) -> bool {
        self.response_types.iter().any(|r| r == response_type)
    }

    /// Returns `true` if `scope` is within the client's scopes.
    ///
    /// `offline` allows `offline` and `offline.read`, but not `offline_access`.
    #[must_use]
    pub fn allows_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|allowed| {
            scope == allowed
                || scope
                    .strip_prefix(allowed.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }

    /// Returns `true` if the audience was registered for the client.
    #[must_use]
    pub fn allows_audience(&self, audience: &str) -> bool {
        self.audience.iter().any(|a| a == audience)
    }

    /// Returns `true` if the redirect URI is registered for the client.
    #[must_use]
    pub fn has_redirect_uri(&self, uri: &str) -> bool {
        self.redirect_uris.iter().any(|r| r == uri)
    }

    /// Returns the first requested scope the client may not use.
    #[must_use]
    pub fn first_disallowed_scope<'a>(&self, requested: &'a [String]) -> Option<&'a str> {
        requested
            .iter()
            .find(|s| !self.allows_scope(s))
            .map(String::as_str)
    }

    /// Returns the first requested audience the client may not use.
    #[must_use]
    pub fn first_disallowed_audience<'a>(&self, requested: &'a [String]) -> Option<&'a str> {
        requested
            .iter()
            .find(|a| !self.allows_audience(a))
            .map(String::as_str)
    }
}
