//! Application session carried by every stored token.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Token kinds that carry their own lifespan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// Bearer access token.
    AccessToken,
    /// Refresh token.
    RefreshToken,
    /// Authorization code.
    AuthorizeCode,
    /// OpenID Connect ID token.
    IdToken,
    /// RFC 8628 device code.
    DeviceCode,
    /// RFC 8628 user code.
    UserCode,
}

impl TokenType {
    /// Returns the wire name of the token type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
            Self::AuthorizeCode => "authorize_code",
            Self::IdToken => "id_token",
            Self::DeviceCode => "device_code",
            Self::UserCode => "user_code",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted token session kinds; each has its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Code,
    Access,
    Refresh,
    Pkce,
    Oidc,
}

impl SessionKind {
    /// Every persisted kind, in flush order.
    pub const ALL: [SessionKind; 5] = [
        SessionKind::Code,
        SessionKind::Access,
        SessionKind::Refresh,
        SessionKind::Pkce,
        SessionKind::Oidc,
    ];

    /// Short name used in logs and as the table suffix.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Access => "access",
            Self::Refresh => "refresh",
            Self::Pkce => "pkce",
            Self::Oidc => "oidc",
        }
    }

    /// Table backing this kind.
    #[must_use]
    pub fn table_name(self) -> &'static str {
        match self {
            Self::Code => "tollgate_oauth2_code",
            Self::Access => "tollgate_oauth2_access",
            Self::Refresh => "tollgate_oauth2_refresh",
            Self::Pkce => "tollgate_oauth2_pkce",
            Self::Oidc => "tollgate_oauth2_oidc",
        }
    }

    /// The lifespan that bounds this kind when flushing.
    #[must_use]
    pub fn lifespan_type(self) -> TokenType {
        match self {
            Self::Access => TokenType::AccessToken,
            Self::Refresh => TokenType::RefreshToken,
            Self::Code | Self::Pkce | Self::Oidc => TokenType::AuthorizeCode,
        }
    }

    /// The token type whose expiry is enforced on read.
    #[must_use]
    pub fn expiry_type(self) -> TokenType {
        self.lifespan_type()
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The application session stored (optionally encrypted) with each token.
///
/// `Clone` is the deep copy used by the refresh grant before re-granting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub subject: String,

    #[serde(default)]
    pub username: String,

    #[serde(default, with = "expiry_map")]
    pub expires_at: BTreeMap<TokenType, OffsetDateTime>,

    /// Consent challenge the session was granted through, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consent_challenge: Option<String>,

    #[serde(default)]
    pub access_token_claims: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub id_token_claims: serde_json::Map<String, serde_json::Value>,
}

impl Session {
    /// Creates a session for a subject.
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Self::default()
        }
    }

    /// Returns the expiry for a token type, if set.
    #[must_use]
    pub fn expires_at(&self, token_type: TokenType) -> Option<OffsetDateTime> {
        self.expires_at.get(&token_type).copied()
    }

    /// Sets the expiry for a token type.
    pub fn set_expires_at(&mut self, token_type: TokenType, at: OffsetDateTime) {
        self.expires_at.insert(token_type, at);
    }

    /// Returns `true` if the token type has an expiry that has passed.
    #[must_use]
    pub fn is_expired(&self, token_type: TokenType, now: OffsetDateTime) -> bool {
        self.expires_at(token_type).is_some_and(|at| at <= now)
    }
}

mod expiry_map {
    use std::collections::BTreeMap;

    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;
    use time::format_description::well_known::Rfc3339;

    use super::TokenType;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<TokenType, OffsetDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut out = serializer.serialize_map(Some(map.len()))?;
        for (token_type, at) in map {
            let formatted = at.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
            out.serialize_entry(token_type.as_str(), &formatted)?;
        }
        out.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<TokenType, OffsetDateTime>, D::Error> {
        let raw = BTreeMap::<TokenType, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(token_type, value)| {
                OffsetDateTime::parse(&value, &Rfc3339)
                    .map(|at| (token_type, at))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_session_expiry() {
        let now = OffsetDateTime::now_utc();
        let mut session = Session::new("alice");
        assert!(!session.is_expired(TokenType::AccessToken, now));

        session.set_expires_at(TokenType::AccessToken, now - Duration::seconds(1));
        session.set_expires_at(TokenType::RefreshToken, now + Duration::hours(1));
        assert!(session.is_expired(TokenType::AccessToken, now));
        assert!(!session.is_expired(TokenType::RefreshToken, now));
    }

    #[test]
    fn test_session_json_shape() {
        let at = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let mut session = Session::new("alice");
        session.set_expires_at(TokenType::AuthorizeCode, at);

        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["subject"], "alice");
        assert_eq!(json["expires_at"]["authorize_code"], "2023-11-14T22:13:20Z");

        let back: Session = serde_json::from_value(json).unwrap();
        assert_eq!(back.expires_at(TokenType::AuthorizeCode), Some(at));
    }

    #[test]
    fn test_clone_is_independent() {
        let mut original = Session::new("alice");
        original
            .id_token_claims
            .insert("acr".into(), serde_json::json!("1"));
        let mut copy = original.clone();
        copy.id_token_claims.clear();
        copy.subject = "bob".into();
        assert_eq!(original.subject, "alice");
        assert_eq!(original.id_token_claims.len(), 1);
    }

    #[test]
    fn test_kind_lifespans() {
        assert_eq!(SessionKind::Pkce.lifespan_type(), TokenType::AuthorizeCode);
        assert_eq!(SessionKind::Refresh.lifespan_type(), TokenType::RefreshToken);
        assert_eq!(SessionKind::Access.table_name(), "tollgate_oauth2_access");
    }
}
