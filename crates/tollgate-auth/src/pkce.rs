//! RFC 7636 Proof Key for Code Exchange.
//!
//! The authorize side stores `code_challenge` and `code_challenge_method` in a
//! PKCE session keyed by the authorization code signature; the token side
//! checks the presented `code_verifier` against it.
//!
//! ```
//! use tollgate_auth::pkce::{PkceChallenge, PkceChallengeMethod, PkceVerifier};
//!
//! let verifier = PkceVerifier::generate();
//! let challenge = PkceChallenge::from_verifier(&verifier, PkceChallengeMethod::S256);
//! assert!(challenge.verify(&verifier).is_ok());
//! ```

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};

use crate::error::AuthError;

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised while checking a PKCE exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PkceError {
    /// Verifier length is outside 43..=128.
    #[error("Invalid verifier length: must be 43-128 characters, got {0}")]
    InvalidVerifierLength(usize),

    /// Verifier contains characters outside `[A-Za-z0-9-._~]`.
    #[error("Invalid verifier characters: must be [A-Za-z0-9-._~]")]
    InvalidVerifierCharacters,

    /// Challenge is empty or malformed for its method.
    #[error("Invalid challenge format")]
    InvalidChallengeFormat,

    /// Unknown `code_challenge_method`.
    #[error("Unsupported challenge method: {0}")]
    UnsupportedMethod(String),

    /// The verifier does not match the stored challenge.
    #[error("PKCE verification failed: verifier does not match challenge")]
    VerificationFailed,
}

impl PkceError {
    /// Returns `true` if the error concerns the presented verifier.
    #[must_use]
    pub fn is_verifier_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidVerifierLength(_) | Self::InvalidVerifierCharacters
        )
    }

    /// Get the OAuth 2.0 error code for this error.
    #[must_use]
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            Self::VerificationFailed => "invalid_grant",
            _ => "invalid_request",
        }
    }
}

impl From<PkceError> for AuthError {
    fn from(err: PkceError) -> Self {
        match err {
            PkceError::VerificationFailed => AuthError::invalid_grant(err.to_string()),
            other => AuthError::invalid_request(other.to_string()),
        }
    }
}

// =============================================================================
// Challenge Method
// =============================================================================

/// PKCE challenge method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PkceChallengeMethod {
    /// `BASE64URL(SHA256(verifier))`.
    #[default]
    S256,
    /// The challenge is the verifier itself.
    Plain,
}

impl PkceChallengeMethod {
    /// Parses `code_challenge_method`; an absent method means `plain`.
    ///
    /// # Errors
    ///
    /// Returns `PkceError::UnsupportedMethod` for unknown methods.
    pub fn parse(method: Option<&str>) -> Result<Self, PkceError> {
        match method {
            Some("S256") => Ok(Self::S256),
            None | Some("") | Some("plain") => Ok(Self::Plain),
            Some(other) => Err(PkceError::UnsupportedMethod(other.to_string())),
        }
    }

    /// Wire name of the method.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S256 => "S256",
            Self::Plain => "plain",
        }
    }
}

impl std::fmt::Display for PkceChallengeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Verifier
// =============================================================================

/// A validated `code_verifier`.
#[derive(Debug, Clone)]
pub struct PkceVerifier(String);

impl PkceVerifier {
    /// Validates a presented verifier.
    ///
    /// # Errors
    ///
    /// Returns a verifier error for a bad length or alphabet.
    pub fn new(verifier: impl Into<String>) -> Result<Self, PkceError> {
        let verifier = verifier.into();
        if !(43..=128).contains(&verifier.len()) {
            return Err(PkceError::InvalidVerifierLength(verifier.len()));
        }
        if !verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~'))
        {
            return Err(PkceError::InvalidVerifierCharacters);
        }
        Ok(Self(verifier))
    }

    /// Generates a random 43-character verifier.
    #[must_use]
    pub fn generate() -> Self {
        use rand::Rng;
        let bytes: [u8; 32] = rand::thread_rng().r#gen();
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// The verifier string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Challenge
// =============================================================================

/// A stored `code_challenge` with its method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkceChallenge {
    value: String,
    method: PkceChallengeMethod,
}

impl PkceChallenge {
    /// Derives the challenge a client would send for `verifier`.
    #[must_use]
    pub fn from_verifier(verifier: &PkceVerifier, method: PkceChallengeMethod) -> Self {
        let value = match method {
            PkceChallengeMethod::S256 => s256(verifier.as_str()),
            PkceChallengeMethod::Plain => verifier.as_str().to_string(),
        };
        Self { value, method }
    }

    /// Wraps a challenge received at the authorize endpoint.
    ///
    /// # Errors
    ///
    /// Returns `InvalidChallengeFormat` for an empty challenge or an S256
    /// challenge that is not base64url.
    pub fn new(value: impl Into<String>, method: PkceChallengeMethod) -> Result<Self, PkceError> {
        let value = value.into();
        if value.is_empty() {
            return Err(PkceError::InvalidChallengeFormat);
        }
        if method == PkceChallengeMethod::S256 && URL_SAFE_NO_PAD.decode(&value).is_err() {
            return Err(PkceError::InvalidChallengeFormat);
        }
        Ok(Self { value, method })
    }

    /// Checks a verifier against this challenge.
    ///
    /// # Errors
    ///
    /// Returns `VerificationFailed` on mismatch.
    pub fn verify(&self, verifier: &PkceVerifier) -> Result<(), PkceError> {
        let computed = match self.method {
            PkceChallengeMethod::S256 => s256(verifier.as_str()),
            PkceChallengeMethod::Plain => verifier.as_str().to_string(),
        };
        if constant_time_eq(computed.as_bytes(), self.value.as_bytes()) {
            Ok(())
        } else {
            Err(PkceError::VerificationFailed)
        }
    }

    /// The challenge string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// The challenge method.
    #[must_use]
    pub fn method(&self) -> PkceChallengeMethod {
        self.method
    }
}

fn s256(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc7636_appendix_b_test_vector() {
        let verifier = PkceVerifier::new("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk").unwrap();
        let challenge = PkceChallenge::from_verifier(&verifier, PkceChallengeMethod::S256);
        assert_eq!(
            challenge.as_str(),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
        assert!(challenge.verify(&verifier).is_ok());
    }

    #[test]
    fn test_plain_method() {
        let verifier = PkceVerifier::generate();
        let challenge = PkceChallenge::new(verifier.as_str(), PkceChallengeMethod::Plain).unwrap();
        assert!(challenge.verify(&verifier).is_ok());

        let other = PkceVerifier::generate();
        assert_eq!(
            challenge.verify(&other),
            Err(PkceError::VerificationFailed)
        );
    }

    #[test]
    fn test_verifier_length_bounds() {
        assert!(matches!(
            PkceVerifier::new("a".repeat(42)),
            Err(PkceError::InvalidVerifierLength(42))
        ));
        assert!(PkceVerifier::new("a".repeat(43)).is_ok());
        assert!(PkceVerifier::new("a".repeat(128)).is_ok());
        assert!(PkceVerifier::new("a".repeat(129)).is_err());
    }

    #[test]
    fn test_verifier_characters() {
        let bad = format!("{}!", "a".repeat(43));
        let err = PkceVerifier::new(bad).unwrap_err();
        assert!(err.is_verifier_error());
        assert!(PkceVerifier::new(format!("{}-._~", "a".repeat(40))).is_ok());
    }

    #[test]
    fn test_challenge_method_parse() {
        assert_eq!(
            PkceChallengeMethod::parse(Some("S256")).unwrap(),
            PkceChallengeMethod::S256
        );
        assert_eq!(
            PkceChallengeMethod::parse(None).unwrap(),
            PkceChallengeMethod::Plain
        );
        assert!(PkceChallengeMethod::parse(Some("S512")).is_err());
        assert_eq!(PkceChallengeMethod::default().to_string(), "S256");
    }

    #[test]
    fn test_challenge_new_invalid() {
        assert_eq!(
            PkceChallenge::new("", PkceChallengeMethod::Plain),
            Err(PkceError::InvalidChallengeFormat)
        );
        assert_eq!(
            PkceChallenge::new("not base64!!", PkceChallengeMethod::S256),
            Err(PkceError::InvalidChallengeFormat)
        );
    }

    #[test]
    fn test_error_mapping() {
        let err: AuthError = PkceError::VerificationFailed.into();
        assert_eq!(err.oauth_error_code(), "invalid_grant");
        let err: AuthError = PkceError::InvalidVerifierCharacters.into();
        assert_eq!(err.oauth_error_code(), "invalid_request");
        assert_eq!(
            PkceError::UnsupportedMethod("x".into()).oauth_error_code(),
            "invalid_request"
        );
    }
}
