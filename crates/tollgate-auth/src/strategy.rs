//! Token generation and signature strategy.
//!
//! The strategy turns a bearer-visible token into the signature the session
//! store is keyed by. It never touches storage.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use sha2::Sha256;
use time::OffsetDateTime;

use crate::AuthResult;
use crate::error::AuthError;
use crate::types::{Request, TokenType};

type HmacSha256 = Hmac<Sha256>;

/// Characters used in user codes. No vowels, no look-alikes.
const USER_CODE_ALPHABET: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ";

/// Generates and validates tokens for each token type.
pub trait TokenStrategy: Send + Sync {
    /// Generates a token and its signature.
    ///
    /// # Errors
    ///
    /// Returns `Misconfiguration` if key material is unusable.
    fn generate(&self, token_type: TokenType, request: &Request) -> AuthResult<(String, String)>;

    /// Derives the signature of a presented token.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the token is malformed.
    fn signature(&self, token_type: TokenType, token: &str) -> AuthResult<String>;

    /// Validates a presented token against its stored request.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` for a forged token and `TokenExpired` when
    /// the session's expiry for `token_type` has passed.
    fn validate(&self, token_type: TokenType, request: &Request, token: &str) -> AuthResult<()>;

    /// Produces an ID token for an OpenID Connect request, if supported.
    ///
    /// # Errors
    ///
    /// Returns `Misconfiguration` if signing keys are unusable.
    fn id_token(&self, _request: &Request) -> AuthResult<Option<String>> {
        Ok(None)
    }
}

/// Opaque HMAC-SHA256 tokens of the form `<prefix><key>.<mac>`.
pub struct HmacTokenStrategy {
    secret: Vec<u8>,
    user_code_length: usize,
}

impl HmacTokenStrategy {
    /// Creates a strategy keyed by `secret`.
    ///
    /// # Errors
    ///
    /// Returns `Misconfiguration` if the secret is shorter than 16 bytes.
    pub fn new(secret: impl AsRef<[u8]>) -> AuthResult<Self> {
        let secret = secret.as_ref();
        if secret.len() < crate::config::MIN_SECRET_LENGTH {
            return Err(AuthError::misconfiguration(
                "token signing secret must be at least 16 bytes",
            ));
        }
        Ok(Self {
            secret: secret.to_vec(),
            user_code_length: 8,
        })
    }

    /// Sets the number of characters in generated user codes.
    #[must_use]
    pub fn with_user_code_length(mut self, length: usize) -> Self {
        self.user_code_length = length;
        self
    }

    fn mac(&self) -> AuthResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| AuthError::misconfiguration(format!("invalid HMAC key: {e}")))
    }

    fn prefix(token_type: TokenType) -> &'static str {
        match token_type {
            TokenType::AccessToken => "tg_at_",
            TokenType::RefreshToken => "tg_rt_",
            TokenType::AuthorizeCode => "tg_ac_",
            TokenType::IdToken => "tg_it_",
            TokenType::DeviceCode => "tg_dc_",
            TokenType::UserCode => "",
        }
    }

    fn normalize_user_code(code: &str) -> String {
        code.chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect()
    }

    fn generate_user_code(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.user_code_length)
            .map(|_| {
                let idx = rng.gen_range(0..USER_CODE_ALPHABET.len());
                char::from(USER_CODE_ALPHABET[idx])
            })
            .collect()
    }

    fn user_code_signature(&self, code: &str) -> AuthResult<String> {
        let mut mac = self.mac()?;
        mac.update(Self::normalize_user_code(code).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn split(token_type: TokenType, token: &str) -> AuthResult<(&str, &str)> {
        let body = token.strip_prefix(Self::prefix(token_type)).ok_or_else(|| {
            AuthError::invalid_request(format!("{token_type} has an unexpected prefix"))
        })?;
        body.rsplit_once('.')
            .filter(|(key, mac)| !key.is_empty() && !mac.is_empty())
            .ok_or_else(|| AuthError::invalid_request(format!("{token_type} is malformed")))
    }
}

impl TokenStrategy for HmacTokenStrategy {
    fn generate(&self, token_type: TokenType, _request: &Request) -> AuthResult<(String, String)> {
        if token_type == TokenType::UserCode {
            let code = self.generate_user_code();
            let signature = self.user_code_signature(&code)?;
            return Ok((code, signature));
        }

        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let key = URL_SAFE_NO_PAD.encode(key);

        let mut mac = self.mac()?;
        mac.update(key.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        let token = format!("{}{key}.{signature}", Self::prefix(token_type));
        Ok((token, signature))
    }

    fn signature(&self, token_type: TokenType, token: &str) -> AuthResult<String> {
        if token_type == TokenType::UserCode {
            return self.user_code_signature(token);
        }
        let (_, mac) = Self::split(token_type, token)?;
        Ok(mac.to_string())
    }

    fn validate(&self, token_type: TokenType, request: &Request, token: &str) -> AuthResult<()> {
        if token_type != TokenType::UserCode {
            let (key, presented) = Self::split(token_type, token)?;
            let presented = URL_SAFE_NO_PAD
                .decode(presented)
                .map_err(|_| AuthError::invalid_request(format!("{token_type} is malformed")))?;
            let mut mac = self.mac()?;
            mac.update(key.as_bytes());
            mac.verify_slice(&presented).map_err(|_| {
                AuthError::invalid_request(format!("{token_type} signature is invalid"))
            })?;
        }

        if request
            .session
            .is_expired(token_type, OffsetDateTime::now_utc())
        {
            return Err(AuthError::token_expired(format!("{token_type} expired")));
        }
        Ok(())
    }
}

impl std::fmt::Debug for HmacTokenStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacTokenStrategy")
            .field("user_code_length", &self.user_code_length)
            .finish_non_exhaustive()
    }
}
