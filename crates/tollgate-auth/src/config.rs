//! Engine configuration.
//!
//! Lifespans, refresh rotation, session encryption, device flow and flush
//! settings. All durations use humantime syntax (`"30m"`, `"720h"`).
//!
//! # Example (TOML)
//!
//! ```toml
//! [lifespans]
//! access_token = "1h"
//! refresh_token = "720h"
//!
//! [refresh]
//! rotation_grace_period = "30s"
//!
//! [encryption]
//! system_secrets = ["a-very-long-system-secret-value"]
//!
//! [device]
//! verification_uri = "https://auth.example.com/device"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{SessionKind, TokenType};

/// Upper bound applied to the refresh rotation grace period.
pub const MAX_ROTATION_GRACE_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Minimum accepted length of a system secret, in bytes.
pub const MIN_SECRET_LENGTH: usize = 16;

/// Root engine configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Token and challenge lifespans.
    pub lifespans: LifespanConfig,

    /// Refresh token rotation.
    pub refresh: RefreshConfig,

    /// Session data encryption at rest.
    pub encryption: EncryptionConfig,

    /// RFC 8628 device flow.
    pub device: DeviceConfig,

    /// Expired row flushing.
    pub flush: FlushConfig,
}

/// Lifespans of every token kind and of login/consent requests.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifespanConfig {
    #[serde(with = "humantime_serde")]
    pub access_token: Duration,

    #[serde(with = "humantime_serde")]
    pub refresh_token: Duration,

    #[serde(with = "humantime_serde")]
    pub authorization_code: Duration,

    #[serde(with = "humantime_serde")]
    pub id_token: Duration,

    /// Lifespan of both the device code and the user code.
    #[serde(with = "humantime_serde")]
    pub device_user_code: Duration,

    /// Maximum age of an unfinished login/consent flow.
    #[serde(with = "humantime_serde")]
    pub login_consent_request: Duration,
}

impl Default for LifespanConfig {
    fn default() -> Self {
        Self {
            access_token: Duration::from_secs(60 * 60),
            refresh_token: Duration::from_secs(720 * 60 * 60),
            authorization_code: Duration::from_secs(10 * 60),
            id_token: Duration::from_secs(60 * 60),
            device_user_code: Duration::from_secs(15 * 60),
            login_consent_request: Duration::from_secs(30 * 60),
        }
    }
}

impl LifespanConfig {
    /// Returns the lifespan for a token type.
    #[must_use]
    pub fn for_token(&self, token_type: TokenType) -> Duration {
        match token_type {
            TokenType::AccessToken => self.access_token,
            TokenType::RefreshToken => self.refresh_token,
            TokenType::AuthorizeCode => self.authorization_code,
            TokenType::IdToken => self.id_token,
            TokenType::DeviceCode | TokenType::UserCode => self.device_user_code,
        }
    }

    /// Returns the lifespan that bounds flushing of a session kind.
    #[must_use]
    pub fn for_kind(&self, kind: SessionKind) -> Duration {
        self.for_token(kind.lifespan_type())
    }
}

/// Refresh token rotation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// How long a used refresh token stays valid. Zero rotates strictly.
    #[serde(with = "humantime_serde")]
    pub rotation_grace_period: Duration,

    /// Scopes that make the engine issue a refresh token. Empty means always.
    pub refresh_token_scopes: Vec<String>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            rotation_grace_period: Duration::ZERO,
            refresh_token_scopes: vec!["offline".to_string(), "offline_access".to_string()],
        }
    }
}

impl RefreshConfig {
    /// The grace period, clamped to [`MAX_ROTATION_GRACE_PERIOD`].
    #[must_use]
    pub fn effective_grace_period(&self) -> Duration {
        self.rotation_grace_period.min(MAX_ROTATION_GRACE_PERIOD)
    }
}

/// Session encryption settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Encrypt session payloads before storing them.
    pub encrypt_session_data: bool,

    /// The first secret encrypts; every secret is tried on decrypt.
    pub system_secrets: Vec<String>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            encrypt_session_data: true,
            system_secrets: Vec::new(),
        }
    }
}

/// Device authorization settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Where the user enters the user code.
    pub verification_uri: String,

    /// Minimum interval between device polls.
    #[serde(with = "humantime_serde")]
    pub polling_interval: Duration,

    /// Number of characters in a user code.
    pub user_code_length: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            verification_uri: "http://localhost:4444/oauth2/device/verify".to_string(),
            polling_interval: Duration::from_secs(5),
            user_code_length: 8,
        }
    }
}

/// Flush batch settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Maximum rows deleted per table and run.
    pub limit: usize,

    /// Rows deleted per statement.
    pub batch_size: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            limit: 10_000,
            batch_size: 100,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// An invalid configuration value was provided.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    /// A required configuration value is missing.
    #[error("Missing required configuration: {0}")]
    Missing(String),

    /// The configuration sources could not be read.
    #[error("Failed to load configuration: {0}")]
    Load(String),
}

impl EngineConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if encryption is on without secrets, and
    /// `ConfigError::InvalidValue` if:
    /// - a system secret is shorter than [`MIN_SECRET_LENGTH`]
    /// - any lifespan is zero
    /// - the flush batch size or limit is zero
    /// - the user code length is outside `6..=16`
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encryption.encrypt_session_data && self.encryption.system_secrets.is_empty() {
            return Err(ConfigError::Missing(
                "encryption.system_secrets".to_string(),
            ));
        }
        if let Some(short) = self
            .encryption
            .system_secrets
            .iter()
            .position(|s| s.len() < MIN_SECRET_LENGTH)
        {
            return Err(ConfigError::InvalidValue(format!(
                "encryption.system_secrets[{short}] must be at least {MIN_SECRET_LENGTH} bytes"
            )));
        }

        let lifespans = [
            ("access_token", self.lifespans.access_token),
            ("refresh_token", self.lifespans.refresh_token),
            ("authorization_code", self.lifespans.authorization_code),
            ("id_token", self.lifespans.id_token),
            ("device_user_code", self.lifespans.device_user_code),
            ("login_consent_request", self.lifespans.login_consent_request),
        ];
        for (name, lifespan) in lifespans {
            if lifespan.is_zero() {
                return Err(ConfigError::InvalidValue(format!(
                    "lifespans.{name} must be greater than 0"
                )));
            }
        }

        if self.flush.batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "flush.batch_size must be greater than 0".to_string(),
            ));
        }
        if self.flush.limit == 0 {
            return Err(ConfigError::InvalidValue(
                "flush.limit must be greater than 0".to_string(),
            ));
        }

        if !(6..=16).contains(&self.device.user_code_length) {
            return Err(ConfigError::InvalidValue(format!(
                "device.user_code_length must be between 6 and 16, got {}",
                self.device.user_code_length
            )));
        }

        Ok(())
    }
}

/// Loads the configuration from an optional TOML file plus environment
/// overrides such as `TOLLGATE__LIFESPANS__ACCESS_TOKEN=30m`.
///
/// # Errors
///
/// Returns `ConfigError::Load` if a source cannot be read or deserialized,
/// and the [`EngineConfig::validate`] error otherwise.
pub fn load_config(path: Option<&std::path::Path>) -> Result<EngineConfig, ConfigError> {
    use config::{Config, Environment, File};

    let mut builder = Config::builder();
    if let Some(path) = path
        && path.exists()
    {
        builder = builder.add_source(File::from(path.to_path_buf()));
    }
    builder = builder.add_source(
        Environment::with_prefix("TOLLGATE")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("encryption.system_secrets")
            .with_list_parse_key("refresh.refresh_token_scopes"),
    );

    let merged: EngineConfig = builder
        .build()
        .map_err(|e| ConfigError::Load(format!("config build error: {e}")))?
        .try_deserialize()
        .map_err(|e| ConfigError::Load(format!("config deserialize error: {e}")))?;
    merged.validate()?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn valid() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.encryption.system_secrets = vec!["0123456789abcdef0123".to_string()];
        config
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.lifespans.access_token, Duration::from_secs(3600));
        assert_eq!(config.lifespans.authorization_code, Duration::from_secs(600));
        assert_eq!(config.lifespans.device_user_code, Duration::from_secs(900));
        assert_eq!(config.refresh.rotation_grace_period, Duration::ZERO);
        assert_eq!(config.flush.batch_size, 100);
        assert!(config.encryption.encrypt_session_data);
    }

    #[test]
    fn test_valid_config() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_missing_secrets() {
        let err = EngineConfig::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));

        let mut config = EngineConfig::default();
        config.encryption.encrypt_session_data = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_short_secret() {
        let mut config = valid();
        config.encryption.system_secrets.push("short".to_string());
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref m) if m.contains("[1]")));
    }

    #[test]
    fn test_zero_lifespan() {
        let mut config = valid();
        config.lifespans.refresh_token = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref m) if m.contains("refresh_token")));
    }

    #[test]
    fn test_zero_batch_size() {
        let mut config = valid();
        config.flush.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_user_code_length_bounds() {
        let mut config = valid();
        config.device.user_code_length = 4;
        assert!(config.validate().is_err());
        config.device.user_code_length = 16;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_grace_period_is_clamped() {
        let mut config = valid();
        config.refresh.rotation_grace_period = Duration::from_secs(3600);
        assert_eq!(
            config.refresh.effective_grace_period(),
            MAX_ROTATION_GRACE_PERIOD
        );
        config.refresh.rotation_grace_period = Duration::from_secs(30);
        assert_eq!(
            config.refresh.effective_grace_period(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_kind_lifespans() {
        let lifespans = LifespanConfig::default();
        assert_eq!(
            lifespans.for_kind(SessionKind::Oidc),
            lifespans.authorization_code
        );
        assert_eq!(
            lifespans.for_kind(SessionKind::Refresh),
            lifespans.refresh_token
        );
    }

    #[test]
    fn test_deserialize_humantime() {
        let toml = r#"
            [lifespans]
            access_token = "30m"

            [refresh]
            rotation_grace_period = "10s"

            [encryption]
            system_secrets = ["0123456789abcdef0123"]
        "#;
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(toml.as_bytes()).unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.lifespans.access_token, Duration::from_secs(1800));
        assert_eq!(config.lifespans.refresh_token, Duration::from_secs(720 * 3600));
        assert_eq!(
            config.refresh.rotation_grace_period,
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_load_validates() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(b"[flush]\nbatch_size = 0\n").unwrap();
        assert!(load_config(Some(file.path())).is_err());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue("test error".to_string());
        assert_eq!(err.to_string(), "Invalid configuration value: test error");
        let err = ConfigError::Missing("required_field".to_string());
        assert_eq!(
            err.to_string(),
            "Missing required configuration: required_field"
        );
    }
}
