//! Enforcement point configuration
//!
//! Server-wide settings (keyring, WebKDC, token limits) and per-location
//! settings (lifetimes, redirect targets, delegated credentials), loaded from
//! TOML. Durations accept a number of seconds or a string such as `"30m"`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use url::Url;

use crate::keyring::RotationPolicy;
use crate::krb5::CredentialType;
use crate::store::DEFAULT_KEY_VALIDITY;
use crate::tokens::{AUTH_WEBKDC, KRB5};

/// Error types for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid duration {0:?}")]
    InvalidDuration(String),
    #[error("Invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Parse `<n>[s|m|h|d|w]` into seconds. A bare number is seconds.
pub fn parse_duration(text: &str) -> Result<u64, ConfigError> {
    let text = text.trim();
    let bad = || ConfigError::InvalidDuration(text.to_owned());
    let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let n: u64 = digits.parse().map_err(|_| bad())?;
    let scale = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        "w" => 7 * 24 * 60 * 60,
        _ => return Err(bad()),
    };
    n.checked_mul(scale).ok_or_else(bad)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

fn duration<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    match RawDuration::deserialize(d)? {
        RawDuration::Seconds(n) => Ok(n),
        RawDuration::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
    }
}

/// Default time limits
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Maximum age of a returned id/proxy token
    pub token_max_ttl: u64,
    /// Age at which the keyring gets a new key
    pub keyring_key_lifetime: u64,
    /// Renew the service token this long before it expires
    pub service_token_refresh: u64,
}

impl Timeouts {
    /// Production values
    pub const PROD: Self = Self {
        token_max_ttl: 300,                          // 5 minutes
        keyring_key_lifetime: 30 * 24 * 60 * 60,     // 30 days
        service_token_refresh: 60 * 60,              // 1 hour
    };

    /// Test values
    pub const TEST: Self = Self {
        token_max_ttl: 60,
        keyring_key_lifetime: 600,
        service_token_refresh: 30,
    };
}

impl Default for Timeouts {
    fn default() -> Self {
        #[cfg(any(test, feature = "test-constants"))]
        { Self::TEST }
        #[cfg(not(any(test, feature = "test-constants")))]
        { Self::PROD }
    }
}

fn default_true() -> bool {
    true
}

fn default_auth_type() -> String {
    AUTH_WEBKDC.to_owned()
}

fn default_token_max_ttl() -> u64 {
    Timeouts::default().token_max_ttl
}

fn default_key_lifetime() -> u64 {
    Timeouts::default().keyring_key_lifetime
}

fn default_service_refresh() -> u64 {
    Timeouts::default().service_token_refresh
}

/// Settings shared by every protected location
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// WebKDC login page
    pub login_url: String,
    pub keyring_path: PathBuf,
    /// Rotate and persist the keyring on startup and on demand
    #[serde(default = "default_true")]
    pub keyring_auto_update: bool,
    #[serde(default = "default_key_lifetime", deserialize_with = "duration")]
    pub keyring_key_lifetime: u64,
    #[serde(default = "default_token_max_ttl", deserialize_with = "duration")]
    pub token_max_ttl: u64,
    /// `webkdc` or `krb5`
    #[serde(default = "default_auth_type")]
    pub subject_auth_type: String,
    #[serde(default = "default_true")]
    pub require_ssl: bool,
    /// Redirect plain HTTP requests to HTTPS instead of denying them
    #[serde(default)]
    pub ssl_redirect: bool,
    #[serde(default)]
    pub ssl_redirect_port: Option<u16>,
    /// Redirect once more after consuming returned tokens, to clean the URL
    #[serde(default = "default_true")]
    pub extra_redirect: bool,
    #[serde(default)]
    pub service_token_cache: Option<PathBuf>,
    #[serde(default = "default_service_refresh", deserialize_with = "duration")]
    pub service_token_refresh: u64,
}

impl ServerConfig {
    /// Minimal configuration for a login URL and keyring path
    pub fn new(login_url: impl Into<String>, keyring_path: impl Into<PathBuf>) -> Self {
        let timeouts = Timeouts::default();
        Self {
            login_url: login_url.into(),
            keyring_path: keyring_path.into(),
            keyring_auto_update: true,
            keyring_key_lifetime: timeouts.keyring_key_lifetime,
            token_max_ttl: timeouts.token_max_ttl,
            subject_auth_type: default_auth_type(),
            require_ssl: true,
            ssl_redirect: false,
            ssl_redirect_port: None,
            extra_redirect: true,
            service_token_cache: None,
            service_token_refresh: timeouts.service_token_refresh,
        }
    }

    /// Rotation policy implied by the key lifetime, if auto-update is on
    #[must_use]
    pub fn rotation_policy(&self) -> Option<RotationPolicy> {
        self.keyring_auto_update.then_some(RotationPolicy {
            lifetime: self.keyring_key_lifetime,
            validity: DEFAULT_KEY_VALIDITY,
            grace: self.keyring_key_lifetime,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match Url::parse(&self.login_url) {
            Ok(url) if url.has_host() => {}
            _ => {
                return Err(ConfigError::Invalid {
                    name: "login_url",
                    reason: format!("{:?} is not an absolute URL", self.login_url),
                })
            }
        }
        if self.keyring_auto_update && self.keyring_key_lifetime == 0 {
            return Err(ConfigError::Invalid {
                name: "keyring_key_lifetime",
                reason: "must be non-zero when keyring_auto_update is on".into(),
            });
        }
        if self.subject_auth_type != AUTH_WEBKDC && self.subject_auth_type != KRB5 {
            return Err(ConfigError::Invalid {
                name: "subject_auth_type",
                reason: format!("unknown type {:?}", self.subject_auth_type),
            });
        }
        Ok(())
    }
}

/// One delegated credential a location needs
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredSpec {
    #[serde(rename = "type")]
    pub cred_type: String,
    pub service: String,
}

/// Per-location settings
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DirConfig {
    /// Lifetime of minted app tokens; zero uses the id token's expiration
    #[serde(deserialize_with = "duration")]
    pub app_token_lifetime: u64,
    /// Reject app tokens unused for this long; zero disables
    #[serde(deserialize_with = "duration")]
    pub inactive_expire: u64,
    /// Minimum interval between last-used refreshes; zero disables tracking
    #[serde(deserialize_with = "duration")]
    pub last_use_update_interval: u64,
    pub force_login: bool,
    pub return_url: Option<String>,
    /// Return URL used when the original request was a POST
    pub post_return_url: Option<String>,
    pub login_canceled_url: Option<String>,
    pub failure_url: Option<String>,
    /// Build the return URL with https regardless of the request scheme
    pub ssl_return: bool,
    pub use_creds: bool,
    pub creds: Vec<CredSpec>,
    /// Overrides the server setting when present
    pub extra_redirect: Option<bool>,
    /// Export environment variables under this prefix as well
    pub var_prefix: Option<String>,
    pub dont_cache: bool,
    pub do_logout: bool,
}

impl DirConfig {
    /// First configured credential type, the default proxy type to request
    #[must_use]
    pub fn default_proxy_type(&self) -> Option<&str> {
        self.creds.first().map(|c| c.cred_type.as_str())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for cred in &self.creds {
            cred.cred_type
                .parse::<CredentialType>()
                .map_err(|e| ConfigError::Invalid { name: "creds", reason: e.to_string() })?;
            if cred.service.is_empty() {
                return Err(ConfigError::Invalid {
                    name: "creds",
                    reason: "empty service".into(),
                });
            }
        }
        Ok(())
    }
}

/// A complete configuration file
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebAuthConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub directory: DirConfig,
}

impl WebAuthConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.server.validate()?;
        config.directory.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

// ============================================================
// TESTS
// ============================================================
