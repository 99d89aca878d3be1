//! Server configuration module.
//!
//! Parses configuration from environment variables for the recovery server.
//! Every variable is optional; unset values fall back to development-friendly
//! defaults (in-memory store, log-only email transport).
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PORT` | 8080 | HTTP server port |
//! | `RECOVERY_DATABASE_PATH` | - | SQLite database file (in-memory store when unset) |
//! | `RECOVERY_EMAIL_API_KEY` | - | Email provider API key (log transport when unset) |
//! | `RECOVERY_EMAIL_API_URL` | `https://api.resend.com` | Email provider base URL |
//! | `RECOVERY_FROM_EMAIL` | `noreply@bookingrecovery.com` | Sender address |
//! | `RECOVERY_DISPATCH_INTERVAL_SECS` | 15 | Seconds between dispatcher polls |
//! | `RECOVERY_MAX_SEND_ATTEMPTS` | 5 | Delivery attempts before a send is marked failed |
//! | `RECOVERY_ENFORCE_ORIGIN` | false | Require the request origin to match the tenant domain |
//! | `RECOVERY_ADMIN_TOKEN` | - | Bearer token for the management API (disabled when unset) |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default email provider base URL.
const DEFAULT_EMAIL_API_URL: &str = "https://api.resend.com";

/// Default sender address.
const DEFAULT_FROM_EMAIL: &str = "noreply@bookingrecovery.com";

/// Default dispatcher poll interval in seconds.
const DEFAULT_DISPATCH_INTERVAL_SECS: u64 = 15;

/// Default number of delivery attempts per scheduled email.
const DEFAULT_MAX_SEND_ATTEMPTS: u32 = 5;

/// Upper bound for `RECOVERY_MAX_SEND_ATTEMPTS`.
const MAX_SEND_ATTEMPTS_LIMIT: u32 = 20;

/// Upper bound for `RECOVERY_DISPATCH_INTERVAL_SECS`.
const MAX_DISPATCH_INTERVAL_SECS: u64 = 3600;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(String),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// SQLite database path. `None` selects the in-memory store.
    pub database_path: Option<PathBuf>,

    /// Email provider API key. `None` selects the log-only transport.
    pub email_api_key: Option<String>,

    /// Email provider base URL.
    pub email_api_url: String,

    /// Sender address for recovery emails.
    pub from_email: String,

    /// Interval between dispatcher polls.
    pub dispatch_interval: Duration,

    /// Delivery attempts before a scheduled email is marked failed.
    pub max_send_attempts: u32,

    /// When true, tracking requests must come from the tenant's domain.
    pub enforce_origin: bool,

    /// Bearer token for the management API. `None` disables those routes.
    pub admin_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_path: None,
            email_api_key: None,
            email_api_url: DEFAULT_EMAIL_API_URL.to_string(),
            from_email: DEFAULT_FROM_EMAIL.to_string(),
            dispatch_interval: Duration::from_secs(DEFAULT_DISPATCH_INTERVAL_SECS),
            max_send_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
            enforce_origin: false,
            admin_token: None,
        }
    }
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is present but malformed or out of
    /// range, or if the combination of values is inconsistent.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use recovery_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            port: parse_port()?,
            database_path: non_empty_env("RECOVERY_DATABASE_PATH").map(PathBuf::from),
            email_api_key: non_empty_env("RECOVERY_EMAIL_API_KEY"),
            email_api_url: non_empty_env("RECOVERY_EMAIL_API_URL")
                .unwrap_or_else(|| DEFAULT_EMAIL_API_URL.to_string()),
            from_email: non_empty_env("RECOVERY_FROM_EMAIL")
                .unwrap_or_else(|| DEFAULT_FROM_EMAIL.to_string()),
            dispatch_interval: Duration::from_secs(parse_bounded_env(
                "RECOVERY_DISPATCH_INTERVAL_SECS",
                DEFAULT_DISPATCH_INTERVAL_SECS,
                1,
                MAX_DISPATCH_INTERVAL_SECS,
            )?),
            max_send_attempts: parse_bounded_env(
                "RECOVERY_MAX_SEND_ATTEMPTS",
                u64::from(DEFAULT_MAX_SEND_ATTEMPTS),
                1,
                u64::from(MAX_SEND_ATTEMPTS_LIMIT),
            )? as u32,
            enforce_origin: parse_bool_env("RECOVERY_ENFORCE_ORIGIN"),
            admin_token: non_empty_env("RECOVERY_ADMIN_TOKEN"),
        };

        config.validate()?;

        if config.email_api_key.is_none() {
            warn!("RECOVERY_EMAIL_API_KEY is not set - recovery emails will be logged, not sent");
        }
        if config.database_path.is_none() {
            warn!(
                "RECOVERY_DATABASE_PATH is not set - using the in-memory store, \
                 scheduled emails will not survive a restart"
            );
        }

        Ok(config)
    }

    /// Validate cross-field constraints.
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.from_email.contains('@') {
            return Err(ConfigError::ValidationError(format!(
                "RECOVERY_FROM_EMAIL '{}' is not an email address",
                self.from_email
            )));
        }

        if !(self.email_api_url.starts_with("http://") || self.email_api_url.starts_with("https://"))
        {
            return Err(ConfigError::InvalidFormat {
                var: "RECOVERY_EMAIL_API_URL".to_string(),
                message: "must start with http:// or https://".to_string(),
            });
        }

        Ok(())
    }
}

/// Returns the variable's trimmed value, treating empty strings as unset.
fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse a boolean environment variable.
///
/// Returns `true` if the variable is set to "true" or "1" (case-insensitive),
/// `false` otherwise.
fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => port_str
            .trim()
            .parse()
            .map_err(|e: std::num::ParseIntError| ConfigError::InvalidPort(e.to_string())),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse an unsigned integer variable constrained to `min..=max`.
fn parse_bounded_env(name: &str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError> {
    let Some(raw) = non_empty_env(name) else {
        return Ok(default);
    };

    let value: u64 = raw.parse().map_err(|_| ConfigError::InvalidFormat {
        var: name.to_string(),
        message: format!("expected an integer, got '{raw}'"),
    })?;

    if !(min..=max).contains(&value) {
        return Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: format!("must be between {min} and {max}, got {value}"),
        });
    }

    Ok(value)
}
