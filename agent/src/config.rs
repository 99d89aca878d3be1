//! Configuration for the tracking agent.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `BOOKING_AGENT_ENDPOINT` | No | `http://localhost:8080` | Origin events are posted to |
//! | `BOOKING_AGENT_INACTIVITY_SECS` | No | 30 | Quiet period before an abandonment fires |
//! | `BOOKING_AGENT_VISIBILITY_GRACE_MS` | No | 2000 | How long the page may stay hidden before an abandonment fires |
//! | `BOOKING_AGENT_FALLBACK_ID` | No | `track_demo123` | Tracking id used when none is found; empty disables the fallback |
//! | `BOOKING_AGENT_REQUEST_TIMEOUT_SECS` | No | 10 | Timeout for event requests |

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::emitter::{DEFAULT_BEACON_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
use crate::session::{SessionTimings, DEFAULT_INACTIVITY_TIMEOUT, DEFAULT_VISIBILITY_GRACE};

/// Tracking id used when neither the script URL nor the page URL carries one.
pub const DEFAULT_FALLBACK_ID: &str = "track_demo123";

/// Origin used when nothing else provides one.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:8080";

/// Errors that can occur during configuration parsing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Configuration for the tracking agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Endpoint origin. `None` means "the origin the script was served
    /// from", which is what an embedded agent does.
    pub endpoint: Option<String>,

    pub timings: SessionTimings,

    /// Tracking id of last resort. `None` disables the fallback.
    pub fallback_tracking_id: Option<String>,

    pub request_timeout: Duration,

    pub beacon_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timings: SessionTimings {
                inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
                visibility_grace: DEFAULT_VISIBILITY_GRACE,
            },
            fallback_tracking_id: Some(DEFAULT_FALLBACK_ID.to_string()),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            beacon_timeout: DEFAULT_BEACON_TIMEOUT,
        }
    }
}

impl AgentConfig {
    /// Reads the configuration from `BOOKING_AGENT_*` environment variables.
    ///
    /// Unlike [`AgentConfig::default`], the endpoint is always set: a CLI has
    /// no script origin to fall back on.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if a numeric variable is not a positive integer
    /// or the endpoint is not an http(s) URL.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let endpoint = match env::var("BOOKING_AGENT_ENDPOINT") {
            Ok(val) if !val.trim().is_empty() => parse_endpoint(val.trim())?,
            _ => DEFAULT_ENDPOINT.to_string(),
        };

        let inactivity_timeout = parse_positive("BOOKING_AGENT_INACTIVITY_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.timings.inactivity_timeout);

        let visibility_grace = parse_positive("BOOKING_AGENT_VISIBILITY_GRACE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.timings.visibility_grace);

        let request_timeout = parse_positive("BOOKING_AGENT_REQUEST_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);

        let fallback_tracking_id = match env::var("BOOKING_AGENT_FALLBACK_ID") {
            Ok(val) => Some(val.trim().to_string()).filter(|id| !id.is_empty()),
            Err(_) => defaults.fallback_tracking_id,
        };

        Ok(Self {
            endpoint: Some(endpoint),
            timings: SessionTimings {
                inactivity_timeout,
                visibility_grace,
            },
            fallback_tracking_id,
            request_timeout,
            beacon_timeout: defaults.beacon_timeout,
        })
    }
}

fn parse_positive(key: &str) -> Result<Option<u64>, ConfigError> {
    let Ok(val) = env::var(key) else {
        return Ok(None);
    };
    match val.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(Some(n)),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected positive integer, got '{val}'"),
        }),
    }
}

fn parse_endpoint(val: &str) -> Result<String, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "BOOKING_AGENT_ENDPOINT".to_string(),
        message,
    };

    let url = reqwest::Url::parse(val).map_err(|e| invalid(format!("'{val}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("expected http or https URL, got '{val}'")));
    }
    Ok(url.origin().ascii_serialization())
}
