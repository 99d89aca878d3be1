//! Email delivery.
//!
//! The scheduler hands rendered messages to an [`EmailTransport`]. Two
//! transports exist:
//!
//! - [`ResendTransport`] posts to a Resend-compatible `POST /emails` endpoint
//!   with bearer authentication and a 5 second timeout.
//! - [`LogTransport`] only logs the message. It is selected when no API key
//!   is configured so local setups never send real mail.
//!
//! Failures are classified so the dispatcher can decide between retrying and
//! giving up: see [`EmailError::is_transient`].
//!
//! # Example
//!
//! ```rust,ignore
//! use recovery_server::email::{EmailMessage, EmailTransport, ResendTransport};
//!
//! let transport = ResendTransport::new("https://api.resend.com", "re_123")?;
//! let id = transport
//!     .send(&EmailMessage {
//!         from: "noreply@bookingrecovery.com".into(),
//!         to: "ana@example.com".into(),
//!         subject: "You left something behind!".into(),
//!         html: "<p>Hi Ana</p>".into(),
//!         text: "Hi Ana".into(),
//!     })
//!     .await?;
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Timeout for a single delivery request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors returned by an [`EmailTransport`].
#[derive(Debug, Error)]
pub enum EmailError {
    /// The request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The provider could not be reached or answered with a retryable status.
    #[error("email provider unavailable: {0}")]
    Unavailable(String),

    /// The provider rejected the message. `body` may contain the recipient
    /// address and is not part of `Display`.
    #[error("email rejected with status {status}")]
    Rejected { status: u16, body: String },

    /// The provider's response could not be understood.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Transport configuration error.
    #[error("transport configuration error: {0}")]
    Configuration(String),
}

impl EmailError {
    /// Returns `true` if sending the same message again may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_))
    }
}

/// A rendered message with its envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Something that can deliver an [`EmailMessage`].
#[async_trait]
pub trait EmailTransport: Send + Sync + 'static {
    /// Delivers `message`, returning the provider's message id if it gave one.
    async fn send(&self, message: &EmailMessage) -> Result<Option<String>, EmailError>;
}

/// Response body of `POST /emails`.
#[derive(Debug, Deserialize)]
struct SendResponse {
    id: Option<String>,
}

/// Transport for the Resend HTTP API (or anything speaking the same shape).
#[derive(Debug, Clone)]
pub struct ResendTransport {
    http_client: Client,
    base_url: String,
    api_key: String,
}

impl ResendTransport {
    /// Creates a transport for `base_url` (e.g. `https://api.resend.com`).
    ///
    /// # Errors
    ///
    /// Returns [`EmailError::Configuration`] if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, EmailError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EmailError::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url,
            api_key: api_key.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl EmailTransport for ResendTransport {
    async fn send(&self, message: &EmailMessage) -> Result<Option<String>, EmailError> {
        let url = format!("{}/emails", self.base_url);

        debug!(url = %url, to = %message.to, "Sending email");

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(message)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EmailError::Timeout(REQUEST_TIMEOUT)
                } else if e.is_connect() {
                    EmailError::Unavailable(format!("connection failed: {e}"))
                } else {
                    EmailError::Unavailable(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Email provider temporarily unavailable");
            return Err(EmailError::Unavailable(format!(
                "status {status}: {body}"
            )));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Email provider rejected message");
            debug!(status = %status, body = %body, "Rejection details");
            return Err(EmailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SendResponse = response.json().await.map_err(|e| {
            EmailError::InvalidResponse(format!("failed to parse send response: {e}"))
        })?;

        Ok(parsed.id)
    }
}

/// Transport that logs messages instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

#[async_trait]
impl EmailTransport for LogTransport {
    async fn send(&self, message: &EmailMessage) -> Result<Option<String>, EmailError> {
        info!("Email transport disabled, message not sent");
        debug!(
            to = %message.to,
            subject = %message.subject,
            text = %message.text,
            "Suppressed email"
        );
        Ok(None)
    }
}
