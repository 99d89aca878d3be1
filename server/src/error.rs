//! Error types for the recovery server.
//!
//! [`ServerError`] is the top-level error returned by the ingestion service and
//! the management handlers. Module-level errors ([`StoreError`],
//! [`SchedulerError`]) convert into it.
//!
//! # Example
//!
//! ```rust
//! use recovery_server::error::ServerError;
//!
//! fn require(field: Option<&str>) -> Result<&str, ServerError> {
//!     field.ok_or_else(|| ServerError::validation("missing required fields"))
//! }
//!
//! assert!(require(None).unwrap_err().is_client_error());
//! ```

use std::error::Error;
use std::fmt;

use crate::scheduler::SchedulerError;
use crate::store::StoreError;

/// Top-level error type for the recovery server.
///
/// # Error Categories
///
/// - **Client errors**: validation failures, unknown tracking identifiers,
///   origin mismatches, missing resources, rate limiting
/// - **Server errors**: store failures, anything unexpected
#[derive(Debug)]
pub enum ServerError {
    /// The request body is not valid JSON of the expected shape.
    InvalidFormat(String),

    /// Request validation failure (malformed fields).
    Validation(String),

    /// A tracking event lacked `trackingId`, `sessionId` or `event`.
    MissingFields,

    /// The tracking identifier does not belong to any registered tenant.
    UnknownTrackingId(String),

    /// Missing or invalid admin credentials.
    Unauthorized(String),

    /// The tracking request came from a host outside the tenant's domain.
    OriginMismatch(String),

    /// The requested resource does not exist.
    NotFound(String),

    /// Rate limit exceeded for a tracking identifier.
    RateLimit {
        /// The rate-limited tracking identifier.
        tracking_id: String,
        /// Number of seconds until the limit resets.
        retry_after: u64,
    },

    /// The backing store failed.
    Store(StoreError),

    /// Unexpected internal server error.
    Internal(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidFormat(msg) => write!(f, "invalid format: {msg}"),
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::MissingFields => write!(f, "missing required fields"),
            Self::UnknownTrackingId(id) => write!(f, "unknown tracking id: {id}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::OriginMismatch(host) => write!(f, "origin mismatch: {host}"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::RateLimit {
                tracking_id,
                retry_after,
            } => {
                write!(
                    f,
                    "rate limit exceeded for {tracking_id}, retry after {retry_after} seconds"
                )
            }
            Self::Store(err) => write!(f, "store error: {err}"),
            Self::Internal(msg) => write!(f, "internal server error: {msg}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<SchedulerError> for ServerError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Store(err) => Self::Store(err),
        }
    }
}

impl ServerError {
    /// Creates a new validation error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use recovery_server::error::ServerError;
    ///
    /// let err = ServerError::validation("missing 'trackingId' field");
    /// assert!(matches!(err, ServerError::Validation(_)));
    /// ```
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat(message.into())
    }

    /// Creates an unauthorized error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    /// Creates an unknown tracking id error.
    pub fn unknown_tracking_id(tracking_id: impl Into<String>) -> Self {
        Self::UnknownTrackingId(tracking_id.into())
    }

    /// Creates a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Creates a new rate limit error.
    pub fn rate_limit(tracking_id: impl Into<String>, retry_after: u64) -> Self {
        Self::RateLimit {
            tracking_id: tracking_id.into(),
            retry_after,
        }
    }

    /// Creates a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Short machine-readable reason, returned as `code` in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidFormat(_) => "invalid_format",
            Self::Validation(_) => "invalid_request",
            Self::MissingFields => "missing_fields",
            Self::UnknownTrackingId(_) => "invalid_tracking_id",
            Self::Unauthorized(_) => "unauthorized",
            Self::OriginMismatch(_) => "origin_mismatch",
            Self::NotFound(_) => "not_found",
            Self::RateLimit { .. } => "rate_limited",
            Self::Store(_) | Self::Internal(_) => "internal_error",
        }
    }

    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidFormat(_)
                | Self::Validation(_)
                | Self::MissingFields
                | Self::UnknownTrackingId(_)
                | Self::Unauthorized(_)
                | Self::OriginMismatch(_)
                | Self::NotFound(_)
                | Self::RateLimit { .. }
        )
    }

    /// Returns `true` if this error indicates a server-side problem.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Internal(_) | Self::Store(_))
    }
}

/// A specialized Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
