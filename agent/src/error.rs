//! Error types for the tracking agent.

use thiserror::Error;

use crate::config::ConfigError;
use crate::emitter::EmitError;

/// Errors that stop the agent from running.
///
/// Delivery failures are not here: they are logged by the emitter and never
/// reach the caller.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Configuration-related error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No tracking id in the script URL or page URL, and no fallback.
    #[error("no tracking id found for this page")]
    NoTrackingId,

    /// No endpoint origin could be derived from the script or page URL.
    #[error("cannot determine event endpoint for page '{0}'")]
    NoEndpoint(String),

    /// The HTTP client could not be built.
    #[error("emitter error: {0}")]
    Emitter(#[from] EmitError),

    /// File system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A replay script line could not be parsed.
    #[error("replay line {line}: {message}")]
    Replay { line: usize, message: String },
}
