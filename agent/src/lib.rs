//! Booking Recovery tracking agent.
//!
//! Watches a booking form for abandonment and reports one terminal event per
//! page session to the ingestion endpoint.
//!
//! # Privacy
//!
//! Only fields that pass the safe-field filter ever leave the page. Password,
//! hidden and payment-looking fields are dropped by type, name or id before
//! anything is stored in the session.
//!
//! # Modules
//!
//! - [`types`]: Wire event and page model
//! - [`fields`]: Safe-field filter and capture keys
//! - [`classify`]: Booking form detection
//! - [`resolve`]: Tracking id and endpoint resolution
//! - [`session`]: Abandonment state machine
//! - [`emitter`]: Event delivery
//! - [`agent`]: Event loop tying the above together
//! - [`replay`]: Scripted page sessions for the CLI
//! - [`config`]: Configuration from environment variables
//! - [`error`]: Error types

pub mod agent;
pub mod classify;
pub mod config;
pub mod emitter;
pub mod error;
pub mod fields;
pub mod replay;
pub mod resolve;
pub mod session;
pub mod types;

pub use agent::{Agent, AgentSummary};
pub use classify::{FormClassifier, KeywordClassifier};
pub use config::AgentConfig;
pub use emitter::{EmitError, EventSink, HttpEmitter, LogSink};
pub use error::AgentError;
pub use session::{Delivery, Emission, TrackingSession};
pub use types::{EventKind, FieldDescriptor, PageDescriptor, PageEvent, TrackEvent};
