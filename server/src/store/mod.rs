//! Persistence for tenants, bookings, campaigns and scheduled emails.
//!
//! The [`Store`] trait is the only way the rest of the server touches durable
//! state. Two implementations are provided:
//!
//! | Type | Durability | Used for |
//! |------|------------|----------|
//! | [`MemoryStore`] | process lifetime | tests, local development |
//! | [`SqliteStore`] | on disk (WAL) | production |
//!
//! # Pending sends
//!
//! Scheduled recovery emails move through a small state machine:
//!
//! ```text
//! PENDING --claim--> SENDING --sent--> SENT
//!                       |  \--retry--> PENDING
//!                       |  \-release-> PENDING (attempt not counted)
//!                       \----fail----> FAILED
//! PENDING | SENDING --cancel--> CANCELLED
//! ```
//!
//! [`Store::claim_due_sends`] performs the `PENDING -> SENDING` step as a
//! conditional update, so a record is handed to at most one dispatcher.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{
    BookingRecord, BookingStats, BookingStatus, CampaignConfig, PendingSend, SendStatus, Tenant,
};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Error recorded on sends whose claim outlived the lease.
pub const STALE_CLAIM_ERROR: &str = "delivery state unknown: claim expired before completion";

/// Errors returned by [`Store`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A record with the same unique key already exists.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A persisted record could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// SQLite reported an error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// A state change applied to a claimed (or still pending) send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTransition {
    /// The transport accepted the email.
    Sent,
    /// A transient failure; try again at `due_at`.
    Retry {
        due_at: DateTime<Utc>,
        error: String,
    },
    /// Permanent failure or attempts exhausted.
    Failed { error: String },
    /// The campaign was deactivated before delivery.
    Cancelled { reason: String },
    /// The claim is handed back untried; try again at `due_at` without
    /// counting the claim as a delivery attempt.
    Released {
        due_at: DateTime<Utc>,
        reason: String,
    },
}

impl SendTransition {
    /// Status the send ends up in.
    pub fn target(&self) -> SendStatus {
        match self {
            Self::Sent => SendStatus::Sent,
            Self::Retry { .. } | Self::Released { .. } => SendStatus::Pending,
            Self::Failed { .. } => SendStatus::Failed,
            Self::Cancelled { .. } => SendStatus::Cancelled,
        }
    }

    /// Statuses this transition may start from.
    pub fn allowed_sources(&self) -> &'static [SendStatus] {
        match self {
            Self::Sent | Self::Retry { .. } | Self::Failed { .. } | Self::Released { .. } => {
                &[SendStatus::Sending]
            }
            Self::Cancelled { .. } => &[SendStatus::Pending, SendStatus::Sending],
        }
    }

    /// Returns `true` if a send in `from` may take this transition.
    pub fn allowed_from(&self, from: SendStatus) -> bool {
        self.allowed_sources().contains(&from)
    }

    /// Error text recorded alongside the new status, if any.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Sent => None,
            Self::Retry { error, .. } | Self::Failed { error } => Some(error),
            Self::Cancelled { reason } | Self::Released { reason, .. } => Some(reason),
        }
    }

    /// New due time for transitions that return the send to `pending`.
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Retry { due_at, .. } | Self::Released { due_at, .. } => Some(*due_at),
            _ => None,
        }
    }

    /// Whether the claim that led here should not count as an attempt.
    pub fn refunds_attempt(&self) -> bool {
        matches!(self, Self::Released { .. })
    }

    /// Applies the transition to an in-memory record.
    ///
    /// Returns `false` and leaves the record untouched when the current status
    /// does not allow it.
    pub fn apply(&self, send: &mut PendingSend, now: DateTime<Utc>) -> bool {
        if !self.allowed_from(send.status) {
            return false;
        }
        send.status = self.target();
        send.updated_at = now;
        if let Some(error) = self.error() {
            send.last_error = Some(error.to_string());
        }
        if let Some(due_at) = self.due_at() {
            send.due_at = due_at;
            send.claimed_at = None;
        }
        if self.refunds_attempt() {
            send.attempts = send.attempts.saturating_sub(1);
        }
        true
    }
}

/// Durable state used by ingestion, the scheduler and the management API.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // ------------------------------------------------------------------
    // Tenants
    // ------------------------------------------------------------------

    /// Registers a tenant. Fails with [`StoreError::Conflict`] if the
    /// tracking identifier or id is already taken.
    async fn insert_tenant(&self, tenant: Tenant) -> Result<(), StoreError>;

    async fn tenant_by_tracking_id(&self, tracking_id: &str)
        -> Result<Option<Tenant>, StoreError>;

    /// Tenants of an owner, oldest first.
    async fn tenants_for_owner(&self, owner_id: &str) -> Result<Vec<Tenant>, StoreError>;

    // ------------------------------------------------------------------
    // Bookings
    // ------------------------------------------------------------------

    /// Persists a booking and, optionally, the recovery email scheduled for
    /// it. Either both records are written or neither is.
    async fn record_booking(
        &self,
        booking: BookingRecord,
        send: Option<PendingSend>,
    ) -> Result<(), StoreError>;

    async fn get_booking(&self, id: &str) -> Result<Option<BookingRecord>, StoreError>;

    /// Changes a booking's status. Returns the updated record, or `None` if
    /// no booking has that id.
    async fn set_booking_status(
        &self,
        id: &str,
        status: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<BookingRecord>, StoreError>;

    /// Bookings for a tracking id created at or after `since`, newest first.
    async fn bookings_for_tracking_id(
        &self,
        tracking_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<BookingRecord>, StoreError>;

    async fn booking_stats(
        &self,
        tracking_id: &str,
        since: DateTime<Utc>,
    ) -> Result<BookingStats, StoreError> {
        let bookings = self.bookings_for_tracking_id(tracking_id, since).await?;
        Ok(BookingStats::from_statuses(
            bookings.into_iter().map(|b| b.status),
        ))
    }

    // ------------------------------------------------------------------
    // Campaigns
    // ------------------------------------------------------------------

    async fn campaign_for_owner(&self, owner_id: &str)
        -> Result<Option<CampaignConfig>, StoreError>;

    /// Inserts or replaces the owner's campaign.
    async fn put_campaign(&self, owner_id: &str, campaign: CampaignConfig)
        -> Result<(), StoreError>;

    // ------------------------------------------------------------------
    // Pending sends
    // ------------------------------------------------------------------

    async fn get_send(&self, id: &str) -> Result<Option<PendingSend>, StoreError>;

    async fn sends_for_booking(&self, booking_id: &str) -> Result<Vec<PendingSend>, StoreError>;

    /// Moves up to `limit` pending sends with `due_at <= now` to `sending`,
    /// earliest first, incrementing their attempt counter. Returns the
    /// claimed records in their new state.
    async fn claim_due_sends(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PendingSend>, StoreError>;

    /// Applies `transition` if the send's current status allows it. Returns
    /// `false` when the send is missing or in another state.
    async fn transition_send(
        &self,
        id: &str,
        transition: SendTransition,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Fails every `sending` record claimed before `claimed_before` with
    /// [`STALE_CLAIM_ERROR`]. Returns the affected records.
    async fn expire_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<PendingSend>, StoreError>;
}
