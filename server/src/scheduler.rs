//! Delayed recovery email scheduling and dispatch.
//!
//! Scheduling never sleeps in-process. [`Scheduler::schedule_recovery`] turns
//! an abandonment into a [`PendingSend`] due at `now + delayMinutes`, which the
//! caller persists together with the booking. A background loop
//! ([`Scheduler::spawn_dispatch_loop`]) then polls the store:
//!
//! 1. outcomes an earlier pass could not write are written now,
//! 2. sends stuck in `sending` past the claim lease are failed (delivery state
//!    unknown, so they are never sent twice),
//! 3. due sends are claimed with a conditional `pending -> sending` update,
//! 4. each claim re-checks that the campaign is still active and the booking
//!    is still abandoned, otherwise it is cancelled,
//! 5. the template is rendered and handed to the [`EmailTransport`],
//! 6. the send is marked `sent`, rescheduled with backoff, or `failed`.
//!
//! A store error before step 5 releases the claim back to `pending`, so the
//! email is tried again instead of being expired. Only a claim whose process
//! died between steps 5 and 6 can reach the lease expiry.
//!
//! Because the pending set lives in the store, scheduled emails survive a
//! restart and are picked up on the next poll.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::email::{EmailMessage, EmailTransport};
use crate::store::{SendTransition, Store, StoreError};
use crate::template;
use crate::types::{
    generate_send_id, BookingStatus, ClientInfo, FormData, PendingSend, SendStatus,
};

/// Maximum number of sends claimed per poll.
const DEFAULT_BATCH_SIZE: usize = 50;

/// How long a claim may stay in `sending` before it is considered lost.
const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(10 * 60);

/// Base delay for retrying a transient delivery failure.
const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(30);

/// Upper bound for the retry delay.
const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(60 * 60);

/// Errors returned by the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Tunables for planning and dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Sender address.
    pub from_email: String,
    /// Delivery attempts before a send is failed.
    pub max_attempts: u32,
    /// Sends claimed per poll.
    pub batch_size: usize,
    /// Claim lease; see the module docs.
    pub claim_lease: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl SchedulerConfig {
    pub fn new(from_email: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            from_email: from_email.into(),
            max_attempts: max_attempts.max(1),
            batch_size: DEFAULT_BATCH_SIZE,
            claim_lease: DEFAULT_CLAIM_LEASE,
            retry_base: DEFAULT_RETRY_BASE,
            retry_max: DEFAULT_RETRY_MAX,
        }
    }
}

impl From<&Config> for SchedulerConfig {
    fn from(config: &Config) -> Self {
        Self::new(config.from_email.clone(), config.max_send_attempts)
    }
}

/// Why no email was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No non-empty `email` field was captured.
    NoEmail,
    /// The owner's campaign is switched off.
    CampaignInactive,
}

/// Result of [`Scheduler::schedule_recovery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A send was planned. The caller must persist it.
    Scheduled(PendingSend),
    Skipped(SkipReason),
}

/// Counts from one [`Scheduler::dispatch_due`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub expired: usize,
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Claims handed back untried after a store error.
    pub released: usize,
    /// Outcomes that could not be written yet; retried on the next pass.
    pub deferred: usize,
    /// Deferred outcomes from earlier passes written during this one.
    pub recorded: usize,
}

impl DispatchReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Plans recovery emails and dispatches them when due.
///
/// Cheap to clone; clones share the store and transport.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn Store>,
    transport: Arc<dyn EmailTransport>,
    config: SchedulerConfig,
    /// Outcomes whose `transition_send` failed, keyed by send id.
    unrecorded: Arc<Mutex<Vec<(String, SendTransition)>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn EmailTransport>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            unrecorded: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Plans a recovery email for an abandoned booking.
    ///
    /// Loads the owner's campaign (or the default one), skips when it is
    /// inactive or no email was captured, and otherwise snapshots the
    /// template into a [`PendingSend`] due at `now + delayMinutes`.
    pub async fn schedule_recovery(
        &self,
        booking_id: &str,
        owner_id: &str,
        client: &ClientInfo,
        form_data: &FormData,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, SchedulerError> {
        let Some(recipient) = form_data
            .get("email")
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
        else {
            return Ok(ScheduleOutcome::Skipped(SkipReason::NoEmail));
        };

        let campaign = self
            .store
            .campaign_for_owner(owner_id)
            .await?
            .unwrap_or_default();

        if !campaign.is_active {
            info!(booking_id, owner_id, "Campaign inactive, no recovery email scheduled");
            return Ok(ScheduleOutcome::Skipped(SkipReason::CampaignInactive));
        }

        let due_at = now + chrono::Duration::minutes(i64::from(campaign.delay_minutes));

        info!(
            booking_id,
            owner_id,
            delay_minutes = campaign.delay_minutes,
            due_at = %due_at,
            "Recovery email scheduled"
        );

        Ok(ScheduleOutcome::Scheduled(PendingSend {
            id: generate_send_id(),
            booking_id: booking_id.to_string(),
            owner_id: owner_id.to_string(),
            recipient: recipient.to_string(),
            subject: campaign.subject,
            body: campaign.body,
            client: client.clone(),
            form_data: form_data.clone(),
            due_at,
            attempts: 0,
            status: SendStatus::Pending,
            last_error: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }))
    }

    /// Runs one dispatch pass at `now`.
    ///
    /// An outcome that cannot be written is kept in memory and written by a
    /// later pass before stale claims are expired.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<DispatchReport, SchedulerError> {
        let mut report = DispatchReport::default();

        report.recorded = self.record_deferred(now).await;

        let lease = chrono::Duration::from_std(self.config.claim_lease)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let expired = self.store.expire_stale_claims(now - lease, now).await?;
        for send in &expired {
            warn!(
                send_id = %send.id,
                booking_id = %send.booking_id,
                "Claim expired mid-delivery, marking send failed"
            );
        }
        report.expired = expired.len();

        let claimed = self
            .store
            .claim_due_sends(now, self.config.batch_size)
            .await?;
        report.claimed = claimed.len();

        for send in claimed {
            let transition = self.deliver(&send, now).await;
            match &transition {
                SendTransition::Sent => report.sent += 1,
                SendTransition::Retry { .. } => report.retried += 1,
                SendTransition::Failed { .. } => report.failed += 1,
                SendTransition::Cancelled { .. } => report.cancelled += 1,
                SendTransition::Released { .. } => report.released += 1,
            }
            if !self.record(&send.id, transition, now).await {
                report.deferred += 1;
            }
        }

        if !report.is_empty() {
            info!(
                expired = report.expired,
                claimed = report.claimed,
                sent = report.sent,
                retried = report.retried,
                failed = report.failed,
                cancelled = report.cancelled,
                released = report.released,
                deferred = report.deferred,
                recorded = report.recorded,
                "Dispatch pass complete"
            );
        }

        Ok(report)
    }

    /// Decides and performs delivery for one claimed send.
    ///
    /// A store error during the pre-send checks releases the claim instead
    /// of attempting delivery.
    async fn deliver(&self, send: &PendingSend, now: DateTime<Utc>) -> SendTransition {
        match self.cancellation_reason(send).await {
            Ok(Some(reason)) => {
                info!(send_id = %send.id, reason, "Recovery send cancelled");
                SendTransition::Cancelled {
                    reason: reason.to_string(),
                }
            }
            Ok(None) => self.attempt(send, now).await,
            Err(e) => {
                let delay = retry_delay(1, self.config.retry_base, self.config.retry_max);
                warn!(
                    send_id = %send.id,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "Pre-send check failed, releasing claim"
                );
                SendTransition::Released {
                    due_at: now + to_chrono(delay),
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Writes an outcome. On a store error the outcome is kept for the next
    /// pass and `false` is returned.
    async fn record(&self, send_id: &str, transition: SendTransition, now: DateTime<Utc>) -> bool {
        match self
            .store
            .transition_send(send_id, transition.clone(), Utc::now().max(now))
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                warn!(send_id, "Send changed state during delivery, outcome not recorded");
                true
            }
            Err(e) => {
                error!(send_id, error = %e, "Failed to record send outcome, will retry");
                self.unrecorded
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((send_id.to_string(), transition));
                false
            }
        }
    }

    /// Writes outcomes left over from earlier passes. Returns how many were
    /// written; the rest stay queued.
    async fn record_deferred(&self, now: DateTime<Utc>) -> usize {
        let pending = std::mem::take(
            &mut *self
                .unrecorded
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let mut written = 0;
        for (send_id, transition) in pending {
            if self.record(&send_id, transition, now).await {
                debug!(send_id = %send_id, "Deferred send outcome recorded");
                written += 1;
            }
        }
        written
    }

    /// Re-checks, at dispatch time, whether the send should still go out.
    async fn cancellation_reason(
        &self,
        send: &PendingSend,
    ) -> Result<Option<&'static str>, SchedulerError> {
        let campaign = self
            .store
            .campaign_for_owner(&send.owner_id)
            .await?
            .unwrap_or_default();
        if !campaign.is_active {
            return Ok(Some("campaign inactive"));
        }

        match self.store.get_booking(&send.booking_id).await? {
            Some(booking) if booking.status != BookingStatus::Abandoned => {
                Ok(Some("booking no longer abandoned"))
            }
            _ => Ok(None),
        }
    }

    /// Renders and sends, mapping the transport result to a transition.
    async fn attempt(&self, send: &PendingSend, now: DateTime<Utc>) -> SendTransition {
        let rendered = template::render(&send.subject, &send.body, &send.client, &send.form_data);
        let message = EmailMessage {
            from: self.config.from_email.clone(),
            to: send.recipient.clone(),
            subject: rendered.subject,
            html: rendered.html,
            text: rendered.text,
        };

        match self.transport.send(&message).await {
            Ok(message_id) => {
                info!(
                    send_id = %send.id,
                    booking_id = %send.booking_id,
                    attempt = send.attempts,
                    message_id = message_id.as_deref().unwrap_or("-"),
                    "Recovery email sent"
                );
                debug!(send_id = %send.id, to = %send.recipient, "Recovery email recipient");
                SendTransition::Sent
            }
            Err(e) if e.is_transient() && send.attempts < self.config.max_attempts => {
                let delay = retry_delay(
                    send.attempts,
                    self.config.retry_base,
                    self.config.retry_max,
                );
                let due_at = now + to_chrono(delay);
                warn!(
                    send_id = %send.id,
                    attempt = send.attempts,
                    max_attempts = self.config.max_attempts,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "Recovery email failed, retrying"
                );
                SendTransition::Retry {
                    due_at,
                    error: e.to_string(),
                }
            }
            Err(e) => {
                error!(
                    send_id = %send.id,
                    attempt = send.attempts,
                    error = %e,
                    "Recovery email failed, giving up"
                );
                SendTransition::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Spawns the background dispatch loop.
    ///
    /// The loop polls every `interval` until `shutdown` changes or its sender
    /// is dropped. A pass that is running when shutdown is signalled is
    /// allowed to finish.
    pub fn spawn_dispatch_loop(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(interval_secs = interval.as_secs(), "Dispatch loop started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.dispatch_due(Utc::now()).await {
                            error!(error = %e, "Dispatch pass failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        break;
                    }
                }
            }

            info!("Dispatch loop stopped");
        })
    }
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1))
}

/// Delay before retry number `attempt` (1-based):
/// `min(base * 2^(attempt-1), max)` plus up to 10% jitter.
fn retry_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    let delay_ms = base_ms.saturating_mul(1u64 << exponent).min(max_ms);
    let jitter_ms = rand::rng().random_range(0..=delay_ms / 10);
    Duration::from_millis(delay_ms.saturating_add(jitter_ms))
}
