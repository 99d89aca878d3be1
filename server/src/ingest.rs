//! Tracking event ingestion.
//!
//! [`IngestService::track`] is the domain side of `POST /api/track`:
//!
//! 1. reject events missing `trackingId`, `sessionId` or `event`,
//! 2. resolve the tenant owning the tracking id,
//! 3. optionally check the request origin against the tenant domain,
//! 4. apply the per-tracking-id rate limit,
//! 5. build the booking record and, for abandonments with a captured email,
//!    plan the recovery send,
//! 6. write booking and send in one atomic store call.
//!
//! Nothing is written unless every step succeeds.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::auth::host_matches_domain;
use crate::error::{Result, ServerError};
use crate::rate_limit::{RateLimitResult, RateLimiter};
use crate::scheduler::{ScheduleOutcome, Scheduler, SkipReason};
use crate::store::Store;
use crate::types::{
    generate_booking_id, BookingRecord, BookingStatus, Tenant, TrackRequest, TrackingEventKind,
};

/// What happened to an accepted tracking event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackOutcome {
    pub booking_id: String,
    pub event: TrackingEventKind,
    /// Id of the recovery send planned for this booking, if any.
    pub send_id: Option<String>,
    /// Why no recovery send was planned for an abandonment.
    pub skipped: Option<SkipReason>,
}

/// Validated required fields of a [`TrackRequest`].
struct RequiredFields {
    tracking_id: String,
    session_id: String,
    event: TrackingEventKind,
}

/// Validates, persists and schedules tracking events.
#[derive(Clone)]
pub struct IngestService {
    store: Arc<dyn Store>,
    scheduler: Scheduler,
    rate_limiter: RateLimiter,
    enforce_origin: bool,
}

impl std::fmt::Debug for IngestService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestService")
            .field("rate_limiter", &self.rate_limiter)
            .field("enforce_origin", &self.enforce_origin)
            .finish_non_exhaustive()
    }
}

impl IngestService {
    pub fn new(
        store: Arc<dyn Store>,
        scheduler: Scheduler,
        rate_limiter: RateLimiter,
        enforce_origin: bool,
    ) -> Self {
        Self {
            store,
            scheduler,
            rate_limiter,
            enforce_origin,
        }
    }

    /// Handles one tracking event received at `now`.
    ///
    /// `request_host` is the host from the request's `Origin`/`Referer`
    /// headers; it is only consulted when origin enforcement is on.
    ///
    /// # Errors
    ///
    /// - [`ServerError::MissingFields`] if a required field is absent or empty
    /// - [`ServerError::Validation`] if `event` is not a known kind
    /// - [`ServerError::UnknownTrackingId`] if no tenant owns the tracking id
    /// - [`ServerError::OriginMismatch`] if origin enforcement rejects the host
    /// - [`ServerError::RateLimit`] if the tracking id is over its limit
    /// - [`ServerError::Store`] if reading or writing the store fails
    pub async fn track(
        &self,
        request: TrackRequest,
        request_host: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<TrackOutcome> {
        let fields = required_fields(&request)?;

        let tenant = self
            .store
            .tenant_by_tracking_id(&fields.tracking_id)
            .await?
            .ok_or_else(|| {
                debug!(tracking_id = %fields.tracking_id, "Unknown tracking id");
                ServerError::unknown_tracking_id(&fields.tracking_id)
            })?;

        if self.enforce_origin {
            check_origin(&tenant, request_host)?;
        }

        if let RateLimitResult::Limited { retry_after_secs } =
            self.rate_limiter.check(&tenant.tracking_id).await
        {
            info!(
                tracking_id = %tenant.tracking_id,
                retry_after = retry_after_secs,
                "Rate limit exceeded"
            );
            return Err(ServerError::rate_limit(&tenant.tracking_id, retry_after_secs));
        }

        let booking = build_booking(&tenant, fields, request, now);

        let (send, skipped) = match booking.event {
            TrackingEventKind::Abandonment => {
                match self
                    .scheduler
                    .schedule_recovery(
                        &booking.id,
                        &tenant.owner_id,
                        &tenant.client_info(),
                        &booking.form_data,
                        now,
                    )
                    .await?
                {
                    ScheduleOutcome::Scheduled(send) => (Some(send), None),
                    ScheduleOutcome::Skipped(reason) => (None, Some(reason)),
                }
            }
            TrackingEventKind::Completion => (None, None),
        };

        let outcome = TrackOutcome {
            booking_id: booking.id.clone(),
            event: booking.event,
            send_id: send.as_ref().map(|s| s.id.clone()),
            skipped,
        };

        debug!(
            booking_id = %booking.id,
            fields = ?booking.form_data.keys().collect::<Vec<_>>(),
            "Captured form fields"
        );

        self.store.record_booking(booking, send).await?;

        match outcome.event {
            TrackingEventKind::Abandonment => info!(
                booking_id = %outcome.booking_id,
                tracking_id = %tenant.tracking_id,
                recovery_scheduled = outcome.send_id.is_some(),
                "Booking abandonment recorded"
            ),
            TrackingEventKind::Completion => info!(
                booking_id = %outcome.booking_id,
                tracking_id = %tenant.tracking_id,
                "Booking completion recorded"
            ),
        }

        Ok(outcome)
    }
}

/// Returns the trimmed value of a required field, or `None` if absent/blank.
fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn required_fields(request: &TrackRequest) -> Result<RequiredFields> {
    let (Some(tracking_id), Some(session_id), Some(event)) = (
        non_blank(&request.tracking_id),
        non_blank(&request.session_id),
        non_blank(&request.event),
    ) else {
        return Err(ServerError::MissingFields);
    };

    let event = event.parse::<TrackingEventKind>().map_err(ServerError::validation)?;

    Ok(RequiredFields {
        tracking_id,
        session_id,
        event,
    })
}

fn check_origin(tenant: &Tenant, request_host: Option<&str>) -> Result<()> {
    match request_host {
        Some(host) if host_matches_domain(host, &tenant.domain) => Ok(()),
        Some(host) => {
            warn!(
                tracking_id = %tenant.tracking_id,
                host,
                domain = %tenant.domain,
                "Tracking request from foreign origin"
            );
            Err(ServerError::OriginMismatch(host.to_string()))
        }
        None => {
            warn!(tracking_id = %tenant.tracking_id, "Tracking request without origin");
            Err(ServerError::OriginMismatch("<none>".to_string()))
        }
    }
}

/// Builds the record to persist. An absent or unparsable client timestamp is
/// replaced by the receipt time.
fn build_booking(
    tenant: &Tenant,
    fields: RequiredFields,
    request: TrackRequest,
    now: DateTime<Utc>,
) -> BookingRecord {
    let timestamp = request
        .timestamp
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts.trim()).ok())
        .map_or(now, |ts| ts.with_timezone(&Utc));

    let form_data = request
        .form_data
        .into_iter()
        .filter(|(key, _)| !key.trim().is_empty())
        .collect();

    BookingRecord {
        id: generate_booking_id(),
        tracking_id: fields.tracking_id,
        session_id: fields.session_id,
        client_id: tenant.id.clone(),
        event: fields.event,
        form_data,
        url: non_blank(&request.url),
        timestamp,
        user_agent: non_blank(&request.user_agent),
        status: BookingStatus::for_event(fields.event),
        created_at: now,
        updated_at: now,
    }
}
