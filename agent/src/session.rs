//! Abandonment state machine for one page session.
//!
//! [`TrackingSession`] owns everything the agent knows about a visitor's
//! progress through a booking form. It never reads the clock or performs I/O:
//! every operation takes the current [`Instant`] where timing matters and
//! returns the [`Emission`] to send, if any. The driver in
//! [`agent`](crate::agent) arms timers from [`TrackingSession::next_deadline`].
//!
//! # Lifecycle
//!
//! ```text
//! idle --focus--> tracking --(inactivity | hidden past grace | unload)--> abandoned
//!   \                  \--submit--> completed
//!    \--submit--> completed
//! ```
//!
//! Once a terminal event has been emitted the session is latched: every later
//! operation is a no-op.

use chrono::Utc;
use tokio::time::{Duration, Instant};

use crate::fields::{capture_key, is_safe_field};
use crate::types::{EventKind, FieldDescriptor, FormData, TrackEvent};

/// Default inactivity timeout before an abandonment fires.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time a page must stay hidden before an abandonment fires.
pub const DEFAULT_VISIBILITY_GRACE: Duration = Duration::from_secs(2);

/// How an emission must be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Fire-and-forget request; the caller does not wait.
    Fetch,
    /// Unload path: must be handed off before the page is torn down.
    Beacon,
}

/// A terminal event ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emission {
    pub event: TrackEvent,
    pub delivery: Delivery,
}

/// Timing parameters for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    pub inactivity_timeout: Duration,
    pub visibility_grace: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            visibility_grace: DEFAULT_VISIBILITY_GRACE,
        }
    }
}

/// Page metadata copied into every emitted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContext {
    pub url: String,
    pub user_agent: Option<String>,
}

/// State of one tracking session.
#[derive(Debug, Clone)]
pub struct TrackingSession {
    session_id: String,
    tracking_id: String,
    page: PageContext,
    timings: SessionTimings,
    form_data: FormData,
    is_tracking: bool,
    terminated: bool,
    inactivity_deadline: Option<Instant>,
    visibility_recheck_at: Option<Instant>,
}

impl TrackingSession {
    pub fn new(
        session_id: impl Into<String>,
        tracking_id: impl Into<String>,
        page: PageContext,
        timings: SessionTimings,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            tracking_id: tracking_id.into(),
            page,
            timings,
            form_data: FormData::new(),
            is_tracking: false,
            terminated: false,
            inactivity_deadline: None,
            visibility_recheck_at: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn tracking_id(&self) -> &str {
        &self.tracking_id
    }

    pub fn form_data(&self) -> &FormData {
        &self.form_data
    }

    /// `true` once the visitor has focused a field in a tracked form and no
    /// terminal event has fired.
    pub fn is_tracking(&self) -> bool {
        self.is_tracking
    }

    /// `true` once a terminal event has been emitted.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Earliest pending timer: the inactivity deadline or the visibility
    /// re-check, whichever comes first.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.inactivity_deadline, self.visibility_recheck_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// `true` if a visibility re-check is pending and due at `now`.
    pub fn visibility_recheck_due(&self, now: Instant) -> bool {
        self.visibility_recheck_at.is_some_and(|at| at <= now)
    }

    fn reset_inactivity_timer(&mut self, now: Instant) {
        self.inactivity_deadline = Some(now + self.timings.inactivity_timeout);
    }

    /// A field in a tracked form received focus. Starts tracking and resets
    /// the inactivity timer.
    pub fn focus(&mut self, now: Instant) -> Option<Emission> {
        if self.terminated {
            return None;
        }
        self.is_tracking = true;
        self.reset_inactivity_timer(now);
        None
    }

    /// A field in a tracked form changed value. Safe fields are captured;
    /// every change resets the inactivity timer.
    pub fn input(&mut self, field: &FieldDescriptor, value: &str, now: Instant) -> Option<Emission> {
        if self.terminated {
            return None;
        }
        if is_safe_field(field) {
            if let Some(key) = capture_key(field) {
                self.form_data.insert(key.to_string(), value.to_string());
            }
        }
        self.reset_inactivity_timer(now);
        None
    }

    /// A tracked form was submitted.
    pub fn submit(&mut self) -> Option<Emission> {
        if self.terminated {
            return None;
        }
        Some(self.terminate(EventKind::Completion, Delivery::Fetch))
    }

    /// The page became hidden. While tracking, schedules a re-check after
    /// the visibility grace period.
    pub fn visibility_hidden(&mut self, now: Instant) -> Option<Emission> {
        if self.terminated || !self.is_tracking {
            return None;
        }
        self.visibility_recheck_at = Some(now + self.timings.visibility_grace);
        None
    }

    /// Runs the pending visibility re-check. Fires an abandonment if the page
    /// is still hidden.
    pub fn visibility_check(&mut self, still_hidden: bool) -> Option<Emission> {
        self.visibility_recheck_at.take()?;
        if !still_hidden || self.terminated || !self.is_tracking {
            return None;
        }
        Some(self.terminate(EventKind::Abandonment, Delivery::Fetch))
    }

    /// The page is unloading. Fires an abandonment, as a beacon, if tracking.
    pub fn unload(&mut self) -> Option<Emission> {
        if self.terminated || !self.is_tracking {
            return None;
        }
        Some(self.terminate(EventKind::Abandonment, Delivery::Beacon))
    }

    /// Fires the inactivity timer if it is due at `now`.
    pub fn poll(&mut self, now: Instant) -> Option<Emission> {
        match self.inactivity_deadline {
            Some(deadline) if deadline <= now => {
                self.inactivity_deadline = None;
            }
            _ => return None,
        }
        if self.terminated || !self.is_tracking {
            return None;
        }
        Some(self.terminate(EventKind::Abandonment, Delivery::Fetch))
    }

    fn terminate(&mut self, kind: EventKind, delivery: Delivery) -> Emission {
        self.terminated = true;
        self.is_tracking = false;
        self.inactivity_deadline = None;
        self.visibility_recheck_at = None;

        Emission {
            event: TrackEvent {
                tracking_id: self.tracking_id.clone(),
                session_id: self.session_id.clone(),
                event: kind,
                form_data: self.form_data.clone(),
                url: self.page.url.clone(),
                timestamp: Utc::now(),
                user_agent: self.page.user_agent.clone(),
            },
            delivery,
        }
    }
}
