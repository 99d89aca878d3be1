//! Event delivery to the ingestion endpoint.
//!
//! Delivery is best-effort: failures are logged and swallowed, never retried,
//! and never surfaced to the page.
//!
//! | Delivery | Behaviour |
//! |----------|-----------|
//! | [`Delivery::Fetch`] | Spawned; the caller continues immediately |
//! | [`Delivery::Beacon`] | Awaited with a short deadline so it is handed off before teardown |
//!
//! [`EventSink`] is the seam between the state machine and the network.
//! [`HttpEmitter`] posts JSON to `<origin>/api/track`; [`LogSink`] only logs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::{Delivery, Emission};
use crate::types::TrackEvent;

/// Path of the ingestion endpoint relative to the server origin.
pub const TRACK_PATH: &str = "/api/track";

/// Default timeout for a fire-and-forget request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an unload beacon may block teardown.
pub const DEFAULT_BEACON_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from a single delivery attempt.
#[derive(Error, Debug)]
pub enum EmitError {
    /// Transport-level failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a non-success status.
    #[error("event rejected with status {status}")]
    Rejected { status: u16 },

    /// The beacon did not complete before its deadline.
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

/// Destination for terminal events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: &TrackEvent) -> Result<(), EmitError>;
}

/// Posts events as JSON to the ingestion endpoint.
#[derive(Debug, Clone)]
pub struct HttpEmitter {
    client: Client,
    endpoint: String,
}

impl HttpEmitter {
    /// Creates an emitter posting to `<origin>/api/track`.
    pub fn new(origin: &str, timeout: Duration) -> Result<Self, EmitError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}{TRACK_PATH}", origin.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl EventSink for HttpEmitter {
    async fn send(&self, event: &TrackEvent) -> Result<(), EmitError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .json(event)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        // The body may echo submitted values.
        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), body = %body, "Track endpoint error body");
        Err(EmitError::Rejected {
            status: status.as_u16(),
        })
    }
}

/// Sink that logs events instead of sending them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn send(&self, event: &TrackEvent) -> Result<(), EmitError> {
        info!(
            event = %event.event,
            session_id = %event.session_id,
            fields = event.form_data.len(),
            "Event not sent (dry run)"
        );
        debug!(keys = ?event.form_data.keys().collect::<Vec<_>>(), "Captured field names");
        Ok(())
    }
}

/// Counts of delivery outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Dispatches emissions according to their [`Delivery`] mode.
pub struct Emitter {
    sink: Arc<dyn EventSink>,
    beacon_timeout: Duration,
    in_flight: Vec<JoinHandle<bool>>,
    report: DeliveryReport,
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("beacon_timeout", &self.beacon_timeout)
            .field("in_flight", &self.in_flight.len())
            .field("report", &self.report)
            .finish_non_exhaustive()
    }
}

impl Emitter {
    pub fn new(sink: Arc<dyn EventSink>, beacon_timeout: Duration) -> Self {
        Self {
            sink,
            beacon_timeout,
            in_flight: Vec::new(),
            report: DeliveryReport::default(),
        }
    }

    /// Sends an emission. Fetches are spawned; beacons are awaited up to the
    /// beacon timeout.
    pub async fn emit(&mut self, emission: Emission) {
        info!(
            event = %emission.event.event,
            delivery = ?emission.delivery,
            fields = emission.event.form_data.len(),
            "Emitting booking event"
        );

        match emission.delivery {
            Delivery::Fetch => {
                let sink = Arc::clone(&self.sink);
                let event = emission.event;
                self.in_flight
                    .push(tokio::spawn(async move { deliver(sink.as_ref(), &event).await }));
            }
            Delivery::Beacon => {
                let outcome =
                    tokio::time::timeout(self.beacon_timeout, self.sink.send(&emission.event))
                        .await
                        .unwrap_or(Err(EmitError::Timeout(self.beacon_timeout)));
                self.record(log_outcome(outcome));
            }
        }
    }

    fn record(&mut self, delivered: bool) {
        if delivered {
            self.report.delivered += 1;
        } else {
            self.report.failed += 1;
        }
    }

    /// Waits for spawned fetches and returns the final report.
    pub async fn finish(mut self) -> DeliveryReport {
        for handle in std::mem::take(&mut self.in_flight) {
            let delivered = match handle.await {
                Ok(delivered) => delivered,
                Err(err) => {
                    warn!(error = %err, "Delivery task failed");
                    false
                }
            };
            self.record(delivered);
        }
        self.report
    }
}

async fn deliver(sink: &dyn EventSink, event: &TrackEvent) -> bool {
    log_outcome(sink.send(event).await)
}

fn log_outcome(outcome: Result<(), EmitError>) -> bool {
    match outcome {
        Ok(()) => {
            debug!("Event delivered");
            true
        }
        Err(err) => {
            warn!(error = %err, "Event delivery failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventKind, FormData};
    use chrono::Utc;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event(kind: EventKind) -> TrackEvent {
        let mut form_data = FormData::new();
        form_data.insert("email".to_string(), "ana@example.com".to_string());
        TrackEvent {
            tracking_id: "track_abc".to_string(),
            session_id: "session_1_x".to_string(),
            event: kind,
            form_data,
            url: "https://salon.test/book".to_string(),
            timestamp: Utc::now(),
            user_agent: None,
        }
    }

    #[test]
    fn endpoint_joins_origin_and_path() {
        let emitter = HttpEmitter::new("https://api.test/", DEFAULT_REQUEST_TIMEOUT).unwrap();
        assert_eq!(emitter.endpoint(), "https://api.test/api/track");
    }

    #[tokio::test]
    async fn http_emitter_posts_camel_case_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/track"))
            .and(header("content-type", "application/json"))
            .and(body_partial_json(json!({
                "trackingId": "track_abc",
                "event": "abandonment",
                "formData": { "email": "ana@example.com" }
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let emitter = HttpEmitter::new(&server.uri(), DEFAULT_REQUEST_TIMEOUT).unwrap();
        emitter.send(&event(EventKind::Abandonment)).await.unwrap();
    }

    #[tokio::test]
    async fn http_emitter_reports_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let emitter = HttpEmitter::new(&server.uri(), DEFAULT_REQUEST_TIMEOUT).unwrap();
        let err = emitter
            .send(&event(EventKind::Completion))
            .await
            .unwrap_err();
        assert!(matches!(err, EmitError::Rejected { status: 400 }));
    }

    #[tokio::test]
    async fn emitter_swallows_failures_and_counts_them() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sink = Arc::new(HttpEmitter::new(&server.uri(), DEFAULT_REQUEST_TIMEOUT).unwrap());
        let mut emitter = Emitter::new(sink, DEFAULT_BEACON_TIMEOUT);
        emitter
            .emit(Emission {
                event: event(EventKind::Abandonment),
                delivery: Delivery::Fetch,
            })
            .await;
        emitter
            .emit(Emission {
                event: event(EventKind::Abandonment),
                delivery: Delivery::Beacon,
            })
            .await;

        let report = emitter.finish().await;
        assert_eq!(report, DeliveryReport { delivered: 0, failed: 2 });
    }

    #[tokio::test]
    async fn log_sink_always_succeeds() {
        let mut emitter = Emitter::new(Arc::new(LogSink), DEFAULT_BEACON_TIMEOUT);
        emitter
            .emit(Emission {
                event: event(EventKind::Completion),
                delivery: Delivery::Fetch,
            })
            .await;
        assert_eq!(emitter.finish().await.delivered, 1);
    }
}
