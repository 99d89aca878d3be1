//! The tracking agent driver.
//!
//! [`Agent`] glues the pieces together for one page:
//!
//! 1. resolve the tracking id and generate a session id,
//! 2. classify the page's forms and keep the booking ones,
//! 3. feed [`PageEvent`]s from a channel into the [`TrackingSession`],
//!    arming a timer for its next deadline,
//! 4. hand every emission to the [`Emitter`].
//!
//! The loop ends on [`PageEvent::Unload`], after a terminal event, or once
//! the channel is closed and no timer is pending.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::classify::FormClassifier;
use crate::config::AgentConfig;
use crate::emitter::{DeliveryReport, Emitter, EventSink, HttpEmitter};
use crate::error::AgentError;
use crate::resolve::{endpoint_origin, resolve_tracking_id, TrackingIdSource};
use crate::session::{Emission, PageContext, TrackingSession};
use crate::types::{generate_session_id, EventKind, FieldDescriptor, PageDescriptor, PageEvent};

/// What happened during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSummary {
    pub tracking_id: String,
    pub session_id: String,
    /// Number of forms classified as booking forms.
    pub tracked_forms: usize,
    /// The terminal event, if one fired.
    pub emitted: Option<EventKind>,
    pub delivery: DeliveryReport,
}

/// Whether the event loop should keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Abandonment tracker for one page.
#[derive(Debug)]
pub struct Agent {
    session: TrackingSession,
    tracked_forms: BTreeSet<usize>,
    emitter: Emitter,
    hidden: bool,
    emitted: Option<EventKind>,
}

impl Agent {
    /// Sets up tracking for `page`, sending events to `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::NoTrackingId`] if no tracking id can be resolved.
    pub fn new(
        page: &PageDescriptor,
        config: &AgentConfig,
        classifier: &dyn FormClassifier,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, AgentError> {
        let resolved = resolve_tracking_id(
            page.script_src.as_deref(),
            &page.url,
            config.fallback_tracking_id.as_deref(),
        )
        .ok_or(AgentError::NoTrackingId)?;

        if resolved.source == TrackingIdSource::Fallback {
            info!(tracking_id = %resolved.tracking_id, "Using fallback tracking id");
        }

        let tracked_forms: BTreeSet<usize> = page
            .forms
            .iter()
            .enumerate()
            .filter(|(_, form)| classifier.classify(&form.text))
            .map(|(index, _)| index)
            .collect();

        let session = TrackingSession::new(
            generate_session_id(),
            resolved.tracking_id,
            PageContext {
                url: page.url.clone(),
                user_agent: page.user_agent.clone(),
            },
            config.timings,
        );

        info!(
            session_id = %session.session_id(),
            forms = page.forms.len(),
            tracked_forms = tracked_forms.len(),
            "Tracking agent initialized"
        );

        Ok(Self {
            session,
            tracked_forms,
            emitter: Emitter::new(sink, config.beacon_timeout),
            hidden: false,
            emitted: None,
        })
    }

    /// Like [`Agent::new`], posting to the configured endpoint or, if none
    /// is configured, to the origin the script was served from.
    pub fn with_http(
        page: &PageDescriptor,
        config: &AgentConfig,
        classifier: &dyn FormClassifier,
    ) -> Result<Self, AgentError> {
        let origin = config
            .endpoint
            .clone()
            .or_else(|| endpoint_origin(page.script_src.as_deref(), &page.url))
            .ok_or_else(|| AgentError::NoEndpoint(page.url.clone()))?;
        let sink = HttpEmitter::new(&origin, config.request_timeout)?;
        debug!(endpoint = %sink.endpoint(), "Event endpoint resolved");
        Self::new(page, config, classifier, Arc::new(sink))
    }

    pub fn session(&self) -> &TrackingSession {
        &self.session
    }

    /// Indices of the forms being tracked.
    pub fn tracked_forms(&self) -> &BTreeSet<usize> {
        &self.tracked_forms
    }

    fn accepts(&self, form: usize, field: &FieldDescriptor) -> bool {
        self.tracked_forms.contains(&form) && field.tag.is_input_capable()
    }

    async fn emit(&mut self, emission: Option<Emission>) {
        if let Some(emission) = emission {
            self.emitted = Some(emission.event.event);
            self.emitter.emit(emission).await;
        }
    }

    /// Applies one page event at `now`.
    async fn handle(&mut self, event: PageEvent, now: Instant) -> Flow {
        let emission = match event {
            PageEvent::Focus { form, field } if self.accepts(form, &field) => {
                self.session.focus(now)
            }
            PageEvent::Input { form, field, value } if self.accepts(form, &field) => {
                self.session.input(&field, &value, now)
            }
            PageEvent::Submit { form } if self.tracked_forms.contains(&form) => {
                self.session.submit()
            }
            PageEvent::Hidden => {
                self.hidden = true;
                self.session.visibility_hidden(now)
            }
            PageEvent::Visible => {
                self.hidden = false;
                None
            }
            PageEvent::Unload => {
                let emission = self.session.unload();
                self.emit(emission).await;
                return Flow::Stop;
            }
            _ => None,
        };
        self.emit(emission).await;
        Flow::Continue
    }

    /// Fires whichever timers are due at `now`.
    async fn tick(&mut self, now: Instant) {
        if self.session.visibility_recheck_due(now) {
            let emission = self.session.visibility_check(self.hidden);
            self.emit(emission).await;
        }
        let emission = self.session.poll(now);
        self.emit(emission).await;
    }

    /// Runs until unload, a terminal event, or the channel closing with no
    /// timer left, then waits for in-flight deliveries.
    pub async fn run(mut self, mut events: mpsc::Receiver<PageEvent>) -> AgentSummary {
        if self.tracked_forms.is_empty() {
            debug!("No booking forms on page, agent idle");
        } else {
            self.event_loop(&mut events).await;
        }

        AgentSummary {
            tracking_id: self.session.tracking_id().to_string(),
            session_id: self.session.session_id().to_string(),
            tracked_forms: self.tracked_forms.len(),
            emitted: self.emitted,
            delivery: self.emitter.finish().await,
        }
    }

    async fn event_loop(&mut self, events: &mut mpsc::Receiver<PageEvent>) {
        let mut open = true;

        while !self.session.is_terminated() {
            let deadline = self.session.next_deadline();
            if !open && deadline.is_none() {
                break;
            }

            tokio::select! {
                received = events.recv(), if open => match received {
                    Some(event) => {
                        if self.handle(event, Instant::now()).await == Flow::Stop {
                            break;
                        }
                    }
                    None => open = false,
                },
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.tick(Instant::now()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::classify::KeywordClassifier;
    use crate::emitter::EmitError;
    use crate::types::{FieldTag, FormDescriptor, TrackEvent};

    #[derive(Clone, Default)]
    struct RecordingSink {
        events: Arc<Mutex<Vec<TrackEvent>>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<TrackEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn send(&self, event: &TrackEvent) -> Result<(), EmitError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn page() -> PageDescriptor {
        PageDescriptor {
            url: "https://salon.test/book".to_string(),
            script_src: Some("/tracking.js?id=track_abc".to_string()),
            user_agent: Some("Mozilla/5.0".to_string()),
            forms: vec![
                FormDescriptor {
                    text: "Book your appointment".to_string(),
                },
                FormDescriptor {
                    text: "Subscribe to our newsletter".to_string(),
                },
            ],
        }
    }

    fn email() -> FieldDescriptor {
        FieldDescriptor::input("email", "email", "")
    }

    fn spawn_agent(
        page: PageDescriptor,
    ) -> (
        mpsc::Sender<PageEvent>,
        tokio::task::JoinHandle<AgentSummary>,
        RecordingSink,
    ) {
        let sink = RecordingSink::default();
        let agent = Agent::new(
            &page,
            &AgentConfig::default(),
            &KeywordClassifier::default(),
            Arc::new(sink.clone()),
        )
        .unwrap();
        let (tx, rx) = mpsc::channel(16);
        (tx, tokio::spawn(agent.run(rx)), sink)
    }

    #[test]
    fn only_booking_forms_are_tracked() {
        let agent = Agent::new(
            &page(),
            &AgentConfig::default(),
            &KeywordClassifier::default(),
            Arc::new(RecordingSink::default()),
        )
        .unwrap();
        assert_eq!(agent.tracked_forms().iter().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(agent.session().tracking_id(), "track_abc");
    }

    #[test]
    fn missing_tracking_id_without_fallback_fails() {
        let config = AgentConfig {
            fallback_tracking_id: None,
            ..AgentConfig::default()
        };
        let page = PageDescriptor {
            script_src: Some("/tracking.js".to_string()),
            ..page()
        };
        let result = Agent::new(
            &page,
            &config,
            &KeywordClassifier::default(),
            Arc::new(RecordingSink::default()),
        );
        assert!(matches!(result, Err(AgentError::NoTrackingId)));
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_emits_abandonment() {
        let (tx, handle, sink) = spawn_agent(page());
        let start = Instant::now();

        tx.send(PageEvent::Focus { form: 0, field: email() }).await.unwrap();
        tx.send(PageEvent::Input {
            form: 0,
            field: email(),
            value: "ana@example.com".to_string(),
        })
        .await
        .unwrap();

        let summary = handle.await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(summary.emitted, Some(EventKind::Abandonment));
        assert_eq!(summary.delivery.delivered, 1);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tracking_id, "track_abc");
        assert_eq!(events[0].form_data["email"], "ana@example.com");
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn brief_tab_switch_then_submit_is_single_completion() {
        let (tx, handle, sink) = spawn_agent(page());

        tx.send(PageEvent::Focus { form: 0, field: email() }).await.unwrap();
        tx.send(PageEvent::Hidden).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(PageEvent::Visible).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send(PageEvent::Submit { form: 0 }).await.unwrap();

        let summary = handle.await.unwrap();
        assert_eq!(summary.emitted, Some(EventKind::Completion));

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, EventKind::Completion);
    }

    #[tokio::test(start_paused = true)]
    async fn staying_hidden_abandons_after_grace() {
        let (tx, handle, sink) = spawn_agent(page());
        let start = Instant::now();

        tx.send(PageEvent::Focus { form: 0, field: email() }).await.unwrap();
        tx.send(PageEvent::Hidden).await.unwrap();
        drop(tx);

        let summary = handle.await.unwrap();
        assert_eq!(summary.emitted, Some(EventKind::Abandonment));
        assert!(start.elapsed() < Duration::from_secs(30));
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn untracked_form_and_buttons_are_ignored() {
        let (tx, handle, sink) = spawn_agent(page());

        tx.send(PageEvent::Focus { form: 1, field: email() }).await.unwrap();
        tx.send(PageEvent::Focus {
            form: 0,
            field: FieldDescriptor {
                tag: FieldTag::Button,
                ..FieldDescriptor::default()
            },
        })
        .await
        .unwrap();
        tx.send(PageEvent::Submit { form: 1 }).await.unwrap();
        tx.send(PageEvent::Unload).await.unwrap();

        let summary = handle.await.unwrap();
        assert_eq!(summary.emitted, None);
        assert!(sink.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unload_while_tracking_sends_abandonment() {
        let (tx, handle, sink) = spawn_agent(page());

        tx.send(PageEvent::Focus { form: 0, field: email() }).await.unwrap();
        tx.send(PageEvent::Unload).await.unwrap();

        let summary = handle.await.unwrap();
        assert_eq!(summary.emitted, Some(EventKind::Abandonment));
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn page_without_booking_forms_is_idle() {
        let page = PageDescriptor {
            forms: vec![FormDescriptor {
                text: "Contact us".to_string(),
            }],
            ..page()
        };
        let (tx, handle, sink) = spawn_agent(page);
        let _ = tx.send(PageEvent::Unload).await;

        let summary = handle.await.unwrap();
        assert_eq!(summary.tracked_forms, 0);
        assert!(sink.events().is_empty());
    }
}
