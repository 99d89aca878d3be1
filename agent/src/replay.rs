//! Scripted page sessions.
//!
//! A replay script is a JSON-lines file. The first non-empty line describes
//! the page; every later line is a page event with its offset in
//! milliseconds from the start of the session:
//!
//! ```text
//! {"url":"https://salon.test/book","script_src":"/tracking.js?id=track_abc","forms":[{"text":"Book now"}]}
//! {"at_ms":0,"kind":"focus","form":0,"field":{"type":"email","name":"email"}}
//! {"at_ms":1200,"kind":"input","form":0,"field":{"type":"email","name":"email"},"value":"ana@example.com"}
//! {"at_ms":5000,"kind":"unload"}
//! ```
//!
//! Lines starting with `#` are comments.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::agent::{Agent, AgentSummary};
use crate::error::AgentError;
use crate::types::{PageDescriptor, PageEvent};

/// Buffer between the script feeder and the agent.
const CHANNEL_CAPACITY: usize = 64;

/// A page event at an offset from session start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedEvent {
    pub at: Duration,
    pub event: PageEvent,
}

#[derive(Deserialize)]
struct EventLine {
    at_ms: u64,
    #[serde(flatten)]
    event: PageEvent,
}

/// A parsed replay script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayScript {
    pub page: PageDescriptor,
    pub events: Vec<TimedEvent>,
}

impl ReplayScript {
    /// Parses a script from its text.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Replay`] for a missing page line, a malformed
    /// line, or events whose offsets go backwards.
    pub fn parse(input: &str) -> Result<Self, AgentError> {
        let mut lines = input
            .lines()
            .enumerate()
            .map(|(index, line)| (index + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

        let (page_line, page_text) = lines.next().ok_or_else(|| AgentError::Replay {
            line: 0,
            message: "script is empty".to_string(),
        })?;
        let page: PageDescriptor =
            serde_json::from_str(page_text).map_err(|e| replay_error(page_line, &e))?;

        let mut events = Vec::new();
        let mut last = Duration::ZERO;
        for (line, text) in lines {
            let parsed: EventLine =
                serde_json::from_str(text).map_err(|e| replay_error(line, &e))?;
            let at = Duration::from_millis(parsed.at_ms);
            if at < last {
                return Err(AgentError::Replay {
                    line,
                    message: format!("at_ms {} is earlier than the previous event", parsed.at_ms),
                });
            }
            last = at;
            events.push(TimedEvent {
                at,
                event: parsed.event,
            });
        }

        Ok(Self { page, events })
    }

    /// Reads and parses a script file.
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Total scripted duration.
    pub fn duration(&self) -> Duration {
        self.events.last().map_or(Duration::ZERO, |e| e.at)
    }
}

fn replay_error(line: usize, err: &serde_json::Error) -> AgentError {
    AgentError::Replay {
        line,
        message: err.to_string(),
    }
}

/// Feeds `events` to `agent` in real time and waits for it to finish.
pub async fn replay(agent: Agent, events: Vec<TimedEvent>) -> AgentSummary {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    let feeder = async move {
        let start = Instant::now();
        for timed in events {
            tokio::select! {
                () = sleep_until(start + timed.at) => {}
                // Agent finished early.
                () = tx.closed() => break,
            }
            debug!(at_ms = timed.at.as_millis() as u64, "Replaying page event");
            if tx.send(timed.event).await.is_err() {
                break;
            }
        }
    };

    let (summary, ()) = tokio::join!(agent.run(rx), feeder);
    summary
}
