//! Booking Recovery agent CLI.
//!
//! Replays scripted page sessions through the tracking agent, posting the
//! resulting event to a live server. Used to smoke-test deployments.
//!
//! # Commands
//!
//! - `booking-agent replay <file>`: run a script against the endpoint
//! - `booking-agent inspect <file>`: show what the agent would track, send nothing
//!
//! # Environment Variables
//!
//! See the [`booking_agent::config`] module for available configuration options.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use booking_agent::classify::{FormClassifier, KeywordClassifier};
use booking_agent::config::AgentConfig;
use booking_agent::emitter::LogSink;
use booking_agent::fields::{capture_key, is_safe_field};
use booking_agent::replay::{replay, ReplayScript};
use booking_agent::resolve::{endpoint_origin, resolve_tracking_id};
use booking_agent::types::PageEvent;
use booking_agent::Agent;

/// Booking Recovery tracking agent.
///
/// Drives the abandonment state machine from a JSON-lines page script.
#[derive(Parser, Debug)]
#[command(name = "booking-agent")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    BOOKING_AGENT_ENDPOINT             Server origin (default: http://localhost:8080)
    BOOKING_AGENT_INACTIVITY_SECS      Inactivity timeout (default: 30)
    BOOKING_AGENT_VISIBILITY_GRACE_MS  Hidden-page grace period (default: 2000)
    BOOKING_AGENT_FALLBACK_ID          Fallback tracking id (default: track_demo123)
    BOOKING_AGENT_REQUEST_TIMEOUT_SECS Request timeout (default: 10)

EXAMPLES:
    # Replay a session against a local server
    booking-agent replay session.jsonl

    # Replay against staging with a short timeout
    BOOKING_AGENT_INACTIVITY_SECS=5 booking-agent replay session.jsonl \\
        --endpoint https://staging.bookingrecovery.com

    # See which forms and fields would be tracked
    booking-agent inspect session.jsonl
")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a page script through the agent.
    Replay {
        /// JSON-lines script: page descriptor, then timed page events.
        file: PathBuf,

        /// Server origin, overriding BOOKING_AGENT_ENDPOINT.
        #[arg(short, long)]
        endpoint: Option<String>,

        /// Log the event instead of sending it.
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the tracked forms and captured field names for a script.
    Inspect {
        /// JSON-lines script.
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = AgentConfig::from_env().context("Failed to load configuration")?;

    match cli.command {
        Command::Replay {
            file,
            endpoint,
            dry_run,
        } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to create tokio runtime")?;
            runtime.block_on(run_replay(config, file, endpoint, dry_run))
        }
        Command::Inspect { file } => run_inspect(&config, &file),
    }
}

async fn run_replay(
    mut config: AgentConfig,
    file: PathBuf,
    endpoint: Option<String>,
    dry_run: bool,
) -> Result<()> {
    let script = ReplayScript::load(&file)
        .with_context(|| format!("Failed to load script {}", file.display()))?;

    if let Some(endpoint) = endpoint {
        config.endpoint = Some(endpoint);
    }

    let classifier = KeywordClassifier::default();
    let agent = if dry_run {
        Agent::new(&script.page, &config, &classifier, Arc::new(LogSink))?
    } else {
        Agent::with_http(&script.page, &config, &classifier)?
    };

    info!(
        file = %file.display(),
        events = script.events.len(),
        duration_ms = script.duration().as_millis() as u64,
        "Replaying script"
    );

    let summary = replay(agent, script.events).await;

    println!("tracking id:   {}", summary.tracking_id);
    println!("session id:    {}", summary.session_id);
    println!("tracked forms: {}", summary.tracked_forms);
    match summary.emitted {
        Some(kind) => println!("emitted:       {kind}"),
        None => println!("emitted:       nothing"),
    }
    println!(
        "delivery:      {} delivered, {} failed",
        summary.delivery.delivered, summary.delivery.failed
    );

    Ok(())
}

fn run_inspect(config: &AgentConfig, file: &Path) -> Result<()> {
    let script = ReplayScript::load(file)
        .with_context(|| format!("Failed to load script {}", file.display()))?;
    let page = &script.page;

    match resolve_tracking_id(
        page.script_src.as_deref(),
        &page.url,
        config.fallback_tracking_id.as_deref(),
    ) {
        Some(resolved) => println!(
            "tracking id: {} (from {:?})",
            resolved.tracking_id, resolved.source
        ),
        None => println!("tracking id: none, agent stays silent"),
    }

    let endpoint = config
        .endpoint
        .clone()
        .or_else(|| endpoint_origin(page.script_src.as_deref(), &page.url));
    println!("endpoint:    {}", endpoint.as_deref().unwrap_or("unknown"));

    let classifier = KeywordClassifier::default();
    for (index, form) in page.forms.iter().enumerate() {
        let tracked = classifier.classify(&form.text);
        println!("form {index}: {}", if tracked { "tracked" } else { "ignored" });
    }

    let mut seen = BTreeSet::new();
    for timed in &script.events {
        if let PageEvent::Input { field, .. } = &timed.event {
            let key = capture_key(field).unwrap_or("<no key>").to_string();
            if seen.insert(key.clone()) {
                let verdict = if is_safe_field(field) { "captured" } else { "dropped" };
                println!("field {key}: {verdict}");
            }
        }
    }

    Ok(())
}

/// Initializes compact logging to stderr.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .init();
}
