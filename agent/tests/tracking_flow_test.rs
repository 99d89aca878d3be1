//! End-to-end tests: scripted page sessions posted to a mock ingestion
//! endpoint.
//!
//! The endpoint is a wiremock server; the agent finds it through the script
//! URL, the way an embedded snippet does.

use serde_json::Value;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use booking_agent::classify::KeywordClassifier;
use booking_agent::config::AgentConfig;
use booking_agent::replay::{replay, ReplayScript};
use booking_agent::{Agent, EventKind};

// ============================================================================
// Test Helpers
// ============================================================================

async fn mock_endpoint(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/track"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

/// Builds a script whose agent is served from `server`.
fn script(server: &MockServer, events: &[&str]) -> ReplayScript {
    let page = format!(
        r#"{{"url":"https://salon.test/book","script_src":"{}/tracking.js?id=track_abc","user_agent":"Mozilla/5.0","forms":[{{"text":"Book your appointment"}}]}}"#,
        server.uri()
    );
    let text = std::iter::once(page.as_str())
        .chain(events.iter().copied())
        .collect::<Vec<_>>()
        .join("\n");
    ReplayScript::parse(&text).unwrap()
}

fn fast_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.timings.inactivity_timeout = std::time::Duration::from_millis(300);
    config.timings.visibility_grace = std::time::Duration::from_millis(100);
    config
}

async fn posted_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect()
}

// ============================================================================
// Test Cases
// ============================================================================

#[tokio::test]
async fn password_like_field_never_leaves_the_page() {
    let server = mock_endpoint(200).await;
    let script = script(
        &server,
        &[
            r#"{"at_ms":0,"kind":"focus","form":0,"field":{"type":"text","name":"name","id":"pwd1"}}"#,
            r#"{"at_ms":10,"kind":"input","form":0,"field":{"type":"text","name":"name","id":"pwd1"},"value":"password123"}"#,
            r#"{"at_ms":20,"kind":"input","form":0,"field":{"type":"email","name":"email"},"value":"x@y.com"}"#,
            r#"{"at_ms":30,"kind":"unload"}"#,
        ],
    );

    let agent = Agent::with_http(&script.page, &fast_config(), &KeywordClassifier::default())
        .unwrap();
    let summary = replay(agent, script.events).await;
    assert_eq!(summary.emitted, Some(EventKind::Abandonment));
    assert_eq!(summary.delivery.delivered, 1);

    let bodies = posted_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    let body = &bodies[0];
    assert_eq!(body["trackingId"], "track_abc");
    assert_eq!(body["event"], "abandonment");
    assert_eq!(body["userAgent"], "Mozilla/5.0");
    assert_eq!(body["formData"]["email"], "x@y.com");
    assert!(body["formData"].get("name").is_none());
    assert!(!body.to_string().contains("password123"));
}

#[tokio::test]
async fn inactivity_posts_one_abandonment() {
    let server = mock_endpoint(200).await;
    let script = script(
        &server,
        &[
            r#"{"at_ms":0,"kind":"focus","form":0,"field":{"type":"text","name":"name"}}"#,
            r#"{"at_ms":10,"kind":"input","form":0,"field":{"type":"text","name":"name"},"value":"Ana"}"#,
        ],
    );

    let agent = Agent::with_http(&script.page, &fast_config(), &KeywordClassifier::default())
        .unwrap();
    let summary = replay(agent, script.events).await;
    assert_eq!(summary.emitted, Some(EventKind::Abandonment));

    let bodies = posted_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["formData"]["name"], "Ana");
    assert!(bodies[0]["sessionId"]
        .as_str()
        .unwrap()
        .starts_with("session_"));
}

#[tokio::test]
async fn submit_posts_completion_only() {
    let server = mock_endpoint(200).await;
    let script = script(
        &server,
        &[
            r#"{"at_ms":0,"kind":"focus","form":0,"field":{"type":"email","name":"email"}}"#,
            r#"{"at_ms":10,"kind":"input","form":0,"field":{"type":"email","name":"email"},"value":"ana@example.com"}"#,
            r#"{"at_ms":20,"kind":"submit","form":0}"#,
            r#"{"at_ms":30,"kind":"unload"}"#,
        ],
    );

    let agent = Agent::with_http(&script.page, &fast_config(), &KeywordClassifier::default())
        .unwrap();
    let summary = replay(agent, script.events).await;
    assert_eq!(summary.emitted, Some(EventKind::Completion));

    let bodies = posted_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["event"], "completion");
}

#[tokio::test]
async fn rejected_event_is_counted_not_raised() {
    let server = mock_endpoint(400).await;
    let script = script(
        &server,
        &[
            r#"{"at_ms":0,"kind":"focus","form":0,"field":{"type":"email","name":"email"}}"#,
            r#"{"at_ms":10,"kind":"unload"}"#,
        ],
    );

    let agent = Agent::with_http(&script.page, &fast_config(), &KeywordClassifier::default())
        .unwrap();
    let summary = replay(agent, script.events).await;
    assert_eq!(summary.delivery.delivered, 0);
    assert_eq!(summary.delivery.failed, 1);
}

#[tokio::test]
async fn untouched_form_sends_nothing() {
    let server = mock_endpoint(200).await;
    let script = script(&server, &[r#"{"at_ms":50,"kind":"unload"}"#]);

    let agent = Agent::with_http(&script.page, &fast_config(), &KeywordClassifier::default())
        .unwrap();
    let summary = replay(agent, script.events).await;
    assert_eq!(summary.emitted, None);
    assert!(posted_bodies(&server).await.is_empty());
}
