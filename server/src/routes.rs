//! HTTP route handlers for the recovery server.
//!
//! This module provides the HTTP API endpoints:
//!
//! | Route | Purpose | Auth |
//! |-------|---------|------|
//! | `POST /api/track` | Ingest abandonment/completion events | tracking id (+ optional origin check) |
//! | `OPTIONS /api/track` | CORS preflight | none |
//! | `GET /tracking.js` | Embeddable tracking snippet | none |
//! | `GET /health` | Health check | none |
//! | `POST/GET /api/websites` | Register and list tenants | admin token |
//! | `GET /api/websites/{trackingId}/stats` | Booking counts | admin token |
//! | `GET/PUT /api/campaigns` | Owner's recovery campaign | admin token |
//! | `PUT /api/bookings/{id}/status` | Manual status change | admin token |
//!
//! Management routes require `Authorization: Bearer <RECOVERY_ADMIN_TOKEN>`
//! and an `X-Owner-ID` header naming the owner acted for. When no admin
//! token is configured they answer `404`.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use recovery_server::config::Config;
//! use recovery_server::email::LogTransport;
//! use recovery_server::routes::{create_router, AppState};
//! use recovery_server::store::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() {
//!     let state = AppState::new(
//!         Config::default(),
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(LogTransport),
//!     );
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::{bearer_token, request_host, verify_admin_token};
use crate::config::Config;
use crate::email::EmailTransport;
use crate::error::ServerError;
use crate::ingest::IngestService;
use crate::rate_limit::RateLimiter;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::store::Store;
use crate::types::{BookingStatus, CampaignConfig, Tenant, TrackRequest, TrackingEventKind};

// ============================================================================
// Constants
// ============================================================================

/// Header naming the owner a management request acts for.
const HEADER_OWNER_ID: &str = "X-Owner-ID";

/// Header name for rate limit retry delay.
const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Maximum body size for tracking events (64 KB).
const MAX_TRACK_BODY_SIZE: usize = 64 * 1024;

/// Default stats window in days.
const DEFAULT_STATS_DAYS: i64 = 30;

/// Largest stats window accepted.
const MAX_STATS_DAYS: i64 = 365;

/// The embeddable tracking snippet.
const TRACKING_SNIPPET: &str = include_str!("../assets/tracking.js");

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Durable state.
    pub store: Arc<dyn Store>,

    /// Plans and dispatches recovery emails.
    pub scheduler: Scheduler,

    /// Tracking event pipeline.
    pub ingest: IngestService,

    /// Per-tracking-id rate limiter, shared with `ingest`.
    pub rate_limiter: RateLimiter,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state with the default rate limiter.
    #[must_use]
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        transport: Arc<dyn EmailTransport>,
    ) -> Self {
        Self::with_components(config, store, transport, RateLimiter::default())
    }

    /// Creates application state with a custom rate limiter.
    #[must_use]
    pub fn with_components(
        config: Config,
        store: Arc<dyn Store>,
        transport: Arc<dyn EmailTransport>,
        rate_limiter: RateLimiter,
    ) -> Self {
        let scheduler = Scheduler::new(
            store.clone(),
            transport,
            SchedulerConfig::from(&config),
        );
        let ingest = IngestService::new(
            store.clone(),
            scheduler.clone(),
            rate_limiter.clone(),
            config.enforce_origin,
        );

        Self {
            config: Arc::new(config),
            store,
            scheduler,
            ingest,
            rate_limiter,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("scheduler", &self.scheduler)
            .field("rate_limiter", &self.rate_limiter)
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    let track_cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    let track = Router::new()
        .route("/api/track", post(post_track).options(options_track))
        .layer(DefaultBodyLimit::max(MAX_TRACK_BODY_SIZE))
        .layer(track_cors);

    let management = Router::new()
        .route("/api/websites", post(post_website).get(get_websites))
        .route("/api/websites/{tracking_id}/stats", get(get_website_stats))
        .route("/api/campaigns", get(get_campaign).put(put_campaign))
        .route("/api/bookings/{id}/status", put(put_booking_status));

    Router::new()
        .merge(track)
        .merge(management)
        .route("/tracking.js", get(get_tracking_snippet))
        .route("/health", get(get_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Error Response Types
// ============================================================================

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidFormat(_)
            | Self::Validation(_)
            | Self::MissingFields
            | Self::UnknownTrackingId(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::OriginMismatch(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Store(_) | Self::Internal(_) => {
                error!(error = %self, "Request failed");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse::new("internal server error")),
                )
                    .into_response();
            }
        };

        let message = match &self {
            Self::MissingFields => "missing required fields".to_string(),
            Self::UnknownTrackingId(_) => "invalid tracking id".to_string(),
            Self::OriginMismatch(_) => "origin not allowed for this tracking id".to_string(),
            Self::RateLimit { .. } => "rate limit exceeded".to_string(),
            Self::InvalidFormat(msg)
            | Self::Validation(msg)
            | Self::Unauthorized(msg) => msg.clone(),
            Self::NotFound(what) => format!("{what} not found"),
            Self::Store(_) | Self::Internal(_) => String::new(),
        };

        let body = Json(ErrorResponse::new(message).with_code(self.code()));

        if let Self::RateLimit { retry_after, .. } = self {
            return (
                status,
                [(HEADER_RETRY_AFTER, retry_after.to_string())],
                body,
            )
                .into_response();
        }

        (status, body).into_response()
    }
}

/// Parses a JSON body, mapping failures to `400 invalid_format`.
fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ServerError> {
    serde_json::from_slice(body).map_err(|err| {
        debug!(error = %err, "Failed to parse request body");
        ServerError::invalid_format(format!("invalid request body: {err}"))
    })
}

// ============================================================================
// POST /api/track - Event Ingestion
// ============================================================================

/// Response body for an accepted tracking event.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackResponse {
    pub success: bool,
    pub booking_id: String,
    pub event: TrackingEventKind,
}

/// POST /api/track - Ingest an event from the tracking snippet.
///
/// # Responses
///
/// - `200 OK` - `{ success, bookingId, event }`
/// - `400 Bad Request` - malformed JSON, missing fields or unknown tracking id
/// - `403 Forbidden` - origin check enabled and the origin does not match
/// - `429 Too Many Requests` - rate limit exceeded (with `Retry-After`)
/// - `500 Internal Server Error` - store failure; nothing was persisted
async fn post_track(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    let request: TrackRequest = parse_json(&body)?;
    let host = request_host(&headers);

    let outcome = state
        .ingest
        .track(request, host.as_deref(), Utc::now())
        .await?;

    Ok((
        StatusCode::OK,
        Json(TrackResponse {
            success: true,
            booking_id: outcome.booking_id,
            event: outcome.event,
        }),
    )
        .into_response())
}

/// OPTIONS /api/track - CORS preflight for snippets on any origin.
async fn options_track() -> Response {
    (
        StatusCode::OK,
        [
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
        ],
    )
        .into_response()
}

// ============================================================================
// GET /tracking.js - Snippet
// ============================================================================

/// GET /tracking.js - Serves the embeddable tracking snippet.
async fn get_tracking_snippet() -> Response {
    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/javascript; charset=utf-8"),
            ),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static("public, max-age=3600"),
            ),
        ],
        TRACKING_SNIPPET,
    )
        .into_response()
}

// ============================================================================
// Management API
// ============================================================================

/// Checks the admin token and returns the owner id the request acts for.
fn authorize_owner(state: &AppState, headers: &HeaderMap) -> Result<String, ServerError> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Err(ServerError::not_found("route"));
    };

    match bearer_token(headers) {
        Some(presented) if verify_admin_token(expected, presented) => {}
        Some(_) => {
            warn!("Management request with invalid admin token");
            return Err(ServerError::unauthorized("invalid token"));
        }
        None => return Err(ServerError::unauthorized("missing bearer token")),
    }

    headers
        .get(HEADER_OWNER_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|owner| !owner.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ServerError::validation("missing X-Owner-ID header"))
}

/// Loads a tenant and checks that `owner_id` owns it.
async fn owned_tenant(
    state: &AppState,
    owner_id: &str,
    tracking_id: &str,
) -> Result<Tenant, ServerError> {
    state
        .store
        .tenant_by_tracking_id(tracking_id)
        .await?
        .filter(|tenant| tenant.owner_id == owner_id)
        .ok_or_else(|| ServerError::not_found("website"))
}

/// Request body for `POST /api/websites`.
#[derive(Debug, Deserialize)]
struct CreateWebsiteRequest {
    name: Option<String>,
    domain: Option<String>,
}

/// POST /api/websites - Registers a website and issues its tracking id.
async fn post_website(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    let owner_id = authorize_owner(&state, &headers)?;
    let request: CreateWebsiteRequest = parse_json(&body)?;

    let name = request.name.as_deref().map(str::trim).unwrap_or_default();
    let domain = request.domain.as_deref().map(str::trim).unwrap_or_default();
    if name.is_empty() || domain.is_empty() {
        return Err(ServerError::validation("name and domain are required"));
    }

    let tenant = Tenant::new(owner_id, name, domain.to_ascii_lowercase());
    state.store.insert_tenant(tenant.clone()).await?;

    info!(
        owner_id = %tenant.owner_id,
        tracking_id = %tenant.tracking_id,
        domain = %tenant.domain,
        "Website registered"
    );

    Ok((StatusCode::CREATED, Json(tenant)).into_response())
}

/// GET /api/websites - Lists the owner's websites.
async fn get_websites(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Tenant>>, ServerError> {
    let owner_id = authorize_owner(&state, &headers)?;
    Ok(Json(state.store.tenants_for_owner(&owner_id).await?))
}

/// Query parameters for the stats endpoint.
#[derive(Debug, Deserialize)]
struct StatsQuery {
    days: Option<i64>,
}

/// GET /api/websites/{trackingId}/stats?days=30 - Booking counts.
async fn get_website_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(tracking_id): Path<String>,
    Query(query): Query<StatsQuery>,
) -> Result<Response, ServerError> {
    let owner_id = authorize_owner(&state, &headers)?;
    let tenant = owned_tenant(&state, &owner_id, &tracking_id).await?;

    let days = query
        .days
        .unwrap_or(DEFAULT_STATS_DAYS)
        .clamp(1, MAX_STATS_DAYS);
    let since = Utc::now() - chrono::Duration::days(days);

    let stats = state
        .store
        .booking_stats(&tenant.tracking_id, since)
        .await?;

    Ok(Json(stats).into_response())
}

/// GET /api/campaigns - The owner's campaign, or the default one.
async fn get_campaign(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<CampaignConfig>, ServerError> {
    let owner_id = authorize_owner(&state, &headers)?;
    let campaign = state
        .store
        .campaign_for_owner(&owner_id)
        .await?
        .unwrap_or_default();
    Ok(Json(campaign))
}

/// Request body for `PUT /api/campaigns`. Absent fields keep their value.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CampaignUpdate {
    subject: Option<String>,
    body: Option<String>,
    delay_minutes: Option<u32>,
    is_active: Option<bool>,
}

/// PUT /api/campaigns - Validates and stores the owner's campaign.
async fn put_campaign(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<CampaignConfig>, ServerError> {
    let owner_id = authorize_owner(&state, &headers)?;
    let update: CampaignUpdate = parse_json(&body)?;

    let mut campaign = state
        .store
        .campaign_for_owner(&owner_id)
        .await?
        .unwrap_or_default();
    if let Some(subject) = update.subject {
        campaign.subject = subject;
    }
    if let Some(body) = update.body {
        campaign.body = body;
    }
    if let Some(delay) = update.delay_minutes {
        campaign.delay_minutes = delay;
    }
    if let Some(active) = update.is_active {
        campaign.is_active = active;
    }
    campaign.validate().map_err(ServerError::validation)?;

    state.store.put_campaign(&owner_id, campaign.clone()).await?;

    info!(
        owner_id = %owner_id,
        delay_minutes = campaign.delay_minutes,
        is_active = campaign.is_active,
        "Campaign updated"
    );

    Ok(Json(campaign))
}

/// Request body for `PUT /api/bookings/{id}/status`.
#[derive(Debug, Deserialize)]
struct StatusUpdate {
    status: Option<String>,
}

/// PUT /api/bookings/{id}/status - Manual status change.
///
/// Marking an abandoned booking `recovered` or `completed` cancels its
/// pending recovery email at dispatch time.
async fn put_booking_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, ServerError> {
    let owner_id = authorize_owner(&state, &headers)?;
    let update: StatusUpdate = parse_json(&body)?;

    let status = update
        .status
        .as_deref()
        .ok_or_else(|| ServerError::validation("status is required"))?
        .parse::<BookingStatus>()
        .map_err(ServerError::validation)?;

    let booking = state
        .store
        .get_booking(&id)
        .await?
        .ok_or_else(|| ServerError::not_found("booking"))?;
    owned_tenant(&state, &owner_id, &booking.tracking_id)
        .await
        .map_err(|_| ServerError::not_found("booking"))?;

    let updated = state
        .store
        .set_booking_status(&id, status, Utc::now())
        .await?
        .ok_or_else(|| ServerError::not_found("booking"))?;

    info!(booking_id = %id, status = %status.as_str(), "Booking status updated");

    Ok(Json(updated).into_response())
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::email::LogTransport;
    use crate::store::MemoryStore;

    const ADMIN_TOKEN: &str = "admin-secret";

    struct TestApp {
        state: AppState,
        store: Arc<MemoryStore>,
    }

    fn test_config() -> Config {
        Config {
            admin_token: Some(ADMIN_TOKEN.to_string()),
            ..Config::default()
        }
    }

    fn test_app_with(config: Config, rate_limiter: RateLimiter) -> TestApp {
        let store = Arc::new(MemoryStore::new());
        let state = AppState::with_components(
            config,
            store.clone(),
            Arc::new(LogTransport),
            rate_limiter,
        );
        TestApp { state, store }
    }

    fn test_app() -> TestApp {
        test_app_with(test_config(), RateLimiter::default())
    }

    async fn register_tenant(app: &TestApp) -> Tenant {
        let tenant = Tenant::new("owner-1", "Glow Salon", "glow.test");
        app.store.insert_tenant(tenant.clone()).await.unwrap();
        tenant
    }

    fn track_request(body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/track")
            .header("Content-Type", "application/json")
            .header("Origin", "https://glow.test")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn admin_request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("Authorization", format!("Bearer {ADMIN_TOKEN}"))
            .header(HEADER_OWNER_ID, "owner-1")
            .header("Content-Type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    // ========================================================================
    // Health and snippet
    // ========================================================================

    #[tokio::test]
    async fn health_returns_ok_status() {
        let app = create_router(test_app().state);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
    }

    #[tokio::test]
    async fn tracking_snippet_is_served_as_javascript() {
        let app = create_router(test_app().state);

        let response = app
            .oneshot(Request::builder().uri("/tracking.js").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("application/javascript"));
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let snippet = String::from_utf8_lossy(&body);
        assert!(snippet.contains("/api/track"));
        // Cross-origin posts must stay CORS-simple.
        assert!(snippet.contains("text/plain;charset=UTF-8"));
        assert!(!snippet.contains("application/json"));
    }

    // ========================================================================
    // /api/track
    // ========================================================================

    #[tokio::test]
    async fn options_track_allows_any_origin() {
        let app = create_router(test_app().state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/track")
                    .header("Origin", "https://anywhere.test")
                    .header("Access-Control-Request-Method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
        assert!(response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS]
            .to_str()
            .unwrap()
            .contains("POST"));
    }

    #[tokio::test]
    async fn track_accepts_abandonment_and_schedules_email() {
        let test = test_app();
        let tenant = register_tenant(&test).await;
        let app = create_router(test.state.clone());

        let response = app
            .oneshot(track_request(&json!({
                "trackingId": tenant.tracking_id,
                "sessionId": "session_1700000000000_abc123def",
                "event": "abandonment",
                "formData": { "name": "Ana", "email": "ana@example.com" },
                "url": "https://glow.test/book",
                "timestamp": "2024-03-01T10:00:00.000Z",
                "userAgent": "Mozilla/5.0"
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["event"], "abandonment");

        let booking_id = body["bookingId"].as_str().unwrap();
        let sends = test.store.sends_for_booking(booking_id).await.unwrap();
        assert_eq!(sends.len(), 1);
    }

    #[tokio::test]
    async fn track_accepts_plain_text_beacon_body() {
        let test = test_app();
        let tenant = register_tenant(&test).await;
        let app = create_router(test.state);

        let body = json!({
            "trackingId": tenant.tracking_id,
            "sessionId": "session_1700000000000_abc123def",
            "event": "abandonment",
            "formData": { "email": "ana@example.com" }
        });
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/track")
                    .header("Content-Type", "text/plain;charset=UTF-8")
                    .header("Origin", "https://glow.test")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
        assert_eq!(json_body(response).await["success"], true);
    }

    #[tokio::test]
    async fn track_rejects_malformed_json() {
        let app = create_router(test_app().state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/track")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "invalid_format");
    }

    #[tokio::test]
    async fn track_rejects_missing_fields() {
        let test = test_app();
        let tenant = register_tenant(&test).await;
        let app = create_router(test.state);

        let response = app
            .oneshot(track_request(&json!({
                "trackingId": tenant.tracking_id,
                "event": "abandonment"
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "missing_fields");
    }

    #[tokio::test]
    async fn track_rejects_unknown_tracking_id() {
        let app = create_router(test_app().state);

        let response = app
            .oneshot(track_request(&json!({
                "trackingId": "track_nope",
                "sessionId": "session_1_x",
                "event": "completion"
            })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], "invalid_tracking_id");
        assert_eq!(body["error"], "invalid tracking id");
    }

    #[tokio::test]
    async fn track_rate_limit_sets_retry_after() {
        let test = test_app_with(test_config(), RateLimiter::new(0.01, 1));
        let tenant = register_tenant(&test).await;
        let event = json!({
            "trackingId": tenant.tracking_id,
            "sessionId": "session_1_x",
            "event": "completion"
        });

        let app = create_router(test.state);
        let first = app.clone().oneshot(track_request(&event)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(track_request(&event)).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(HEADER_RETRY_AFTER));
        assert_eq!(json_body(second).await["code"], "rate_limited");
    }

    #[tokio::test]
    async fn track_enforces_origin_when_enabled() {
        let config = Config {
            enforce_origin: true,
            ..test_config()
        };
        let test = test_app_with(config, RateLimiter::default());
        let tenant = register_tenant(&test).await;
        let app = create_router(test.state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/track")
                    .header("Origin", "https://evil.test")
                    .body(Body::from(
                        json!({
                            "trackingId": tenant.tracking_id,
                            "sessionId": "session_1_x",
                            "event": "completion"
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["code"], "origin_mismatch");
    }

    // ========================================================================
    // Management API
    // ========================================================================

    #[tokio::test]
    async fn management_is_disabled_without_admin_token() {
        let test = test_app_with(Config::default(), RateLimiter::default());
        let app = create_router(test.state);

        let response = app
            .oneshot(admin_request("GET", "/api/websites", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn management_rejects_wrong_token() {
        let app = create_router(test_app().state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/websites")
                    .header("Authorization", "Bearer wrong")
                    .header(HEADER_OWNER_ID, "owner-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["code"], "unauthorized");
    }

    #[tokio::test]
    async fn management_requires_owner_header() {
        let app = create_router(test_app().state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/websites")
                    .header("Authorization", format!("Bearer {ADMIN_TOKEN}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn websites_can_be_created_and_listed() {
        let app = create_router(test_app().state);

        let response = app
            .clone()
            .oneshot(admin_request(
                "POST",
                "/api/websites",
                Some(json!({ "name": "Glow Salon", "domain": "Glow.test" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = json_body(response).await;
        assert!(created["trackingId"].as_str().unwrap().starts_with("track_"));
        assert_eq!(created["domain"], "glow.test");

        let response = app
            .oneshot(admin_request("GET", "/api/websites", None))
            .await
            .unwrap();
        let listed = json_body(response).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["trackingId"], created["trackingId"]);
    }

    #[tokio::test]
    async fn website_creation_requires_name_and_domain() {
        let app = create_router(test_app().state);

        let response = app
            .oneshot(admin_request(
                "POST",
                "/api/websites",
                Some(json!({ "name": "  ", "domain": "glow.test" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stats_count_bookings_by_status() {
        let test = test_app();
        let tenant = register_tenant(&test).await;
        let app = create_router(test.state.clone());

        for event in ["abandonment", "abandonment", "completion"] {
            let response = app
                .clone()
                .oneshot(track_request(&json!({
                    "trackingId": tenant.tracking_id,
                    "sessionId": "session_1_x",
                    "event": event
                })))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let uri = format!("/api/websites/{}/stats?days=7", tenant.tracking_id);
        let response = app
            .oneshot(admin_request("GET", &uri, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stats = json_body(response).await;
        assert_eq!(stats["total"], 3);
        assert_eq!(stats["abandoned"], 2);
        assert_eq!(stats["completed"], 1);
        assert_eq!(stats["recoveryRate"], "0.0");
    }

    #[tokio::test]
    async fn stats_hide_other_owners_websites() {
        let test = test_app();
        let other = Tenant::new("owner-2", "Other", "other.test");
        test.store.insert_tenant(other.clone()).await.unwrap();
        let app = create_router(test.state);

        let uri = format!("/api/websites/{}/stats", other.tracking_id);
        let response = app
            .oneshot(admin_request("GET", &uri, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn campaign_defaults_and_updates() {
        let app = create_router(test_app().state);

        let response = app
            .clone()
            .oneshot(admin_request("GET", "/api/campaigns", None))
            .await
            .unwrap();
        let campaign = json_body(response).await;
        assert_eq!(campaign["delayMinutes"], 60);
        assert_eq!(campaign["isActive"], true);

        let response = app
            .clone()
            .oneshot(admin_request(
                "PUT",
                "/api/campaigns",
                Some(json!({ "delayMinutes": 0, "isActive": false })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(admin_request("GET", "/api/campaigns", None))
            .await
            .unwrap();
        let campaign = json_body(response).await;
        assert_eq!(campaign["delayMinutes"], 0);
        assert_eq!(campaign["isActive"], false);
        assert_eq!(campaign["subject"], "You left something behind!");
    }

    #[tokio::test]
    async fn campaign_update_is_validated() {
        let app = create_router(test_app().state);

        let response = app
            .oneshot(admin_request(
                "PUT",
                "/api/campaigns",
                Some(json!({ "subject": "" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "invalid_request");
    }

    #[tokio::test]
    async fn booking_status_can_be_marked_recovered() {
        let test = test_app();
        let tenant = register_tenant(&test).await;
        let app = create_router(test.state.clone());

        let response = app
            .clone()
            .oneshot(track_request(&json!({
                "trackingId": tenant.tracking_id,
                "sessionId": "session_1_x",
                "event": "abandonment"
            })))
            .await
            .unwrap();
        let booking_id = json_body(response).await["bookingId"]
            .as_str()
            .unwrap()
            .to_string();

        let uri = format!("/api/bookings/{booking_id}/status");
        let response = app
            .clone()
            .oneshot(admin_request(
                "PUT",
                &uri,
                Some(json!({ "status": "recovered" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "recovered");

        let response = app
            .oneshot(admin_request("PUT", &uri, Some(json!({ "status": "lost" }))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_booking_is_not_found() {
        let app = create_router(test_app().state);

        let response = app
            .oneshot(admin_request(
                "PUT",
                "/api/bookings/booking_missing/status",
                Some(json!({ "status": "recovered" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
