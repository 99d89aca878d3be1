//! Shared data types for the recovery server.
//!
//! This module defines the wire format accepted from the tracking snippet and
//! the records persisted by the [`Store`](crate::store::Store). Booking records
//! are immutable once written apart from their `status` field.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Length of the random part of a generated tracking identifier.
const TRACKING_ID_SUFFIX_LEN: usize = 12;

/// Captured form fields, keyed by field name.
pub type FormData = BTreeMap<String, String>;

/// Terminal event reported by the tracking snippet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingEventKind {
    Abandonment,
    Completion,
}

impl TrackingEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abandonment => "abandonment",
            Self::Completion => "completion",
        }
    }
}

impl fmt::Display for TrackingEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackingEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abandonment" => Ok(Self::Abandonment),
            "completion" => Ok(Self::Completion),
            other => Err(format!("unknown event '{other}'")),
        }
    }
}

/// Request body of `POST /api/track`.
///
/// Every field is optional at the serde level so that missing required fields
/// can be reported as a validation error rather than a parse error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackRequest {
    pub tracking_id: Option<String>,
    pub session_id: Option<String>,
    pub event: Option<String>,
    #[serde(default, deserialize_with = "deserialize_form_data")]
    pub form_data: FormData,
    pub url: Option<String>,
    pub timestamp: Option<String>,
    pub user_agent: Option<String>,
}

/// Accepts scalar JSON values for form fields and stores them as strings.
///
/// Snippets on hand-edited pages occasionally send numbers or booleans; nulls,
/// arrays and objects are dropped.
fn deserialize_form_data<'de, D>(deserializer: D) -> Result<FormData, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    let mut form = FormData::new();
    for (key, value) in raw.unwrap_or_default() {
        let value = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        form.insert(key, value);
    }
    Ok(form)
}

/// Lifecycle status of a booking record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Abandoned,
    Completed,
    Recovered,
}

impl BookingStatus {
    /// Status assigned to a freshly ingested event.
    pub fn for_event(kind: TrackingEventKind) -> Self {
        match kind {
            TrackingEventKind::Completion => Self::Completed,
            TrackingEventKind::Abandonment => Self::Abandoned,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abandoned => "abandoned",
            Self::Completed => "completed",
            Self::Recovered => "recovered",
        }
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abandoned" => Ok(Self::Abandoned),
            "completed" => Ok(Self::Completed),
            "recovered" => Ok(Self::Recovered),
            other => Err(format!("unknown booking status '{other}'")),
        }
    }
}

/// A persisted booking event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRecord {
    pub id: String,
    pub tracking_id: String,
    pub session_id: String,
    pub client_id: String,
    pub event: TrackingEventKind,
    pub form_data: FormData,
    pub url: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A registered website whose owner receives recovery campaigns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub domain: String,
    pub tracking_id: String,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    /// Creates a tenant with freshly generated identifiers.
    pub fn new(
        owner_id: impl Into<String>,
        name: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("client_{}", Uuid::new_v4().simple()),
            owner_id: owner_id.into(),
            name: name.into(),
            domain: domain.into(),
            tracking_id: generate_tracking_id(),
            created_at: Utc::now(),
        }
    }

    /// Display metadata handed to the scheduler.
    pub fn client_info(&self) -> ClientInfo {
        ClientInfo {
            name: self.name.clone(),
            domain: self.domain.clone(),
        }
    }
}

/// Display metadata about the tenant used when rendering emails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub domain: String,
}

/// Default subject used when an owner has not configured a campaign.
pub const DEFAULT_CAMPAIGN_SUBJECT: &str = "You left something behind!";

/// Default body used when an owner has not configured a campaign.
pub const DEFAULT_CAMPAIGN_BODY: &str = "<p>Hi {{name}},</p>\n\
<p>We noticed you started a booking with {{business}} but didn't finish it. \
Your details are saved, so it only takes a moment to complete.</p>\n\
<p><a href=\"https://{{domain}}\">Complete my booking</a></p>\n\
<p>If you have any questions, just reply to this email.</p>";

/// Default delay before a recovery email is sent.
pub const DEFAULT_DELAY_MINUTES: u32 = 60;

/// Upper bound on the configurable delay (30 days).
pub const MAX_DELAY_MINUTES: u32 = 30 * 24 * 60;

/// Per-owner recovery email settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignConfig {
    pub subject: String,
    pub body: String,
    pub delay_minutes: u32,
    pub is_active: bool,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            subject: DEFAULT_CAMPAIGN_SUBJECT.to_string(),
            body: DEFAULT_CAMPAIGN_BODY.to_string(),
            delay_minutes: DEFAULT_DELAY_MINUTES,
            is_active: true,
        }
    }
}

impl CampaignConfig {
    /// Checks the fields an owner can edit.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the subject or body is blank or the
    /// delay exceeds [`MAX_DELAY_MINUTES`].
    pub fn validate(&self) -> Result<(), String> {
        if self.subject.trim().is_empty() {
            return Err("subject cannot be empty".to_string());
        }
        if self.body.trim().is_empty() {
            return Err("body cannot be empty".to_string());
        }
        if self.delay_minutes > MAX_DELAY_MINUTES {
            return Err(format!(
                "delayMinutes cannot exceed {MAX_DELAY_MINUTES}"
            ));
        }
        Ok(())
    }
}

/// Status of one scheduled recovery email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Cancelled,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns `true` once no further transition happens without an operator.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for SendStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown send status '{other}'")),
        }
    }
}

/// A durable record of one scheduled recovery email.
///
/// The template is snapshotted at schedule time; only the `is_active` flag of
/// the owner's campaign is consulted again at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSend {
    pub id: String,
    pub booking_id: String,
    pub owner_id: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub client: ClientInfo,
    pub form_data: FormData,
    pub due_at: DateTime<Utc>,
    pub attempts: u32,
    pub status: SendStatus,
    pub last_error: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Simple per-tenant booking counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingStats {
    pub total: u64,
    pub abandoned: u64,
    pub completed: u64,
    pub recovered: u64,
    /// Recovered share of abandoned bookings, as a percentage with one decimal.
    pub recovery_rate: String,
}

impl BookingStats {
    /// Builds stats from a list of statuses.
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = BookingStatus>,
    {
        let mut stats = Self::default();
        for status in statuses {
            stats.total += 1;
            match status {
                BookingStatus::Abandoned => stats.abandoned += 1,
                BookingStatus::Completed => stats.completed += 1,
                BookingStatus::Recovered => stats.recovered += 1,
            }
        }
        stats.recovery_rate = if stats.abandoned > 0 {
            format!(
                "{:.1}",
                stats.recovered as f64 / stats.abandoned as f64 * 100.0
            )
        } else {
            "0.0".to_string()
        };
        stats
    }
}

/// Generates a public tracking identifier (`track_` + 12 alphanumerics).
pub fn generate_tracking_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TRACKING_ID_SUFFIX_LEN)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("track_{suffix}")
}

/// Generates a booking record identifier.
pub fn generate_booking_id() -> String {
    format!("booking_{}", Uuid::new_v4().simple())
}

/// Generates a pending-send identifier.
pub fn generate_send_id() -> String {
    format!("send_{}", Uuid::new_v4().simple())
}
