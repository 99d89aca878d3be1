//! Types shared by the tracking agent.
//!
//! Two groups live here:
//!
//! - the wire format posted to `POST /api/track` ([`TrackEvent`]), which
//!   serializes to camelCase JSON,
//! - the page model the agent observes ([`PageDescriptor`], [`FieldDescriptor`],
//!   [`PageEvent`]), which replay scripts deserialize from snake_case JSON.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Characters used for the random part of a session id.
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length of the random part of a session id.
const SESSION_SUFFIX_LEN: usize = 9;

/// Captured form fields, keyed by capture key.
pub type FormData = BTreeMap<String, String>;

/// Terminal event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Abandonment,
    Completion,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Abandonment => "abandonment",
            Self::Completion => "completion",
        })
    }
}

/// Body of `POST /api/track`.
///
/// Both event kinds carry `userAgent` when it is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEvent {
    pub tracking_id: String,
    pub session_id: String,
    pub event: EventKind,
    pub form_data: FormData,
    pub url: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// Element kind of a form field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldTag {
    #[default]
    Input,
    Select,
    Textarea,
    Button,
    Other,
}

impl FieldTag {
    /// `input`, `select` and `textarea` hold user-entered values.
    pub fn is_input_capable(self) -> bool {
        matches!(self, Self::Input | Self::Select | Self::Textarea)
    }
}

/// The attributes of a form field the agent looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    #[serde(default)]
    pub tag: FieldTag,
    /// The `type` attribute, e.g. `text`, `email`, `password`.
    #[serde(default, rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: String,
}

impl FieldDescriptor {
    /// An `<input>` with the given type, name and id.
    pub fn input(
        field_type: impl Into<String>,
        name: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            tag: FieldTag::Input,
            field_type: field_type.into(),
            name: name.into(),
            id: id.into(),
        }
    }
}

/// A `<form>` element on the page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormDescriptor {
    /// Rendered markup/text of the form, used for classification.
    pub text: String,
}

/// The page the agent is running on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDescriptor {
    /// Full URL of the page.
    pub url: String,
    /// `src` of the script tag that loaded the agent, possibly relative.
    #[serde(default)]
    pub script_src: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub forms: Vec<FormDescriptor>,
}

/// Something that happened on the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageEvent {
    /// A field in form `form` received focus.
    Focus { form: usize, field: FieldDescriptor },
    /// A field in form `form` changed value.
    Input {
        form: usize,
        field: FieldDescriptor,
        value: String,
    },
    /// Form `form` was submitted.
    Submit { form: usize },
    /// The page became hidden (tab switch, minimise).
    Hidden,
    /// The page became visible again.
    Visible,
    /// The page is being torn down.
    Unload,
}

/// Generates a session id: `session_<unix ms>_<9 base36 chars>`.
pub fn generate_session_id() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..SESSION_SUFFIX_LEN)
        .map(|_| char::from(BASE36[rng.random_range(0..BASE36.len())]))
        .collect();
    format!("session_{}_{suffix}", Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_format() {
        let id = generate_session_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "session");
        assert!(parts[1].parse::<i64>().unwrap() > 0);
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(generate_session_id(), generate_session_id());
    }

    #[test]
    fn track_event_serializes_camel_case() {
        let event = TrackEvent {
            tracking_id: "track_abc".to_string(),
            session_id: "session_1_x".to_string(),
            event: EventKind::Completion,
            form_data: FormData::new(),
            url: "https://salon.test/book".to_string(),
            timestamp: Utc::now(),
            user_agent: None,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["trackingId"], "track_abc");
        assert_eq!(json["sessionId"], "session_1_x");
        assert_eq!(json["event"], "completion");
        assert!(json.get("userAgent").is_none());
    }

    #[test]
    fn page_event_deserializes_from_tagged_json() {
        let event: PageEvent = serde_json::from_str(
            r#"{"kind":"input","form":0,"field":{"type":"email","name":"email"},"value":"a@b.com"}"#,
        )
        .unwrap();

        assert_eq!(
            event,
            PageEvent::Input {
                form: 0,
                field: FieldDescriptor::input("email", "email", ""),
                value: "a@b.com".to_string(),
            }
        );

        let hidden: PageEvent = serde_json::from_str(r#"{"kind":"hidden"}"#).unwrap();
        assert_eq!(hidden, PageEvent::Hidden);
    }

    #[test]
    fn input_capable_tags() {
        assert!(FieldTag::Input.is_input_capable());
        assert!(FieldTag::Select.is_input_capable());
        assert!(FieldTag::Textarea.is_input_capable());
        assert!(!FieldTag::Button.is_input_capable());
        assert!(!FieldTag::Other.is_input_capable());
    }
}
