//! Recovery email rendering.
//!
//! Campaign subjects and bodies are owner-supplied templates with
//! `{{placeholder}}` markers:
//!
//! | Placeholder | Value |
//! |-------------|-------|
//! | `{{name}}` | captured `name` field, or `there` |
//! | `{{email}}` | captured `email` field |
//! | `{{business}}` | tenant display name |
//! | `{{domain}}` | tenant domain |
//!
//! Captured values are HTML-escaped before they reach the HTML part.
//! Unknown placeholders are left untouched.

use crate::types::{ClientInfo, FormData};

/// Greeting used when no name was captured.
pub const DEFAULT_NAME: &str = "there";

/// Captured fields listed under "Your booking details", in order.
const DETAIL_FIELDS: &[(&str, &str)] = &[
    ("date", "Date"),
    ("time", "Time"),
    ("service", "Service"),
    ("phone", "Phone"),
];

/// A fully rendered email, ready for an [`EmailTransport`](crate::email::EmailTransport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Renders a campaign template for one abandoned booking.
pub fn render(subject: &str, body: &str, client: &ClientInfo, form: &FormData) -> RenderedEmail {
    let raw = Values::new(client, form);
    let escaped = raw.escaped();

    let subject = substitute(subject, &raw);
    let html_body = substitute(body, &escaped);
    let text_body = html_to_text(&substitute(body, &raw));

    RenderedEmail {
        html: html_layout(&subject, &html_body, &details_html(form), &escaped.business),
        text: text_layout(&text_body, &details_text(form), &raw.domain, &raw.business),
        subject,
    }
}

struct Values {
    name: String,
    email: String,
    business: String,
    domain: String,
}

impl Values {
    fn new(client: &ClientInfo, form: &FormData) -> Self {
        let field = |key: &str| {
            form.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Self {
            name: field("name").unwrap_or_else(|| DEFAULT_NAME.to_string()),
            email: field("email").unwrap_or_default(),
            business: client.name.clone(),
            domain: client.domain.clone(),
        }
    }

    fn escaped(&self) -> Self {
        Self {
            name: escape_html(&self.name),
            email: escape_html(&self.email),
            business: escape_html(&self.business),
            domain: escape_html(&self.domain),
        }
    }

    fn lookup(&self, key: &str) -> Option<&str> {
        match key {
            "name" => Some(&self.name),
            "email" => Some(&self.email),
            "business" => Some(&self.business),
            "domain" => Some(&self.domain),
            _ => None,
        }
    }
}

/// Replaces `{{key}}` markers (whitespace inside the braces allowed).
fn substitute(template: &str, values: &Values) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match values.lookup(key) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 2 + end + 2]),
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Escapes the five HTML-significant characters.
pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Crude tag stripper for the plain-text part.
///
/// Block-level closing tags and `<br>` become line breaks; runs of blank
/// lines collapse to one.
fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut tag = String::new();
    let mut in_tag = false;

    for c in html.chars() {
        match (in_tag, c) {
            (false, '<') => {
                in_tag = true;
                tag.clear();
            }
            (true, '>') => {
                in_tag = false;
                let name = tag.trim().to_ascii_lowercase();
                if name.starts_with("br") || matches!(name.as_str(), "/p" | "/div" | "/h1" | "/h2" | "/h3" | "/li") {
                    out.push('\n');
                }
            }
            (true, other) => tag.push(other),
            (false, other) => out.push(other),
        }
    }

    let mut text = String::with_capacity(out.len());
    let mut blank_run = 0;
    for line in out.lines().map(str::trim) {
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 || text.is_empty() {
                continue;
            }
        } else {
            blank_run = 0;
        }
        text.push_str(line);
        text.push('\n');
    }
    text.trim_end().to_string()
}

fn details_html(form: &FormData) -> String {
    DETAIL_FIELDS
        .iter()
        .filter_map(|(key, label)| {
            form.get(*key)
                .filter(|v| !v.trim().is_empty())
                .map(|v| format!("<p><strong>{label}:</strong> {}</p>", escape_html(v.trim())))
        })
        .collect()
}

fn details_text(form: &FormData) -> String {
    DETAIL_FIELDS
        .iter()
        .filter_map(|(key, label)| {
            form.get(*key)
                .filter(|v| !v.trim().is_empty())
                .map(|v| format!("{label}: {}", v.trim()))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn html_layout(title: &str, body: &str, details: &str, business: &str) -> String {
    let details = if details.is_empty() {
        String::new()
    } else {
        format!("<div class=\"details\"><h3>Your Booking Details:</h3>{details}</div>")
    };

    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n\
         <title>{title}</title>\n</head>\n<body>\n\
         <div class=\"container\">\n{body}\n{details}\n\
         <p>Best regards,<br>The {business} Team</p>\n\
         <div class=\"footer\"><p>This email was sent because you started a booking on our website.</p></div>\n\
         </div>\n</body>\n</html>\n",
        title = escape_html(title),
    )
}

fn text_layout(body: &str, details: &str, domain: &str, business: &str) -> String {
    let mut text = String::new();
    text.push_str(body);
    text.push_str("\n\n");
    if !details.is_empty() {
        text.push_str("Your Booking Details:\n");
        text.push_str(details);
        text.push_str("\n\n");
    }
    text.push_str(&format!("Complete your booking: https://{domain}\n\n"));
    text.push_str(&format!("Best regards,\nThe {business} Team\n\n"));
    text.push_str("---\nThis email was sent because you started a booking on our website.\n");
    text
}
