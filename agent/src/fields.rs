//! Safe-field filter.
//!
//! Decides which form fields may leave the page. A field is captured only if
//! it is input-capable, its type is not `password`/`hidden`, and neither its
//! name nor its id contains a sensitive fragment (case-insensitive).
//!
//! ```
//! use booking_agent::fields::is_safe_field;
//! use booking_agent::types::FieldDescriptor;
//!
//! // A text input named "password123" is still rejected by name.
//! assert!(!is_safe_field(&FieldDescriptor::input("text", "password123", "pwd1")));
//! assert!(is_safe_field(&FieldDescriptor::input("email", "email", "")));
//! ```

use crate::types::FieldDescriptor;

/// Field types that are never captured.
const UNSAFE_TYPES: &[&str] = &["password", "hidden"];

/// Name/id fragments that mark a field as sensitive.
const UNSAFE_NAME_FRAGMENTS: &[&str] = &["password", "pass", "pwd", "credit", "card", "cvv", "ssn"];

fn has_unsafe_fragment(value: &str) -> bool {
    let value = value.to_ascii_lowercase();
    UNSAFE_NAME_FRAGMENTS
        .iter()
        .any(|fragment| value.contains(fragment))
}

/// Returns `true` if the field's value may be captured.
pub fn is_safe_field(field: &FieldDescriptor) -> bool {
    if !field.tag.is_input_capable() {
        return false;
    }

    let field_type = field.field_type.trim().to_ascii_lowercase();
    if UNSAFE_TYPES.contains(&field_type.as_str()) {
        return false;
    }

    !has_unsafe_fragment(&field.name) && !has_unsafe_fragment(&field.id)
}

/// Key a captured value is stored under: name, else id, else type.
///
/// Returns `None` when all three are empty.
pub fn capture_key(field: &FieldDescriptor) -> Option<&str> {
    [&field.name, &field.id, &field.field_type]
        .into_iter()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
}
