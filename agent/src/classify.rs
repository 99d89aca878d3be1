//! Booking form detection.
//!
//! [`KeywordClassifier`] treats a form as booking-related when its text
//! contains any of a fixed set of keywords. Common words such as "date" and
//! "time" make this a known false-positive source; swap in another
//! [`FormClassifier`] for stricter detection.

/// Default booking keywords.
pub const BOOKING_KEYWORDS: &[&str] = &[
    "book",
    "appointment",
    "schedule",
    "reserve",
    "date",
    "time",
    "calendar",
];

/// Decides whether a form should be tracked.
pub trait FormClassifier: Send + Sync {
    /// `form_text` is the form's rendered markup or text content.
    fn classify(&self, form_text: &str) -> bool;
}

/// Case-insensitive substring match against a keyword list.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    keywords: Vec<String>,
}

impl KeywordClassifier {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(BOOKING_KEYWORDS)
    }
}

impl FormClassifier for KeywordClassifier {
    fn classify(&self, form_text: &str) -> bool {
        let text = form_text.to_lowercase();
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_booking_keywords_case_insensitively() {
        let classifier = KeywordClassifier::default();
        assert!(classifier.classify("<button>Book Now</button>"));
        assert!(classifier.classify("Pick an APPOINTMENT slot"));
        assert!(classifier.classify("<label>Preferred date</label>"));
    }

    #[test]
    fn ignores_forms_without_keywords() {
        let classifier = KeywordClassifier::default();
        assert!(!classifier.classify("<input name=\"q\"> Search"));
        assert!(!classifier.classify(""));
    }

    #[test]
    fn keyword_inside_other_words_matches() {
        // "newsletter signup" has no keyword, "Facebook login" does.
        let classifier = KeywordClassifier::default();
        assert!(!classifier.classify("Newsletter signup"));
        assert!(classifier.classify("Log in with Facebook"));
    }

    #[test]
    fn custom_keywords() {
        let classifier = KeywordClassifier::new(["Checkout", ""]);
        assert!(classifier.classify("proceed to checkout"));
        assert!(!classifier.classify("book a table"));
    }
}
