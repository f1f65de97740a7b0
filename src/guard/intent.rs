//! Deterministic intent classification for inbound message text.
//!
//! An ordered table of `(Intent, patterns)` is walked top to bottom and the
//! first intent with a matching pattern wins. More specific intents sit
//! above more generic ones (urgency before location, location before
//! greeting, so "hey, where are you?" is a location query).

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Closed set of intent labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Urgent,
    LocationQuery,
    AvailabilityQuery,
    ActivityQuery,
    Greeting,
    Acknowledgment,
    Question,
    Statement,
}

impl Intent {
    /// Wire label used in rule `triggerIntents`, `relatedIntents`, and
    /// `followUpResponses` keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::LocationQuery => "location_query",
            Self::AvailabilityQuery => "availability_query",
            Self::ActivityQuery => "activity_query",
            Self::Greeting => "greeting",
            Self::Acknowledgment => "acknowledgment",
            Self::Question => "question",
            Self::Statement => "statement",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the precedence table.
struct IntentPatterns {
    intent: Intent,
    patterns: Vec<Regex>,
}

fn compile(intent: Intent, patterns: &[&str]) -> IntentPatterns {
    IntentPatterns {
        intent,
        patterns: patterns
            .iter()
            .map(|p| Regex::new(&format!("(?i){p}")).expect("static intent pattern"))
            .collect(),
    }
}

static INTENT_TABLE: LazyLock<Vec<IntentPatterns>> = LazyLock::new(|| {
    vec![
        compile(
            Intent::Urgent,
            &[
                r"\burgent\b",
                r"\bemergency\b",
                r"\basap\b",
                r"need.*now",
                r"help\s*!",
                r"\bimportant\b",
            ],
        ),
        compile(
            Intent::LocationQuery,
            &[
                r"where\s+(are|r)\s+(you|u)",
                r"where\s+u\s+at",
                r"what.*location",
                r"where.*now",
                r"what\s+place",
                r"which\s+city",
                r"are\s+(you|u)\s+(still\s+)?(at|in)\b",
                r"\blocation\b",
            ],
        ),
        compile(
            Intent::AvailabilityQuery,
            &[
                r"when\s+(will|are|r)\s+(you|u)",
                r"what\s+time",
                r"how\s+long",
                r"when.*coming",
                r"when.*here",
                r"when.*back",
                r"are\s+(you|u)\s+(free|available|busy)",
                r"what.*eta",
                r"\beta\b",
            ],
        ),
        compile(
            Intent::ActivityQuery,
            &[
                r"what\s+(are|r)\s+(you|u)\s+doing",
                r"what.*up\s+to",
                r"\bwyd\b",
                r"whatcha\s+doing",
                r"you\s+busy",
                r"still\s+(at\s+)?work",
            ],
        ),
        compile(
            Intent::Greeting,
            &[
                r"^(hey|hi|hello|yo|sup|what'?s?\s*up|hola)\b",
                r"good\s+(morning|afternoon|evening)",
                r"how\s+(are|r)\s+(you|u)\b",
                r"how's\s+it\s+going",
            ],
        ),
        // Only a bare acknowledgment; "ok honey, love you" stays a statement.
        compile(
            Intent::Acknowledgment,
            &[
                r"^(ok|okay|k|kk|sure|alright|got\s*it|thanks|thank\s+you|thx|ty|cool|sounds\s+good|perfect|great)[\s!.]*$",
            ],
        ),
        compile(
            Intent::Question,
            &[r"\?$", r"^(can|could|would|will|do|does|have|has)\s+(you|i|we|they)\b"],
        ),
    ]
});

/// Label a message. Same text, same label; falls back to `Statement`.
pub fn classify_intent(text: &str) -> Intent {
    let body = text.trim().to_lowercase();
    if body.is_empty() {
        return Intent::Statement;
    }
    INTENT_TABLE
        .iter()
        .find(|row| row.patterns.iter().any(|p| p.is_match(&body)))
        .map(|row| row.intent)
        .unwrap_or(Intent::Statement)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_intent(cases: &[&str], expected: Intent) {
        for text in cases {
            assert_eq!(classify_intent(text), expected, "text: {text:?}");
        }
    }

    #[test]
    fn location_queries() {
        assert_intent(
            &[
                "Where are you?",
                "where r u",
                "where u at",
                "what's your location",
                "Are you still at work?",
                "Hey sweetie, where are you?",
            ],
            Intent::LocationQuery,
        );
    }

    #[test]
    fn availability_queries() {
        assert_intent(
            &[
                "When will you be here?",
                "When will you be up?",
                "What time are you coming?",
                "How long will you be?",
                "when are you coming back",
                "are you free?",
                "are you free for lunch?",
            ],
            Intent::AvailabilityQuery,
        );
    }

    #[test]
    fn activity_queries() {
        assert_intent(
            &["What are you doing?", "wyd", "wyd?", "whatcha doing", "you busy?"],
            Intent::ActivityQuery,
        );
    }

    #[test]
    fn greetings() {
        assert_intent(
            &["Hey", "Hi there!", "Hello", "Good morning", "How are you?"],
            Intent::Greeting,
        );
    }

    #[test]
    fn urgency_beats_everything() {
        assert_intent(
            &[
                "URGENT - call me back!",
                "This is an emergency",
                "Need this ASAP",
                "hey where are you, it's important",
            ],
            Intent::Urgent,
        );
    }

    #[test]
    fn bare_acknowledgments_only() {
        assert_intent(&["Ok", "Sure", "Thanks", "Got it", "sounds good!"], Intent::Acknowledgment);
        assert_eq!(classify_intent("Ok honey, love you"), Intent::Statement);
    }

    #[test]
    fn generic_questions() {
        assert_intent(&["Can you help me?", "Will you be there?"], Intent::Question);
    }

    #[test]
    fn statements_are_the_fallback() {
        assert_intent(
            &["I went to the store today", "The weather is nice", "", "   "],
            Intent::Statement,
        );
    }

    #[test]
    fn greeting_words_inside_other_words_do_not_match() {
        assert_eq!(classify_intent("This is fine"), Intent::Statement);
        assert_eq!(classify_intent("Shipping tomorrow"), Intent::Statement);
    }

    #[test]
    fn classification_is_deterministic() {
        let text = "When will you be up?";
        let first = classify_intent(text);
        for _ in 0..100 {
            assert_eq!(classify_intent(text), first);
        }
    }

    #[test]
    fn labels_match_serde() {
        for intent in [
            Intent::Urgent,
            Intent::LocationQuery,
            Intent::AvailabilityQuery,
            Intent::ActivityQuery,
            Intent::Greeting,
            Intent::Acknowledgment,
            Intent::Question,
            Intent::Statement,
        ] {
            let json = serde_json::to_value(intent).unwrap();
            assert_eq!(json, intent.as_str());
        }
    }
}
