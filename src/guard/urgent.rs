//! Urgent follow-up forwarding.
//!
//! People split one thought across several texts. When a message was
//! forwarded because it met an "urgent" priority filter directly, the
//! messages that follow within a short window ride along to the same
//! destination even if they would not qualify on their own. The anchor is
//! set only by a direct urgent forward, so the window does not slide
//! forward through a long chat.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default follow-up window.
pub const DEFAULT_URGENT_FOLLOWUP_WINDOW_MS: i64 = 45_000;

/// Inputs as they come off the wire; any of them may be missing or malformed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrgentFollowupInput {
    #[serde(default)]
    pub priority_filter: Option<String>,
    #[serde(default)]
    pub message_priority: Option<String>,
    #[serde(default)]
    pub is_spam_or_held: bool,
    pub now: DateTime<Utc>,
    #[serde(default = "default_window_ms")]
    pub urgent_followup_window_ms: i64,
    #[serde(default)]
    pub normalized_dest: Option<String>,
    /// RFC 3339 timestamp of the direct urgent forward.
    #[serde(default)]
    pub anchor_at: Option<String>,
    /// Destination the anchoring message was forwarded to.
    #[serde(default)]
    pub anchor_to: Option<String>,
}

fn default_window_ms() -> i64 {
    DEFAULT_URGENT_FOLLOWUP_WINDOW_MS
}

/// Should this message ride along on a prior urgent forward?
///
/// High-priority messages are excluded: they take the direct urgent path.
pub fn should_forward_urgent_followup(input: &UrgentFollowupInput) -> bool {
    if input.priority_filter.as_deref() != Some("urgent") {
        return false;
    }
    if input.is_spam_or_held {
        return false;
    }
    if input.message_priority.as_deref() == Some("high") {
        return false;
    }

    let (Some(dest), Some(anchor_to), Some(anchor_at)) = (
        non_empty(&input.normalized_dest),
        non_empty(&input.anchor_to),
        non_empty(&input.anchor_at),
    ) else {
        return false;
    };
    if anchor_to != dest {
        return false;
    }

    let Ok(anchor_at) = DateTime::parse_from_rfc3339(anchor_at) else {
        return false;
    };
    // An anchor later than `now` gives a negative delta, which is inside
    // the window.
    let elapsed_ms = (input.now - anchor_at.with_timezone(&Utc)).num_milliseconds();
    elapsed_ms <= input.urgent_followup_window_ms
}

/// Present and non-empty. Values are compared exactly as sent.
fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
