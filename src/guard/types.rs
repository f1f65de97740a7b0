//! Record shapes shared by the rule engine and its collaborators.
//!
//! Field names serialize in camelCase: these structs are the wire contract
//! with the rule-authoring and storage side and must round-trip unchanged.
//! Enum values the engine does not recognize are preserved in an `Other`
//! variant so they survive a load/save cycle; evaluation treats them as
//! non-matching.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::guard::intent::Intent;

// ── Rule ────────────────────────────────────────────────────────────

/// What a rule does once it matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleType {
    Transfer,
    AutoReply,
    Block,
    Forward,
    Priority,
    Custom,
    MessageNotify,
    #[serde(untagged)]
    Other(String),
}

/// Which contacts a rule applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionMode {
    #[default]
    All,
    Favorites,
    Saved,
    Custom,
    #[serde(untagged)]
    Other(String),
}

/// Which event types a rule applies to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferMode {
    Calls,
    Messages,
    #[default]
    Both,
    #[serde(untagged)]
    Other(String),
}

impl TransferMode {
    /// Whether this mode lets the rule see an event of the given type.
    pub fn admits(&self, event_type: EventType) -> bool {
        matches!(
            (self, event_type),
            (Self::Both, _)
                | (Self::Calls, EventType::Call)
                | (Self::Messages, EventType::Message)
        )
    }
}

/// How a rule's active period is defined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleMode {
    #[default]
    Always,
    Duration,
    TimeWindow,
    Custom,
    #[serde(untagged)]
    Other(String),
}

/// Contact scoping for a rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conditions {
    #[serde(default)]
    pub mode: ConditionMode,
    /// When set, the rule only ever matches this one contact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_contact_phone: Option<String>,
    /// Display name for the scoped contact. Informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_contact_name: Option<String>,
    /// Intent labels the message must carry for the rule to fire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_intents: Option<Vec<String>>,
}

/// Action parameters: where to route, what to reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferDetails {
    #[serde(default)]
    pub mode: TransferMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_reply_message: Option<String>,
    /// Message priority gate for forwarding: "all", "important", "urgent" or "none".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_filter: Option<String>,
}

/// Recurring daily window, e.g. 22:00 to 07:00 every night.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeWindow {
    #[serde(default)]
    pub start_hour: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_minute: Option<u32>,
    #[serde(default)]
    pub end_hour: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_minute: Option<u32>,
    /// Day names ("mon", "tue", ...). Matched on the first three letters.
    #[serde(default)]
    pub days: Vec<String>,
    /// IANA zone the owner authored the window in. Resolved by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    #[serde(default)]
    pub mode: ScheduleMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

/// Opt-in statefulness for auto-reply rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationScope {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: f64,
    /// Intents that continue an active deflection. Empty means any intent.
    #[serde(default)]
    pub related_intents: Vec<String>,
    #[serde(default)]
    pub alternative_responses: Vec<String>,
    /// Intent label → reply. The "default" key is the generic follow-up.
    #[serde(default)]
    pub follow_up_responses: BTreeMap<String, String>,
}

fn default_ttl_hours() -> f64 {
    4.0
}

impl Default for ConversationScope {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_hours: default_ttl_hours(),
            related_intents: Vec::new(),
            alternative_responses: Vec::new(),
            follow_up_responses: BTreeMap::new(),
        }
    }
}

impl ConversationScope {
    /// Whether a follow-up with this intent continues the deflection.
    pub fn is_related(&self, intent: Intent) -> bool {
        self.related_intents.is_empty()
            || self.related_intents.iter().any(|i| i == intent.as_str())
    }
}

/// A user-authored routing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Human-readable label, e.g. "Tell grandma I'm asleep at night".
    #[serde(default)]
    pub rule: String,
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default)]
    pub transfer_details: TransferDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_scope: Option<ConversationScope>,
    /// Creation instant; anchors `duration` schedules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
    true
}

impl Rule {
    /// The conversation scope, if present and switched on.
    pub fn enabled_scope(&self) -> Option<&ConversationScope> {
        self.conversation_scope.as_ref().filter(|s| s.enabled)
    }
}

// ── Contact ─────────────────────────────────────────────────────────

/// Result of the external contact lookup for the caller. A lookup that
/// finds nothing is `None`, so a `Contact` value defaults to existing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    #[serde(default = "default_active")]
    pub exists: bool,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub is_blocked: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for Contact {
    fn default() -> Self {
        Self {
            exists: true,
            is_favorite: false,
            is_blocked: false,
            tags: Vec::new(),
        }
    }
}

// ── Inbound event ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Call,
    Message,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Medium,
    High,
}

impl MessagePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// An inbound call or message, already classified upstream for priority
/// and spam/hold status.
///
/// `now` carries the owner's local UTC offset so the schedule evaluator can
/// read the local weekday and hour from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub event_type: EventType,
    pub caller_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub message_priority: MessagePriority,
    #[serde(default)]
    pub is_spam_or_held: bool,
    pub now: DateTime<FixedOffset>,
}

impl InboundEvent {
    /// Message text, if the event carries any non-blank text.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }
}

// ── Decision ────────────────────────────────────────────────────────

/// Outcome of matching an event against a rule set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Decision {
    /// Nothing matched; the caller applies default routing.
    NoMatch,
    /// Drop the event. `rule_id` is absent when the contact itself is blocked.
    Block {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_id: Option<String>,
    },
    AutoReply { rule_id: String, text: String },
    Transfer { rule_id: String, target_phone: String },
    Forward { rule_id: String, target_phone: String },
}

impl Decision {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoMatch => "no_match",
            Self::Block { .. } => "block",
            Self::AutoReply { .. } => "auto_reply",
            Self::Transfer { .. } => "transfer",
            Self::Forward { .. } => "forward",
        }
    }

    /// Id of the rule that produced this decision, if any.
    pub fn rule_id(&self) -> Option<&str> {
        match self {
            Self::NoMatch => None,
            Self::Block { rule_id } => rule_id.as_deref(),
            Self::AutoReply { rule_id, .. }
            | Self::Transfer { rule_id, .. }
            | Self::Forward { rule_id, .. } => Some(rule_id),
        }
    }
}

// ── Conversation state ──────────────────────────────────────────────

/// Identity of a deflection: one per (user, contact, rule).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationKey {
    pub user_id: String,
    /// Normalized last-10-digit suffix.
    pub contact_phone: String,
    pub rule_id: String,
}

impl ConversationKey {
    pub fn new(
        user_id: impl Into<String>,
        contact_phone: impl Into<String>,
        rule_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            contact_phone: contact_phone.into(),
            rule_id: rule_id.into(),
        }
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.user_id, self.contact_phone, self.rule_id)
    }
}

/// Who said a line in the context memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Contact,
    Guard,
}

/// One remembered exchange line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub from: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// An active deflection for one contact under one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub id: Uuid,
    #[serde(flatten)]
    pub key: ConversationKey,
    pub trigger_intent: String,
    pub response_count: u32,
    pub context_memory: Vec<ContextEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConversationState {
    /// Live iff `now < expires_at`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Mutable fields written back on each follow-up.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationUpdate {
    /// The `response_count` this update was computed from. The write only
    /// lands if the stored count still equals it.
    pub expected_count: u32,
    pub response_count: u32,
    pub context_memory: Vec<ContextEntry>,
    pub last_response: String,
}
