//! Rule matching and conversational deflection for calls and SMS.
//!
//! The pure pieces (`phone`, `schedule`, `intent`, `matcher`, `urgent`) take
//! all their inputs as arguments. `deflection` owns conversation state
//! through a `ConversationStateStore`, and `service` ties everything to the
//! repositories.

pub mod deflection;
pub mod intent;
pub mod matcher;
pub mod phone;
pub mod schedule;
pub mod service;
pub mod types;
pub mod urgent;

pub use deflection::{DeflectionManager, DeflectionReply, spawn_expiry_sweep};
pub use intent::{Intent, classify_intent};
pub use matcher::{match_rules, match_rules_engaged};
pub use phone::normalize_phone;
pub use schedule::evaluate_time_window;
pub use service::{Guard, GuardOutcome, UrgentAnchor};
pub use types::{Decision, InboundEvent, Rule};
pub use urgent::{UrgentFollowupInput, should_forward_urgent_followup};
