//! Rule matcher: one inbound event, one ordered rule set, one decision.
//!
//! Rules are evaluated in list order and the first rule that fully matches
//! and can produce an action wins. There is no scoring. A rule either
//! passes every gate and yields a decision, or it is skipped as a whole:
//!
//! 0. a blocked contact short-circuits to `Block` before any rule runs
//! 1. event type vs. `transferDetails.mode`
//! 2. schedule
//! 3. source contact scoping (normalized suffix equality)
//! 4. `conditions.mode`
//! 5. trigger intents (waived for rules with a live deflection)
//! 6. priority filter (forward/transfer on messages)
//! 7. action

use std::collections::HashSet;

use chrono::{DateTime, TimeZone};
use tracing::debug;

use crate::guard::intent::{Intent, classify_intent};
use crate::guard::phone::normalize_phone;
use crate::guard::schedule::evaluate_time_window;
use crate::guard::types::{
    ConditionMode, Contact, Decision, EventType, InboundEvent, MessagePriority, Rule, RuleType,
};

/// Match an event against the user's rules.
pub fn match_rules<Tz: TimeZone>(
    event: &InboundEvent,
    contact: Option<&Contact>,
    rules: &[Rule],
    now: &DateTime<Tz>,
) -> Decision {
    match_rules_engaged(event, contact, rules, now, &HashSet::new())
}

/// Match with a set of rule ids that already hold a live, related deflection
/// for this caller. Those rules skip the trigger-intent gate so follow-ups
/// keep flowing to the deflection even when their intent would not trigger
/// the rule from scratch.
pub fn match_rules_engaged<Tz: TimeZone>(
    event: &InboundEvent,
    contact: Option<&Contact>,
    rules: &[Rule],
    now: &DateTime<Tz>,
    engaged: &HashSet<String>,
) -> Decision {
    if contact.is_some_and(|c| c.is_blocked) {
        debug!(caller = %normalize_phone(&event.caller_number), "Caller is a blocked contact");
        return Decision::Block { rule_id: None };
    }

    let caller = normalize_phone(&event.caller_number);
    // Classified lazily, at most once per event.
    let mut intent: Option<Intent> = None;

    for rule in rules.iter().filter(|r| r.active) {
        if !rule_applies(rule, event, contact, &caller, now) {
            continue;
        }

        if let (Some(triggers), Some(text)) = (&rule.conditions.trigger_intents, event.text()) {
            if !engaged.contains(&rule.id) {
                let label = *intent.get_or_insert_with(|| classify_intent(text));
                if !triggers.iter().any(|t| t == label.as_str()) {
                    debug!(rule_id = %rule.id, intent = %label, "Skipping rule: intent not a trigger");
                    continue;
                }
            }
        }

        if matches!(rule.rule_type, RuleType::Transfer | RuleType::Forward)
            && event.event_type == EventType::Message
            && !priority_filter_admits(
                rule.transfer_details.priority_filter.as_deref(),
                event.message_priority,
                event.is_spam_or_held,
            )
        {
            debug!(rule_id = %rule.id, "Skipping rule: priority filter");
            continue;
        }

        match action_for(rule) {
            Some(decision) => {
                debug!(rule_id = %rule.id, action = decision.label(), "Rule matched");
                return decision;
            }
            None => {
                debug!(rule_id = %rule.id, rule_type = ?rule.rule_type, "Matched rule has no dispatchable action");
            }
        }
    }

    Decision::NoMatch
}

/// Gates 1 to 4: event type, schedule, source contact, contact condition.
///
/// `caller` is the caller's normalized number.
pub(crate) fn rule_applies<Tz: TimeZone>(
    rule: &Rule,
    event: &InboundEvent,
    contact: Option<&Contact>,
    caller: &str,
    now: &DateTime<Tz>,
) -> bool {
    if !rule.transfer_details.mode.admits(event.event_type) {
        debug!(rule_id = %rule.id, "Skipping rule: event type not covered");
        return false;
    }

    if let Some(schedule) = &rule.schedule {
        if !evaluate_time_window(schedule, rule.created_at, now) {
            debug!(rule_id = %rule.id, "Skipping rule: schedule inactive");
            return false;
        }
    }

    if let Some(source) = &rule.conditions.source_contact_phone {
        let source = normalize_phone(source);
        if source.is_empty() || source != caller {
            debug!(rule_id = %rule.id, "Skipping rule: scoped to another contact");
            return false;
        }
    }

    if !condition_mode_matches(&rule.conditions.mode, contact) {
        debug!(rule_id = %rule.id, mode = ?rule.conditions.mode, "Skipping rule: contact condition");
        return false;
    }
    true
}

fn condition_mode_matches(mode: &ConditionMode, contact: Option<&Contact>) -> bool {
    match mode {
        ConditionMode::All => true,
        ConditionMode::Favorites => contact.is_some_and(|c| c.is_favorite),
        ConditionMode::Saved => contact.is_some(),
        ConditionMode::Custom | ConditionMode::Other(_) => false,
    }
}

/// Whether a forwarding rule's priority filter lets this message through.
///
/// `important` admits medium and high, `urgent` admits high only, and
/// neither admits spam or held messages. `none` admits nothing.
pub fn priority_filter_admits(
    filter: Option<&str>,
    priority: MessagePriority,
    is_spam_or_held: bool,
) -> bool {
    match filter.map(|f| f.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("all") => true,
        Some("none") => false,
        Some("important") | Some("medium") => {
            priority >= MessagePriority::Medium && !is_spam_or_held
        }
        Some("urgent") | Some("high") | Some("high-priority") => {
            priority == MessagePriority::High && !is_spam_or_held
        }
        Some(_) => false,
    }
}

fn action_for(rule: &Rule) -> Option<Decision> {
    let target = || {
        rule.transfer_details
            .contact_phone
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(str::to_string)
    };
    match rule.rule_type {
        RuleType::Block => Some(Decision::Block {
            rule_id: Some(rule.id.clone()),
        }),
        RuleType::Transfer => target().map(|target_phone| Decision::Transfer {
            rule_id: rule.id.clone(),
            target_phone,
        }),
        RuleType::Forward => target().map(|target_phone| Decision::Forward {
            rule_id: rule.id.clone(),
            target_phone,
        }),
        RuleType::AutoReply => rule
            .transfer_details
            .auto_reply_message
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .map(|text| Decision::AutoReply {
                rule_id: rule.id.clone(),
                text: text.to_string(),
            }),
        RuleType::Priority | RuleType::Custom | RuleType::MessageNotify | RuleType::Other(_) => {
            None
        }
    }
}
