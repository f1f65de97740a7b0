//! Event dispatch: load rules and contact, match, resolve the reply.
//!
//! `Guard` wires the pure components to the repositories. Every storage call
//! runs under the configured timeout and any failure comes back as a
//! `GuardError`; the engine never degrades to a default action on its own.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::GuardConfig;
use crate::error::GuardError;
use crate::guard::deflection::{DeflectionManager, DeflectionReply, with_storage_timeout};
use crate::guard::intent::{Intent, classify_intent};
use crate::guard::matcher::{match_rules_engaged, rule_applies};
use crate::guard::phone::normalize_phone;
use crate::guard::types::{
    Contact, ConversationKey, Decision, EventType, InboundEvent, Rule, RuleType,
};
use crate::guard::urgent::{UrgentFollowupInput, should_forward_urgent_followup};
use crate::store::{ContactDirectory, ConversationStateStore, RuleRepository};

/// The last direct urgent forward for this caller, as tracked by the
/// dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UrgentAnchor {
    /// RFC 3339 instant of the forward.
    pub at: String,
    /// Destination it went to.
    pub to: String,
}

/// Everything the dispatcher needs to act on one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardOutcome {
    pub decision: Decision,
    /// Present when an auto-reply went through the deflection manager.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deflection: Option<DeflectionReply>,
    /// True when the decision is a forward riding on an earlier urgent one.
    pub urgent_followup: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
}

pub struct Guard {
    rules: Arc<dyn RuleRepository>,
    contacts: Arc<dyn ContactDirectory>,
    states: Arc<dyn ConversationStateStore>,
    deflections: DeflectionManager,
    storage_timeout: Duration,
    urgent_window_ms: i64,
}

impl Guard {
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        contacts: Arc<dyn ContactDirectory>,
        states: Arc<dyn ConversationStateStore>,
        config: &GuardConfig,
    ) -> Self {
        let deflections = DeflectionManager::new(
            states.clone(),
            config.context_memory_limit,
            config.storage_timeout,
        );
        Self {
            rules,
            contacts,
            states,
            deflections,
            storage_timeout: config.storage_timeout,
            urgent_window_ms: config.urgent_followup_window_ms,
        }
    }

    /// End the deflection `rule_id` holds for `contact_phone` before its
    /// TTL runs out. Returns false if there was none.
    pub async fn end_deflection(
        &self,
        user_id: &str,
        contact_phone: &str,
        rule_id: &str,
    ) -> Result<bool, GuardError> {
        let contact = normalize_phone(contact_phone);
        if contact.is_empty() {
            return Ok(false);
        }
        self.deflections
            .end_deflection(&ConversationKey::new(user_id, contact, rule_id))
            .await
    }

    /// Decide what to do with one inbound event for `user_id`.
    pub async fn handle_event(
        &self,
        user_id: &str,
        event: &InboundEvent,
        anchor: Option<&UrgentAnchor>,
    ) -> Result<GuardOutcome, GuardError> {
        let caller = normalize_phone(&event.caller_number);
        let now = event.now.with_timezone(&Utc);

        let contact_lookup = async {
            if caller.is_empty() {
                Ok(None)
            } else {
                self.contacts.find_contact(user_id, &caller).await
            }
        };
        let (rules, contact) = with_storage_timeout(
            "load_rules_and_contact",
            self.storage_timeout,
            try_join(self.rules.list_active_rules(user_id), contact_lookup),
        )
        .await?;

        let intent = match event.event_type {
            EventType::Message => event.text().map(classify_intent),
            EventType::Call => None,
        };
        let engaged = self
            .engaged_rules(user_id, &caller, &rules, intent, now)
            .await?;

        let decision = match_rules_engaged(event, contact.as_ref(), &rules, &event.now, &engaged);
        let mut outcome = GuardOutcome {
            decision: decision.clone(),
            deflection: None,
            urgent_followup: false,
            intent,
        };

        match decision {
            Decision::AutoReply { rule_id, .. } if event.event_type == EventType::Message => {
                if let Some(rule) = rules.iter().find(|r| r.id == rule_id) {
                    let reply = self
                        .deflections
                        .resolve_reply(
                            rule,
                            user_id,
                            &event.caller_number,
                            event.text().unwrap_or_default(),
                            now,
                        )
                        .await?;
                    outcome.decision = Decision::AutoReply {
                        rule_id: rule.id.clone(),
                        text: reply.reply_text.clone(),
                    };
                    outcome.deflection = Some(reply);
                }
            }
            Decision::NoMatch if event.event_type == EventType::Message => {
                if let Some(anchor) = anchor {
                    if let Some(decision) =
                        self.urgent_followup(event, contact.as_ref(), &rules, &caller, anchor, now)
                    {
                        outcome.decision = decision;
                        outcome.urgent_followup = true;
                    }
                }
            }
            _ => {}
        }

        info!(
            user_id,
            caller = %caller,
            event_type = ?event.event_type,
            action = outcome.decision.label(),
            rule_id = outcome.decision.rule_id().unwrap_or("-"),
            urgent_followup = outcome.urgent_followup,
            "Event handled"
        );
        Ok(outcome)
    }

    /// Rules holding a live deflection for this caller whose scope admits
    /// the message's intent.
    async fn engaged_rules(
        &self,
        user_id: &str,
        caller: &str,
        rules: &[Rule],
        intent: Option<Intent>,
        now: DateTime<Utc>,
    ) -> Result<HashSet<String>, GuardError> {
        let Some(intent) = intent else {
            return Ok(HashSet::new());
        };
        if caller.is_empty() || !rules.iter().any(|r| r.enabled_scope().is_some()) {
            return Ok(HashSet::new());
        }

        let live = with_storage_timeout(
            "list_live_for_contact",
            self.storage_timeout,
            self.states.list_live_for_contact(user_id, caller, now),
        )
        .await?;

        let engaged: HashSet<String> = live
            .iter()
            .filter_map(|state| rules.iter().find(|r| r.id == state.key.rule_id))
            .filter(|rule| rule.enabled_scope().is_some_and(|s| s.is_related(intent)))
            .map(|rule| rule.id.clone())
            .collect();
        if !engaged.is_empty() {
            debug!(caller = %caller, rules = ?engaged, "Caller has live deflections");
        }
        Ok(engaged)
    }

    /// First forwarding rule whose urgent window this message still falls in.
    fn urgent_followup(
        &self,
        event: &InboundEvent,
        contact: Option<&Contact>,
        rules: &[Rule],
        caller: &str,
        anchor: &UrgentAnchor,
        now: DateTime<Utc>,
    ) -> Option<Decision> {
        if contact.is_some_and(|c| c.is_blocked) {
            return None;
        }
        let anchor_to = normalize_phone(&anchor.to);

        rules
            .iter()
            .filter(|r| r.active && matches!(r.rule_type, RuleType::Transfer | RuleType::Forward))
            .filter(|r| rule_applies(r, event, contact, caller, &event.now))
            .find_map(|rule| {
                let target = rule
                    .transfer_details
                    .contact_phone
                    .as_deref()
                    .filter(|p| !p.trim().is_empty())?;
                let input = UrgentFollowupInput {
                    priority_filter: rule.transfer_details.priority_filter.clone(),
                    message_priority: Some(event.message_priority.as_str().to_string()),
                    is_spam_or_held: event.is_spam_or_held,
                    now,
                    urgent_followup_window_ms: self.urgent_window_ms,
                    normalized_dest: Some(normalize_phone(target)),
                    anchor_at: Some(anchor.at.clone()),
                    anchor_to: Some(anchor_to.clone()),
                };
                if !should_forward_urgent_followup(&input) {
                    return None;
                }
                debug!(rule_id = %rule.id, "Forwarding as urgent follow-up");
                let rule_id = rule.id.clone();
                let target_phone = target.to_string();
                Some(match rule.rule_type {
                    RuleType::Transfer => Decision::Transfer { rule_id, target_phone },
                    _ => Decision::Forward { rule_id, target_phone },
                })
            })
    }
}
