//! Conversation-scoped deflection.
//!
//! An auto-reply rule with an enabled conversation scope remembers that it
//! already answered a contact. Per `(user, contact, rule)` the state moves
//! `ABSENT -> ACTIVE -> ABSENT`: the first qualifying message creates it and
//! gets the rule's main message, related follow-ups within the TTL get
//! intent-specific replies, and once `expires_at` passes the key reads as
//! absent again. `expires_at` is fixed when the state is created.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, GuardError};
use crate::guard::intent::{Intent, classify_intent};
use crate::guard::phone::normalize_phone;
use crate::guard::schedule::hours_to_delta;
use crate::guard::types::{
    ContextEntry, ConversationKey, ConversationScope, ConversationState, ConversationUpdate, Rule,
    Speaker,
};
use crate::store::ConversationStateStore;

/// Default cap on remembered context lines per state.
pub const DEFAULT_CONTEXT_MEMORY_LIMIT: usize = 50;

/// Attempts at the read-then-write cycle before giving up on a key that
/// keeps changing underneath us. A lost write means another follow-up on
/// the same key landed, so this bounds how many can pile up at once.
const MAX_ATTEMPTS: usize = 16;

/// The reply chosen for one auto-reply match.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeflectionReply {
    /// True only for the call that created the state.
    pub created: bool,
    pub reply_text: String,
    pub intent: Intent,
    /// Replies sent within the current deflection, 0 when stateless.
    pub response_count: u32,
}

pub struct DeflectionManager {
    store: Arc<dyn ConversationStateStore>,
    memory_limit: usize,
    timeout: Duration,
}

impl DeflectionManager {
    pub fn new(store: Arc<dyn ConversationStateStore>, memory_limit: usize, timeout: Duration) -> Self {
        Self {
            store,
            memory_limit: memory_limit.max(1),
            timeout,
        }
    }

    /// Pick the reply for `message` from `contact_phone` under an auto-reply
    /// `rule`, creating or advancing the conversation state as needed.
    pub async fn resolve_reply(
        &self,
        rule: &Rule,
        user_id: &str,
        contact_phone: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<DeflectionReply, GuardError> {
        let main = rule
            .transfer_details
            .auto_reply_message
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| GuardError::InvalidRule {
                rule_id: rule.id.clone(),
                reason: "auto-reply rule has no autoReplyMessage".into(),
            })?;
        let intent = classify_intent(message);

        let Some(scope) = rule.enabled_scope() else {
            return Ok(stateless(main, intent));
        };
        let contact = normalize_phone(contact_phone);
        if contact.is_empty() {
            debug!(rule_id = %rule.id, "No usable caller number, replying without state");
            return Ok(stateless(main, intent));
        }
        let ttl = hours_to_delta(scope.ttl_hours).ok_or_else(|| GuardError::InvalidRule {
            rule_id: rule.id.clone(),
            reason: format!("invalid ttlHours {}", scope.ttl_hours),
        })?;

        let key = ConversationKey::new(user_id, contact, rule.id.as_str());
        let turn = Turn {
            scope,
            main,
            message,
            intent,
            now,
        };

        for _ in 0..MAX_ATTEMPTS {
            let live = self.guarded("get_live", self.store.get_live(&key, now)).await?;
            let outcome = match live {
                Some(state) => self.follow_up(&key, state, &turn).await?,
                None => {
                    let state = self.fresh_state(&key, &turn, now + ttl);
                    self.create(state, &turn).await?
                }
            };
            if let Some(reply) = outcome {
                return Ok(reply);
            }
        }

        warn!(key = %key, "Conversation state kept changing, replying with main message");
        Ok(stateless(main, intent))
    }

    /// End a deflection before its TTL runs out.
    pub async fn end_deflection(&self, key: &ConversationKey) -> Result<bool, GuardError> {
        let removed = self.guarded("deactivate", self.store.deactivate(key)).await?;
        if removed {
            info!(key = %key, "Deflection ended early");
        }
        Ok(removed)
    }

    async fn create(
        &self,
        state: ConversationState,
        turn: &Turn<'_>,
    ) -> Result<Option<DeflectionReply>, GuardError> {
        let created = self
            .guarded("create_if_absent", self.store.create_if_absent(&state, turn.now))
            .await?;
        if !created {
            debug!(key = %state.key, "Lost create race, re-reading state");
            return Ok(None);
        }
        info!(
            key = %state.key,
            intent = %turn.intent,
            expires_at = %state.expires_at,
            "Deflection started"
        );
        Ok(Some(DeflectionReply {
            created: true,
            reply_text: turn.main.to_string(),
            intent: turn.intent,
            response_count: state.response_count,
        }))
    }

    async fn follow_up(
        &self,
        key: &ConversationKey,
        state: ConversationState,
        turn: &Turn<'_>,
    ) -> Result<Option<DeflectionReply>, GuardError> {
        if !turn.scope.is_related(turn.intent) {
            debug!(key = %key, intent = %turn.intent, "Unrelated intent, state left as is");
            return Ok(Some(DeflectionReply {
                created: false,
                reply_text: turn.main.to_string(),
                intent: turn.intent,
                response_count: state.response_count,
            }));
        }

        let response_count = state.response_count.saturating_add(1);
        let reply_text = follow_up_text(turn.scope, turn.intent, response_count, turn.main);

        let mut context_memory = state.context_memory;
        context_memory.push(ContextEntry {
            from: Speaker::Contact,
            text: turn.message.to_string(),
            at: turn.now,
        });
        context_memory.push(ContextEntry {
            from: Speaker::Guard,
            text: reply_text.clone(),
            at: turn.now,
        });
        self.cap_memory(&mut context_memory);

        let update = ConversationUpdate {
            expected_count: state.response_count,
            response_count,
            context_memory,
            last_response: reply_text.clone(),
        };
        let applied = self
            .guarded("update", self.store.update(key, &update, turn.now))
            .await?;
        if !applied {
            debug!(key = %key, "State changed or expired mid-update, re-reading");
            return Ok(None);
        }

        debug!(key = %key, intent = %turn.intent, response_count, "Deflection follow-up");
        Ok(Some(DeflectionReply {
            created: false,
            reply_text,
            intent: turn.intent,
            response_count,
        }))
    }

    fn fresh_state(
        &self,
        key: &ConversationKey,
        turn: &Turn<'_>,
        expires_at: DateTime<Utc>,
    ) -> ConversationState {
        let mut context_memory = Vec::with_capacity(2);
        if !turn.message.trim().is_empty() {
            context_memory.push(ContextEntry {
                from: Speaker::Contact,
                text: turn.message.to_string(),
                at: turn.now,
            });
        }
        context_memory.push(ContextEntry {
            from: Speaker::Guard,
            text: turn.main.to_string(),
            at: turn.now,
        });

        self.cap_memory(&mut context_memory);

        ConversationState {
            id: Uuid::new_v4(),
            key: key.clone(),
            trigger_intent: turn.intent.as_str().to_string(),
            response_count: 1,
            context_memory,
            last_response: Some(turn.main.to_string()),
            created_at: turn.now,
            expires_at,
        }
    }

    /// Keep only the newest `memory_limit` entries.
    fn cap_memory(&self, memory: &mut Vec<ContextEntry>) {
        if memory.len() > self.memory_limit {
            let excess = memory.len() - self.memory_limit;
            memory.drain(..excess);
        }
    }

    async fn guarded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, DatabaseError>>,
    ) -> Result<T, GuardError> {
        with_storage_timeout(operation, self.timeout, fut).await
    }
}

/// Run a store call under `timeout`, mapping every failure to a storage error.
pub(crate) async fn with_storage_timeout<T>(
    operation: &'static str,
    timeout: Duration,
    fut: impl Future<Output = Result<T, DatabaseError>>,
) -> Result<T, GuardError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            warn!(operation, "Storage call failed: {e}");
            Err(GuardError::storage(operation, e))
        }
        Err(_) => {
            warn!(operation, timeout_ms = timeout.as_millis() as u64, "Storage call timed out");
            Err(GuardError::timed_out(operation, timeout))
        }
    }
}

/// Inputs shared by the create and follow-up paths of one call.
struct Turn<'a> {
    scope: &'a ConversationScope,
    main: &'a str,
    message: &'a str,
    intent: Intent,
    now: DateTime<Utc>,
}

fn stateless(main: &str, intent: Intent) -> DeflectionReply {
    DeflectionReply {
        created: false,
        reply_text: main.to_string(),
        intent,
        response_count: 0,
    }
}

/// Reply precedence for a follow-up: the intent's own response, then the
/// rotating alternatives, then the generic follow-up, then the main message.
fn follow_up_text(scope: &ConversationScope, intent: Intent, response_count: u32, main: &str) -> String {
    if let Some(text) = scope.follow_up_responses.get(intent.as_str()) {
        return text.clone();
    }
    if !scope.alternative_responses.is_empty() {
        let idx = response_count as usize % scope.alternative_responses.len();
        return scope.alternative_responses[idx].clone();
    }
    scope
        .follow_up_responses
        .get("default")
        .cloned()
        .unwrap_or_else(|| main.to_string())
}

/// Spawn a background task that periodically purges expired states.
///
/// Reads already ignore expired rows; this only keeps the store small.
pub fn spawn_expiry_sweep(
    store: Arc<dyn ConversationStateStore>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match store.purge_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "Purged expired conversation states"),
                Err(e) => warn!("Conversation state sweep failed: {e}"),
            }
        }
    })
}
