//! In-memory store for rules, contacts, and conversation state.
//!
//! Used by tests and by single-process deployments that don't need state to
//! survive a restart. Conversation state sits behind one `Mutex` so the
//! check-and-insert in `create_if_absent` is atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::DatabaseError;
use crate::guard::phone::normalize_phone;
use crate::guard::types::{Contact, ConversationKey, ConversationState, ConversationUpdate, Rule};
use crate::store::traits::{ContactDirectory, ConversationStateStore, RuleRepository};

#[derive(Default)]
pub struct MemoryStore {
    rules: RwLock<HashMap<String, Vec<Rule>>>,
    contacts: RwLock<HashMap<(String, String), Contact>>,
    states: Mutex<HashMap<ConversationKey, ConversationState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a contact under the normalized form of `phone`.
    pub async fn upsert_contact(&self, user_id: &str, phone: &str, contact: Contact) {
        let suffix = normalize_phone(phone);
        if suffix.is_empty() {
            debug!(user_id, "Ignoring contact with unparsable phone");
            return;
        }
        self.contacts
            .write()
            .await
            .insert((user_id.to_string(), suffix), contact);
    }

    /// Number of stored states, live or not.
    pub async fn state_count(&self) -> usize {
        self.states.lock().await.len()
    }
}

#[async_trait]
impl RuleRepository for MemoryStore {
    async fn list_active_rules(&self, user_id: &str) -> Result<Vec<Rule>, DatabaseError> {
        let rules = self.rules.read().await;
        Ok(rules
            .get(user_id)
            .map(|list| list.iter().filter(|r| r.active).cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_rule(&self, rule: &Rule) -> Result<(), DatabaseError> {
        let mut rules = self.rules.write().await;
        let list = rules.entry(rule.user_id.clone()).or_default();
        match list.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule.clone(),
            None => list.push(rule.clone()),
        }
        Ok(())
    }

    async fn delete_rule(&self, user_id: &str, rule_id: &str) -> Result<bool, DatabaseError> {
        let mut rules = self.rules.write().await;
        let Some(list) = rules.get_mut(user_id) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|r| r.id != rule_id);
        Ok(list.len() != before)
    }
}

#[async_trait]
impl ContactDirectory for MemoryStore {
    async fn find_contact(
        &self,
        user_id: &str,
        phone_suffix: &str,
    ) -> Result<Option<Contact>, DatabaseError> {
        let contacts = self.contacts.read().await;
        Ok(contacts
            .get(&(user_id.to_string(), phone_suffix.to_string()))
            .cloned())
    }
}

#[async_trait]
impl ConversationStateStore for MemoryStore {
    async fn get_live(
        &self,
        key: &ConversationKey,
        now: DateTime<Utc>,
    ) -> Result<Option<ConversationState>, DatabaseError> {
        let states = self.states.lock().await;
        Ok(states.get(key).filter(|s| s.is_live(now)).cloned())
    }

    async fn list_live_for_contact(
        &self,
        user_id: &str,
        contact_phone: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConversationState>, DatabaseError> {
        let states = self.states.lock().await;
        let mut live: Vec<ConversationState> = states
            .values()
            .filter(|s| {
                s.key.user_id == user_id && s.key.contact_phone == contact_phone && s.is_live(now)
            })
            .cloned()
            .collect();
        live.sort_by_key(|s| s.created_at);
        Ok(live)
    }

    async fn create_if_absent(
        &self,
        state: &ConversationState,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut states = self.states.lock().await;
        if states.get(&state.key).is_some_and(|s| s.is_live(now)) {
            return Ok(false);
        }
        states.insert(state.key.clone(), state.clone());
        Ok(true)
    }

    async fn update(
        &self,
        key: &ConversationKey,
        update: &ConversationUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut states = self.states.lock().await;
        let current = states
            .get_mut(key)
            .filter(|s| s.is_live(now) && s.response_count == update.expected_count);
        match current {
            Some(state) => {
                state.response_count = update.response_count;
                state.context_memory = update.context_memory.clone();
                state.last_response = Some(update.last_response.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn deactivate(&self, key: &ConversationKey) -> Result<bool, DatabaseError> {
        Ok(self.states.lock().await.remove(key).is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let mut states = self.states.lock().await;
        let before = states.len();
        states.retain(|_, s| s.is_live(now));
        Ok(before - states.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use uuid::Uuid;

    use crate::guard::types::RuleType;

    fn rule(user: &str, id: &str, active: bool) -> Rule {
        Rule {
            id: id.into(),
            user_id: user.into(),
            rule_type: RuleType::Block,
            active,
            rule: String::new(),
            conditions: Default::default(),
            transfer_details: Default::default(),
            schedule: None,
            conversation_scope: None,
            created_at: None,
        }
    }

    fn state(key: &ConversationKey, created: DateTime<Utc>, ttl_hours: i64) -> ConversationState {
        ConversationState {
            id: Uuid::new_v4(),
            key: key.clone(),
            trigger_intent: "location_query".into(),
            response_count: 1,
            context_memory: Vec::new(),
            last_response: None,
            created_at: created,
            expires_at: created + TimeDelta::hours(ttl_hours),
        }
    }

    #[tokio::test]
    async fn rules_keep_insertion_order_and_filter_inactive() {
        let store = MemoryStore::new();
        store.upsert_rule(&rule("u", "a", true)).await.unwrap();
        store.upsert_rule(&rule("u", "b", false)).await.unwrap();
        store.upsert_rule(&rule("u", "c", true)).await.unwrap();
        store.upsert_rule(&rule("other", "x", true)).await.unwrap();

        let ids: Vec<String> = store
            .list_active_rules("u")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn upsert_replaces_in_place() {
        let store = MemoryStore::new();
        store.upsert_rule(&rule("u", "a", true)).await.unwrap();
        store.upsert_rule(&rule("u", "b", true)).await.unwrap();
        let mut edited = rule("u", "a", true);
        edited.rule = "edited".into();
        store.upsert_rule(&edited).await.unwrap();

        let rules = store.list_active_rules("u").await.unwrap();
        assert_eq!(rules[0].rule, "edited");
        assert_eq!(rules[1].id, "b");
        assert!(store.delete_rule("u", "a").await.unwrap());
        assert!(!store.delete_rule("u", "a").await.unwrap());
    }

    #[tokio::test]
    async fn contacts_are_keyed_by_suffix() {
        let store = MemoryStore::new();
        let contact = Contact {
            exists: true,
            is_favorite: true,
            ..Default::default()
        };
        store.upsert_contact("u", "+1 (555) 123-4567", contact.clone()).await;
        assert_eq!(
            store.find_contact("u", "5551234567").await.unwrap(),
            Some(contact)
        );
        assert_eq!(store.find_contact("other", "5551234567").await.unwrap(), None);
    }

    #[tokio::test]
    async fn create_if_absent_respects_live_state() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let key = ConversationKey::new("u", "5551234567", "r");

        assert!(store.create_if_absent(&state(&key, now, 8), now).await.unwrap());
        assert!(!store.create_if_absent(&state(&key, now, 8), now).await.unwrap());

        // After expiry the key is free again.
        let later = now + TimeDelta::hours(9);
        assert!(store.get_live(&key, later).await.unwrap().is_none());
        assert!(store.create_if_absent(&state(&key, later, 8), later).await.unwrap());
        assert_eq!(store.state_count().await, 1);
    }

    #[tokio::test]
    async fn update_requires_expected_count() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let key = ConversationKey::new("u", "5551234567", "r");
        store.create_if_absent(&state(&key, now, 8), now).await.unwrap();

        let stale = ConversationUpdate {
            expected_count: 2,
            response_count: 3,
            context_memory: Vec::new(),
            last_response: "stale".into(),
        };
        assert!(!store.update(&key, &stale, now).await.unwrap());

        let current = ConversationUpdate {
            expected_count: 1,
            response_count: 2,
            context_memory: Vec::new(),
            last_response: "fresh".into(),
        };
        assert!(store.update(&key, &current, now).await.unwrap());
        // The same write computed from count 1 no longer applies.
        assert!(!store.update(&key, &current, now).await.unwrap());

        let live = store.get_live(&key, now).await.unwrap().unwrap();
        assert_eq!(live.response_count, 2);
        assert_eq!(live.last_response.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let old = ConversationKey::new("u", "5551234567", "old");
        let fresh = ConversationKey::new("u", "5551234567", "fresh");
        store
            .create_if_absent(&state(&old, now - TimeDelta::hours(10), 8), now)
            .await
            .unwrap();
        store.create_if_absent(&state(&fresh, now, 8), now).await.unwrap();

        assert_eq!(store.purge_expired(now).await.unwrap(), 1);
        let live = store.list_live_for_contact("u", "5551234567", now).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].key.rule_id, "fresh");
    }
}
