//! Repository traits the guard consumes.
//!
//! Rules and contacts are owned by external collaborators; the guard only
//! reads them. Conversation state is owned by the deflection manager, and
//! its store must make `create_if_absent` atomic per key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::guard::types::{Contact, ConversationKey, ConversationState, ConversationUpdate, Rule};

/// Ordered per-user rule storage.
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Active rules for a user, in evaluation order.
    async fn list_active_rules(&self, user_id: &str) -> Result<Vec<Rule>, DatabaseError>;

    /// Insert a rule at the end of the user's list, or replace it in place.
    async fn upsert_rule(&self, rule: &Rule) -> Result<(), DatabaseError>;

    /// Remove a rule. Returns false if it did not exist.
    async fn delete_rule(&self, user_id: &str, rule_id: &str) -> Result<bool, DatabaseError>;
}

/// Contact lookup by normalized phone suffix.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn find_contact(
        &self,
        user_id: &str,
        phone_suffix: &str,
    ) -> Result<Option<Contact>, DatabaseError>;
}

/// Deflection state with TTL. Every read filters on `now < expires_at`,
/// whether or not expired rows have been purged yet.
#[async_trait]
pub trait ConversationStateStore: Send + Sync {
    /// The live state for a key, if any.
    async fn get_live(
        &self,
        key: &ConversationKey,
        now: DateTime<Utc>,
    ) -> Result<Option<ConversationState>, DatabaseError>;

    /// All live states a user holds for one contact.
    async fn list_live_for_contact(
        &self,
        user_id: &str,
        contact_phone: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConversationState>, DatabaseError>;

    /// Insert `state` unless a live state already exists for its key.
    /// An expired state under the same key is replaced. Returns whether
    /// this call created the state.
    async fn create_if_absent(
        &self,
        state: &ConversationState,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Apply a follow-up to the live state if its `response_count` still
    /// equals `update.expected_count`. Returns false if no state is live or
    /// another follow-up got there first.
    async fn update(
        &self,
        key: &ConversationKey,
        update: &ConversationUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// End a deflection early. Returns false if nothing was stored.
    async fn deactivate(&self, key: &ConversationKey) -> Result<bool, DatabaseError>;

    /// Physically remove expired states. Returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError>;
}
