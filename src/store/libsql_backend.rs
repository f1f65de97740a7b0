//! libSQL backend for rules, contacts, and conversation state.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 UTC strings so SQL text comparison orders them
//! correctly.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GuardConfig;
use crate::error::DatabaseError;
use crate::guard::phone::normalize_phone;
use crate::guard::types::{
    Contact, ContextEntry, ConversationKey, ConversationState, ConversationUpdate, Rule,
};
use crate::store::migrations;
use crate::store::traits::{ContactDirectory, ConversationStateStore, RuleRepository};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    /// Validate `config` and open the database it names.
    pub async fn open(config: &GuardConfig) -> crate::error::Result<Self> {
        config.validate()?;
        let backend = if config.is_memory_db() {
            Self::new_memory().await?
        } else {
            Self::new_local(&config.db_path).await?
        };
        Ok(backend)
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Store a contact under the normalized form of `phone`.
    pub async fn upsert_contact(
        &self,
        user_id: &str,
        phone: &str,
        contact: &Contact,
    ) -> Result<(), DatabaseError> {
        let suffix = normalize_phone(phone);
        if suffix.is_empty() {
            debug!(user_id, "Ignoring contact with unparsable phone");
            return Ok(());
        }
        let body = serde_json::to_string(contact)
            .map_err(|e| DatabaseError::Serialization(format!("contact: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO contacts (user_id, phone_suffix, body) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, phone_suffix) DO UPDATE SET body = excluded.body",
                params![user_id, suffix, body],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_contact: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format for every stored instant.
fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn memory_to_json(entries: &[ContextEntry]) -> Result<String, DatabaseError> {
    serde_json::to_string(entries)
        .map_err(|e| DatabaseError::Serialization(format!("context_memory: {e}")))
}

const STATE_COLUMNS: &str = "id, user_id, contact_phone, rule_id, trigger_intent, response_count, context_memory, last_response, created_at, expires_at";

/// Map a libsql Row to a ConversationState.
fn row_to_state(row: &libsql::Row) -> Result<ConversationState, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("conversation state row: {e}"));

    let id_str: String = row.get(0).map_err(parse)?;
    let memory_json: String = row.get(6).map_err(parse)?;
    let created_str: String = row.get(8).map_err(parse)?;
    let expires_str: String = row.get(9).map_err(parse)?;
    let response_count: i64 = row.get(5).map_err(parse)?;

    let context_memory: Vec<ContextEntry> = serde_json::from_str(&memory_json)
        .map_err(|e| DatabaseError::Serialization(format!("context_memory: {e}")))?;

    Ok(ConversationState {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        key: ConversationKey {
            user_id: row.get(1).map_err(parse)?,
            contact_phone: row.get(2).map_err(parse)?,
            rule_id: row.get(3).map_err(parse)?,
        },
        trigger_intent: row.get(4).map_err(parse)?,
        response_count: u32::try_from(response_count).unwrap_or(u32::MAX),
        context_memory,
        last_response: row.get(7).ok(),
        created_at: parse_datetime(&created_str),
        expires_at: parse_datetime(&expires_str),
    })
}

// ── Rules ───────────────────────────────────────────────────────────

#[async_trait]
impl RuleRepository for LibSqlBackend {
    async fn list_active_rules(&self, user_id: &str) -> Result<Vec<Rule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, body FROM rules WHERE user_id = ?1 AND active = 1 ORDER BY position",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_rules: {e}")))?;

        let mut rules = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row.get(0).unwrap_or_default();
            let body: String = row.get(1).unwrap_or_default();
            match serde_json::from_str::<Rule>(&body) {
                Ok(rule) => rules.push(rule),
                Err(e) => warn!(rule_id = %id, "Skipping unreadable rule row: {e}"),
            }
        }
        Ok(rules)
    }

    async fn upsert_rule(&self, rule: &Rule) -> Result<(), DatabaseError> {
        let body = serde_json::to_string(rule)
            .map_err(|e| DatabaseError::Serialization(format!("rule {}: {e}", rule.id)))?;

        // Existing rules keep their position; new ones go to the end.
        self.conn()
            .execute(
                "INSERT INTO rules (user_id, id, position, active, body, updated_at)
                 VALUES (?1, ?2,
                         (SELECT COALESCE(MAX(position), 0) + 1 FROM rules WHERE user_id = ?1),
                         ?3, ?4, ?5)
                 ON CONFLICT(user_id, id) DO UPDATE SET
                     active = excluded.active,
                     body = excluded.body,
                     updated_at = excluded.updated_at",
                params![
                    rule.user_id.as_str(),
                    rule.id.as_str(),
                    i64::from(rule.active),
                    body,
                    fmt_datetime(&Utc::now())
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_rule: {e}")))?;
        Ok(())
    }

    async fn delete_rule(&self, user_id: &str, rule_id: &str) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "DELETE FROM rules WHERE user_id = ?1 AND id = ?2",
                params![user_id, rule_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_rule: {e}")))?;
        Ok(affected > 0)
    }
}

// ── Contacts ────────────────────────────────────────────────────────

#[async_trait]
impl ContactDirectory for LibSqlBackend {
    async fn find_contact(
        &self,
        user_id: &str,
        phone_suffix: &str,
    ) -> Result<Option<Contact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT body FROM contacts WHERE user_id = ?1 AND phone_suffix = ?2",
                params![user_id, phone_suffix],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_contact: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let body: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("find_contact row parse: {e}")))?;
                let contact = serde_json::from_str(&body)
                    .map_err(|e| DatabaseError::Serialization(format!("contact: {e}")))?;
                Ok(Some(contact))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_contact: {e}"))),
        }
    }
}

// ── Conversation state ──────────────────────────────────────────────

#[async_trait]
impl ConversationStateStore for LibSqlBackend {
    async fn get_live(
        &self,
        key: &ConversationKey,
        now: DateTime<Utc>,
    ) -> Result<Option<ConversationState>, DatabaseError> {
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM conversation_states
             WHERE user_id = ?1 AND contact_phone = ?2 AND rule_id = ?3 AND expires_at > ?4"
        );
        let mut rows = self
            .conn()
            .query(
                &sql,
                params![
                    key.user_id.as_str(),
                    key.contact_phone.as_str(),
                    key.rule_id.as_str(),
                    fmt_datetime(&now)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_live: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_state(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_live: {e}"))),
        }
    }

    async fn list_live_for_contact(
        &self,
        user_id: &str,
        contact_phone: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ConversationState>, DatabaseError> {
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM conversation_states
             WHERE user_id = ?1 AND contact_phone = ?2 AND expires_at > ?3
             ORDER BY created_at"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![user_id, contact_phone, fmt_datetime(&now)])
            .await
            .map_err(|e| DatabaseError::Query(format!("list_live_for_contact: {e}")))?;

        let mut states = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_state(&row) {
                Ok(state) => states.push(state),
                Err(e) => warn!("Skipping conversation state row: {e}"),
            }
        }
        Ok(states)
    }

    async fn create_if_absent(
        &self,
        state: &ConversationState,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let memory = memory_to_json(&state.context_memory)?;

        // The UNIQUE key makes this a single atomic statement: a live row
        // blocks the insert, an expired one is overwritten.
        let affected = self
            .conn()
            .execute(
                "INSERT INTO conversation_states
                     (id, user_id, contact_phone, rule_id, trigger_intent, response_count,
                      context_memory, last_response, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(user_id, contact_phone, rule_id) DO UPDATE SET
                     id = excluded.id,
                     trigger_intent = excluded.trigger_intent,
                     response_count = excluded.response_count,
                     context_memory = excluded.context_memory,
                     last_response = excluded.last_response,
                     created_at = excluded.created_at,
                     expires_at = excluded.expires_at
                 WHERE conversation_states.expires_at <= ?11",
                params![
                    state.id.to_string(),
                    state.key.user_id.as_str(),
                    state.key.contact_phone.as_str(),
                    state.key.rule_id.as_str(),
                    state.trigger_intent.as_str(),
                    i64::from(state.response_count),
                    memory,
                    opt_text(state.last_response.as_deref()),
                    fmt_datetime(&state.created_at),
                    fmt_datetime(&state.expires_at),
                    fmt_datetime(&now)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_if_absent: {e}")))?;
        Ok(affected > 0)
    }

    async fn update(
        &self,
        key: &ConversationKey,
        update: &ConversationUpdate,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let memory = memory_to_json(&update.context_memory)?;
        let affected = self
            .conn()
            .execute(
                "UPDATE conversation_states
                 SET response_count = ?1, context_memory = ?2, last_response = ?3
                 WHERE user_id = ?4 AND contact_phone = ?5 AND rule_id = ?6 AND expires_at > ?7
                   AND response_count = ?8",
                params![
                    i64::from(update.response_count),
                    memory,
                    update.last_response.as_str(),
                    key.user_id.as_str(),
                    key.contact_phone.as_str(),
                    key.rule_id.as_str(),
                    fmt_datetime(&now),
                    i64::from(update.expected_count)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update conversation state: {e}")))?;
        Ok(affected > 0)
    }

    async fn deactivate(&self, key: &ConversationKey) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "DELETE FROM conversation_states
                 WHERE user_id = ?1 AND contact_phone = ?2 AND rule_id = ?3",
                params![
                    key.user_id.as_str(),
                    key.contact_phone.as_str(),
                    key.rule_id.as_str()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("deactivate: {e}")))?;
        Ok(affected > 0)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "DELETE FROM conversation_states WHERE expires_at <= ?1",
                params![fmt_datetime(&now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("purge_expired: {e}")))?;
        Ok(affected as usize)
    }
}
