//! # Database models
//!
//! Diesel structs for the SQLite chat log: named conversations, their
//! messages, and point-in-time snapshots of the runtime settings a
//! conversation ran with. See `crate::schema` for the table definitions.

use diesel::prelude::*;

/// A named chat session grouping messages and config snapshots.
#[derive(Queryable, Identifiable, Insertable, Debug, Selectable)]
#[diesel(table_name = crate::schema::conversations)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Conversation {
    /// Auto-increment primary key (set by the DB on insert).
    #[diesel(deserialize_as = i32)]
    pub id: Option<i32>,
    /// Unique session name for this conversation.
    pub session_name: String,
}

impl Conversation {
    /// Convenience accessor for the assigned primary key.
    #[inline]
    pub fn id(&self) -> Option<i32> {
        self.id
    }
}

/// One turn in a conversation: `"system"`, `"user"`, or `"assistant"`.
///
/// `dynamic` marks messages generated at runtime (retrieved context blocks)
/// versus static template rows.
#[derive(Queryable, Associations, Insertable, Debug, Selectable, Clone)]
#[diesel(belongs_to(Conversation))]
#[diesel(table_name = crate::schema::messages)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Message {
    #[diesel(deserialize_as = i32)]
    pub id: Option<i32>,
    pub role: String,
    pub content: String,
    pub dynamic: bool,
    pub conversation_id: Option<i32>,
}

/// Snapshot of the runtime settings in effect for a conversation.
///
/// A new row is inserted whenever the live config differs from the last
/// snapshot (see [`crate::config::LedgerSageConfig::ensure_conversation_and_config`]).
/// `stop_words` is stored comma-joined; the YAML config holds the real list.
#[derive(Queryable, Associations, Insertable, PartialEq, Debug)]
#[diesel(belongs_to(Conversation))]
#[diesel(table_name = crate::schema::sage_configs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SageConfigRow {
    #[diesel(deserialize_as = i32)]
    pub id: Option<i32>,
    /// Base URL of the OpenAI-compatible endpoint.
    pub api_base: String,
    /// API key/token; may be empty for a local, unsecured backend.
    pub api_key: String,
    /// Model identifier to request from the backend.
    pub model: String,
    /// Maximum tokens for the assistant's response (DB as `i32`).
    pub context_max_tokens: i32,
    /// How many transactions retrieval feeds into the prompt.
    pub retrieval_top_k: i32,
    /// Comma-joined list of stop strings.
    pub stop_words: String,
    /// Foreign key to the owning [`Conversation`].
    pub conversation_id: Option<i32>,
}
