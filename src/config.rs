//! Application configuration: loading, defaults, and the SQLite handshake
//! that pins a conversation to the settings it ran with.
//!
//! Configuration lives in a YAML file (by default under the per-platform
//! config directory, see [`crate::config_dir`]) and is deserialized into
//! [`LedgerSageConfig`]. `sage init` writes a starter file.

use crate::models::*;
use diesel::prelude::*;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::{error::Error, fs};

use tracing::*;

/// Runtime settings for the assistant and the retrieval core.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct LedgerSageConfig {
    /// The API key used to authenticate requests to the API.
    pub api_key: String,

    /// The base URL of the OpenAI-compatible API.
    pub api_base: String,

    /// The name of the model to be used for generating answers.
    pub model: String,

    // The context size of the model.
    pub context_max_tokens: u16,

    /// How many retrieved transactions to offer the model per question.
    #[serde(default = "default_retrieval_top_k")]
    pub retrieval_top_k: usize,

    /// Dimensionality of the embedding vectors (384 for MiniLM-L6).
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,

    // Stop words
    pub stop_words: Vec<String>,

    // Session database url (SQLite)
    pub session_db_url: String,

    // Session name
    #[serde(default)]
    pub session_name: Option<String>,

    // Stream responses token by token
    #[serde(default)]
    pub should_stream: Option<bool>,

    /// Namespace for the on-disk retrieval artifacts.
    #[serde(default = "default_profile")]
    pub profile: String,

    /// Override for the retrieval data directory; defaults to
    /// `config_dir()/data`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_retrieval_top_k() -> usize {
    10
}

fn default_embedding_dimension() -> usize {
    crate::embedding::EMBEDDING_DIM
}

fn default_profile() -> String {
    "default".to_string()
}

impl LedgerSageConfig {
    /// Ensure a conversation row exists for `a_session_name` and that the
    /// latest config snapshot attached to it matches this config, inserting
    /// either as needed. Also records the session name on `self`.
    pub async fn ensure_conversation_and_config(
        &mut self,
        a_session_name: &str,
    ) -> Result<(), Box<dyn Error>> {
        let mut connection = establish_connection(&self.session_db_url);

        connection.transaction(|conn| {
            let existing_conversation = crate::schema::conversations::table
                .filter(crate::schema::conversations::session_name.eq(a_session_name))
                .first(conn)
                .optional()?;

            debug!("existing conversation: {:?}", existing_conversation);

            let conversation = if let Some(conversation) = existing_conversation {
                conversation
            } else {
                let new_conversation = Conversation {
                    id: None,
                    session_name: a_session_name.to_string(),
                };
                diesel::insert_into(crate::schema::conversations::table)
                    .values(&new_conversation)
                    .returning(Conversation::as_returning())
                    .get_result(conn)
                    .expect("Error saving new Conversation!")
            };

            let existing_config: Option<SageConfigRow> = crate::schema::sage_configs::table
                .filter(crate::schema::sage_configs::conversation_id.eq(conversation.id))
                .first(conn)
                .optional()?;

            debug!("existing config snapshot: {:?}", existing_config);

            if existing_config.is_none() || existing_config.unwrap() != *self {
                let new_config = SageConfigRow {
                    id: None,
                    conversation_id: Some(conversation.id().expect("Conversation has no ID!")),
                    api_key: self.api_key.clone(),
                    api_base: self.api_base.clone(),
                    model: self.model.clone(),
                    context_max_tokens: self.context_max_tokens as i32,
                    retrieval_top_k: self.retrieval_top_k as i32,
                    stop_words: self.stop_words.join(","),
                };
                diesel::insert_into(crate::schema::sage_configs::table)
                    .values(&new_config)
                    .execute(conn)?;
            }

            self.session_name = Some(a_session_name.to_string());

            Ok(())
        })
    }

    /// The directory holding the retrieval tiers' persisted artifacts.
    pub fn resolved_data_dir(&self) -> Result<PathBuf, Box<dyn Error>> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(crate::config_dir()?.join("data")),
        }
    }
}

/// Load the configuration from a YAML file.
///
/// # Errors
/// I/O failure reading the file, or YAML that does not deserialize into
/// [`LedgerSageConfig`].
pub fn load_config(file: &str) -> Result<LedgerSageConfig, Box<dyn Error>> {
    let content = fs::read_to_string(file)?;
    let config: LedgerSageConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}

pub fn establish_connection(db_url: &str) -> SqliteConnection {
    SqliteConnection::establish(db_url).unwrap_or_else(|_| panic!("Error connecting to {}", db_url))
}

impl PartialEq<LedgerSageConfig> for SageConfigRow {
    fn eq(&self, other: &LedgerSageConfig) -> bool {
        self.api_base == other.api_base
            && self.api_key == other.api_key
            && self.model == other.model
            && self.context_max_tokens as u16 == other.context_max_tokens
            && self.retrieval_top_k as usize == other.retrieval_top_k
    }
}
