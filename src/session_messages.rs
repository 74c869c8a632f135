//! # Session messages
//!
//! Chat-session scaffolding for the ask flow: holds the preamble (system
//! prompt + retrieved context) and the rolling conversation, persists turns to
//! SQLite via Diesel, and counts tokens (tiktoken `cl100k_base`) to decide
//! when older turns must be ejected to stay inside the model's context.

use async_openai::types::chat::ChatCompletionRequestAssistantMessage;
use async_openai::types::chat::ChatCompletionRequestAssistantMessageContent;
use async_openai::types::chat::ChatCompletionRequestSystemMessageContent;
use async_openai::types::chat::ChatCompletionRequestUserMessage;
use async_openai::types::chat::ChatCompletionRequestUserMessageContent;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage, Role,
};
use diesel::prelude::*;
use diesel::{Connection, SqliteConnection};
use tiktoken_rs::cl100k_base;

use crate::{
    config::{LedgerSageConfig, establish_connection},
    models::{Conversation, Message},
};

/// Tokens held back from the context budget so the assistant has room to
/// answer.
const ANSWER_RESERVE_TOKENS: isize = 1024;

/// All messages in the current session plus DB connectivity.
pub struct SessionMessages {
    /// System prompt and retrieved-context messages that lead the prompt.
    pub preamble_messages: Vec<ChatCompletionRequestMessage>,

    /// Rolling user/assistant exchange.
    pub conversation_messages: Vec<ChatCompletionRequestMessage>,

    config: LedgerSageConfig,

    sqlite_connection: SqliteConnection,
}

impl SessionMessages {
    /// Create a new `SessionMessages`, connecting to SQLite immediately.
    ///
    /// # Panics
    /// Panics if the SQLite connection cannot be established.
    pub fn new(config: LedgerSageConfig) -> Self {
        Self {
            preamble_messages: Vec::new(),
            conversation_messages: Vec::new(),
            config: config.clone(),
            sqlite_connection: establish_connection(&config.session_db_url),
        }
    }

    /// Build (but do not insert) a DB `Message` row.
    pub fn serialize_chat_message(
        role: String,
        content: String,
        dynamic: bool,
        conversation: &Conversation,
    ) -> Message {
        Message {
            id: None,
            role,
            content,
            dynamic,
            conversation_id: Some(conversation.id.unwrap()),
        }
    }

    /// Convert a `Role` plus content into an OpenAI chat message.
    ///
    /// # Panics
    /// Panics if `role` is not one of `System | User | Assistant`.
    #[allow(deprecated)]
    pub fn serialize_chat_completion_message(
        role: Role,
        content: String,
    ) -> ChatCompletionRequestMessage {
        match role {
            Role::System => {
                ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                    content: ChatCompletionRequestSystemMessageContent::Text(content),
                    name: None,
                })
            }
            Role::User => ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: ChatCompletionRequestUserMessageContent::Text(content),
                name: None,
            }),
            Role::Assistant => {
                ChatCompletionRequestMessage::Assistant(ChatCompletionRequestAssistantMessage {
                    content: Some(ChatCompletionRequestAssistantMessageContent::Text(content)),
                    name: None,
                    refusal: None,
                    audio: None,
                    tool_calls: None,
                    function_call: None,
                })
            }
            other => panic!("Role in message not allowed: {other:?}"),
        }
    }

    /// Insert one `Message` row inside a transaction, returning it with its ID.
    pub fn persist_message(&mut self, message: &Message) -> Result<Message, diesel::result::Error> {
        self.sqlite_connection.transaction(|conn| {
            diesel::insert_into(crate::schema::messages::table)
                .values(message)
                .returning(Message::as_returning())
                .get_result(conn)
        })
    }

    /// Insert a single message into the current conversation.
    pub fn insert_message(
        &mut self,
        role: String,
        content: String,
    ) -> Result<Message, diesel::result::Error> {
        let conversation = self.query_conversation()?;
        let chat_message = Self::serialize_chat_message(role, content, false, &conversation);
        self.persist_message(&chat_message)
    }

    /// Look up the active conversation from `config.session_name`.
    ///
    /// Returns `Err(NotFound)` if no session name is set or no row exists.
    pub fn query_conversation(&mut self) -> Result<Conversation, diesel::result::Error> {
        let a_session_name = match self.config.session_name.as_ref() {
            Some(name) => name.clone(),
            None => return Err(diesel::result::Error::NotFound),
        };

        self.sqlite_connection.transaction(|conn| {
            crate::schema::conversations::table
                .filter(crate::schema::conversations::session_name.eq(a_session_name))
                .first(conn)
        })
    }

    /// All messages belonging to a conversation.
    pub fn query_conversation_messages(
        &mut self,
        conversation: &Conversation,
    ) -> Result<Vec<Message>, diesel::result::Error> {
        self.sqlite_connection.transaction(|conn| {
            crate::schema::messages::table
                .filter(crate::schema::messages::conversation_id.eq(conversation.id))
                .load(conn)
        })
    }

    /// Convert a stored role string back to an OpenAI `Role`.
    ///
    /// # Panics
    /// Panics on any unrecognized role string.
    pub fn string_to_role(role: &str) -> Role {
        match role {
            "system" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            err => panic!("Role in message not allowed: {err}"),
        }
    }

    /// Sum tokens across the textual content of the given messages.
    pub fn count_tokens_in_chat_completion_messages(
        messages: &[ChatCompletionRequestMessage],
    ) -> isize {
        let bpe = cl100k_base().unwrap();
        let mut count: isize = 0;
        for msg in messages {
            let content = match msg {
                ChatCompletionRequestMessage::System(system_message) => {
                    match &system_message.content {
                        ChatCompletionRequestSystemMessageContent::Text(text) => Some(text.clone()),
                        _ => None,
                    }
                }
                ChatCompletionRequestMessage::User(user_message) => match &user_message.content {
                    ChatCompletionRequestUserMessageContent::Text(text) => Some(text.clone()),
                    _ => None,
                },
                ChatCompletionRequestMessage::Assistant(assistant_message) => {
                    match &assistant_message.content {
                        Some(ChatCompletionRequestAssistantMessageContent::Text(text)) => {
                            Some(text.clone())
                        }
                        _ => None,
                    }
                }
                _ => None,
            };

            if let Some(content) = content {
                count += bpe.encode_with_special_tokens(&content).len() as isize;
            }
        }

        count
    }

    /// Token budget available to the prompt: the model context minus the
    /// reserve held for the answer.
    pub fn max_tokens(&self) -> isize {
        self.config.context_max_tokens as isize - ANSWER_RESERVE_TOKENS
    }

    /// Whether the current prompt no longer fits and old turns must go.
    pub fn should_eject_message(&self) -> bool {
        let session_token_count =
            Self::count_tokens_in_chat_completion_messages(&self.preamble_messages)
                + Self::count_tokens_in_chat_completion_messages(&self.conversation_messages);
        tracing::debug!(
            "session tokens: {session_token_count} of {}",
            self.max_tokens()
        );

        session_token_count > self.max_tokens()
    }
}
