//! # API Module
//!
//! The ask flow: turn a natural-language question about the user's finances
//! into an answer by embedding the question, retrieving the most similar
//! transactions from both tiers, assembling a token-budgeted context block,
//! and calling an OpenAI-compatible chat endpoint.
//!
//! The language model is an external collaborator; this module only builds
//! prompts, streams/fetches completions, and persists the turn to the session
//! database when a session is active.

use crate::{
    config::LedgerSageConfig,
    embedding::Embedder,
    retrieval::{RetrievalService, ScoredTransaction, TimeRange},
    session_messages::SessionMessages,
    template::ChatTemplate,
};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, CreateChatCompletionRequestArgs, Role,
    },
};
use crossterm::{
    ExecutableCommand,
    style::{Attribute, Color, SetAttribute, SetForegroundColor},
};
use futures::StreamExt;
use std::{
    error::Error,
    io::{Write, stdout},
};
use tiktoken_rs::cl100k_base;
use tracing::{debug, error};

/// Creates a new OpenAI API client from configuration.
fn create_client(config: &LedgerSageConfig) -> Result<Client<OpenAIConfig>, Box<dyn Error>> {
    let openai_config = OpenAIConfig::new()
        .with_api_key(config.api_key.clone())
        .with_api_base(config.api_base.clone());
    debug!("Client created with config: {:?}", openai_config);
    Ok(Client::with_config(openai_config))
}

/// Render one retrieved transaction as a context line.
fn format_hit(hit: &ScoredTransaction) -> String {
    let txn = &hit.transaction;
    let kind = if txn.is_income() { "income" } else { "expense" };
    let category = txn
        .classified_category
        .as_deref()
        .unwrap_or(txn.category.as_str());
    format!(
        "- {} | {} | ${:.2} {} | {} | similarity {:.3} ({})",
        txn.date,
        txn.merchant,
        txn.amount.abs(),
        kind,
        category,
        hit.similarity,
        hit.search_method,
    )
}

/// Assemble the retrieved-transactions block, spending at most `max_tokens`.
///
/// Hits arrive best-first from the retrieval service, so breaking at the
/// budget drops the weakest matches.
fn build_context_block(hits: &[ScoredTransaction], max_tokens: isize) -> String {
    if hits.is_empty() {
        return "No matching transactions were found for this question.".to_string();
    }

    let bpe = cl100k_base().unwrap();
    let header = "Relevant transactions, most similar first:";
    let mut used = bpe.encode_with_special_tokens(header).len() as isize;
    let mut lines = vec![header.to_string()];

    for hit in hits {
        let line = format_hit(hit);
        let cost = bpe.encode_with_special_tokens(&line).len() as isize;
        if used + cost > max_tokens {
            debug!("context budget reached; dropping remaining hits");
            break;
        }
        used += cost;
        lines.push(line);
    }

    lines.join("\n")
}

/// Streams the assistant's response and prints it to the console with
/// formatting, returning the collected text.
async fn stream_response(
    client: &Client<OpenAIConfig>,
    model: String,
    session_messages: &mut SessionMessages,
    config: &LedgerSageConfig,
) -> Result<String, Box<dyn Error>> {
    let request = build_request(model, session_messages, config)?;
    debug!("Sending request: {:?}", request);

    let mut response_string = String::new();

    let mut stream = client.chat().create_stream(request).await?;
    let mut lock = stdout().lock();
    let mut stdout = std::io::stdout();
    stdout.execute(SetForegroundColor(Color::Blue))?;
    stdout.execute(SetAttribute(Attribute::Bold))?;

    while let Some(result) = stream.next().await {
        match result {
            Ok(response) => {
                response.choices.iter().for_each(|chat_choice| {
                    if let Some(ref content) = chat_choice.delta.content {
                        response_string.push_str(content);
                        write!(lock, "{content}").unwrap();
                    }
                });
            }
            Err(err) => {
                error!("Received error: {}", err);
                writeln!(lock, "error: {err}").unwrap();
            }
        }
        stdout.flush()?;
    }

    stdout.execute(SetAttribute(Attribute::Reset))?;
    stdout.execute(SetForegroundColor(Color::Reset))?;
    writeln!(lock)?;

    drop(lock);

    Ok(response_string)
}

/// Fetch the assistant's response in one round trip (no streaming).
async fn fetch_response(
    client: &Client<OpenAIConfig>,
    model: String,
    session_messages: &mut SessionMessages,
    config: &LedgerSageConfig,
) -> Result<String, Box<dyn Error>> {
    let request = build_request(model, session_messages, config)?;
    debug!("Sending request: {:?}", request);

    let response = client.chat().create(request).await?;

    let mut response_string = String::new();
    response.choices.iter().for_each(|chat_choice| {
        if let Some(message_text) = chat_choice.message.content.clone() {
            response_string.push_str(&message_text);
        }
    });

    Ok(response_string)
}

fn build_request(
    model: String,
    session_messages: &mut SessionMessages,
    config: &LedgerSageConfig,
) -> Result<async_openai::types::chat::CreateChatCompletionRequest, Box<dyn Error>> {
    // Eject the oldest turns until the prompt fits the context budget.
    while session_messages.should_eject_message()
        && !session_messages.conversation_messages.is_empty()
    {
        session_messages.conversation_messages.remove(0);
    }

    let full_conversation: Vec<ChatCompletionRequestMessage> = session_messages
        .preamble_messages
        .iter()
        .cloned()
        .chain(session_messages.conversation_messages.iter().cloned())
        .collect();

    Ok(CreateChatCompletionRequestArgs::default()
        .max_tokens(config.context_max_tokens)
        .model(model)
        .stop(config.stop_words.clone())
        .messages(full_conversation)
        .build()?)
}

/// Answer one question against the transaction store.
///
/// Embeds the question, retrieves `retrieval_top_k` similar transactions
/// across both tiers, builds the preamble (template system prompt + context
/// block), and calls the model. When `config.session_name` is set, the user
/// and assistant turns are persisted to the session database.
pub async fn ask(
    config: &LedgerSageConfig,
    question: String,
    template: &ChatTemplate,
    service: &RetrievalService,
    embedder: &dyn Embedder,
) -> Result<String, Box<dyn Error>> {
    let client = create_client(config)?;

    let query_vector = embedder.embed(&question)?;
    let hits = service.search(&query_vector, config.retrieval_top_k, TimeRange::All)?;
    debug!("retrieved {} transaction(s) for context", hits.len());

    let mut session_messages = SessionMessages::new(config.clone());
    let context_budget = (config.context_max_tokens as isize) / 2;
    let context_block = build_context_block(&hits, context_budget);

    session_messages.preamble_messages = vec![
        SessionMessages::serialize_chat_completion_message(
            Role::System,
            template.system_prompt.clone(),
        ),
        SessionMessages::serialize_chat_completion_message(Role::System, context_block),
    ];

    // Carry prior turns when a session is active.
    if config.session_name.is_some() {
        if let Ok(conversation) = session_messages.query_conversation() {
            let prior = session_messages.query_conversation_messages(&conversation)?;
            for msg in prior {
                let role = SessionMessages::string_to_role(&msg.role);
                session_messages
                    .conversation_messages
                    .push(SessionMessages::serialize_chat_completion_message(
                        role,
                        msg.content,
                    ));
            }
        }
    }

    let decorated = template.decorate_question(&question);
    session_messages
        .conversation_messages
        .push(SessionMessages::serialize_chat_completion_message(
            Role::User,
            decorated.clone(),
        ));

    let answer = match config.should_stream {
        Some(true) => {
            stream_response(&client, config.model.clone(), &mut session_messages, config).await?
        }
        _ => fetch_response(&client, config.model.clone(), &mut session_messages, config).await?,
    };

    if config.session_name.is_some() {
        let _ = session_messages.insert_message("user".to_string(), decorated);
        let _ = session_messages.insert_message("assistant".to_string(), answer.clone());
    }

    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{IndexTier, Transaction};
    use httpmock::prelude::*;
    use serde_json::json;

    fn setup() {
        let _ = tracing_subscriber::fmt::try_init();
    }

    fn mock_config(api_base: &str) -> LedgerSageConfig {
        LedgerSageConfig {
            api_key: "mock_api_key".to_string(),
            api_base: api_base.to_string(),
            model: "mock_model".to_string(),
            context_max_tokens: 8192,
            retrieval_top_k: 5,
            embedding_dimension: 4,
            stop_words: vec![],
            session_db_url: ":memory:".to_string(),
            session_name: None,
            should_stream: Some(false),
            profile: "test".to_string(),
            data_dir: None,
        }
    }

    fn scored(id: &str, similarity: f32) -> ScoredTransaction {
        ScoredTransaction {
            transaction: Transaction::new(id, "Blue Bottle", 4.5, "2025-06-01", "Food"),
            similarity,
            search_method: IndexTier::Exact,
        }
    }

    #[tokio::test]
    async fn test_create_client() {
        setup();
        let config = mock_config("http://mock.api.base");
        let client = create_client(&config);
        assert!(client.is_ok(), "Failed to create client");
    }

    #[test]
    fn context_block_keeps_best_hits_within_budget() {
        setup();
        let hits: Vec<ScoredTransaction> = (0..50)
            .map(|i| scored(&format!("t{i}"), 1.0 - i as f32 / 100.0))
            .collect();

        let block = build_context_block(&hits, 120);
        assert!(block.starts_with("Relevant transactions"));
        // The best hit survives, the tail is trimmed.
        assert!(block.contains("similarity 1.000"));
        assert!(block.lines().count() < 51);
    }

    #[test]
    fn context_block_reports_empty_retrieval() {
        let block = build_context_block(&[], 1000);
        assert!(block.contains("No matching transactions"));
    }

    #[tokio::test]
    async fn fetch_response_parses_mocked_completion() {
        setup();
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 1700000000,
                "model": "mock_model",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "You spent $42 on coffee."},
                    "finish_reason": "stop",
                    "logprobs": null
                }],
                "usage": {"prompt_tokens": 10, "completion_tokens": 8, "total_tokens": 18}
            }));
        });

        let config = mock_config(&server.url("/v1"));
        let client = create_client(&config).unwrap();
        let mut session_messages = SessionMessages::new(config.clone());
        session_messages.conversation_messages.push(
            SessionMessages::serialize_chat_completion_message(
                Role::User,
                "How much on coffee?".into(),
            ),
        );

        let answer = fetch_response(&client, config.model.clone(), &mut session_messages, &config)
            .await
            .unwrap();

        mock.assert();
        assert_eq!(answer, "You spent $42 on coffee.");
    }
}
