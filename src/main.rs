//! Main module for the Ledger Sage CLI application (sage).
//!
//! Handles command parsing, configuration loading, and initialization, then
//! dispatches to ingestion, search, ask, migration, or stats.
//!
//! # Examples
//!
//! ```sh
//! sage init
//! sage ingest transactions.json
//! sage ask "How much did I spend on coffee this month?"
//! sage migrate
//! ```

use clap::Parser;
use indicatif::ProgressBar;
use ledger_sage::{
    classifier, commands, config,
    config::LedgerSageConfig,
    config_dir,
    embedding::{Embedder, MiniLmEmbedder},
    retrieval::{RetrievalService, SystemClock, TimeRange},
    template,
    transaction::Transaction,
};
use once_cell::sync::OnceCell;
use std::{env, error::Error, fs};
use tracing::{debug, info, warn};

static TRACING: OnceCell<()> = OnceCell::new();

fn main() -> Result<(), Box<dyn Error>> {
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt::init();
    });
    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(run())
}

/// Load configuration, parse arguments, and execute the chosen command.
async fn run() -> Result<(), Box<dyn Error>> {
    let cli = commands::Cli::parse();

    if let commands::Commands::Init = cli.command {
        return init();
    }

    let config_path = match env::var("SAGE_CONFIG") {
        Ok(path) => path.into(),
        Err(_) => config_dir()?.join("config.yaml"),
    };
    debug!("Loading config from: {}", config_path.display());
    let mut sage_config = config::load_config(config_path.to_str().unwrap())?;

    match cli.command {
        commands::Commands::Ask {
            question,
            template,
            session,
        } => {
            if let Some(session_name) = session {
                sage_config
                    .ensure_conversation_and_config(&session_name)
                    .await?;
            }
            let template_name = template.unwrap_or_else(|| "finance_question".to_string());
            let template = template::load_template(&template_name).await?;

            let embedder = MiniLmEmbedder::load()?;
            let service = open_service(&sage_config)?;

            let answer =
                ledger_sage::api::ask(&sage_config, question, &template, &service, &embedder)
                    .await?;
            // Streaming mode already printed token by token.
            if sage_config.should_stream != Some(true) {
                println!("{answer}");
            }
        }
        commands::Commands::Ingest { file } => {
            let raw = fs::read_to_string(&file)?;
            let transactions: Vec<Transaction> = serde_json::from_str(&raw)?;
            info!(
                "ingesting {} transaction(s) from {}",
                transactions.len(),
                file.display()
            );

            let embedder = MiniLmEmbedder::load()?;
            let mut service = open_service(&sage_config)?;

            let total = transactions.len();
            let bar = ProgressBar::new(total as u64);
            let mut items = Vec::new();
            for mut txn in transactions {
                classifier::enrich(&mut txn);
                let text = txn
                    .embedding_text
                    .clone()
                    .expect("enrich always sets embedding_text");
                match embedder.embed(&text) {
                    Ok(vector) => items.push((txn, vector)),
                    Err(e) => warn!("skipping transaction {}: {e}", txn.id),
                }
                bar.inc(1);
            }
            bar.finish_and_clear();

            let inserted = service.insert_many(items)?;
            println!(
                "Ingested {inserted} new transaction(s) ({} duplicates or failures skipped)",
                total - inserted
            );
        }
        commands::Commands::Search { query, k, range } => {
            let range: TimeRange = range.parse()?;
            let embedder = MiniLmEmbedder::load()?;
            let service = open_service(&sage_config)?;

            let query_vector = embedder.embed(&query)?;
            let hits = service.search(&query_vector, k, range)?;
            if hits.is_empty() {
                println!("No matches.");
            }
            for hit in hits {
                let txn = &hit.transaction;
                println!(
                    "{:.3}  {}  {}  ${:.2}  {}  [{}]",
                    hit.similarity,
                    txn.date,
                    txn.merchant,
                    txn.amount.abs(),
                    txn.classified_category
                        .as_deref()
                        .unwrap_or(txn.category.as_str()),
                    hit.search_method,
                );
            }
        }
        commands::Commands::Migrate => {
            let mut service = open_service(&sage_config)?;
            let moved = service.run_migration()?;
            println!("Migrated {moved} transaction(s) to the historical tier");
        }
        commands::Commands::Stats => {
            let service = open_service(&sage_config)?;
            let stats = service.stats();
            println!("Current month (exact index): {}", stats.exact_count);
            println!("Historical (HNSW index):     {}", stats.approximate_count);
            println!("Total:                       {}", stats.total);
        }
        commands::Commands::Init => unreachable!("handled above"),
    }

    Ok(())
}

/// Open the retrieval service for the configured profile, creating the data
/// directory on first use.
fn open_service(config: &LedgerSageConfig) -> Result<RetrievalService, Box<dyn Error>> {
    let data_dir = config.resolved_data_dir()?;
    fs::create_dir_all(&data_dir)?;
    Ok(RetrievalService::open(
        config.embedding_dimension,
        data_dir,
        &config.profile,
        Box::new(SystemClock),
    )?)
}

/// Write the default configuration and prompt template.
fn init() -> Result<(), Box<dyn Error>> {
    let config_dir = config_dir()?;
    let templates_dir = config_dir.join("templates");
    info!("Creating template config directory: {}", templates_dir.display());
    fs::create_dir_all(&templates_dir)?;

    let template_path = templates_dir.join("finance_question.yaml");
    info!("Creating template file: {}", template_path.display());
    let template = template::ChatTemplate {
        system_prompt: "You are Ledger Sage, a personal finance assistant. Answer questions \
                        about the user's spending using only the transactions provided in the \
                        context. Quote amounts and dates exactly; say so when the context does \
                        not contain the answer."
            .to_string(),
        pre_user_message_content: None,
        post_user_message_content: Some("Keep the answer short and concrete.".to_string()),
    };
    let template_yaml = serde_yaml::to_string(&template)?;
    fs::write(template_path, template_yaml)?;

    let config_path = config_dir.join("config.yaml");
    info!("Creating config file: {}", config_path.display());
    let config = LedgerSageConfig {
        api_base: "http://localhost:5001/v1".to_string(),
        api_key: "CHANGEME".to_string(),
        model: "mistral-7b-openorca".to_string(),
        context_max_tokens: 8192,
        retrieval_top_k: 10,
        embedding_dimension: ledger_sage::embedding::EMBEDDING_DIM,
        stop_words: vec![],
        session_db_url: config_dir.join("sage.db").to_string_lossy().into_owned(),
        session_name: None,
        should_stream: Some(true),
        profile: "default".to_string(),
        data_dir: None,
    };
    let config_yaml = serde_yaml::to_string(&config)?;
    fs::write(config_path, config_yaml)?;

    println!("Initialized configuration in {}", config_dir.display());
    Ok(())
}
