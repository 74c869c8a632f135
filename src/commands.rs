//! Command-line interface definitions for the `sage` binary, parsed with
//! `clap`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Represents the parsed command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, propagate_version = true, color = clap::ColorChoice::Always)]
pub struct Cli {
    /// The parsed subcommand and its options.
    #[command(subcommand)]
    pub command: Commands,
}

/// The available subcommands and their options.
#[derive(Subcommand, Debug)]
#[command(about, long_about = None, color = clap::ColorChoice::Always)]
pub enum Commands {
    /// Ask a natural-language question about your transactions.
    #[clap(name = "ask", alias = "a")]
    Ask {
        /// The question to answer from your transaction history.
        question: String,

        /// Prompt template name (under the config dir's templates/ folder).
        #[arg(name = "template", short = 't')]
        template: Option<String>,

        /// Session name for persisted conversation history.
        #[arg(name = "session", short = 's')]
        session: Option<String>,
    },

    /// Ingest transactions from a JSON file: classify, embed, and index them.
    #[clap(name = "ingest", alias = "in")]
    Ingest {
        /// Path to a JSON array of transactions.
        file: PathBuf,
    },

    /// Run a raw similarity search and print the matches.
    Search {
        /// Free-text query to embed and match.
        query: String,

        /// Maximum number of results.
        #[arg(short = 'k', default_value_t = 10)]
        k: usize,

        /// Which tier(s) to consult: current_month, historical, or all.
        #[arg(short = 'r', long = "range", default_value = "all")]
        range: String,
    },

    /// Move aged-out transactions from the current-month index to the
    /// historical index.
    Migrate,

    /// Print tier population counts.
    Stats,

    /// Create the default configuration and prompt template.
    Init,
}
