//! # Ledger Sage (library root)
//!
//! Core plumbing for the **Ledger Sage** personal-finance assistant:
//! - Dual-tier transaction retrieval (`tier`, `retrieval`): an exact
//!   brute-force index over the current month and an approximate HNSW index
//!   over history, with routing, cross-tier ranking, persistence, and
//!   month-boundary migration.
//! - Embeddings (`embedding`): all-MiniLM-L6-v2 sentence vectors via Candle.
//! - Ingestion helpers (`transaction`, `classifier`): typed records, keyword
//!   categorization, and embedding-text generation.
//! - Chat glue (`api`, `session_messages`, `template`): retrieval-augmented
//!   question answering against an OpenAI-compatible endpoint, with the
//!   conversation persisted to SQLite.
//! - Configuration & CLI (`config`, `commands`, `models`, `schema`).
//!
//! The binary (`sage`) wires these together; the library is usable on its own
//! by constructing a [`retrieval::RetrievalService`] and an
//! [`embedding::Embedder`] explicitly — there are no global instances.

use directories::ProjectDirs;
use std::error::Error;

pub mod api;
pub mod classifier;
pub mod commands;
pub mod config;
pub mod embedding;
pub mod models;
pub mod retrieval;
pub mod schema;
pub mod session_messages;
pub mod template;
pub mod tier;
pub mod transaction;

/// Return the per-platform configuration directory used by Ledger Sage.
///
/// Uses [`directories::ProjectDirs`] with the application triple
/// `("com", "ledger-sage", "sage")`, so you get the right place on each OS
/// (e.g., `~/.config/sage` on Linux via XDG).
///
/// The directory is **not** created by this function; callers that need it
/// should create it with `fs::create_dir_all`.
///
/// # Errors
/// Returns an error if the platform configuration directory cannot be
/// determined (rare, but possible in heavily sandboxed environments).
pub fn config_dir() -> Result<std::path::PathBuf, Box<dyn Error>> {
    let proj_dirs = ProjectDirs::from("com", "ledger-sage", "sage")
        .ok_or("Unable to determine config directory")?;
    let config_dir = proj_dirs.config_dir().to_path_buf();

    Ok(config_dir)
}
