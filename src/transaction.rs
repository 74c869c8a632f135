//! # Transaction records
//!
//! The typed representation of one financial event, shared by ingestion,
//! classification, the retrieval tiers, and the chat flow.
//!
//! A [`Transaction`] carries the core fields every collaborator relies on
//! (id, merchant, amount, date, category) plus an open-ended `extra` map for
//! provider-specific metadata (account ids, pending flags, …) so bank feeds
//! can attach whatever they like without loosening the core types.
//!
//! Sign convention for `amount`: negative is income/credit, positive is
//! expense/debit.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;

/// Which similarity index currently owns a record.
///
/// A record belongs to exactly one tier at a time; its `vector_id` is only
/// meaningful inside that tier's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexTier {
    /// Brute-force index holding current-month transactions.
    Exact,
    /// HNSW index holding historical transactions.
    Approximate,
}

impl IndexTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexTier::Exact => "exact",
            IndexTier::Approximate => "approximate",
        }
    }
}

impl fmt::Display for IndexTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One financial event.
///
/// Created when a transaction first enters the system (bank feed, manual
/// entry, or backfill). Append-only: after creation only
/// `classified_category`/`embedding_text` are filled in by the classifier, and
/// `vector_id`/`index_tier` are stamped by the tier that accepts the record
/// (and re-stamped when migration moves it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique, immutable identifier from the upstream feed.
    pub id: String,

    /// Merchant or counterparty name as reported by the feed.
    pub merchant: String,

    /// Signed amount: negative = income/credit, positive = expense/debit.
    pub amount: f64,

    /// Calendar date, ISO 8601 `YYYY-MM-DD`.
    pub date: String,

    /// Raw category label from the feed.
    pub category: String,

    /// Category assigned by the keyword classifier, if it has run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classified_category: Option<String>,

    /// Free-text description that was (or will be) embedded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_text: Option<String>,

    /// Position inside the owning tier's index. Not a global identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_id: Option<usize>,

    /// Tier that currently owns this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_tier: Option<IndexTier>,

    /// Provider-specific extras (account type, pending flag, …).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, JsonValue>,
}

impl Transaction {
    /// Minimal constructor for the core fields; optional fields start empty.
    pub fn new(
        id: impl Into<String>,
        merchant: impl Into<String>,
        amount: f64,
        date: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            merchant: merchant.into(),
            amount,
            date: date.into(),
            category: category.into(),
            classified_category: None,
            embedding_text: None,
            vector_id: None,
            index_tier: None,
            extra: HashMap::new(),
        }
    }

    /// `true` when the amount is a credit (income) under the sign convention.
    pub fn is_income(&self) -> bool {
        self.amount < 0.0
    }

    /// The `(year, month)` of the transaction date, or `None` if the date
    /// string is not valid ISO `YYYY-MM-DD`.
    pub fn year_month(&self) -> Option<(i32, u32)> {
        NaiveDate::parse_from_str(&self.date, "%Y-%m-%d")
            .ok()
            .map(|d| (d.year(), d.month()))
    }
}
