//! Keyword-based transaction classification and embedding-text generation.
//!
//! Bank feeds deliver merchant strings like `"STARBUCKS #1234"` and vague
//! category labels; this module normalizes the merchant, assigns one of a
//! fixed set of spending categories by keyword match, and renders the
//! pipe-delimited text representation that gets embedded.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::transaction::Transaction;

/// Trailing store/location numbers on merchant names (`"#1234"`, `"NO. 55"`).
static STORE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+(?:#|no\.?\s*)?\d{2,}$").unwrap());

/// Category name → keywords that map a transaction into it.
/// Order matters: earlier categories win on a tie.
const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "Food & Dining",
        &["restaurant", "food", "dining", "cafe", "coffee", "pizza", "burger", "fast food"],
    ),
    (
        "Groceries",
        &["grocery", "supermarket", "whole foods", "trader joe", "safeway", "kroger"],
    ),
    (
        "Transportation",
        &["uber", "lyft", "taxi", "gas", "fuel", "parking", "airline", "flight"],
    ),
    (
        "Shopping",
        &["amazon", "walmart", "target", "store", "retail", "adidas", "nike", "clothing"],
    ),
    (
        "Entertainment",
        &["netflix", "spotify", "movie", "theater", "game", "entertainment", "streaming"],
    ),
    (
        "Bills & Utilities",
        &["electric", "water", "internet", "phone", "utility", "cable"],
    ),
    (
        "Health & Fitness",
        &["gym", "fitness", "pharmacy", "doctor", "medical", "health", "cvs", "walgreens"],
    ),
    (
        "Credit Cards",
        &["credit card", "cc payment", "card payment"],
    ),
    (
        "EMI & Loans",
        &["emi", "loan", "installment", "mortgage"],
    ),
    (
        "Income",
        &["salary", "deposit", "paycheck", "income", "refund", "interest earned"],
    ),
    (
        "Fun & Leisure",
        &["fun", "hobby", "recreation", "vacation", "travel", "hotel"],
    ),
];

const FALLBACK_CATEGORY: &str = "Other";

/// Strip trailing store numbers and collapse whitespace.
pub fn normalize_merchant(raw: &str) -> String {
    let stripped = STORE_NUMBER.replace(raw.trim(), "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Assign a spending category from merchant/category keywords.
///
/// Credits are always `Income`; loan-ish merchants are split between
/// `Credit Cards` and `EMI & Loans` before the general keyword scan runs.
pub fn classify(txn: &Transaction) -> &'static str {
    if txn.is_income() {
        return "Income";
    }

    let merchant = txn.merchant.to_lowercase();
    if ["emi", "loan", "mortgage", "payment"]
        .iter()
        .any(|kw| merchant.contains(kw))
    {
        if merchant.contains("credit card") {
            return "Credit Cards";
        }
        return "EMI & Loans";
    }

    let haystack = format!("{} {}", merchant, txn.category.to_lowercase());
    for (name, keywords) in CATEGORY_KEYWORDS {
        if keywords.iter().any(|kw| haystack.contains(kw)) {
            return name;
        }
    }

    FALLBACK_CATEGORY
}

/// Render the text representation that gets embedded.
///
/// Every field a question might reference is spelled out, so "how much did I
/// spend on coffee in June" can match on merchant, amount, type, and date.
pub fn embedding_text(txn: &Transaction) -> String {
    let kind = if txn.is_income() {
        "income/credit"
    } else {
        "expense/debit"
    };

    let mut parts = vec![
        format!("Transaction ID: {}", txn.id),
        format!("Merchant: {}", normalize_merchant(&txn.merchant)),
        format!("Amount: ${:.2}", txn.amount.abs()),
        format!("Type: {kind}"),
        format!("Category: {}", txn.category),
        format!("Date: {}", txn.date),
    ];

    if let Some(classified) = &txn.classified_category {
        parts.push(format!("Classified as: {classified}"));
    }

    parts.join(" | ")
}

/// Classify the record and attach its embedding text in place.
pub fn enrich(txn: &mut Transaction) {
    txn.classified_category = Some(classify(txn).to_string());
    txn.embedding_text = Some(embedding_text(txn));
}
