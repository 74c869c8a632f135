//! # Retrieval service
//!
//! The public face of the transaction store. Owns both [`Tier`]s — an exact
//! brute-force index over the current calendar month and an approximate HNSW
//! index over everything older — and is the only component allowed to mutate
//! them.
//!
//! Responsibilities:
//! - **Routing**: each new record lands in the tier its date belongs to,
//!   compared against an injectable [`Clock`].
//! - **Search**: per-tier nearest-neighbor queries, distances converted to a
//!   bounded similarity score, merged and ranked across tiers.
//! - **Migration**: at month boundaries, aged-out records move from the exact
//!   tier to the approximate tier and the exact index is rebuilt without them.
//! - **Persistence**: every mutation saves the owning tier; state is reloaded
//!   (and integrity-checked) by [`RetrievalService::open`].
//!
//! Distances from both tiers are Euclidean, so the `1/(1+d)` similarity
//! transform puts them on one comparable `(0,1]` scale before merging. Merging
//! raw distances would bias toward whichever tier produced smaller numbers.

use chrono::{Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::tier::{Tier, TierError, TierPaths};
use crate::transaction::{IndexTier, Transaction};

/// Wall-clock source for routing and migration decisions. Injectable so
/// month-boundary behavior is deterministic under test.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// The production clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Which tiers a search should consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeRange {
    /// Exact tier only.
    CurrentMonth,
    /// Approximate tier only.
    Historical,
    /// Both tiers, merged.
    All,
}

impl FromStr for TimeRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "current_month" | "current" => Ok(TimeRange::CurrentMonth),
            "historical" => Ok(TimeRange::Historical),
            "all" => Ok(TimeRange::All),
            other => Err(format!(
                "unknown time range {other:?}; expected current_month, historical, or all"
            )),
        }
    }
}

/// One search hit: the record, its bounded similarity score, and the tier
/// that answered it.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredTransaction {
    pub transaction: Transaction,
    /// `1 / (1 + distance)`, in `(0, 1]`; 1.0 only at distance zero.
    pub similarity: f32,
    pub search_method: IndexTier,
}

/// Tier population counts.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RetrievalStats {
    pub exact_count: usize,
    pub approximate_count: usize,
    pub total: usize,
}

/// Failures surfaced by [`RetrievalService::search`].
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Tier(#[from] TierError),

    /// `k` must be at least 1.
    #[error("result count k must be at least 1")]
    InvalidK,
}

/// Dual-tier transaction retrieval.
pub struct RetrievalService {
    exact: Tier,
    approximate: Tier,
    dimension: usize,
    seen_ids: HashSet<String>,
    data_dir: PathBuf,
    uuid: u64,
    clock: Box<dyn Clock>,
}

impl RetrievalService {
    /// Fresh service with empty tiers. Does not touch the disk until the
    /// first insert.
    pub fn new(
        dimension: usize,
        data_dir: impl Into<PathBuf>,
        profile: &str,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            exact: Tier::new(IndexTier::Exact, dimension),
            approximate: Tier::new(IndexTier::Approximate, dimension),
            dimension,
            seen_ids: HashSet::new(),
            data_dir: data_dir.into(),
            uuid: profile_uuid(profile),
            clock,
        }
    }

    /// Load both tiers from `data_dir`, running the per-tier integrity check.
    /// Missing files come up as empty tiers, so `open` on a fresh directory
    /// is equivalent to [`RetrievalService::new`].
    pub fn open(
        dimension: usize,
        data_dir: impl Into<PathBuf>,
        profile: &str,
        clock: Box<dyn Clock>,
    ) -> Result<Self, TierError> {
        let data_dir = data_dir.into();
        let uuid = profile_uuid(profile);

        let exact = Tier::load(
            IndexTier::Exact,
            dimension,
            &tier_paths(&data_dir, uuid, IndexTier::Exact),
        )?;
        let approximate = Tier::load(
            IndexTier::Approximate,
            dimension,
            &tier_paths(&data_dir, uuid, IndexTier::Approximate),
        )?;

        let seen_ids = exact
            .records()
            .iter()
            .chain(approximate.records())
            .map(|t| t.id.clone())
            .collect();

        info!(
            "retrieval service opened: {} current-month, {} historical",
            exact.len(),
            approximate.len()
        );

        Ok(Self {
            exact,
            approximate,
            dimension,
            seen_ids,
            data_dir,
            uuid,
            clock,
        })
    }

    /// Decide which tier a date string belongs to right now.
    ///
    /// Unparseable dates go to the historical tier rather than being dropped;
    /// they can never match "the current month".
    fn route(&self, date: &str) -> IndexTier {
        let today = self.clock.today();
        match NaiveDate::parse_from_str(date, "%Y-%m-%d") {
            Ok(d) if d.year() == today.year() && d.month() == today.month() => IndexTier::Exact,
            Ok(_) => IndexTier::Approximate,
            Err(_) => {
                warn!("unparseable transaction date {date:?}; routing to historical tier");
                IndexTier::Approximate
            }
        }
    }

    fn tier_mut(&mut self, kind: IndexTier) -> &mut Tier {
        match kind {
            IndexTier::Exact => &mut self.exact,
            IndexTier::Approximate => &mut self.approximate,
        }
    }

    /// Insert one transaction with its precomputed embedding.
    ///
    /// Returns `Ok(None)` when the id has been seen before (duplicate inserts
    /// are a no-op), otherwise `Ok(Some(vector_id))` within the owning tier.
    ///
    /// The owning tier is persisted synchronously after the append. If that
    /// write fails the in-memory state keeps the record and the error is
    /// returned; disk catches up on the next successful save.
    pub fn insert(
        &mut self,
        txn: Transaction,
        vector: Vec<f32>,
    ) -> Result<Option<usize>, TierError> {
        if self.seen_ids.contains(&txn.id) {
            debug!("duplicate transaction {} ignored", txn.id);
            return Ok(None);
        }
        if vector.len() != self.dimension {
            return Err(TierError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        let kind = self.route(&txn.date);
        let txn_id = txn.id.clone();
        let vector_id = self.tier_mut(kind).append(txn, vector)?;
        self.seen_ids.insert(txn_id);

        self.save_tier(kind)?;
        Ok(Some(vector_id))
    }

    /// Bulk insert that defers persistence to one save per touched tier.
    /// Returns the number of records actually inserted (duplicates skipped).
    pub fn insert_many(
        &mut self,
        items: Vec<(Transaction, Vec<f32>)>,
    ) -> Result<usize, TierError> {
        let mut inserted = 0;
        let mut touched = [false, false];

        for (txn, vector) in items {
            if self.seen_ids.contains(&txn.id) {
                debug!("duplicate transaction {} ignored", txn.id);
                continue;
            }
            if vector.len() != self.dimension {
                return Err(TierError::DimensionMismatch {
                    expected: self.dimension,
                    actual: vector.len(),
                });
            }
            let kind = self.route(&txn.date);
            let txn_id = txn.id.clone();
            self.tier_mut(kind).append(txn, vector)?;
            self.seen_ids.insert(txn_id);
            touched[matches!(kind, IndexTier::Approximate) as usize] = true;
            inserted += 1;
        }

        if touched[0] {
            self.save_tier(IndexTier::Exact)?;
        }
        if touched[1] {
            self.save_tier(IndexTier::Approximate)?;
        }
        Ok(inserted)
    }

    /// Find the `k` most similar transactions within `range`.
    ///
    /// Results are sorted by descending similarity (stable, so equal scores
    /// keep tier order) and truncated to `k`. Empty tiers are skipped, never
    /// an error.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        range: TimeRange,
    ) -> Result<Vec<ScoredTransaction>, RetrievalError> {
        if k == 0 {
            return Err(RetrievalError::InvalidK);
        }
        if query.len() != self.dimension {
            return Err(RetrievalError::Tier(TierError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            }));
        }

        let mut tiers: Vec<&Tier> = Vec::with_capacity(2);
        if matches!(range, TimeRange::CurrentMonth | TimeRange::All) {
            tiers.push(&self.exact);
        }
        if matches!(range, TimeRange::Historical | TimeRange::All) {
            tiers.push(&self.approximate);
        }

        let mut results = Vec::new();
        for tier in tiers {
            for (id, distance) in tier.search(query, k)? {
                let Some(record) = tier.record(id) else {
                    continue;
                };
                results.push(ScoredTransaction {
                    transaction: record.clone(),
                    similarity: 1.0 / (1.0 + distance),
                    search_method: tier.kind(),
                });
            }
        }

        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(k);
        Ok(results)
    }

    /// Defensive copy of every current-month record.
    pub fn current_month_snapshot(&self) -> Vec<Transaction> {
        self.exact.snapshot()
    }

    /// Defensive copy of every historical record.
    pub fn historical_snapshot(&self) -> Vec<Transaction> {
        self.approximate.snapshot()
    }

    /// Move records whose month is no longer current from the exact tier to
    /// the approximate tier, then rebuild the exact index from the survivors
    /// so no stale vector stays queryable there.
    ///
    /// Safe to run any time (idempotent within a month); intended to run
    /// daily or at service start. Returns the number of records moved.
    pub fn run_migration(&mut self) -> Result<usize, TierError> {
        let today = self.clock.today();
        let current = (today.year(), today.month());

        let needs_move = self
            .exact
            .records()
            .iter()
            .any(|t| t.year_month() != Some(current));
        if !needs_move {
            debug!("migration: nothing aged out");
            return Ok(0);
        }

        let old = std::mem::replace(&mut self.exact, Tier::new(IndexTier::Exact, self.dimension));
        let (records, vectors) = old.into_parts();

        let mut kept_records = Vec::new();
        let mut kept_vectors = Vec::new();
        let mut moved = 0usize;

        for (txn, vector) in records.into_iter().zip(vectors) {
            // Unparseable dates age out too; the router would never have kept
            // them current.
            if txn.year_month() == Some(current) {
                kept_records.push(txn);
                kept_vectors.push(vector);
            } else {
                self.approximate.append(txn, vector)?;
                moved += 1;
            }
        }

        self.exact =
            Tier::rebuild_from(IndexTier::Exact, self.dimension, kept_records, kept_vectors)?;

        info!(
            "migration: moved {moved} record(s) to the historical tier, {} remain current",
            self.exact.len()
        );

        self.save_tier(IndexTier::Exact)?;
        self.save_tier(IndexTier::Approximate)?;
        Ok(moved)
    }

    /// Tier population counts.
    pub fn stats(&self) -> RetrievalStats {
        RetrievalStats {
            exact_count: self.exact.len(),
            approximate_count: self.approximate.len(),
            total: self.exact.len() + self.approximate.len(),
        }
    }

    /// Persist both tiers (used after batch operations).
    pub fn save(&mut self) -> Result<(), TierError> {
        self.save_tier(IndexTier::Exact)?;
        self.save_tier(IndexTier::Approximate)
    }

    fn save_tier(&mut self, kind: IndexTier) -> Result<(), TierError> {
        let paths = tier_paths(&self.data_dir, self.uuid, kind);
        let result = self.tier_mut(kind).save(&paths);
        if let Err(e) = &result {
            warn!("failed to persist {kind} tier (in-memory state is current): {e}");
        }
        result
    }
}

/// Stable numeric id derived from the profile name, used to namespace the
/// on-disk artifacts.
fn profile_uuid(profile: &str) -> u64 {
    let digest = sha256::digest(profile);
    digest.as_bytes().iter().map(|b| *b as u64).sum()
}

fn tier_paths(data_dir: &Path, uuid: u64, kind: IndexTier) -> TierPaths {
    let stem = format!("{uuid}_{kind}");
    TierPaths {
        index: data_dir.join(format!("{stem}_index.bin")),
        metadata: data_dir.join(format!("{stem}_meta.yaml")),
        vectors: data_dir.join(format!("{stem}_vectors.bin")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const DIM: usize = 4;

    struct FixedClock(NaiveDate);

    impl Clock for FixedClock {
        fn today(&self) -> NaiveDate {
            self.0
        }
    }

    fn june_15() -> Box<dyn Clock> {
        Box::new(FixedClock(NaiveDate::from_ymd_opt(2025, 6, 15).unwrap()))
    }

    fn txn(id: &str, date: &str) -> Transaction {
        Transaction::new(id, "Acme", 10.0, date, "Shopping")
    }

    fn axis(i: usize, scale: f32) -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[i % DIM] = scale;
        v
    }

    fn service(dir: &std::path::Path) -> RetrievalService {
        RetrievalService::new(DIM, dir, "test", june_15())
    }

    #[test]
    fn routes_by_month_against_the_clock() {
        let dir = tempdir().unwrap();
        let mut svc = service(dir.path());

        svc.insert(txn("cur", "2025-06-01"), axis(0, 1.0)).unwrap();
        svc.insert(txn("old", "2025-05-31"), axis(1, 1.0)).unwrap();
        svc.insert(txn("bad", "not-a-date"), axis(2, 1.0)).unwrap();

        let current: Vec<_> = svc
            .current_month_snapshot()
            .into_iter()
            .map(|t| t.id)
            .collect();
        let historical: Vec<_> = svc
            .historical_snapshot()
            .into_iter()
            .map(|t| t.id)
            .collect();

        assert_eq!(current, vec!["cur"]);
        assert_eq!(historical, vec!["old", "bad"]);
        assert_eq!(
            svc.current_month_snapshot()[0].index_tier,
            Some(IndexTier::Exact)
        );
    }

    #[test]
    fn duplicate_insert_is_a_no_op() {
        let dir = tempdir().unwrap();
        let mut svc = service(dir.path());

        let first = svc.insert(txn("t1", "2025-06-01"), axis(0, 1.0)).unwrap();
        assert_eq!(first, Some(0));

        let second = svc.insert(txn("t1", "2025-06-01"), axis(1, 1.0)).unwrap();
        assert_eq!(second, None);
        assert_eq!(svc.stats().total, 1);

        // Same id in a different tier is still a duplicate.
        let third = svc.insert(txn("t1", "2025-01-01"), axis(2, 1.0)).unwrap();
        assert_eq!(third, None);
        assert_eq!(svc.stats().total, 1);
    }

    #[test]
    fn search_scores_are_bounded_and_sorted() {
        let dir = tempdir().unwrap();
        let mut svc = service(dir.path());

        svc.insert(txn("a", "2025-06-01"), vec![1.0, 0.0, 0.0, 0.0])
            .unwrap();
        svc.insert(txn("b", "2025-06-02"), vec![2.0, 0.0, 0.0, 0.0])
            .unwrap();
        svc.insert(txn("c", "2025-05-01"), vec![5.0, 0.0, 0.0, 0.0])
            .unwrap();

        let hits = svc
            .search(&[1.0, 0.0, 0.0, 0.0], 3, TimeRange::All)
            .unwrap();
        assert_eq!(hits.len(), 3);
        for pair in hits.windows(2) {
            assert!(pair[0].similarity >= pair[1].similarity);
        }
        for hit in &hits {
            assert!(hit.similarity > 0.0 && hit.similarity <= 1.0);
        }
        // Exact match scores 1.0 and wins.
        assert_eq!(hits[0].transaction.id, "a");
        assert!((hits[0].similarity - 1.0).abs() < f32::EPSILON);
        assert_eq!(hits[0].search_method, IndexTier::Exact);
        assert_eq!(hits[2].search_method, IndexTier::Approximate);
    }

    #[test]
    fn search_truncates_to_k_across_tiers() {
        let dir = tempdir().unwrap();
        let mut svc = service(dir.path());

        // 2 current-month, 10 historical.
        for i in 0..2 {
            svc.insert(txn(&format!("cur{i}"), "2025-06-01"), axis(i, 1.0))
                .unwrap();
        }
        for i in 0..10 {
            svc.insert(
                txn(&format!("old{i}"), "2025-05-01"),
                axis(i, 2.0 + i as f32),
            )
            .unwrap();
        }

        let hits = svc.search(&axis(0, 1.0), 5, TimeRange::All).unwrap();
        assert_eq!(hits.len(), 5);
        // The exact hit at distance zero must lead.
        assert_eq!(hits[0].transaction.id, "cur0");
    }

    #[test]
    fn search_respects_the_range_selector() {
        let dir = tempdir().unwrap();
        let mut svc = service(dir.path());

        svc.insert(txn("cur", "2025-06-01"), axis(0, 1.0)).unwrap();
        svc.insert(txn("old", "2025-05-01"), axis(0, 1.5)).unwrap();

        let query = axis(0, 1.0);
        let current = svc.search(&query, 5, TimeRange::CurrentMonth).unwrap();
        assert!(current.iter().all(|h| h.transaction.id == "cur"));

        let historical = svc.search(&query, 5, TimeRange::Historical).unwrap();
        assert!(historical.iter().all(|h| h.transaction.id == "old"));
    }

    #[test]
    fn empty_service_searches_cleanly_for_every_range() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        for range in [TimeRange::CurrentMonth, TimeRange::Historical, TimeRange::All] {
            assert!(svc.search(&axis(0, 1.0), 5, range).unwrap().is_empty());
        }
    }

    #[test]
    fn zero_k_and_wrong_dimension_are_rejected() {
        let dir = tempdir().unwrap();
        let mut svc = service(dir.path());
        svc.insert(txn("t", "2025-06-01"), axis(0, 1.0)).unwrap();

        assert!(matches!(
            svc.search(&axis(0, 1.0), 0, TimeRange::All),
            Err(RetrievalError::InvalidK)
        ));
        assert!(matches!(
            svc.search(&[1.0; DIM + 2], 3, TimeRange::All),
            Err(RetrievalError::Tier(TierError::DimensionMismatch { .. }))
        ));
        assert!(matches!(
            svc.insert(txn("u", "2025-06-01"), vec![1.0; DIM - 1]),
            Err(TierError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn reopen_reproduces_state_and_results() {
        let dir = tempdir().unwrap();
        let query = axis(1, 2.0);

        let (snapshot, before) = {
            let mut svc = service(dir.path());
            for i in 0..4 {
                svc.insert(txn(&format!("c{i}"), "2025-06-01"), axis(i, 1.0))
                    .unwrap();
                svc.insert(txn(&format!("h{i}"), "2025-04-01"), axis(i, 3.0))
                    .unwrap();
            }
            (
                svc.historical_snapshot(),
                svc.search(&query, 4, TimeRange::All).unwrap(),
            )
        };

        let svc = RetrievalService::open(DIM, dir.path(), "test", june_15()).unwrap();
        assert_eq!(svc.historical_snapshot(), snapshot);
        assert_eq!(svc.stats().total, 8);

        let after = svc.search(&query, 4, TimeRange::All).unwrap();
        let ids = |hits: &[ScoredTransaction]| {
            hits.iter()
                .map(|h| h.transaction.id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&after), ids(&before));
    }

    #[test]
    fn migration_moves_aged_records_and_keeps_them_searchable() {
        let dir = tempdir().unwrap();

        // Backdated entries that landed in the exact tier before the month
        // turned (simulated with a clock one month behind).
        {
            let mut past = RetrievalService::new(
                DIM,
                dir.path(),
                "test",
                Box::new(FixedClock(NaiveDate::from_ymd_opt(2025, 5, 20).unwrap())),
            );
            past.insert(txn("stale", "2025-05-18"), axis(3, 2.0)).unwrap();
            past.insert(txn("evergreen", "2025-05-31"), axis(0, 1.0))
                .unwrap();
        }
        // Reopen under the June clock; both records are now aged out.
        let mut svc = RetrievalService::open(DIM, dir.path(), "test", june_15()).unwrap();
        svc.insert(txn("fresh", "2025-06-10"), axis(1, 1.0)).unwrap();
        assert_eq!(svc.current_month_snapshot().len(), 3);

        let moved = svc.run_migration().unwrap();
        assert_eq!(moved, 2);

        let current_ids: Vec<_> = svc
            .current_month_snapshot()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(current_ids, vec!["fresh"]);

        let historical_ids: Vec<_> = svc
            .historical_snapshot()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert!(historical_ids.contains(&"stale".to_string()));
        assert!(historical_ids.contains(&"evergreen".to_string()));

        // The migrated vector answers historical queries with a perfect score.
        let hits = svc.search(&axis(3, 2.0), 1, TimeRange::Historical).unwrap();
        assert_eq!(hits[0].transaction.id, "stale");
        assert!((hits[0].similarity - 1.0).abs() < f32::EPSILON);
        assert_eq!(hits[0].search_method, IndexTier::Approximate);
        assert_eq!(hits[0].transaction.index_tier, Some(IndexTier::Approximate));

        // Second run in the same month is a no-op.
        assert_eq!(svc.run_migration().unwrap(), 0);
        assert_eq!(svc.stats().exact_count, 1);
        assert_eq!(svc.stats().approximate_count, 2);
    }

    #[test]
    fn migration_preserves_surviving_order_and_renumbers() {
        let dir = tempdir().unwrap();

        {
            let mut past = RetrievalService::new(
                DIM,
                dir.path(),
                "test",
                Box::new(FixedClock(NaiveDate::from_ymd_opt(2025, 5, 1).unwrap())),
            );
            past.insert(txn("may", "2025-05-01"), axis(0, 5.0)).unwrap();
        }
        let mut svc = RetrievalService::open(DIM, dir.path(), "test", june_15()).unwrap();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            svc.insert(txn(id, "2025-06-02"), axis(i, 1.0)).unwrap();
        }

        svc.run_migration().unwrap();

        let survivors = svc.current_month_snapshot();
        let ids: Vec<_> = survivors.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        for (i, t) in survivors.iter().enumerate() {
            assert_eq!(t.vector_id, Some(i));
        }
    }

    #[test]
    fn insert_many_skips_duplicates_and_counts() {
        let dir = tempdir().unwrap();
        let mut svc = service(dir.path());
        svc.insert(txn("dup", "2025-06-01"), axis(0, 1.0)).unwrap();

        let inserted = svc
            .insert_many(vec![
                (txn("dup", "2025-06-01"), axis(0, 1.0)),
                (txn("n1", "2025-06-02"), axis(1, 1.0)),
                (txn("n2", "2025-03-02"), axis(2, 1.0)),
            ])
            .unwrap();

        assert_eq!(inserted, 2);
        assert_eq!(svc.stats().exact_count, 2);
        assert_eq!(svc.stats().approximate_count, 1);
    }

    #[test]
    fn time_range_parses_cli_spellings() {
        assert_eq!("current_month".parse::<TimeRange>().unwrap(), TimeRange::CurrentMonth);
        assert_eq!("historical".parse::<TimeRange>().unwrap(), TimeRange::Historical);
        assert_eq!("all".parse::<TimeRange>().unwrap(), TimeRange::All);
        assert!("yesterday".parse::<TimeRange>().is_err());
    }
}
