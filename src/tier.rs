//! # Tier
//!
//! One time partition of the transaction store: a similarity index, the
//! ordered metadata list behind it, and a parallel array of the raw vectors.
//!
//! The central invariant is positional: the record at `records[i]` was
//! embedded into `vectors[i]` and inserted into the index at position `i`,
//! for the lifetime of this tier instance. Positions are never reused or
//! renumbered; migration produces a *new* tier instance via
//! [`Tier::rebuild_from`].
//!
//! The raw-vector array exists because neither index backend can return a
//! stored vector by position. It is the reconstruction source for migration
//! and for rebuilding an index whose dump file is missing or stale, and is
//! never handed out to collaborators.
//!
//! ## Persistence
//! Three artifacts per tier, written together by [`Tier::save`]:
//! - the index dump (`hora`'s own binary format),
//! - the raw-vector array (bincode),
//! - the metadata list (YAML), carrying the population count that stands in
//!   for the index's own count at load time.
//!
//! Metadata is the source of truth. A missing or unloadable index file is
//! repaired by re-adding every stored vector; a divergence between the record
//! list and the vector array cannot be repaired and takes the tier offline
//! (empty results, loud logging) instead of serving misleading matches.

use hora::core::ann_index::{ANNIndex, SerializableIndex};
use hora::core::metrics::Metric;
use hora::index::bruteforce_idx::BruteForceIndex;
use hora::index::bruteforce_params::BruteForceParams;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, warn};

use crate::transaction::{IndexTier, Transaction};

/// Failures in tier operations.
#[derive(Debug, Error)]
pub enum TierError {
    /// A vector's length does not match the tier's dimension. Rejected before
    /// the index or metadata are touched.
    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The underlying index rejected an add/build/dump.
    #[error("index operation failed: {0}")]
    Index(&'static str),

    /// A disk write failed. In-memory state remains authoritative; the next
    /// successful save reconciles.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// The on-disk record list and vector array disagree, or the tier was
    /// taken offline by a failed integrity check.
    #[error("corrupted tier state: {0}")]
    CorruptedState(String),
}

/// File locations for one tier's persisted artifacts.
#[derive(Debug, Clone)]
pub struct TierPaths {
    pub index: PathBuf,
    pub metadata: PathBuf,
    pub vectors: PathBuf,
}

/// The YAML metadata artifact. `count` is recorded at dump time and checked
/// against the record list on load, standing in for the index population
/// (which hora does not expose).
#[derive(Debug, Serialize, Deserialize)]
struct TierMetadata {
    dimension: usize,
    count: usize,
    records: Vec<Transaction>,
}

/// The two index algorithms behind the tiers. Both are built with
/// [`Metric::Euclidean`] so their distances share one scale.
enum TierBackend {
    /// Brute-force scan, exact ranking. Current-month tier.
    Flat(BruteForceIndex<f32, usize>),
    /// Navigable small-world graph, approximate ranking. Historical tier.
    Hnsw(HNSWIndex<f32, usize>),
}

impl TierBackend {
    fn for_kind(kind: IndexTier, dimension: usize) -> Self {
        match kind {
            IndexTier::Exact => {
                TierBackend::Flat(BruteForceIndex::new(dimension, &BruteForceParams::default()))
            }
            IndexTier::Approximate => {
                TierBackend::Hnsw(HNSWIndex::new(dimension, &HNSWParams::<f32>::default()))
            }
        }
    }

    fn add(&mut self, vector: &[f32], id: usize) -> Result<(), &'static str> {
        match self {
            TierBackend::Flat(index) => index.add(vector, id),
            TierBackend::Hnsw(index) => index.add(vector, id),
        }
    }

    fn build(&mut self) -> Result<(), &'static str> {
        match self {
            TierBackend::Flat(index) => index.build(Metric::Euclidean),
            TierBackend::Hnsw(index) => index.build(Metric::Euclidean),
        }
    }

    /// Nearest neighbors as `(position, distance)`, best first.
    fn search(&self, vector: &[f32], k: usize) -> Vec<(usize, f32)> {
        let nodes = match self {
            TierBackend::Flat(index) => index.search_nodes(vector, k),
            TierBackend::Hnsw(index) => index.search_nodes(vector, k),
        };
        nodes
            .into_iter()
            .filter_map(|(node, distance)| node.idx().as_ref().map(|id| (*id, distance)))
            .collect()
    }

    fn dump(&mut self, path: &str) -> Result<(), &'static str> {
        match self {
            TierBackend::Flat(index) => index.dump(path),
            TierBackend::Hnsw(index) => index.dump(path),
        }
    }

    fn load_from(kind: IndexTier, path: &str) -> Result<Self, &'static str> {
        match kind {
            IndexTier::Exact => BruteForceIndex::load(path).map(TierBackend::Flat),
            IndexTier::Approximate => HNSWIndex::load(path).map(TierBackend::Hnsw),
        }
    }
}

/// One (index, metadata, raw-vector) triple covering a time partition.
pub struct Tier {
    kind: IndexTier,
    backend: TierBackend,
    records: Vec<Transaction>,
    vectors: Vec<Vec<f32>>,
    dimension: usize,
    offline: bool,
}

impl Tier {
    /// Fresh empty tier.
    pub fn new(kind: IndexTier, dimension: usize) -> Self {
        Self {
            kind,
            backend: TierBackend::for_kind(kind, dimension),
            records: Vec::new(),
            vectors: Vec::new(),
            dimension,
            offline: false,
        }
    }

    /// An offline tier: integrity check failed, queries return nothing,
    /// writes are refused. The on-disk artifacts are left untouched.
    fn offline(kind: IndexTier, dimension: usize) -> Self {
        Self {
            offline: true,
            ..Self::new(kind, dimension)
        }
    }

    pub fn kind(&self) -> IndexTier {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn records(&self) -> &[Transaction] {
        &self.records
    }

    /// Defensive copy of the metadata list; callers may mutate it freely.
    pub fn snapshot(&self) -> Vec<Transaction> {
        if self.offline {
            return Vec::new();
        }
        self.records.clone()
    }

    /// Append a record and its vector at the next position.
    ///
    /// Stamps `vector_id` and `index_tier` on the record before storing it.
    /// Both appends happen behind the caller's `&mut`, so readers never see
    /// the index and metadata at different lengths.
    pub fn append(&mut self, mut txn: Transaction, vector: Vec<f32>) -> Result<usize, TierError> {
        if self.offline {
            return Err(TierError::CorruptedState(format!(
                "{} tier is offline",
                self.kind
            )));
        }
        if vector.len() != self.dimension {
            return Err(TierError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        let id = self.records.len();
        self.backend.add(&vector, id).map_err(TierError::Index)?;
        self.backend.build().map_err(TierError::Index)?;

        txn.vector_id = Some(id);
        txn.index_tier = Some(self.kind);
        self.records.push(txn);
        self.vectors.push(vector);

        debug_assert_eq!(self.records.len(), self.vectors.len());
        Ok(id)
    }

    /// Nearest neighbors as `(position, distance)`, best first.
    ///
    /// An empty or offline tier yields an empty list, never an error.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>, TierError> {
        if self.offline {
            warn!("{} tier is offline; returning no matches", self.kind);
            return Ok(Vec::new());
        }
        if self.records.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(TierError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let k = k.min(self.records.len());
        Ok(self
            .backend
            .search(query, k)
            .into_iter()
            .filter(|(id, _)| *id < self.records.len())
            .collect())
    }

    pub fn record(&self, id: usize) -> Option<&Transaction> {
        self.records.get(id)
    }

    /// Consume the tier, handing back its records and raw vectors.
    /// Used by migration to repartition the exact tier.
    pub fn into_parts(self) -> (Vec<Transaction>, Vec<Vec<f32>>) {
        (self.records, self.vectors)
    }

    /// Build a tier from scratch out of parallel record/vector lists,
    /// renumbering positions 0..n in the given order.
    pub fn rebuild_from(
        kind: IndexTier,
        dimension: usize,
        records: Vec<Transaction>,
        vectors: Vec<Vec<f32>>,
    ) -> Result<Self, TierError> {
        if records.len() != vectors.len() {
            return Err(TierError::CorruptedState(format!(
                "{} records but {} vectors",
                records.len(),
                vectors.len()
            )));
        }

        let mut tier = Tier::new(kind, dimension);
        for (id, (mut txn, vector)) in records.into_iter().zip(vectors).enumerate() {
            if vector.len() != dimension {
                return Err(TierError::DimensionMismatch {
                    expected: dimension,
                    actual: vector.len(),
                });
            }
            tier.backend.add(&vector, id).map_err(TierError::Index)?;
            txn.vector_id = Some(id);
            txn.index_tier = Some(kind);
            tier.records.push(txn);
            tier.vectors.push(vector);
        }
        if !tier.records.is_empty() {
            tier.backend.build().map_err(TierError::Index)?;
        }
        Ok(tier)
    }

    /// Persist all three artifacts. The metadata file is written last; its
    /// `count` field is the commit point the loader checks.
    pub fn save(&mut self, paths: &TierPaths) -> Result<(), TierError> {
        if self.offline {
            // Never overwrite artifacts with the empty state of an offline tier.
            return Err(TierError::CorruptedState(format!(
                "{} tier is offline",
                self.kind
            )));
        }

        if self.records.is_empty() {
            // hora cannot dump an unbuilt index; an absent file plus count 0
            // reads back as a fresh tier.
            let _ = fs::remove_file(&paths.index);
        } else {
            let index_path = paths.index.to_string_lossy().into_owned();
            self.backend.dump(&index_path).map_err(TierError::Index)?;
        }

        let encoded = bincode::serde::encode_to_vec(&self.vectors, bincode::config::standard())
            .map_err(|e| TierError::Persistence(e.to_string()))?;
        fs::write(&paths.vectors, encoded).map_err(|e| TierError::Persistence(e.to_string()))?;

        let metadata = TierMetadata {
            dimension: self.dimension,
            count: self.records.len(),
            records: self.records.clone(),
        };
        let yaml =
            serde_yaml::to_string(&metadata).map_err(|e| TierError::Persistence(e.to_string()))?;
        fs::write(&paths.metadata, yaml).map_err(|e| TierError::Persistence(e.to_string()))?;

        Ok(())
    }

    /// Load a tier from disk, running the integrity check.
    ///
    /// - No metadata file: fresh empty tier.
    /// - Index file missing, unloadable, or its recorded count stale: index
    ///   rebuilt from the vector array (metadata is the source of truth).
    /// - Record list and vector array diverge, or the stored dimension does
    ///   not match: the tier comes up offline.
    pub fn load(kind: IndexTier, dimension: usize, paths: &TierPaths) -> Result<Self, TierError> {
        if !paths.metadata.exists() {
            return Ok(Tier::new(kind, dimension));
        }

        let raw = fs::read_to_string(&paths.metadata)
            .map_err(|e| TierError::Persistence(e.to_string()))?;
        let metadata: TierMetadata = match serde_yaml::from_str(&raw) {
            Ok(m) => m,
            Err(e) => {
                error!("{kind} tier metadata unreadable, taking tier offline: {e}");
                return Ok(Tier::offline(kind, dimension));
            }
        };

        if metadata.dimension != dimension {
            error!(
                "{kind} tier was stored with dimension {}, expected {dimension}; taking tier offline",
                metadata.dimension
            );
            return Ok(Tier::offline(kind, dimension));
        }

        let vectors: Vec<Vec<f32>> = if metadata.records.is_empty() {
            Vec::new()
        } else {
            let bytes = match fs::read(&paths.vectors) {
                Ok(b) => b,
                Err(e) => {
                    error!("{kind} tier vector array unreadable, taking tier offline: {e}");
                    return Ok(Tier::offline(kind, dimension));
                }
            };
            match bincode::serde::decode_from_slice(&bytes, bincode::config::standard()) {
                Ok((v, _)) => v,
                Err(e) => {
                    error!("{kind} tier vector array corrupt, taking tier offline: {e}");
                    return Ok(Tier::offline(kind, dimension));
                }
            }
        };

        if vectors.len() != metadata.records.len()
            || vectors.iter().any(|v| v.len() != dimension)
        {
            error!(
                "{kind} tier has {} records but {} vectors; taking tier offline",
                metadata.records.len(),
                vectors.len()
            );
            return Ok(Tier::offline(kind, dimension));
        }

        // Fast path: reuse the index dump when its population matches.
        if metadata.count == metadata.records.len() && paths.index.exists() {
            if let Ok(backend) = TierBackend::load_from(kind, &paths.index.to_string_lossy()) {
                return Ok(Self {
                    kind,
                    backend,
                    records: metadata.records,
                    vectors,
                    dimension,
                    offline: false,
                });
            }
            warn!("{kind} tier index dump unloadable; rebuilding from stored vectors");
        } else if !metadata.records.is_empty() {
            warn!(
                "{kind} tier index dump missing or stale (count {}, records {}); rebuilding",
                metadata.count,
                metadata.records.len()
            );
        }

        Tier::rebuild_from(kind, dimension, metadata.records, vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const DIM: usize = 4;

    fn txn(id: &str, date: &str) -> Transaction {
        Transaction::new(id, "Acme", 10.0, date, "Shopping")
    }

    fn axis(i: usize, scale: f32) -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[i % DIM] = scale;
        v
    }

    fn paths_in(dir: &std::path::Path) -> TierPaths {
        TierPaths {
            index: dir.join("t_index.bin"),
            metadata: dir.join("t_meta.yaml"),
            vectors: dir.join("t_vectors.bin"),
        }
    }

    #[test]
    fn append_assigns_sequential_positions() {
        let mut tier = Tier::new(IndexTier::Exact, DIM);
        for i in 0..5 {
            let id = tier
                .append(txn(&format!("t{i}"), "2025-06-01"), axis(i, 1.0))
                .unwrap();
            assert_eq!(id, i);
        }
        assert_eq!(tier.len(), 5);
        assert_eq!(tier.record(3).unwrap().vector_id, Some(3));
        assert_eq!(tier.record(3).unwrap().index_tier, Some(IndexTier::Exact));
    }

    #[test]
    fn append_rejects_wrong_dimension() {
        let mut tier = Tier::new(IndexTier::Exact, DIM);
        let err = tier.append(txn("t0", "2025-06-01"), vec![1.0; DIM + 1]);
        assert!(matches!(
            err,
            Err(TierError::DimensionMismatch {
                expected: DIM,
                actual: 5
            })
        ));
        assert!(tier.is_empty());
    }

    #[test]
    fn search_returns_nearest_first_with_distances() {
        let mut tier = Tier::new(IndexTier::Exact, DIM);
        tier.append(txn("near", "2025-06-01"), vec![1.0, 0.0, 0.0, 0.0])
            .unwrap();
        tier.append(txn("far", "2025-06-02"), vec![9.0, 0.0, 0.0, 0.0])
            .unwrap();

        let hits = tier.search(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 0);
        assert!(hits[0].1 < f32::EPSILON);
        assert!(hits[1].1 > hits[0].1);
    }

    #[test]
    fn search_on_empty_tier_is_empty_not_error() {
        let tier = Tier::new(IndexTier::Approximate, DIM);
        assert!(tier.search(&[0.0; DIM], 3).unwrap().is_empty());
    }

    #[test]
    fn search_caps_k_at_population() {
        let mut tier = Tier::new(IndexTier::Exact, DIM);
        tier.append(txn("only", "2025-06-01"), axis(0, 1.0)).unwrap();
        let hits = tier.search(&axis(0, 1.0), 50).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn snapshot_is_a_defensive_copy() {
        let mut tier = Tier::new(IndexTier::Exact, DIM);
        tier.append(txn("t0", "2025-06-01"), axis(0, 1.0)).unwrap();

        let mut snap = tier.snapshot();
        snap[0].merchant = "Mutated".into();
        snap.clear();

        assert_eq!(tier.len(), 1);
        assert_eq!(tier.record(0).unwrap().merchant, "Acme");
    }

    #[test]
    fn save_load_round_trip_preserves_order_and_results() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());

        let mut tier = Tier::new(IndexTier::Approximate, DIM);
        for i in 0..6 {
            tier.append(txn(&format!("t{i}"), "2025-05-01"), axis(i, 1.0 + i as f32))
                .unwrap();
        }
        let query = axis(2, 3.0);
        let before = tier.search(&query, 3).unwrap();
        tier.save(&paths).unwrap();

        let reloaded = Tier::load(IndexTier::Approximate, DIM, &paths).unwrap();
        assert!(!reloaded.is_offline());
        assert_eq!(reloaded.snapshot(), tier.snapshot());
        assert_eq!(reloaded.search(&query, 3).unwrap(), before);
    }

    #[test]
    fn missing_index_file_rebuilds_from_vectors() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());

        let mut tier = Tier::new(IndexTier::Exact, DIM);
        tier.append(txn("t0", "2025-06-01"), vec![1.0, 0.0, 0.0, 0.0])
            .unwrap();
        tier.append(txn("t1", "2025-06-02"), vec![0.0, 1.0, 0.0, 0.0])
            .unwrap();
        tier.save(&paths).unwrap();
        std::fs::remove_file(&paths.index).unwrap();

        let reloaded = Tier::load(IndexTier::Exact, DIM, &paths).unwrap();
        assert!(!reloaded.is_offline());
        assert_eq!(reloaded.len(), 2);
        let hits = reloaded.search(&[0.0, 1.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].0, 1);
    }

    #[test]
    fn diverged_vector_array_takes_tier_offline() {
        let dir = tempdir().unwrap();
        let paths = paths_in(dir.path());

        let mut tier = Tier::new(IndexTier::Exact, DIM);
        tier.append(txn("t0", "2025-06-01"), axis(0, 1.0)).unwrap();
        tier.append(txn("t1", "2025-06-02"), axis(1, 1.0)).unwrap();
        tier.save(&paths).unwrap();

        // Truncate the vector array to one entry behind the record list.
        let one: Vec<Vec<f32>> = vec![axis(0, 1.0)];
        let bytes = bincode::serde::encode_to_vec(&one, bincode::config::standard()).unwrap();
        std::fs::write(&paths.vectors, bytes).unwrap();

        let mut reloaded = Tier::load(IndexTier::Exact, DIM, &paths).unwrap();
        assert!(reloaded.is_offline());
        assert!(reloaded.search(&axis(0, 1.0), 5).unwrap().is_empty());
        assert!(reloaded.snapshot().is_empty());
        assert!(matches!(
            reloaded.append(txn("t2", "2025-06-03"), axis(2, 1.0)),
            Err(TierError::CorruptedState(_))
        ));
        // And it refuses to clobber the artifacts it could not vouch for.
        assert!(reloaded.save(&paths).is_err());
    }

    #[test]
    fn rebuild_from_renumbers_in_order() {
        let records = vec![txn("a", "2025-04-01"), txn("b", "2025-04-02")];
        let vectors = vec![axis(0, 1.0), axis(1, 1.0)];
        let tier =
            Tier::rebuild_from(IndexTier::Approximate, DIM, records, vectors).unwrap();

        assert_eq!(tier.record(0).unwrap().id, "a");
        assert_eq!(tier.record(0).unwrap().vector_id, Some(0));
        assert_eq!(tier.record(1).unwrap().vector_id, Some(1));
        assert_eq!(
            tier.record(1).unwrap().index_tier,
            Some(IndexTier::Approximate)
        );
    }
}
