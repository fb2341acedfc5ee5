// ============================================================================
// RETRIEVAL
// ============================================================================
// Similarity search over sample summaries plus exact run-tag lookup.
//
// The query path only knows the `VectorIndex` contract; which backend serves
// it (flat artifact or in-database column) is decided once at startup.
// ============================================================================

mod column;
mod encoder;
mod flat;

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;

use ordered_float::OrderedFloat;
use tracing::{debug, info};

pub use column::ColumnIndex;
pub use encoder::{dot, l2_normalize, Encoder, HashEncoder};
pub use flat::{FlatIndex, FLAT_MAGIC, FLAT_VERSION};

use crate::config::{BackendKind, RetrievalConfig};
use crate::error::{ConfigError, RetrievalError, RetrievalResult};
use crate::sample::StoredSample;
use crate::store::{SampleQuery, Store};

/// A scored hit: store row id and inner-product similarity
pub type Hit = (i64, f32);

/// Upper bound on heap slots reserved up front
const MAX_PREALLOC: usize = 1024;

/// Backend contract shared by every vector index.
pub trait VectorIndex: Send + Sync {
    fn name(&self) -> &'static str;

    /// Re-derive vectors from the store; returns how many were written.
    fn build(&self, store: &Store, encoder: &dyn Encoder) -> RetrievalResult<usize>;

    /// Number of vectors the index currently holds.
    fn vector_count(&self, store: &Store) -> RetrievalResult<usize>;

    /// Up to `k` hits, most similar first.
    fn nearest(&self, store: &Store, query: &[f32], k: usize) -> RetrievalResult<Vec<Hit>>;
}

/// Keep the `k` best hits; ties go to the newer (larger) id.
pub fn top_k<I>(hits: I, k: usize) -> Vec<Hit>
where
    I: IntoIterator<Item = Hit>,
{
    if k == 0 {
        return Vec::new();
    }

    // k comes from callers; never size the heap from it directly
    let mut heap: BinaryHeap<Reverse<(OrderedFloat<f32>, i64)>> =
        BinaryHeap::with_capacity(k.min(MAX_PREALLOC) + 1);
    for (id, score) in hits {
        heap.push(Reverse((OrderedFloat(score), id)));
        if heap.len() > k {
            heap.pop();
        }
    }

    heap.into_sorted_vec()
        .into_iter()
        .map(|Reverse((score, id))| (id, score.into_inner()))
        .collect()
}

/// Pick the backend named in config. `auto` prefers an existing flat artifact.
pub fn select_backend(config: &RetrievalConfig) -> Result<Arc<dyn VectorIndex>, ConfigError> {
    let kind = match config.backend_kind()? {
        BackendKind::Auto if config.index_path.exists() => BackendKind::Flat,
        BackendKind::Auto => BackendKind::Column,
        other => other,
    };

    let index: Arc<dyn VectorIndex> = match kind {
        BackendKind::Flat => Arc::new(FlatIndex::new(&config.index_path, config.ids_path())),
        _ => Arc::new(ColumnIndex::new()),
    };
    info!(target: "gpu_doctor::retrieval", backend = index.name(), "Vector backend selected");
    Ok(index)
}

// ----------------------------------------------------------------------------
// Retriever
// ----------------------------------------------------------------------------

pub struct Retriever {
    store: Arc<Store>,
    index: Arc<dyn VectorIndex>,
    encoder: Arc<dyn Encoder>,
}

impl fmt::Debug for Retriever {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retriever")
            .field("store", &self.store.path())
            .field("backend", &self.index.name())
            .field("dimension", &self.encoder.dimension())
            .finish()
    }
}

impl Retriever {
    pub fn new(store: Arc<Store>, index: Arc<dyn VectorIndex>, encoder: Arc<dyn Encoder>) -> Self {
        Self {
            store,
            index,
            encoder,
        }
    }

    /// Backend from config, built-in hash encoder.
    pub fn from_config(config: &RetrievalConfig, store: Arc<Store>) -> Result<Self, ConfigError> {
        let index = select_backend(config)?;
        let encoder = Arc::new(HashEncoder::new(config.embedding_dim));
        Ok(Self::new(store, index, encoder))
    }

    pub fn backend(&self) -> &'static str {
        self.index.name()
    }

    /// Rebuild the vector index from the store.
    pub fn build_index(&self) -> RetrievalResult<usize> {
        let written = self.index.build(&self.store, self.encoder.as_ref())?;
        info!(
            target: "gpu_doctor::retrieval",
            backend = self.index.name(),
            vectors = written,
            "Vector index built"
        );
        Ok(written)
    }

    /// Most similar stored samples, best first.
    pub fn search_samples(&self, query_text: &str, k: usize) -> RetrievalResult<Vec<StoredSample>> {
        if k == 0 {
            return Err(RetrievalError::InvalidK);
        }

        let query = self.encoder.encode(query_text)?;
        if query.len() != self.encoder.dimension() {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.encoder.dimension(),
                actual: query.len(),
            });
        }

        let size = self.index.vector_count(&self.store)?;
        if size == 0 {
            return Ok(Vec::new());
        }

        // over-fetch so ids pruned from the store do not shrink the answer
        let mut want = k.saturating_mul(4).saturating_add(16).min(size);
        loop {
            let hits = self.index.nearest(&self.store, &query, want)?;
            let exhausted = hits.len() < want || want >= size;
            let ids: Vec<i64> = hits.iter().map(|(id, _)| *id).collect();

            let mut rows = self.store.fetch_by_ids(&ids)?;
            if rows.len() >= k || exhausted {
                rows.truncate(k);
                debug!(
                    target: "gpu_doctor::retrieval",
                    candidates = hits.len(),
                    returned = rows.len(),
                    "Similarity search complete"
                );
                return Ok(rows);
            }
            want = want.saturating_mul(4).min(size);
        }
    }

    /// Up to `k` summaries, most similar first.
    pub fn search(&self, query_text: &str, k: usize) -> RetrievalResult<Vec<String>> {
        Ok(self
            .search_samples(query_text, k)?
            .iter()
            .map(|row| row.sample.summary())
            .collect())
    }

    /// Up to `k` most recent samples carrying `tag`, newest first.
    pub fn search_by_tag_samples(&self, tag: &str, k: usize) -> RetrievalResult<Vec<StoredSample>> {
        if k == 0 {
            return Err(RetrievalError::InvalidK);
        }
        Ok(self.store.query(&SampleQuery::new(k).with_run_tag(tag))?)
    }

    pub fn search_by_tag(&self, tag: &str, k: usize) -> RetrievalResult<Vec<String>> {
        Ok(self
            .search_by_tag_samples(tag, k)?
            .iter()
            .map(|row| row.sample.summary())
            .collect())
    }
}
