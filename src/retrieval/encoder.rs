//! Text encoders used to turn sample summaries into vectors.
//!
//! The model-backed encoder lives outside this crate; [`HashEncoder`] is the
//! built-in stand-in. It is deterministic and lexical only: summaries that
//! share hosts, tags, users and values land close together.

use xxhash_rust::xxh3::xxh3_64;

use crate::error::RetrievalResult;
use crate::DEFAULT_EMBEDDING_DIM;

/// Black-box `encode(text) -> vector`.
pub trait Encoder: Send + Sync {
    fn dimension(&self) -> usize;

    /// Encode `text`. Implementations return L2-normalized vectors of
    /// length [`Encoder::dimension`] so inner product equals cosine similarity.
    fn encode(&self, text: &str) -> RetrievalResult<Vec<f32>>;
}

/// Signed hashing of tokens into a fixed number of buckets.
#[derive(Debug, Clone)]
pub struct HashEncoder {
    dimension: usize,
}

impl HashEncoder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn encode_sync(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; self.dimension];

        for token in tokenize(text) {
            let hash = xxh3_64(token.as_bytes());
            let index = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) == 1 { 1.0 } else { -1.0 };
            embedding[index] += sign;
        }

        l2_normalize(&mut embedding);
        embedding
    }
}

impl Default for HashEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIM)
    }
}

impl Encoder for HashEncoder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode(&self, text: &str) -> RetrievalResult<Vec<f32>> {
        Ok(self.encode_sync(text))
    }
}

/// Lowercased tokens; `key=value` pairs split into both halves and `-`/`_`/`.`
/// stay inside tokens so tags like `run-42` survive intact.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || matches!(c, '-' | '_' | '.')))
        .map(|t| t.trim_matches(|c: char| matches!(c, '-' | '.')))
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

/// Scale `vector` to unit length in place; zero vectors stay zero.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm_sq: f32 = vector.iter().map(|x| x * x).sum();
    if !norm_sq.is_finite() || norm_sq < f32::EPSILON {
        vector.iter_mut().for_each(|x| *x = 0.0);
        return;
    }
    let inv = 1.0 / norm_sq.sqrt();
    vector.iter_mut().for_each(|x| *x *= inv);
}

/// Inner product; callers guarantee equal lengths.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
