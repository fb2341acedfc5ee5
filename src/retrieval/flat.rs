//! Flat vector artifact: a vector file plus a parallel id list.
//!
//! Vector file layout (little-endian):
//!
//! ```text
//! magic "GDVI" | version u32 | dimension u32 | count u64 | count * dimension f32
//! ```
//!
//! The id list is a bincode `Vec<i64>` whose n-th entry is the store row id of
//! the n-th vector. Both files are replaced atomically on rebuild.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{dot, top_k, Encoder, Hit, VectorIndex};
use crate::error::{RetrievalError, RetrievalResult};
use crate::store::Store;

pub const FLAT_MAGIC: [u8; 4] = *b"GDVI";
pub const FLAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 4 + 4 + 4 + 8;

#[derive(Debug)]
struct FlatData {
    dimension: usize,
    ids: Vec<i64>,
    vectors: Vec<f32>,
}

/// Fully in-memory brute-force index backed by the artifact pair.
#[derive(Debug)]
pub struct FlatIndex {
    vectors_path: PathBuf,
    ids_path: PathBuf,
    loaded: RwLock<Option<Arc<FlatData>>>,
}

impl FlatIndex {
    pub fn new(vectors_path: impl Into<PathBuf>, ids_path: impl Into<PathBuf>) -> Self {
        Self {
            vectors_path: vectors_path.into(),
            ids_path: ids_path.into(),
            loaded: RwLock::new(None),
        }
    }

    fn data(&self) -> RetrievalResult<Arc<FlatData>> {
        if let Some(data) = self.loaded.read().as_ref() {
            return Ok(Arc::clone(data));
        }
        let data = Arc::new(self.load()?);
        *self.loaded.write() = Some(Arc::clone(&data));
        Ok(data)
    }

    fn corrupt(&self, path: &Path, message: impl Into<String>) -> RetrievalError {
        RetrievalError::CorruptIndex {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }

    fn read_file(path: &Path) -> RetrievalResult<Vec<u8>> {
        fs::read(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => RetrievalError::MissingIndex {
                path: path.to_path_buf(),
            },
            _ => RetrievalError::Io(e),
        })
    }

    fn load(&self) -> RetrievalResult<FlatData> {
        let raw = Self::read_file(&self.vectors_path)?;
        let path = self.vectors_path.as_path();

        if raw.len() < HEADER_LEN {
            return Err(self.corrupt(path, format!("truncated header ({} bytes)", raw.len())));
        }
        if raw[0..4] != FLAT_MAGIC {
            return Err(self.corrupt(path, format!("bad magic bytes {:?}", &raw[0..4])));
        }

        let version = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        if version != FLAT_VERSION {
            return Err(self.corrupt(path, format!("unsupported version {}", version)));
        }
        let dimension = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]) as usize;
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&raw[12..20]);
        let count = u64::from_le_bytes(count_bytes) as usize;

        if dimension == 0 {
            return Err(self.corrupt(path, "zero dimension"));
        }
        let expected = count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(HEADER_LEN))
            .ok_or_else(|| self.corrupt(path, "vector count overflows"))?;
        if raw.len() != expected {
            return Err(self.corrupt(
                path,
                format!("expected {} bytes, found {}", expected, raw.len()),
            ));
        }

        let vectors: Vec<f32> = raw[HEADER_LEN..]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let ids_raw = Self::read_file(&self.ids_path)?;
        let ids: Vec<i64> = bincode::deserialize(&ids_raw)
            .map_err(|e| self.corrupt(&self.ids_path, e.to_string()))?;
        if ids.len() != count {
            return Err(self.corrupt(
                &self.ids_path,
                format!("{} ids for {} vectors", ids.len(), count),
            ));
        }

        debug!(
            target: "gpu_doctor::retrieval",
            path = %path.display(),
            count,
            dimension,
            "Flat index loaded"
        );
        Ok(FlatData {
            dimension,
            ids,
            vectors,
        })
    }

    fn write(&self, data: &FlatData) -> RetrievalResult<()> {
        let mut out = Vec::with_capacity(HEADER_LEN + data.vectors.len() * 4);
        out.extend_from_slice(&FLAT_MAGIC);
        out.extend_from_slice(&FLAT_VERSION.to_le_bytes());
        out.extend_from_slice(&(data.dimension as u32).to_le_bytes());
        out.extend_from_slice(&(data.ids.len() as u64).to_le_bytes());
        for value in &data.vectors {
            out.extend_from_slice(&value.to_le_bytes());
        }

        let ids = bincode::serialize(&data.ids)
            .map_err(|e| self.corrupt(&self.ids_path, e.to_string()))?;

        write_atomic(&self.ids_path, &ids)?;
        write_atomic(&self.vectors_path, &out)?;
        Ok(())
    }
}

impl VectorIndex for FlatIndex {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn build(&self, store: &Store, encoder: &dyn Encoder) -> RetrievalResult<usize> {
        let rows = store.iter_all()?;
        let dimension = encoder.dimension();

        let mut ids = Vec::with_capacity(rows.len());
        let mut vectors = Vec::with_capacity(rows.len() * dimension);
        for row in &rows {
            let vector = encoder.encode(&row.sample.summary())?;
            if vector.len() != dimension {
                return Err(RetrievalError::DimensionMismatch {
                    expected: dimension,
                    actual: vector.len(),
                });
            }
            ids.push(row.id);
            vectors.extend_from_slice(&vector);
        }

        let data = FlatData {
            dimension,
            ids,
            vectors,
        };
        self.write(&data)?;

        let count = data.ids.len();
        *self.loaded.write() = Some(Arc::new(data));
        Ok(count)
    }

    fn vector_count(&self, _store: &Store) -> RetrievalResult<usize> {
        Ok(self.data()?.ids.len())
    }

    fn nearest(&self, _store: &Store, query: &[f32], k: usize) -> RetrievalResult<Vec<Hit>> {
        let data = self.data()?;
        if query.len() != data.dimension {
            return Err(RetrievalError::DimensionMismatch {
                expected: data.dimension,
                actual: query.len(),
            });
        }

        let scored = data
            .vectors
            .chunks_exact(data.dimension)
            .zip(&data.ids)
            .map(|(vector, id)| (*id, dot(query, vector)));
        Ok(top_k(scored, k))
    }
}

/// Write to a sibling temp file, fsync, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> RetrievalResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::HashEncoder;
    use crate::sample::{PollStamp, Sample};
    use pretty_assertions::assert_eq;

    fn setup() -> (tempfile::TempDir, Store, FlatIndex) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("gpu_logs.db")).unwrap();
        let stamp = PollStamp::now("node-a");
        store
            .insert(&[Sample::idle(&stamp, 0), Sample::idle(&stamp, 1)])
            .unwrap();
        let index = FlatIndex::new(dir.path().join("gpu_logs.vidx"), dir.path().join("gpu_logs.ids"));
        (dir, store, index)
    }

    #[test]
    fn test_build_then_reload_from_disk() {
        let (dir, store, index) = setup();
        let encoder = HashEncoder::new(32);
        assert_eq!(index.build(&store, &encoder).unwrap(), 2);

        let header = fs::read(dir.path().join("gpu_logs.vidx")).unwrap();
        assert_eq!(&header[0..4], b"GDVI");
        assert_eq!(header.len(), HEADER_LEN + 2 * 32 * 4);

        let reopened = FlatIndex::new(dir.path().join("gpu_logs.vidx"), dir.path().join("gpu_logs.ids"));
        let query = encoder.encode("host=node-a gpu=1").unwrap();
        let hits = reopened.nearest(&store, &query, 5).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_missing_artifact() {
        let (_dir, store, index) = setup();
        let err = index.nearest(&store, &[0.0; 8], 3).unwrap_err();
        assert!(matches!(err, RetrievalError::MissingIndex { .. }));
    }

    #[test]
    fn test_corrupt_magic() {
        let (dir, store, index) = setup();
        fs::write(dir.path().join("gpu_logs.vidx"), b"NOPE\x01\0\0\0\x08\0\0\0\0\0\0\0\0\0\0\0").unwrap();
        fs::write(dir.path().join("gpu_logs.ids"), bincode::serialize(&Vec::<i64>::new()).unwrap()).unwrap();

        let err = index.nearest(&store, &[0.0; 8], 3).unwrap_err();
        assert!(matches!(err, RetrievalError::CorruptIndex { .. }));
    }

    #[test]
    fn test_dimension_mismatch() {
        let (_dir, store, index) = setup();
        index.build(&store, &HashEncoder::new(16)).unwrap();
        let err = index.nearest(&store, &[0.0; 8], 3).unwrap_err();
        assert!(matches!(err, RetrievalError::DimensionMismatch { expected: 16, actual: 8 }));
    }
}
