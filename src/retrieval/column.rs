//! In-database backend: an `embedding BLOB` column on the sample table,
//! scanned brute-force at query time.

use rusqlite::{params, Connection};
use tracing::{debug, warn};

use super::{dot, top_k, Encoder, Hit, VectorIndex};
use crate::error::{RetrievalError, RetrievalResult, StoreResult};
use crate::store::{decode_row, sample_columns, Store};

#[derive(Debug, Default)]
pub struct ColumnIndex;

impl ColumnIndex {
    pub fn new() -> Self {
        Self
    }
}

fn has_embedding_column(conn: &Connection) -> StoreResult<bool> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('gpu_samples')")?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
    for name in names {
        if name? == "embedding" {
            return Ok(true);
        }
    }
    Ok(false)
}

fn encode_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(std::mem::size_of_val(vector));
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_blob(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

impl VectorIndex for ColumnIndex {
    fn name(&self) -> &'static str {
        "column"
    }

    /// Adds the column when missing and back-fills rows whose embedding is NULL.
    fn build(&self, store: &Store, encoder: &dyn Encoder) -> RetrievalResult<usize> {
        let pending = store.with_writer(|conn| {
            if !has_embedding_column(conn)? {
                conn.execute_batch("ALTER TABLE gpu_samples ADD COLUMN embedding BLOB")?;
                debug!(target: "gpu_doctor::retrieval", "Added embedding column");
            }
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM gpu_samples WHERE embedding IS NULL ORDER BY id",
                sample_columns()
            ))?;
            let rows = stmt.query_map([], decode_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;

        let mut encoded = Vec::with_capacity(pending.len());
        for row in &pending {
            let vector = encoder.encode(&row.sample.summary())?;
            if vector.len() != encoder.dimension() {
                return Err(RetrievalError::DimensionMismatch {
                    expected: encoder.dimension(),
                    actual: vector.len(),
                });
            }
            encoded.push((row.id, encode_blob(&vector)));
        }

        let written = store.with_writer(|conn| {
            let tx = conn.transaction()?;
            let mut written = 0;
            {
                let mut stmt = tx.prepare_cached(
                    "UPDATE gpu_samples SET embedding = ?1 WHERE id = ?2 AND embedding IS NULL",
                )?;
                for (id, blob) in &encoded {
                    written += stmt.execute(params![blob, id])?;
                }
            }
            tx.commit()?;
            Ok(written)
        })?;
        Ok(written)
    }

    fn vector_count(&self, store: &Store) -> RetrievalResult<usize> {
        let count = store.with_reader(|conn| {
            if !has_embedding_column(conn)? {
                return Ok(0);
            }
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM gpu_samples WHERE embedding IS NOT NULL",
                [],
                |row| row.get(0),
            )?;
            Ok(n)
        })?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn nearest(&self, store: &Store, query: &[f32], k: usize) -> RetrievalResult<Vec<Hit>> {
        let rows: Vec<(i64, Vec<u8>)> = store.with_reader(|conn| {
            if !has_embedding_column(conn)? {
                return Ok(Vec::new());
            }
            let mut stmt =
                conn.prepare("SELECT id, embedding FROM gpu_samples WHERE embedding IS NOT NULL")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;

        let mut scored = Vec::with_capacity(rows.len());
        for (id, blob) in rows {
            match decode_blob(&blob) {
                Some(vector) if vector.len() == query.len() => scored.push((id, dot(query, &vector))),
                Some(vector) => {
                    return Err(RetrievalError::DimensionMismatch {
                        expected: vector.len(),
                        actual: query.len(),
                    })
                }
                None => warn!(target: "gpu_doctor::retrieval", id, "Skipping malformed embedding blob"),
            }
        }
        Ok(top_k(scored, k))
    }
}
