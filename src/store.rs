// ============================================================================
// SAMPLE STORE
// ============================================================================
// Append-only SQLite history with time-bounded retention.
// - WAL journal: readers never block the writer and never see partial batches
// - one writer and one reader connection, each behind its own mutex
// - every batch is one transaction
// ============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, Row, ToSql};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::sample::{format_timestamp, parse_timestamp, Sample, StoredSample};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS gpu_samples (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    ts                  TEXT    NOT NULL,
    host                TEXT    NOT NULL CHECK (length(host) > 0),
    gpu_index           INTEGER NOT NULL CHECK (gpu_index >= 0),
    utilization_gpu_pct INTEGER,
    utilization_mem_pct INTEGER,
    memory_used_mib     INTEGER,
    temperature_c       INTEGER,
    power_draw_w        INTEGER,
    ecc_error_count     INTEGER NOT NULL DEFAULT 0,
    process_id          INTEGER,
    process_name        TEXT,
    process_user        TEXT,
    run_tag             TEXT
);
CREATE INDEX IF NOT EXISTS idx_gpu_samples_ts ON gpu_samples (ts);
CREATE INDEX IF NOT EXISTS idx_gpu_samples_run_tag ON gpu_samples (run_tag);
";

const SAMPLE_COLUMNS: &str = "id, ts, host, gpu_index, utilization_gpu_pct, utilization_mem_pct, \
     memory_used_mib, temperature_c, power_draw_w, ecc_error_count, process_id, process_name, \
     process_user, run_tag";

/// Bound-parameter limit kept well under SQLite's default of 999
const ID_CHUNK: usize = 500;

// ----------------------------------------------------------------------------
// Query Filter
// ----------------------------------------------------------------------------

/// Ad hoc read filter. Results are newest first.
#[derive(Debug, Clone)]
pub struct SampleQuery {
    pub run_tag: Option<String>,
    pub host: Option<String>,
    pub gpu_index: Option<u32>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for SampleQuery {
    fn default() -> Self {
        Self {
            run_tag: None,
            host: None,
            gpu_index: None,
            since: None,
            limit: 100,
        }
    }
}

impl SampleQuery {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn with_run_tag(mut self, tag: impl Into<String>) -> Self {
        self.run_tag = Some(tag.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_gpu(mut self, gpu_index: u32) -> Self {
        self.gpu_index = Some(gpu_index);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }
}

// ----------------------------------------------------------------------------
// Store
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl Store {
    /// Open or create the database, creating the schema on first use.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let writer = Connection::open(path)?;
        writer.pragma_update(None, "journal_mode", "WAL")?;
        writer.pragma_update(None, "synchronous", "NORMAL")?;
        writer.busy_timeout(Duration::from_secs(5))?;
        writer.execute_batch(SCHEMA_SQL)?;

        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(Duration::from_secs(5))?;

        info!(target: "gpu_doctor::store", path = %path.display(), "Sample store opened");

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the writer connection.
    pub fn with_writer<T>(&self, f: impl FnOnce(&mut Connection) -> StoreResult<T>) -> StoreResult<T> {
        let mut conn = self.writer.lock();
        f(&mut conn)
    }

    /// Run `f` against the read-only connection.
    pub fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let conn = self.reader.lock();
        f(&conn)
    }

    /// Insert one poll's batch atomically; returns the number of rows written.
    pub fn insert(&self, batch: &[Sample]) -> StoreResult<usize> {
        if batch.is_empty() {
            return Err(StoreError::EmptyBatch);
        }

        self.with_writer(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO gpu_samples (
                        ts, host, gpu_index, utilization_gpu_pct, utilization_mem_pct,
                        memory_used_mib, temperature_c, power_draw_w, ecc_error_count,
                        process_id, process_name, process_user, run_tag
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                )?;
                for s in batch {
                    stmt.execute(params![
                        format_timestamp(&s.timestamp),
                        s.host,
                        s.gpu_index,
                        s.utilization_gpu_pct,
                        s.utilization_mem_pct,
                        s.memory_used_mib,
                        s.temperature_c,
                        s.power_draw_w,
                        s.ecc_error_count,
                        s.process_id,
                        s.process_name,
                        s.process_user,
                        s.run_tag,
                    ])?;
                }
            }
            tx.commit()?;
            debug!(target: "gpu_doctor::store", rows = batch.len(), "Batch committed");
            Ok(batch.len())
        })
    }

    /// Delete samples older than `older_than`; returns rows deleted.
    pub fn prune(&self, older_than: Duration) -> StoreResult<usize> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.prune_before(cutoff)
    }

    /// Delete samples stamped strictly before `cutoff`.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let cutoff = format_timestamp(&cutoff);
        self.with_writer(|conn| {
            let deleted = conn.execute("DELETE FROM gpu_samples WHERE ts < ?1", params![cutoff])?;
            info!(target: "gpu_doctor::store", deleted, cutoff = %cutoff, "Pruned old samples");
            Ok(deleted)
        })
    }

    /// Filtered read, newest first.
    pub fn query(&self, query: &SampleQuery) -> StoreResult<Vec<StoredSample>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(tag) = &query.run_tag {
            clauses.push("run_tag = ?");
            args.push(Box::new(tag.clone()));
        }
        if let Some(host) = &query.host {
            clauses.push("host = ?");
            args.push(Box::new(host.clone()));
        }
        if let Some(gpu) = query.gpu_index {
            clauses.push("gpu_index = ?");
            args.push(Box::new(gpu));
        }
        if let Some(since) = &query.since {
            clauses.push("ts >= ?");
            args.push(Box::new(format_timestamp(since)));
        }
        args.push(Box::new(i64::try_from(query.limit).unwrap_or(i64::MAX)));

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {SAMPLE_COLUMNS} FROM gpu_samples {where_sql} ORDER BY ts DESC, id DESC LIMIT ?"
        );

        self.with_reader(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), decode_row)?;
            collect_rows(rows)
        })
    }

    /// Rows for `ids` in the order given; ids no longer stored are skipped.
    pub fn fetch_by_ids(&self, ids: &[i64]) -> StoreResult<Vec<StoredSample>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut found: HashMap<i64, StoredSample> = HashMap::with_capacity(ids.len());
        self.with_reader(|conn| {
            for chunk in ids.chunks(ID_CHUNK) {
                let placeholders = vec!["?"; chunk.len()].join(",");
                let sql = format!("SELECT {SAMPLE_COLUMNS} FROM gpu_samples WHERE id IN ({placeholders})");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(chunk.iter()), decode_row)?;
                for row in collect_rows(rows)? {
                    found.insert(row.id, row);
                }
            }
            Ok(())
        })?;

        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    pub fn count(&self) -> StoreResult<u64> {
        self.with_reader(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM gpu_samples", [], |r| r.get(0))?;
            Ok(n.max(0) as u64)
        })
    }

    /// Every stored row in insertion order.
    pub fn iter_all(&self) -> StoreResult<Vec<StoredSample>> {
        self.with_reader(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {SAMPLE_COLUMNS} FROM gpu_samples ORDER BY id"))?;
            let rows = stmt.query_map([], decode_row)?;
            collect_rows(rows)
        })
    }
}

// ----------------------------------------------------------------------------
// Row Decoding
// ----------------------------------------------------------------------------

fn collect_rows<F>(rows: rusqlite::MappedRows<'_, F>) -> StoreResult<Vec<StoredSample>>
where
    F: FnMut(&Row<'_>) -> rusqlite::Result<StoredSample>,
{
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Decode a row selected with [`SAMPLE_COLUMNS`].
pub(crate) fn decode_row(row: &Row<'_>) -> rusqlite::Result<StoredSample> {
    let raw_ts: String = row.get(1)?;
    let timestamp = parse_timestamp(&raw_ts).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("invalid timestamp '{}'", raw_ts).into(),
        )
    })?;

    Ok(StoredSample {
        id: row.get(0)?,
        sample: Sample {
            timestamp,
            host: row.get(2)?,
            gpu_index: row.get(3)?,
            utilization_gpu_pct: row.get(4)?,
            utilization_mem_pct: row.get(5)?,
            memory_used_mib: row.get(6)?,
            temperature_c: row.get(7)?,
            power_draw_w: row.get(8)?,
            ecc_error_count: row.get(9)?,
            process_id: row.get(10)?,
            process_name: row.get(11)?,
            process_user: row.get(12)?,
            run_tag: row.get(13)?,
        },
    })
}

/// Column list accepted by [`decode_row`], for callers composing their own SELECT
pub(crate) fn sample_columns() -> &'static str {
    SAMPLE_COLUMNS
}
