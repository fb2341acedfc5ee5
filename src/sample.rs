// ============================================================================
// CORE TYPE SYSTEM
// ============================================================================
// One normalized telemetry row per GPU per poll, or per (GPU, process) pair
// when processes occupy the GPU.
// ============================================================================

use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Fixed-width ISO-8601 layout; lexical order equals chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Render a timestamp the way it is persisted and summarized
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Inverse of [`format_timestamp`]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Hostname of this machine, or `"localhost"` when it cannot be determined
pub fn local_hostname() -> String {
    sysinfo::System::host_name()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

// ----------------------------------------------------------------------------
// Poll Stamp
// ----------------------------------------------------------------------------

/// Wall-clock instant and host read once per poll and shared by every row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollStamp {
    pub timestamp: DateTime<Utc>,
    pub host: String,
}

impl PollStamp {
    pub fn new(timestamp: DateTime<Utc>, host: impl Into<String>) -> Self {
        Self {
            timestamp,
            host: host.into(),
        }
    }

    /// Current instant at the precision the store keeps (microseconds)
    pub fn now(host: impl Into<String>) -> Self {
        Self::new(Utc::now().trunc_subsecs(6), host)
    }
}

// ----------------------------------------------------------------------------
// Sample
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub host: String,
    pub gpu_index: u32,
    pub utilization_gpu_pct: Option<i64>,
    pub utilization_mem_pct: Option<i64>,
    pub memory_used_mib: Option<i64>,
    pub temperature_c: Option<i64>,
    pub power_draw_w: Option<i64>,
    /// Always zero until the tool exposes per-GPU ECC counters in the query
    pub ecc_error_count: i64,
    pub process_id: Option<u32>,
    pub process_name: Option<String>,
    pub process_user: Option<String>,
    pub run_tag: Option<String>,
}

impl Sample {
    /// A sample with no metrics and no process attribution.
    pub fn idle(stamp: &PollStamp, gpu_index: u32) -> Self {
        Self {
            timestamp: stamp.timestamp,
            host: stamp.host.clone(),
            gpu_index,
            utilization_gpu_pct: None,
            utilization_mem_pct: None,
            memory_used_mib: None,
            temperature_c: None,
            power_draw_w: None,
            ecc_error_count: 0,
            process_id: None,
            process_name: None,
            process_user: None,
            run_tag: None,
        }
    }

    /// Copy of this sample attributed to `pid`, with name/user/tag left unresolved.
    pub fn for_process(&self, pid: u32) -> Self {
        Self {
            process_id: Some(pid),
            process_name: None,
            process_user: None,
            run_tag: None,
            ..self.clone()
        }
    }

    pub fn is_idle(&self) -> bool {
        self.process_id.is_none()
    }

    /// Persisted form of the timestamp
    pub fn timestamp_string(&self) -> String {
        format_timestamp(&self.timestamp)
    }

    /// Deterministic one-line text used both for indexing and for display.
    pub fn summary(&self) -> String {
        format!(
            "{} host={} gpu={} util={}% mem={}MB pid={} user={} tag={}",
            self.timestamp_string(),
            self.host,
            self.gpu_index,
            OrNone(&self.utilization_gpu_pct),
            OrNone(&self.memory_used_mib),
            OrNone(&self.process_id),
            OrNone(&self.process_user),
            OrNone(&self.run_tag),
        )
    }
}

impl Display for Sample {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Renders `None` literally so summaries keep a fixed shape.
struct OrNone<'a, T>(&'a Option<T>);

impl<T: Display> Display for OrNone<'_, T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(v) => v.fmt(f),
            None => f.write_str("None"),
        }
    }
}

/// A sample together with its store-assigned row id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSample {
    pub id: i64,
    #[serde(flatten)]
    pub sample: Sample,
}
