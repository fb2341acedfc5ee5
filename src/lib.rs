//! # GPU Doctor - Telemetry Ingestion & Retrieval Core
//!
//! Samples per-GPU telemetry from `nvidia-smi`, normalizes it across driver
//! versions and output formats, keeps a bounded history in SQLite and answers
//! "what did the GPUs look like when..." questions through vector similarity
//! or exact run-tag lookup.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               GPU DOCTOR                                  │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  nvidia-smi → NEGOTIATE → PARSE (xml | csv) → ENRICH → STORE → PRUNE      │
//! │                                                   │                       │
//! │                                 INDEX BUILD ◄─────┤                       │
//! │                                      │            │                       │
//! │                     search(text) ◄── VECTOR INDEX │                       │
//! │                     search_by_tag(tag) ◄──────────┘                       │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The collector write path and the retrieval read path share nothing but the
//! [`store::Store`]; the vector index is a cache that can be rebuilt from it at
//! any time.

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod collector;
pub mod config;
pub mod enrich;
pub mod error;
pub mod logging;
pub mod negotiate;
pub mod parser;
pub mod retrieval;
pub mod run_tag;
pub mod sample;
pub mod store;
pub mod tool;

pub use collector::{Collector, CollectorState, CollectorStats, CycleReport};
pub use config::{AppConfig, CollectorConfig, LoggingConfig, RetrievalConfig, StorageConfig};
pub use enrich::{ProcessEnricher, ProcessInspector, ProcfsInspector};
pub use error::{GpuDoctorError, GpuDoctorResult};
pub use negotiate::{FieldNegotiator, GpuField};
pub use parser::{parse, strip_units, OutputFormat};
pub use retrieval::{Encoder, HashEncoder, Retriever, VectorIndex};
pub use sample::{PollStamp, Sample, StoredSample};
pub use store::{SampleQuery, Store};
pub use tool::{MetricsTool, NvidiaSmi};

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Crate version - follows semantic versioning
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_NAME: &str = "gpu-doctor";
pub const APP_FULL_NAME: &str = "GPU Doctor Telemetry Core";

// ----------------------------------------------------------------------------
// Collection Defaults
// ----------------------------------------------------------------------------

/// Seconds between two polls of the metrics tool
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Samples older than this are removed by the pruning pass
pub const DEFAULT_RETENTION_DAYS: u64 = 7;

/// Prune after every N collection cycles
pub const DEFAULT_PRUNE_EVERY: u64 = 100;

/// Upper bound for a single metrics tool invocation
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 10;

/// Upper bound for a single process metadata lookup
pub const DEFAULT_ENRICH_TIMEOUT_MS: u64 = 2_000;

/// Metrics tool binary
pub const DEFAULT_TOOL_PATH: &str = "nvidia-smi";

/// Environment variable carrying the run tag inside a tagged workload
pub const RUN_TAG_ENV: &str = "GPU_DOC_RUN_TAG";

/// Sentinel written to process name/user when the lookup fails
pub const UNKNOWN_SENTINEL: &str = "unknown";

/// Default procfs mount point
pub const DEFAULT_PROC_ROOT: &str = "/proc";

// ----------------------------------------------------------------------------
// Storage & Retrieval Defaults
// ----------------------------------------------------------------------------

/// SQLite database file
pub const DEFAULT_DB_PATH: &str = "gpu_logs.db";

/// Flat vector index artifact; the id list sits next to it with an `.ids` extension
pub const DEFAULT_INDEX_PATH: &str = "gpu_logs.vidx";

/// Embedding width (matches MiniLM-L6 so a model-backed encoder can drop in)
pub const DEFAULT_EMBEDDING_DIM: usize = 384;

/// Results returned when the caller does not pass `k`
pub const DEFAULT_SEARCH_K: usize = 5;
