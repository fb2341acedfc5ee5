// ============================================================================
// COLLECTOR
// ============================================================================
// The polling loop:
//
//   Idle → Polling → Parsing → Enriching → Persisting → (Pruning) → Idle
//
// A cycle that fails anywhere is logged and counted; the loop carries on
// after the normal sleep. Cancellation is observed between cycles only, so
// an in-flight cycle always completes.
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{CollectorConfig, SECS_PER_DAY};
use crate::enrich::ProcessEnricher;
use crate::error::{GpuDoctorError, GpuDoctorResult, StoreError};
use crate::negotiate::FieldNegotiator;
use crate::parser::{parse, OutputFormat};
use crate::sample::{local_hostname, PollStamp, Sample};
use crate::store::Store;
use crate::tool::MetricsTool;

// ----------------------------------------------------------------------------
// State & Reports
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CollectorState {
    Idle,
    Polling,
    Parsing,
    Enriching,
    Persisting,
    Pruning,
    Stopped,
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollectorState::Idle => "idle",
            CollectorState::Polling => "polling",
            CollectorState::Parsing => "parsing",
            CollectorState::Enriching => "enriching",
            CollectorState::Persisting => "persisting",
            CollectorState::Pruning => "pruning",
            CollectorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Outcome of one successful cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    /// Format that produced the samples
    pub format: OutputFormat,
    /// The structured attempt failed and the delimited one was used
    pub fell_back: bool,
    pub samples: usize,
    /// Rows deleted when this cycle also ran the retention pass
    pub pruned: Option<usize>,
}

/// Counters accumulated over the collector's lifetime.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectorStats {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub fallbacks: u64,
    pub samples_written: u64,
    pub rows_pruned: u64,
    pub avg_cycle_us: u64,
    pub max_cycle_us: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct CollectorStatsTracker {
    cycles: AtomicU64,
    failed_cycles: AtomicU64,
    fallbacks: AtomicU64,
    samples_written: AtomicU64,
    rows_pruned: AtomicU64,
    total_duration_us: AtomicU64,
    max_duration_us: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl CollectorStatsTracker {
    fn record_cycle(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.cycles.fetch_add(1, AtomicOrdering::Relaxed);
        self.total_duration_us.fetch_add(us, AtomicOrdering::Relaxed);
        self.max_duration_us.fetch_max(us, AtomicOrdering::Relaxed);
    }

    fn record_error(&self, error: &GpuDoctorError) {
        self.failed_cycles.fetch_add(1, AtomicOrdering::Relaxed);
        *self.last_error.lock() = Some(error.to_string());
    }

    fn snapshot(&self) -> CollectorStats {
        let cycles = self.cycles.load(AtomicOrdering::Relaxed);
        let total_us = self.total_duration_us.load(AtomicOrdering::Relaxed);
        CollectorStats {
            cycles,
            failed_cycles: self.failed_cycles.load(AtomicOrdering::Relaxed),
            fallbacks: self.fallbacks.load(AtomicOrdering::Relaxed),
            samples_written: self.samples_written.load(AtomicOrdering::Relaxed),
            rows_pruned: self.rows_pruned.load(AtomicOrdering::Relaxed),
            avg_cycle_us: if cycles > 0 { total_us / cycles } else { 0 },
            max_cycle_us: self.max_duration_us.load(AtomicOrdering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Collector
// ----------------------------------------------------------------------------

pub struct Collector {
    tool: Arc<dyn MetricsTool>,
    enricher: ProcessEnricher,
    store: Arc<Store>,
    fields: Vec<String>,
    hostname: Option<String>,
    poll_interval: Duration,
    retention: Duration,
    prune_every: u64,
    cycle: AtomicU64,
    state: RwLock<CollectorState>,
    stats: CollectorStatsTracker,
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("fields", &self.fields)
            .field("poll_interval", &self.poll_interval)
            .field("retention", &self.retention)
            .field("prune_every", &self.prune_every)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Collector {
    /// Negotiate fields with the tool and build a collector.
    ///
    /// A tool that cannot answer the capability query is a startup failure.
    pub async fn initialize(
        config: &CollectorConfig,
        tool: Arc<dyn MetricsTool>,
        enricher: ProcessEnricher,
        store: Arc<Store>,
    ) -> GpuDoctorResult<Self> {
        let negotiator = FieldNegotiator::discover(tool.as_ref()).await?;
        let fields = negotiator.negotiate(&config.requested_fields);
        info!(target: "gpu_doctor::collector", fields = ?fields, "Field list negotiated");
        Ok(Self::with_fields(config, tool, enricher, store, fields))
    }

    /// Build a collector around an already negotiated field list.
    pub fn with_fields(
        config: &CollectorConfig,
        tool: Arc<dyn MetricsTool>,
        enricher: ProcessEnricher,
        store: Arc<Store>,
        fields: Vec<String>,
    ) -> Self {
        Self {
            tool,
            enricher,
            store,
            fields,
            hostname: config.hostname.clone().filter(|h| !h.trim().is_empty()),
            poll_interval: config.poll_interval(),
            retention: config.retention(),
            prune_every: config.prune_every.max(1),
            cycle: AtomicU64::new(0),
            state: RwLock::new(CollectorState::Idle),
            stats: CollectorStatsTracker::default(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn state(&self) -> CollectorState {
        *self.state.read()
    }

    pub fn stats(&self) -> CollectorStats {
        self.stats.snapshot()
    }

    fn set_state(&self, state: CollectorState) {
        *self.state.write() = state;
    }

    fn poll_stamp(&self) -> PollStamp {
        let host = self.hostname.clone().unwrap_or_else(local_hostname);
        PollStamp::now(host)
    }

    // ------------------------------------------------------------------------
    // Cycle
    // ------------------------------------------------------------------------

    async fn fetch(&self, format: OutputFormat, stamp: &PollStamp) -> GpuDoctorResult<Vec<Sample>> {
        self.set_state(CollectorState::Polling);
        let raw = self.tool.query(&self.fields, format).await?;
        self.set_state(CollectorState::Parsing);
        Ok(parse(&raw, format, &self.fields, stamp)?)
    }

    /// Structured first; any failure there retries once in delimited format.
    async fn poll(&self, stamp: &PollStamp) -> GpuDoctorResult<(Vec<Sample>, OutputFormat, bool)> {
        match self.fetch(OutputFormat::Structured, stamp).await {
            Ok(samples) => Ok((samples, OutputFormat::Structured, false)),
            Err(e) => {
                warn!(
                    target: "gpu_doctor::collector",
                    error = %e,
                    category = e.category(),
                    "Structured poll failed, retrying with delimited format"
                );
                self.stats.fallbacks.fetch_add(1, AtomicOrdering::Relaxed);
                let samples = self.fetch(OutputFormat::Delimited, stamp).await?;
                Ok((samples, OutputFormat::Delimited, true))
            }
        }
    }

    async fn persist(&self, batch: Vec<Sample>) -> GpuDoctorResult<usize> {
        self.set_state(CollectorState::Persisting);
        let store = Arc::clone(&self.store);
        let written = tokio::task::spawn_blocking(move || store.insert(&batch))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;
        Ok(written)
    }

    async fn prune(&self) -> GpuDoctorResult<usize> {
        self.set_state(CollectorState::Pruning);
        let store = Arc::clone(&self.store);
        let retention = self.retention;
        let deleted = tokio::task::spawn_blocking(move || store.prune(retention))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;
        self.stats.rows_pruned.fetch_add(deleted as u64, AtomicOrdering::Relaxed);
        Ok(deleted)
    }

    /// Poll, parse, enrich and persist once.
    async fn collect(&self, cycle: u64) -> GpuDoctorResult<CycleReport> {
        let stamp = self.poll_stamp();
        let (samples, format, fell_back) = self.poll(&stamp).await?;

        self.set_state(CollectorState::Enriching);
        let samples = self.enricher.enrich_all(samples).await;

        let written = if samples.is_empty() {
            debug!(target: "gpu_doctor::collector", cycle, "No GPUs reported, nothing to persist");
            0
        } else {
            self.persist(samples).await?
        };
        self.stats.samples_written.fetch_add(written as u64, AtomicOrdering::Relaxed);

        Ok(CycleReport {
            cycle,
            format,
            fell_back,
            samples: written,
            pruned: None,
        })
    }

    /// One full cycle including the periodic retention pass.
    ///
    /// Errors are logged and counted before being returned.
    pub async fn tick(&self) -> GpuDoctorResult<CycleReport> {
        let started = Instant::now();
        let cycle = self.cycle.fetch_add(1, AtomicOrdering::Relaxed) + 1;

        let mut result = self.collect(cycle).await;
        if let Err(e) = &result {
            self.stats.record_error(e);
            if e.is_recoverable() {
                warn!(target: "gpu_doctor::collector", cycle, error = %e, category = e.category(), "Collection cycle failed");
            } else {
                error!(target: "gpu_doctor::collector", cycle, error = %e, category = e.category(), "Collection cycle failed");
            }
        }

        if cycle % self.prune_every == 0 {
            match self.prune().await {
                Ok(deleted) => {
                    info!(
                        target: "gpu_doctor::collector",
                        deleted,
                        retention_days = self.retention.as_secs() / SECS_PER_DAY,
                        "Retention pass complete"
                    );
                    if let Ok(report) = &mut result {
                        report.pruned = Some(deleted);
                    }
                }
                Err(e) => warn!(target: "gpu_doctor::collector", error = %e, "Retention pass failed"),
            }
        }

        self.stats.record_cycle(started.elapsed());
        self.set_state(CollectorState::Idle);

        if let Ok(report) = &result {
            debug!(
                target: "gpu_doctor::collector",
                cycle,
                format = report.format.name(),
                samples = report.samples,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Cycle complete"
            );
        }
        result
    }

    /// Take a single snapshot.
    pub async fn run_once(&self) -> GpuDoctorResult<CycleReport> {
        let result = self.tick().await;
        self.set_state(CollectorState::Stopped);
        result
    }

    /// Poll until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> CollectorStats {
        info!(
            target: "gpu_doctor::collector",
            interval_secs = self.poll_interval.as_secs_f64(),
            retention_days = self.retention.as_secs() / SECS_PER_DAY,
            prune_every = self.prune_every,
            "Collector started"
        );

        while !shutdown.is_cancelled() {
            let _ = self.tick().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        self.set_state(CollectorState::Stopped);
        let stats = self.stats();
        info!(
            target: "gpu_doctor::collector",
            cycles = stats.cycles,
            failed = stats.failed_cycles,
            samples = stats.samples_written,
            "Collector stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::{ProcessInspector, ProcessMeta};
    use crate::error::{ToolError, ToolResult};
    use crate::retrieval::Retriever;
    use crate::config::RetrievalConfig;
    use async_trait::async_trait;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    const CAPABILITIES: &str = "\"minor_number\"\n\"fb_memory_usage/used\"\n\"utilization/gpu_util\"\n\
        \"utilization/memory_util\"\n\"temperature/gpu_temp\"\n\"power_readings/power_draw\"\n";

    const TWO_GPUS: &str = r#"<nvidia_smi_log>
  <gpu><minor_number>0</minor_number>
    <utilization><gpu_util>0 %</gpu_util><memory_util>0 %</memory_util></utilization>
    <fb_memory_usage><used>0 MiB</used></fb_memory_usage>
  </gpu>
  <gpu><minor_number>1</minor_number>
    <utilization><gpu_util>87 %</gpu_util><memory_util>40 %</memory_util></utilization>
    <fb_memory_usage><used>10240 MiB</used></fb_memory_usage>
    <processes><process_info><pid>1234</pid></process_info></processes>
  </gpu>
</nvidia_smi_log>"#;

    struct FakeTool {
        capabilities: Option<String>,
        structured: Option<Vec<u8>>,
        delimited: Option<Vec<u8>>,
        calls: Mutex<Vec<OutputFormat>>,
    }

    impl FakeTool {
        fn new(structured: Option<&str>, delimited: Option<&str>) -> Self {
            Self {
                capabilities: Some(CAPABILITIES.to_string()),
                structured: structured.map(|s| s.as_bytes().to_vec()),
                delimited: delimited.map(|s| s.as_bytes().to_vec()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MetricsTool for FakeTool {
        async fn capabilities(&self) -> ToolResult<String> {
            self.capabilities
                .clone()
                .ok_or_else(|| ToolError::NotFound { path: "nvidia-smi".into() })
        }

        async fn query(&self, _fields: &[String], format: OutputFormat) -> ToolResult<Vec<u8>> {
            self.calls.lock().push(format);
            let out = match format {
                OutputFormat::Structured => &self.structured,
                OutputFormat::Delimited => &self.delimited,
            };
            out.clone().ok_or(ToolError::NonZeroExit {
                code: Some(6),
                stderr: "No devices were found".into(),
            })
        }
    }

    struct FakeInspector;

    impl ProcessInspector for FakeInspector {
        fn inspect(&self, pid: u32) -> Option<ProcessMeta> {
            (pid == 1234).then(|| ProcessMeta {
                name: "python".into(),
                user: "mira".into(),
                run_tag: Some("run-42".into()),
            })
        }
    }

    fn config() -> CollectorConfig {
        CollectorConfig {
            hostname: Some("node-a".into()),
            ..CollectorConfig::default()
        }
    }

    fn enricher() -> ProcessEnricher {
        ProcessEnricher::new(Arc::new(FakeInspector), Duration::from_secs(2))
    }

    fn open_store() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("gpu_logs.db")).unwrap());
        (dir, store)
    }

    async fn collector(tool: FakeTool, store: Arc<Store>, config: &CollectorConfig) -> Collector {
        Collector::initialize(config, Arc::new(tool), enricher(), store)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_two_gpus_one_process() {
        let (dir, store) = open_store();
        let collector = collector(FakeTool::new(Some(TWO_GPUS), None), Arc::clone(&store), &config()).await;

        let report = collector.tick().await.unwrap();
        assert_eq!(report.samples, 2);
        assert_eq!(report.format, OutputFormat::Structured);
        assert!(!report.fell_back);
        assert_eq!(collector.state(), CollectorState::Idle);

        let rows = store.iter_all().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].sample.timestamp, rows[1].sample.timestamp);
        assert!(rows[0].sample.is_idle());
        assert_eq!(rows[0].sample.gpu_index, 0);
        assert_eq!(rows[1].sample.gpu_index, 1);
        assert_eq!(rows[1].sample.process_id, Some(1234));
        assert_eq!(rows[1].sample.process_user.as_deref(), Some("mira"));

        let retrieval = RetrievalConfig {
            backend: "column".into(),
            index_path: dir.path().join("gpu_logs.vidx"),
            ..RetrievalConfig::default()
        };
        let retriever = Retriever::from_config(&retrieval, store).unwrap();
        let hits = retriever.search_by_tag("run-42", 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].contains("gpu=1"));
        assert!(hits[0].contains("tag=run-42"));
        assert!(hits[0].contains("util=87% mem=10240MB pid=1234 user=mira"));
    }

    #[tokio::test]
    async fn test_structured_failure_falls_back_to_delimited() {
        let (_dir, store) = open_store();
        let tool = Arc::new(FakeTool::new(None, Some("0, 100, 50, 20, 60, 120\n1, 0, 0, 0, 30, 80\n")));
        let collector = Collector::initialize(&config(), tool.clone(), enricher(), Arc::clone(&store))
            .await
            .unwrap();

        let report = collector.tick().await.unwrap();
        assert!(report.fell_back);
        assert_eq!(report.format, OutputFormat::Delimited);
        assert_eq!(report.samples, 2);
        assert!(store.iter_all().unwrap().iter().all(|r| r.sample.is_idle()));
        assert_eq!(collector.stats().fallbacks, 1);
        assert_eq!(*tool.calls.lock(), vec![OutputFormat::Structured, OutputFormat::Delimited]);
    }

    #[tokio::test]
    async fn test_malformed_structured_output_falls_back() {
        let (_dir, store) = open_store();
        let tool = FakeTool::new(Some("<nvidia_smi_log><gpu>"), Some("3, 1, 1, 1, 40, 70\n"));
        let collector = collector(tool, Arc::clone(&store), &config()).await;

        let report = collector.tick().await.unwrap();
        assert!(report.fell_back);
        assert_eq!(store.iter_all().unwrap()[0].sample.gpu_index, 3);
    }

    #[tokio::test]
    async fn test_both_formats_failing_is_counted() {
        let (_dir, store) = open_store();
        let collector = collector(FakeTool::new(None, None), Arc::clone(&store), &config()).await;

        assert!(collector.tick().await.is_err());
        let stats = collector.stats();
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.failed_cycles, 1);
        assert!(stats.last_error.unwrap().contains("No devices"));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_negotiation_is_startup_error() {
        let (_dir, store) = open_store();
        let mut tool = FakeTool::new(Some(TWO_GPUS), None);
        tool.capabilities = None;

        let err = Collector::initialize(&config(), Arc::new(tool), enricher(), store)
            .await
            .unwrap_err();
        assert!(matches!(err, GpuDoctorError::Startup(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_prunes_every_nth_cycle() {
        let (_dir, store) = open_store();
        let old = PollStamp::new(Utc::now() - chrono::Duration::days(30), "node-a");
        store.insert(&[Sample::idle(&old, 0)]).unwrap();

        let config = CollectorConfig {
            prune_every: 2,
            ..config()
        };
        let collector = collector(FakeTool::new(Some(TWO_GPUS), None), Arc::clone(&store), &config).await;

        assert_eq!(collector.tick().await.unwrap().pruned, None);
        assert_eq!(store.count().unwrap(), 3);

        assert_eq!(collector.tick().await.unwrap().pruned, Some(1));
        assert_eq!(store.count().unwrap(), 4);
        assert_eq!(collector.stats().rows_pruned, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (_dir, store) = open_store();
        let config = CollectorConfig {
            poll_interval_secs: 3600,
            ..config()
        };
        let collector = Arc::new(collector(FakeTool::new(Some(TWO_GPUS), None), store, &config).await);

        let token = CancellationToken::new();
        let handle = {
            let collector = Arc::clone(&collector);
            let token = token.clone();
            tokio::spawn(async move { collector.run(token).await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
        let stats = handle.await.unwrap();

        assert_eq!(stats.cycles, 1);
        assert_eq!(collector.state(), CollectorState::Stopped);
    }

    #[tokio::test]
    async fn test_run_once_stops() {
        let (_dir, store) = open_store();
        let collector = collector(FakeTool::new(Some(TWO_GPUS), None), store, &config()).await;

        collector.run_once().await.unwrap();
        assert_eq!(collector.state(), CollectorState::Stopped);
        assert_eq!(collector.stats().samples_written, 2);
    }
}
