// ============================================================================
// GPU DOCTOR CLI
// ============================================================================

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gpu_doctor::config::{BackendKind, SECS_PER_DAY};
use gpu_doctor::logging::init_logging;
use gpu_doctor::run_tag::derive_run_tag_from_env;
use gpu_doctor::{
    AppConfig, Collector, GpuDoctorError, GpuDoctorResult, NvidiaSmi, ProcessEnricher,
    ProcfsInspector, Retriever, SampleQuery, Store, StoredSample, APP_FULL_NAME, VERSION,
};

// ----------------------------------------------------------------------------
// Arguments
// ----------------------------------------------------------------------------

/// GPU Doctor telemetry collector
#[derive(Parser, Debug)]
#[command(
    name = "gpu-doctor",
    version,
    about = "GPU telemetry collection and retrieval",
    long_about = "Samples per-GPU telemetry from nvidia-smi, attributes it to \
                  processes and run tags, keeps a bounded history in SQLite and \
                  answers similarity and run-tag queries over that history."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "gpu-doctor.toml", env = "GPU_DOCTOR_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "GPU_DOCTOR_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long, env = "GPU_DOCTOR_DEBUG")]
    pub debug: bool,

    /// Subcommand to run (defaults to `collect`)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Poll the metrics tool and persist samples
    Collect {
        /// Take a single snapshot and exit
        #[arg(long)]
        once: bool,

        /// Seconds between polls
        #[arg(short, long)]
        interval: Option<u64>,

        /// Days of history to keep
        #[arg(long)]
        retention_days: Option<u64>,

        /// Run the retention pass every N cycles
        #[arg(long)]
        prune_every: Option<u64>,
    },

    /// Delete samples older than the retention window
    Prune {
        /// Days of history to keep (default: configured retention)
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        days: Option<u64>,
    },

    /// Rebuild the vector index from stored samples
    BuildIndex {
        /// Backend to build (flat or column)
        #[arg(short, long)]
        backend: Option<String>,
    },

    /// Find stored samples similar to a free-text query
    Search {
        /// Query text
        text: String,

        /// Number of results
        #[arg(short)]
        k: Option<usize>,

        /// Print one JSON object per row
        #[arg(long)]
        json: bool,
    },

    /// Most recent samples carrying a run tag
    SearchTag {
        /// Run tag
        tag: String,

        /// Number of results
        #[arg(short)]
        k: Option<usize>,

        /// Print one JSON object per row
        #[arg(long)]
        json: bool,
    },

    /// Show the newest stored samples
    Recent {
        /// Number of rows
        #[arg(short, default_value_t = 20)]
        n: usize,

        /// Only rows with this run tag
        #[arg(long)]
        tag: Option<String>,

        /// Only rows from this host
        #[arg(long)]
        host: Option<String>,

        /// Only rows for this GPU index
        #[arg(long)]
        gpu: Option<u32>,

        /// Print one JSON object per row
        #[arg(long)]
        json: bool,
    },

    /// Print the run tag a tagging wrapper would assign in this environment
    RunTag,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> GpuDoctorResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match AppConfig::load(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Metrics tool: {}", config.collector.tool_path);
            println!("  • Poll interval: {}s", config.collector.poll_interval_secs);
            println!("  • Retention: {} days", config.collector.retention_days);
            println!("  • Prune every: {} cycles", config.collector.prune_every);
            println!("  • Requested fields: {}", config.collector.requested_fields.len());
            println!("  • Database: {}", config.storage.db_path.display());
            println!("  • Retrieval backend: {}", config.retrieval.backend);
            println!("  • Embedding dimension: {}", config.retrieval.embedding_dim);
            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(GpuDoctorError::Config(e))
        }
    }
}

fn handle_generate_config(output: Option<&Path>) -> GpuDoctorResult<()> {
    let config_str = AppConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }
    Ok(())
}

fn handle_version() {
    println!("🩺 {} v{}", APP_FULL_NAME, VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • Family: {}", std::env::consts::FAMILY);
    println!();
    println!("Features:");
    println!("  • nvidia-smi field negotiation with legacy aliases");
    println!("  • XML polling with CSV fallback");
    println!("  • Per-process and run-tag attribution");
    println!("  • SQLite history with retention pruning");
    println!("  • Flat-file and in-database vector search");
}

/// Cancel `shutdown` on SIGTERM or SIGINT.
fn spawn_signal_handler(shutdown: CancellationToken) -> AnyhowResult<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!(target: "gpu_doctor::main", "Received SIGTERM"),
            _ = sigint.recv() => info!(target: "gpu_doctor::main", "Received SIGINT"),
        }
        shutdown.cancel();
    });
    Ok(())
}

fn open_store(config: &AppConfig) -> AnyhowResult<Arc<Store>> {
    let path = &config.storage.db_path;
    let store = Store::open(path)
        .with_context(|| format!("Failed to open store at {}", path.display()))?;
    Ok(Arc::new(store))
}

fn print_samples(rows: &[StoredSample], json: bool) -> AnyhowResult<()> {
    if json {
        for row in rows {
            println!("{}", serde_json::to_string(row)?);
        }
        return Ok(());
    }
    if rows.is_empty() {
        println!("No samples found.");
    }
    for (rank, row) in rows.iter().enumerate() {
        println!("{:>3}. {}", rank + 1, row.sample.summary());
    }
    Ok(())
}

async fn handle_collect(config: AppConfig, once: bool) -> AnyhowResult<()> {
    let store = open_store(&config)?;
    let settings = &config.collector;

    let tool = Arc::new(NvidiaSmi::new(settings.tool_path.clone(), settings.tool_timeout()));
    let inspector = Arc::new(ProcfsInspector::new(
        settings.proc_root.clone(),
        settings.run_tag_env.clone(),
    ));
    let enricher = ProcessEnricher::new(inspector, settings.enrich_timeout());

    let collector = Collector::initialize(settings, tool, enricher, store)
        .await
        .context("Collector startup failed")?;

    if once {
        let report = collector.run_once().await?;
        println!(
            "✅ Cycle {}: {} samples via {} output{}",
            report.cycle,
            report.samples,
            report.format.name(),
            if report.fell_back { " (fallback)" } else { "" }
        );
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let stats = collector.run(shutdown).await;
    if let Some(error) = &stats.last_error {
        warn!(target: "gpu_doctor::main", failed = stats.failed_cycles, last_error = %error, "Collector saw failures");
    }
    Ok(())
}

fn handle_prune(config: &AppConfig, days: Option<u64>) -> AnyhowResult<()> {
    let days = days.unwrap_or(config.collector.retention_days);
    let store = open_store(config)?;
    let window = days
        .checked_mul(SECS_PER_DAY)
        .with_context(|| format!("Retention window of {} days is out of range", days))?;
    let deleted = store.prune(Duration::from_secs(window))?;
    println!("✅ Pruned {} samples older than {} days", deleted, days);
    Ok(())
}

fn handle_build_index(mut config: AppConfig, backend: Option<String>) -> AnyhowResult<()> {
    if let Some(backend) = backend {
        if BackendKind::parse(&backend)? == BackendKind::Auto {
            anyhow::bail!("build-index needs a concrete backend (flat or column)");
        }
        config.retrieval.backend = backend;
    }
    let retriever = Retriever::from_config(&config.retrieval, open_store(&config)?)?;
    let written = retriever.build_index()?;
    println!("✅ Indexed {} samples with the {} backend", written, retriever.backend());
    Ok(())
}

// ----------------------------------------------------------------------------
// Main Entry Point
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need full initialization
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        Some(Commands::RunTag) => {
            println!("{}", derive_run_tag_from_env());
            return Ok(());
        }
        _ => {}
    }

    let mut config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.debug {
        config.logging.level = "debug".into();
    }
    init_logging(&config.logging)?;

    info!(target: "gpu_doctor::main", "🩺 {} v{}", APP_FULL_NAME, VERSION);
    if !cli.config.exists() {
        info!(target: "gpu_doctor::main", path = %cli.config.display(), "Config file not found, using defaults");
    }

    let command = cli.command.unwrap_or(Commands::Collect {
        once: false,
        interval: None,
        retention_days: None,
        prune_every: None,
    });

    match command {
        Commands::Collect {
            once,
            interval,
            retention_days,
            prune_every,
        } => {
            if let Some(secs) = interval {
                config.collector.poll_interval_secs = secs;
            }
            if let Some(days) = retention_days {
                config.collector.retention_days = days;
            }
            if let Some(n) = prune_every {
                config.collector.prune_every = n;
            }
            config.validate()?;
            handle_collect(config, once).await?;
        }
        Commands::Prune { days } => handle_prune(&config, days)?,
        Commands::BuildIndex { backend } => handle_build_index(config, backend)?,
        Commands::Search { text, k, json } => {
            let k = k.unwrap_or(config.retrieval.default_k);
            let retriever = Retriever::from_config(&config.retrieval, open_store(&config)?)?;
            print_samples(&retriever.search_samples(&text, k)?, json)?;
        }
        Commands::SearchTag { tag, k, json } => {
            let k = k.unwrap_or(config.retrieval.default_k);
            let retriever = Retriever::from_config(&config.retrieval, open_store(&config)?)?;
            print_samples(&retriever.search_by_tag_samples(&tag, k)?, json)?;
        }
        Commands::Recent {
            n,
            tag,
            host,
            gpu,
            json,
        } => {
            let mut query = SampleQuery::new(n);
            if let Some(tag) = tag {
                query = query.with_run_tag(tag);
            }
            if let Some(host) = host {
                query = query.with_host(host);
            }
            if let Some(gpu) = gpu {
                query = query.with_gpu(gpu);
            }
            print_samples(&open_store(&config)?.query(&query)?, json)?;
        }
        Commands::RunTag | Commands::Validate { .. } | Commands::GenerateConfig { .. } | Commands::Version => {
            unreachable!("handled before the config is loaded")
        }
    }

    Ok(())
}
