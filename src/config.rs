// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Layered configuration:
// - built-in defaults
// - optional TOML file
// - GPU_DOCTOR_* environment variables (`__` separates nesting levels)
// - legacy GPU_DOC_* variables understood by older deployments
// - CLI flags (applied by the binary)
// ============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::negotiate::GpuField;
use crate::{
    DEFAULT_DB_PATH, DEFAULT_EMBEDDING_DIM, DEFAULT_ENRICH_TIMEOUT_MS, DEFAULT_INDEX_PATH,
    DEFAULT_POLL_INTERVAL_SECS, DEFAULT_PROC_ROOT, DEFAULT_PRUNE_EVERY, DEFAULT_RETENTION_DAYS,
    DEFAULT_SEARCH_K, DEFAULT_TOOL_PATH, DEFAULT_TOOL_TIMEOUT_SECS, RUN_TAG_ENV,
};

/// Prefix for structured environment overrides
pub const ENV_PREFIX: &str = "GPU_DOCTOR_";

/// Legacy variable names: poll interval (s), retention (days), prune counter, log level
pub const LEGACY_POLL_ENV: &str = "GPU_DOC_POLL_SEC";
pub const LEGACY_KEEP_DAYS_ENV: &str = "GPU_DOC_KEEP_DAYS";
pub const LEGACY_PRUNE_EVERY_ENV: &str = "GPU_DOC_PRUNE_EVERY";
pub const LEGACY_LOG_LEVEL_ENV: &str = "GPU_DOC_LOG_LEVEL";

pub const SECS_PER_DAY: u64 = 86_400;

// ----------------------------------------------------------------------------
// Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration, constructed once at startup and passed down explicitly
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub collector: CollectorConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from file with environment overrides.
    ///
    /// The file must exist; use [`AppConfig::load_or_default`] when it is optional.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Self::extract(Figment::new().merge(Toml::file(path)))
    }

    /// Same as [`AppConfig::load`] but tolerates a missing file.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Self::extract(Figment::new())
        }
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.apply_legacy_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the `GPU_DOC_*` variables older deployments export.
    pub fn apply_legacy_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| -> Result<Option<u64>, ConfigError> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|e| ConfigError::invalid_value(key, e.to_string())),
                None => Ok(None),
            }
        };

        if let Some(secs) = parse(LEGACY_POLL_ENV)? {
            self.collector.poll_interval_secs = secs;
        }
        if let Some(days) = parse(LEGACY_KEEP_DAYS_ENV)? {
            self.collector.retention_days = days;
        }
        if let Some(every) = parse(LEGACY_PRUNE_EVERY_ENV)? {
            self.collector.prune_every = every;
        }
        if let Some(level) = lookup(LEGACY_LOG_LEVEL_ENV) {
            self.logging.level = level.trim().to_lowercase();
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.collector;
        if c.poll_interval_secs == 0 {
            return Err(ConfigError::invalid_value(
                "collector.poll_interval_secs",
                "poll interval must be at least 1 second",
            ));
        }
        if c.retention_days == 0 {
            return Err(ConfigError::invalid_value(
                "collector.retention_days",
                "retention window must be at least 1 day",
            ));
        }
        if c.retention_days.checked_mul(SECS_PER_DAY).is_none() {
            return Err(ConfigError::invalid_value(
                "collector.retention_days",
                format!("retention window of {} days is out of range", c.retention_days),
            ));
        }
        if c.prune_every == 0 {
            return Err(ConfigError::invalid_value(
                "collector.prune_every",
                "prune counter must be at least 1",
            ));
        }
        if c.tool_path.trim().is_empty() {
            return Err(ConfigError::invalid_value("collector.tool_path", "must not be empty"));
        }
        if c.tool_timeout_secs == 0 {
            return Err(ConfigError::invalid_value(
                "collector.tool_timeout_secs",
                "timeout must be at least 1 second",
            ));
        }
        if c.run_tag_env.trim().is_empty() {
            return Err(ConfigError::invalid_value("collector.run_tag_env", "must not be empty"));
        }

        if self.retrieval.embedding_dim == 0 {
            return Err(ConfigError::invalid_value(
                "retrieval.embedding_dim",
                "embedding dimension must be positive",
            ));
        }
        if self.retrieval.default_k == 0 {
            return Err(ConfigError::invalid_value("retrieval.default_k", "k must be positive"));
        }
        self.retrieval.backend_kind()?;

        match self.logging.format.as_str() {
            "pretty" | "compact" | "json" => {}
            other => {
                return Err(ConfigError::invalid_value(
                    "logging.format",
                    format!("unknown format '{}' (expected pretty, compact or json)", other),
                ))
            }
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Collector Configuration
// ----------------------------------------------------------------------------

/// Polling loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Seconds between polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Maximum sample age kept by the pruning pass
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    /// Prune every N cycles
    #[serde(default = "default_prune_every")]
    pub prune_every: u64,

    /// Metrics tool binary
    #[serde(default = "default_tool_path")]
    pub tool_path: String,

    /// Upper bound for one tool invocation
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,

    /// Upper bound for one process lookup
    #[serde(default = "default_enrich_timeout")]
    pub enrich_timeout_ms: u64,

    /// Fields requested from the tool, preferred (newest) names
    #[serde(default = "default_requested_fields")]
    pub requested_fields: Vec<String>,

    /// Environment variable that carries the run tag inside workloads
    #[serde(default = "default_run_tag_env")]
    pub run_tag_env: String,

    /// procfs mount point used for process enrichment
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    /// Hostname override (auto-detected if empty)
    #[serde(default)]
    pub hostname: Option<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            retention_days: default_retention_days(),
            prune_every: default_prune_every(),
            tool_path: default_tool_path(),
            tool_timeout_secs: default_tool_timeout(),
            enrich_timeout_ms: default_enrich_timeout(),
            requested_fields: default_requested_fields(),
            run_tag_env: default_run_tag_env(),
            proc_root: default_proc_root(),
            hostname: None,
        }
    }
}

impl CollectorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(SECS_PER_DAY))
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn enrich_timeout(&self) -> Duration {
        Duration::from_millis(self.enrich_timeout_ms)
    }
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_retention_days() -> u64 {
    DEFAULT_RETENTION_DAYS
}

fn default_prune_every() -> u64 {
    DEFAULT_PRUNE_EVERY
}

fn default_tool_path() -> String {
    DEFAULT_TOOL_PATH.into()
}

fn default_tool_timeout() -> u64 {
    DEFAULT_TOOL_TIMEOUT_SECS
}

fn default_enrich_timeout() -> u64 {
    DEFAULT_ENRICH_TIMEOUT_MS
}

fn default_requested_fields() -> Vec<String> {
    GpuField::ALL.iter().map(|f| f.preferred().to_string()).collect()
}

fn default_run_tag_env() -> String {
    RUN_TAG_ENV.into()
}

fn default_proc_root() -> PathBuf {
    PathBuf::from(DEFAULT_PROC_ROOT)
}

// ----------------------------------------------------------------------------
// Storage Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(DEFAULT_DB_PATH)
}

// ----------------------------------------------------------------------------
// Retrieval Configuration
// ----------------------------------------------------------------------------

/// Which vector backend serves `search`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Flat artifact if present, in-database column otherwise
    Auto,
    /// Vector file + id list next to the database
    Flat,
    /// `embedding` column inside the sample table
    Column,
}

impl BackendKind {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "flat" => Ok(BackendKind::Flat),
            "column" => Ok(BackendKind::Column),
            _ => Err(ConfigError::UnsupportedBackend {
                backend: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// auto | flat | column
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Flat index vector file; ids live at the same path with an `.ids` extension
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,

    /// Embedding width produced by the encoder
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Results returned when the caller omits `k`
    #[serde(default = "default_k")]
    pub default_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            index_path: default_index_path(),
            embedding_dim: default_embedding_dim(),
            default_k: default_k(),
        }
    }
}

impl RetrievalConfig {
    pub fn backend_kind(&self) -> Result<BackendKind, ConfigError> {
        BackendKind::parse(&self.backend)
    }

    /// Path of the id list paired with the vector file
    pub fn ids_path(&self) -> PathBuf {
        self.index_path.with_extension("ids")
    }
}

fn default_backend() -> String {
    "auto".into()
}

fn default_index_path() -> PathBuf {
    PathBuf::from(DEFAULT_INDEX_PATH)
}

fn default_embedding_dim() -> usize {
    DEFAULT_EMBEDDING_DIM
}

fn default_k() -> usize {
    DEFAULT_SEARCH_K
}

// ----------------------------------------------------------------------------
// Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_defaults() {
        let config = AppConfig::default();

        assert_eq!(config.collector.poll_interval_secs, 30);
        assert_eq!(config.collector.retention_days, 7);
        assert_eq!(config.collector.prune_every, 100);
        assert_eq!(config.collector.retention(), Duration::from_secs(7 * 86_400));
        assert_eq!(config.retrieval.backend_kind().unwrap(), BackendKind::Auto);
        assert_eq!(config.retrieval.ids_path(), PathBuf::from("gpu_logs.ids"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_fields_are_preferred_names() {
        let config = CollectorConfig::default();
        assert_eq!(config.requested_fields[0], "minor_number");
        assert!(config.requested_fields.contains(&"fb_memory_usage/used".to_string()));
        assert_eq!(config.requested_fields.len(), GpuField::ALL.len());
    }

    #[test]
    fn test_from_toml_overrides() {
        let config = AppConfig::from_toml_str(
            r#"
            [collector]
            poll_interval_secs = 10
            retention_days = 14

            [retrieval]
            backend = "flat"
            "#,
        )
        .unwrap();

        assert_eq!(config.collector.poll_interval_secs, 10);
        assert_eq!(config.collector.retention_days, 14);
        assert_eq!(config.collector.prune_every, 100);
        assert_eq!(config.retrieval.backend_kind().unwrap(), BackendKind::Flat);
    }

    #[test]
    fn test_unsupported_backend_rejected() {
        let err = AppConfig::from_toml_str("[retrieval]\nbackend = \"faiss-gpu\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedBackend { .. }));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = AppConfig::from_toml_str("[collector]\npoll_interval_secs = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_retention_overflow_rejected() {
        let err = AppConfig::from_toml_str("[collector]\nretention_days = 213503982334602\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "collector.retention_days"));

        let collector = CollectorConfig {
            retention_days: u64::MAX,
            ..CollectorConfig::default()
        };
        assert_eq!(collector.retention(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_legacy_env_overrides() {
        let mut config = AppConfig::default();
        config
            .apply_legacy_env(|key| match key {
                LEGACY_POLL_ENV => Some("10".into()),
                LEGACY_KEEP_DAYS_ENV => Some("14".into()),
                LEGACY_PRUNE_EVERY_ENV => Some("360".into()),
                LEGACY_LOG_LEVEL_ENV => Some("DEBUG".into()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.collector.poll_interval_secs, 10);
        assert_eq!(config.collector.retention_days, 14);
        assert_eq!(config.collector.prune_every, 360);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_legacy_env_garbage_is_an_error() {
        let mut config = AppConfig::default();
        let err = config
            .apply_legacy_env(|key| (key == LEGACY_POLL_ENV).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let err = AppConfig::load("/nonexistent/gpu-doctor.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_generated_config_round_trips() {
        let rendered = AppConfig::generate_default_config();
        let parsed = AppConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.collector.tool_path, "nvidia-smi");
    }
}
