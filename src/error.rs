// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// One error enum per subsystem, all convertible into `GpuDoctorError`.
// Per-cycle errors are absorbed by the collector loop; startup and
// configuration errors surface to the operator.
// ============================================================================

use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// Top-level Error
// ----------------------------------------------------------------------------

/// The main error type for GPU Doctor.
#[derive(Error, Debug)]
pub enum GpuDoctorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Metrics tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    /// The process cannot start (metrics tool unusable, store unreadable, ...)
    #[error("Startup failed: {0}")]
    Startup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GpuDoctorError {
    /// Check if the collector loop may continue after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            GpuDoctorError::Config(_) => false,
            GpuDoctorError::Tool(e) => e.is_recoverable(),
            GpuDoctorError::Parse(_) => true,
            GpuDoctorError::Store(_) => true,
            GpuDoctorError::Retrieval(e) => e.is_recoverable(),
            GpuDoctorError::Startup(_) => false,
            GpuDoctorError::Io(_) => true,
            GpuDoctorError::Internal(_) => false,
        }
    }

    /// Error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            GpuDoctorError::Config(_) => "config",
            GpuDoctorError::Tool(_) => "tool",
            GpuDoctorError::Parse(_) => "parse",
            GpuDoctorError::Store(_) => "store",
            GpuDoctorError::Retrieval(_) => "retrieval",
            GpuDoctorError::Startup(_) => "startup",
            GpuDoctorError::Io(_) => "io",
            GpuDoctorError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Unsupported retrieval backend '{backend}' (expected auto, flat or column)")]
    UnsupportedBackend { backend: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Metrics Tool Errors
// ----------------------------------------------------------------------------

/// Errors from invoking the vendor metrics tool
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Metrics tool '{path}' not found")]
    NotFound { path: String },

    #[error("Metrics tool exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("Timeout waiting for '{operation}' (waited {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Failed to run metrics tool: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    /// A missing binary never heals on its own; everything else may.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ToolError::NotFound { .. })
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        ToolError::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }
}

// ----------------------------------------------------------------------------
// Parse Errors
// ----------------------------------------------------------------------------

/// Errors while turning raw tool output into samples
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Tool output is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Malformed XML: {0}")]
    Xml(#[from] roxmltree::Error),
}

// ----------------------------------------------------------------------------
// Storage Errors
// ----------------------------------------------------------------------------

/// Errors related to the sample store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Refusing to insert an empty batch")]
    EmptyBatch,

    #[error("Storage task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// ----------------------------------------------------------------------------
// Retrieval Errors
// ----------------------------------------------------------------------------

/// Errors from the vector / tag retrieval layer
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("k must be a positive integer")]
    InvalidK,

    #[error("Encoder failed: {0}")]
    Encoder(String),

    #[error("Vector dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Index artifact {path} is corrupt: {message}")]
    CorruptIndex { path: PathBuf, message: String },

    #[error("Index artifact missing: {path}")]
    MissingIndex { path: PathBuf },

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RetrievalError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            RetrievalError::CorruptIndex { .. } => false,
            RetrievalError::MissingIndex { .. } => false,
            RetrievalError::DimensionMismatch { .. } => false,
            _ => true,
        }
    }
}

// ----------------------------------------------------------------------------
// Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for GPU Doctor operations
pub type GpuDoctorResult<T> = Result<T, GpuDoctorError>;

pub type ToolResult<T> = Result<T, ToolError>;

pub type ParseResult<T> = Result<T, ParseError>;

pub type StoreResult<T> = Result<T, StoreError>;

pub type RetrievalResult<T> = Result<T, RetrievalError>;
