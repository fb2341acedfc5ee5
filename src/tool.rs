// ============================================================================
// METRICS TOOL INVOCATION
// ============================================================================

use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{ToolError, ToolResult};
use crate::parser::OutputFormat;

/// Source of raw telemetry. Production uses [`NvidiaSmi`]; tests inject fakes.
#[async_trait]
pub trait MetricsTool: Send + Sync {
    /// Text listing the field names the tool accepts
    async fn capabilities(&self) -> ToolResult<String>;

    /// Raw output for one poll
    async fn query(&self, fields: &[String], format: OutputFormat) -> ToolResult<Vec<u8>>;
}

/// `nvidia-smi` driven through `tokio::process`, each call bounded by a timeout.
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    path: String,
    timeout: Duration,
}

impl NvidiaSmi {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Arguments for one poll in the given format
    pub fn query_args(fields: &[String], format: OutputFormat) -> Vec<String> {
        vec![
            format!("--query-gpu={}", fields.join(",")),
            format!("--format={}", format.format_arg()),
        ]
    }

    async fn run(&self, args: &[String]) -> ToolResult<Vec<u8>> {
        trace!(target: "gpu_doctor::tool", path = %self.path, ?args, "Invoking metrics tool");

        let mut command = Command::new(&self.path);
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(ToolError::NotFound {
                    path: self.path.clone(),
                })
            }
            Ok(Err(e)) => return Err(ToolError::Io(e)),
            Err(_) => {
                return Err(ToolError::timeout(
                    self.path.clone(),
                    self.timeout.as_millis() as u64,
                ))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ToolError::NonZeroExit {
                code: output.status.code(),
                stderr,
            });
        }

        debug!(
            target: "gpu_doctor::tool",
            bytes = output.stdout.len(),
            "Metrics tool returned"
        );
        Ok(output.stdout)
    }
}

#[async_trait]
impl MetricsTool for NvidiaSmi {
    async fn capabilities(&self) -> ToolResult<String> {
        let raw = self.run(&["--help-query-gpu".to_string()]).await?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    async fn query(&self, fields: &[String], format: OutputFormat) -> ToolResult<Vec<u8>> {
        self.run(&Self::query_args(fields, format)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_query_args() {
        let fields = vec!["index".to_string(), "memory.used".to_string()];
        assert_eq!(
            NvidiaSmi::query_args(&fields, OutputFormat::Structured),
            vec!["--query-gpu=index,memory.used", "--format=xml"]
        );
        assert_eq!(
            NvidiaSmi::query_args(&fields, OutputFormat::Delimited)[1],
            "--format=csv,noheader,nounits"
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_found() {
        let tool = NvidiaSmi::new("/nonexistent/bin/nvidia-smi", Duration::from_secs(1));
        let err = tool.capabilities().await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
        assert!(!err.is_recoverable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_binary_is_non_zero_exit() {
        let tool = NvidiaSmi::new("false", Duration::from_secs(5));
        let err = tool
            .query(&["index".to_string()], OutputFormat::Structured)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NonZeroExit { code: Some(1), .. }));
    }
}
