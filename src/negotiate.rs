// ============================================================================
// FIELD NEGOTIATION
// ============================================================================
// Discovers which metric names the installed nvidia-smi accepts and maps the
// preferred (newest) names onto legacy spellings when necessary.
// ============================================================================

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{GpuDoctorError, GpuDoctorResult};
use crate::tool::MetricsTool;

/// Field used when nothing else survives negotiation
pub const FALLBACK_FIELD: &str = "index";

// ----------------------------------------------------------------------------
// Known GPU Fields
// ----------------------------------------------------------------------------

/// The metrics the collector knows how to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuField {
    MinorNumber,
    MemoryUsed,
    UtilizationGpu,
    UtilizationMemory,
    Temperature,
    PowerDraw,
}

impl GpuField {
    pub const ALL: [GpuField; 6] = [
        GpuField::MinorNumber,
        GpuField::MemoryUsed,
        GpuField::UtilizationGpu,
        GpuField::UtilizationMemory,
        GpuField::Temperature,
        GpuField::PowerDraw,
    ];

    /// Name understood by current drivers
    pub fn preferred(&self) -> &'static str {
        match self {
            GpuField::MinorNumber => "minor_number",
            GpuField::MemoryUsed => "fb_memory_usage/used",
            GpuField::UtilizationGpu => "utilization/gpu_util",
            GpuField::UtilizationMemory => "utilization/memory_util",
            GpuField::Temperature => "temperature/gpu_temp",
            GpuField::PowerDraw => "power_readings/power_draw",
        }
    }

    /// Name understood by older drivers
    pub fn legacy(&self) -> &'static str {
        match self {
            GpuField::MinorNumber => "index",
            GpuField::MemoryUsed => "memory.used",
            GpuField::UtilizationGpu => "utilization.gpu",
            GpuField::UtilizationMemory => "utilization.memory",
            GpuField::Temperature => "temperature.gpu",
            GpuField::PowerDraw => "power.draw",
        }
    }

    /// Resolve either spelling back to the field.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.preferred() == name || f.legacy() == name)
    }

    /// Legacy alias for a preferred name, if one exists
    pub fn alias_for(name: &str) -> Option<&'static str> {
        Self::ALL
            .iter()
            .find(|f| f.preferred() == name)
            .map(|f| f.legacy())
    }
}

// ----------------------------------------------------------------------------
// Capability Text Parsing
// ----------------------------------------------------------------------------

static QUOTED_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([A-Za-z][A-Za-z0-9_./\[\]]*)""#).expect("static regex"));

static BARE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([a-z][a-z0-9_./]*)(?:\s|$)").expect("static regex"));

/// Extract supported field names from `--help-query-gpu` style output.
///
/// Quoted names anywhere on a line count (`"memory.used" or "memory_used"`);
/// otherwise the first token counts when it looks like a lowercase field name.
pub fn parse_capabilities(text: &str) -> HashSet<String> {
    let mut supported = HashSet::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut quoted = QUOTED_NAME
            .captures_iter(line)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .peekable();

        if quoted.peek().is_some() {
            supported.extend(quoted);
        } else if let Some(name) = BARE_NAME.captures(line).and_then(|c| c.get(1)) {
            supported.insert(name.as_str().to_string());
        }
    }
    supported
}

// ----------------------------------------------------------------------------
// Negotiator
// ----------------------------------------------------------------------------

/// Capability cache built once at startup.
#[derive(Debug, Clone)]
pub struct FieldNegotiator {
    supported: HashSet<String>,
}

impl FieldNegotiator {
    pub fn new(supported: HashSet<String>) -> Self {
        Self { supported }
    }

    pub fn from_capabilities(text: &str) -> Self {
        Self::new(parse_capabilities(text))
    }

    /// Query the tool once. An unusable tool is a startup failure.
    pub async fn discover(tool: &dyn MetricsTool) -> GpuDoctorResult<Self> {
        let text = tool.capabilities().await.map_err(|e| {
            GpuDoctorError::Startup(format!("metrics tool capability query failed: {}", e))
        })?;

        let negotiator = Self::from_capabilities(&text);
        info!(
            target: "gpu_doctor::negotiate",
            supported = negotiator.supported.len(),
            "Metrics tool capabilities discovered"
        );
        Ok(negotiator)
    }

    pub fn supports(&self, name: &str) -> bool {
        self.supported.contains(name)
    }

    /// Map requested names onto what the tool accepts.
    ///
    /// Never returns an empty list and never repeats a name.
    pub fn negotiate(&self, requested: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(requested.len());

        for name in requested {
            let chosen = if self.supports(name) {
                Some(name.as_str())
            } else {
                match GpuField::alias_for(name) {
                    Some(alias) if self.supports(alias) => {
                        debug!(
                            target: "gpu_doctor::negotiate",
                            requested = %name,
                            alias = alias,
                            "Using legacy field name"
                        );
                        Some(alias)
                    }
                    _ => None,
                }
            };

            match chosen {
                Some(field) if !out.iter().any(|f| f == field) => out.push(field.to_string()),
                Some(_) => {}
                None => warn!(
                    target: "gpu_doctor::negotiate",
                    field = %name,
                    "Field not supported by metrics tool, dropping"
                ),
            }
        }

        if out.is_empty() {
            out.push(FALLBACK_FIELD.to_string());
        }
        out
    }
}
