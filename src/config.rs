//! Configuration for a validator state.
//!
//! A configuration is fixed when the state is created. It can be built in
//! code or loaded from JSON; absent fields take their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cpu::CpuFeatures;
use crate::error::Result;
use crate::validator::report::LogLevel;

/// Number of previously decoded instructions reachable through lookback.
pub const DEFAULT_LOOKBACK_DEPTH: usize = 4;

/// Options controlling one validator state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Maximum number of errors printed before the run quits. Zero reports
    /// nothing, negative never quits.
    pub max_reported_errors: i32,
    /// Overwrite offending instructions with halts instead of failing the
    /// segment. Forces the error budget to zero.
    pub stub_out: bool,
    /// Most verbose level that reaches the reporter.
    pub log_verbosity: LogLevel,
    /// Log each instruction as it is visited.
    pub trace_instructions: bool,
    /// Include the operand expression tree in instruction traces.
    pub trace_inst_internals: bool,
    /// Collect a first-opcode-byte histogram and print it at the end of a run.
    pub opcode_histogram: bool,
    /// Also validate memory the segment only reads.
    pub read_sandbox: bool,
    /// Accept an all-ones mask byte in the masked indirect jump idiom.
    pub identity_mask: bool,
    /// Feature set used by the CPU check. `None` probes the host.
    pub cpu_features: Option<CpuFeatures>,
    /// Instructions kept for lookback, not counting the current one.
    pub lookback_depth: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_reported_errors: 100,
            stub_out: false,
            log_verbosity: LogLevel::Info,
            trace_instructions: false,
            trace_inst_internals: false,
            opcode_histogram: false,
            read_sandbox: true,
            identity_mask: false,
            cpu_features: None,
            lookback_depth: DEFAULT_LOOKBACK_DEPTH,
        }
    }
}

impl ValidatorConfig {
    /// Parse a configuration from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a configuration from a JSON file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// True when either instruction trace option is on.
    pub fn tracing_enabled(&self) -> bool {
        self.trace_instructions || self.trace_inst_internals
    }
}
