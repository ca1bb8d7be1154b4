//! Software fault isolation validator for x86-64 code segments.
//!
//! A segment of untrusted machine code is decoded instruction by instruction
//! and every instruction is run through an ordered set of validator plugins
//! enforcing sandbox policy: bundle-aligned control flow, a protected base
//! register, sandboxed memory references and a whitelist of instruction
//! forms. See [`validator::ValidatorState`] for the entry points.

pub mod config;
pub mod core;
pub mod cpu;
pub mod decoder;
pub mod error;
pub mod logging;
pub mod validator;

pub use config::ValidatorConfig;
pub use cpu::CpuFeatures;
pub use error::{ErrorBudget, Result, ValidatorError};
pub use validator::report::{Diagnostic, LogLevel, RecordingReporter, Reporter};
pub use validator::{ReplacementSummary, ValidatorState};
