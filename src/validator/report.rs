//! Diagnostic reporting.
//!
//! The validator state decides whether a message is printed (error budget,
//! verbosity); a [`Reporter`] decides where it goes.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::core::instruction::DecodedInstruction;

/// Severity of a diagnostic, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Fatal,
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    /// Levels that make a segment unsafe.
    pub fn is_error(self) -> bool {
        self <= LogLevel::Error
    }

    /// Label printed in front of a message.
    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Fatal => "FATAL: ",
            LogLevel::Error => "ERROR: ",
            LogLevel::Warning => "WARNING: ",
            LogLevel::Info | LogLevel::Debug => "",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Sink for validator diagnostics.
pub trait Reporter {
    /// A message not tied to an address.
    fn message(&mut self, level: LogLevel, validator: &str, message: &str);

    /// A message about an address.
    fn address_message(&mut self, level: LogLevel, validator: &str, addr: u64, message: &str);

    /// A message about one instruction.
    fn inst_message(
        &mut self,
        level: LogLevel,
        validator: &str,
        inst: &DecodedInstruction,
        message: &str,
    ) {
        self.address_message(level, validator, inst.vpc, message);
    }

    /// A message about a pair of instructions.
    fn two_inst_message(
        &mut self,
        level: LogLevel,
        validator: &str,
        inst1: &DecodedInstruction,
        inst2: &DecodedInstruction,
        message: &str,
    ) {
        self.inst_message(level, validator, inst1, message);
        self.inst_message(level, validator, inst2, message);
    }
}

/// Forwards diagnostics to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

macro_rules! emit {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            LogLevel::Fatal | LogLevel::Error => tracing::error!($($arg)+),
            LogLevel::Warning => tracing::warn!($($arg)+),
            LogLevel::Info => tracing::info!($($arg)+),
            LogLevel::Debug => tracing::debug!($($arg)+),
        }
    };
}

impl Reporter for TracingReporter {
    fn message(&mut self, level: LogLevel, validator: &str, message: &str) {
        emit!(level, validator, "{}{}", level, message);
    }

    fn address_message(&mut self, level: LogLevel, validator: &str, addr: u64, message: &str) {
        emit!(
            level,
            validator,
            addr = %format_args!("{:x}", addr),
            "{}{}",
            level,
            message
        );
    }

    fn inst_message(
        &mut self,
        level: LogLevel,
        validator: &str,
        inst: &DecodedInstruction,
        message: &str,
    ) {
        emit!(
            level,
            validator,
            addr = %format_args!("{:x}", inst.vpc),
            inst = %inst,
            "{}{}",
            level,
            message
        );
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn message(&mut self, _level: LogLevel, _validator: &str, _message: &str) {}

    fn address_message(&mut self, _level: LogLevel, _validator: &str, _addr: u64, _message: &str) {}
}

/// One recorded diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: LogLevel,
    pub validator: String,
    pub addr: Option<u64>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            Some(addr) => write!(f, "{:x}: {}{}", addr, self.level, self.message),
            None => write!(f, "{}{}", self.level, self.message),
        }
    }
}

/// Keeps diagnostics in memory. Clones share the same list, so a handle
/// kept by the caller sees what the validator reported.
#[derive(Debug, Default, Clone)]
pub struct RecordingReporter {
    entries: Arc<Mutex<Vec<Diagnostic>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.lock().clone()
    }

    /// Diagnostics at error level or worse.
    pub fn errors(&self) -> Vec<Diagnostic> {
        self.lock()
            .iter()
            .filter(|d| d.level.is_error())
            .cloned()
            .collect()
    }

    /// Recorded diagnostics whose message contains `text`.
    pub fn count_containing(&self, text: &str) -> usize {
        self.lock()
            .iter()
            .filter(|d| d.message.contains(text))
            .count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Diagnostic>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, level: LogLevel, validator: &str, addr: Option<u64>, message: &str) {
        self.lock().push(Diagnostic {
            level,
            validator: validator.to_string(),
            addr,
            message: message.to_string(),
        });
    }
}

impl Reporter for RecordingReporter {
    fn message(&mut self, level: LogLevel, validator: &str, message: &str) {
        self.record(level, validator, None, message);
    }

    fn address_message(&mut self, level: LogLevel, validator: &str, addr: u64, message: &str) {
        self.record(level, validator, Some(addr), message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(LogLevel::Fatal < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Info);
        assert!(LogLevel::Fatal.is_error());
        assert!(!LogLevel::Warning.is_error());
        assert_eq!(LogLevel::Warning.to_string(), "WARNING: ");
    }

    #[test]
    fn recording_reporter_shares_entries() {
        let handle = RecordingReporter::new();
        let mut reporter: Box<dyn Reporter> = Box::new(handle.clone());
        reporter.message(LogLevel::Info, "jumps", "Checking jump targets: 0 to 20");
        reporter.address_message(LogLevel::Error, "jumps", 0x10, "Bad jump target");

        assert_eq!(handle.diagnostics().len(), 2);
        let errors = handle.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].addr, Some(0x10));
        assert_eq!(errors[0].to_string(), "10: ERROR: Bad jump target");
        assert_eq!(handle.count_containing("jump"), 2);

        handle.clear();
        assert!(handle.diagnostics().is_empty());
    }

    #[test]
    fn level_serde_names() {
        let level: LogLevel = serde_json::from_str("\"warning\"").expect("parse");
        assert_eq!(level, LogLevel::Warning);
    }
}
