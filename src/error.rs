//! Error types for the SFI validator.
//!
//! Only failures that prevent a validation run from starting are errors here.
//! Policy violations found inside a segment are diagnostics, reported through
//! [`crate::validator::report::Reporter`] and folded into the state's
//! `is_valid()` flag.

use std::fmt;
use thiserror::Error;

/// Main error type for validator setup operations.
#[derive(Debug, Error)]
pub enum ValidatorError {
    /// Segment size is zero or the segment wraps the address space
    #[error("Invalid segment size {size:#x} at base {vbase:#x}")]
    InvalidSegmentSize { vbase: u64, size: u64 },

    /// Bundle alignment other than 16 or 32
    #[error("Unsupported bundle alignment: {0}")]
    UnsupportedAlignment(u8),

    /// Register cannot serve as the sandbox base
    #[error("Invalid sandbox base register: {0}")]
    InvalidBaseRegister(String),

    /// Memory handed to a run does not match the declared segment size
    #[error("Segment memory is {actual:#x} bytes, expected {expected:#x}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Run started at a base other than the one the state was created for
    #[error("Mismatched vbase address: expected {expected:#x}, got {actual:#x}")]
    VbaseMismatch { expected: u64, actual: u64 },

    /// Run covers a size other than the one the state was created for
    #[error("Mismatched code size: expected {expected:#x}, got {actual:#x}")]
    CodeSizeMismatch { expected: u64, actual: u64 },

    /// Configuration parsing errors
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for validator operations
pub type Result<T> = std::result::Result<T, ValidatorError>;

/// Remaining number of errors the validator may still report.
///
/// Zero disables reporting (detection still happens), a negative count
/// removes the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorBudget(i32);

impl ErrorBudget {
    pub fn new(limit: i32) -> Self {
        Self(limit)
    }

    pub fn unlimited() -> Self {
        Self(-1)
    }

    pub fn disabled() -> Self {
        Self(0)
    }

    pub fn remaining(&self) -> i32 {
        self.0
    }

    pub fn is_exhausted(&self) -> bool {
        self.0 == 0
    }

    pub fn is_unlimited(&self) -> bool {
        self.0 < 0
    }

    /// Count one reported error. Returns true when this call drained the budget.
    pub fn consume(&mut self) -> bool {
        if self.0 > 0 {
            self.0 -= 1;
            return self.0 == 0;
        }
        false
    }
}

impl Default for ErrorBudget {
    fn default() -> Self {
        Self(100)
    }
}

impl fmt::Display for ErrorBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => write!(f, "Budget: reporting disabled"),
            n if n < 0 => write!(f, "Budget: unlimited errors"),
            n => write!(f, "Budget: {} errors", n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ValidatorError::UnsupportedAlignment(8);
        assert_eq!(err.to_string(), "Unsupported bundle alignment: 8");

        let err = ValidatorError::InvalidSegmentSize {
            vbase: 0x1000,
            size: 0,
        };
        assert_eq!(err.to_string(), "Invalid segment size 0x0 at base 0x1000");

        let err = ValidatorError::VbaseMismatch {
            expected: 0x20000,
            actual: 0x20020,
        };
        assert_eq!(
            err.to_string(),
            "Mismatched vbase address: expected 0x20000, got 0x20020"
        );
    }

    #[test]
    fn test_default_budget() {
        let budget = ErrorBudget::default();
        assert_eq!(budget.remaining(), 100);
        assert!(!budget.is_exhausted());
        assert!(!budget.is_unlimited());
    }

    #[test]
    fn test_budget_consume() {
        let mut budget = ErrorBudget::new(2);
        assert!(!budget.consume());
        assert!(budget.consume());
        assert!(budget.is_exhausted());
        assert!(!budget.consume());
        assert_eq!(budget.remaining(), 0);

        let mut unlimited = ErrorBudget::unlimited();
        for _ in 0..1000 {
            assert!(!unlimited.consume());
        }
        assert!(unlimited.is_unlimited());
    }

    #[test]
    fn test_budget_display() {
        assert!(ErrorBudget::default().to_string().contains("100 errors"));
        assert!(ErrorBudget::disabled().to_string().contains("disabled"));
        assert!(ErrorBudget::unlimited().to_string().contains("unlimited"));
    }
}
