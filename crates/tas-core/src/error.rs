//! Unified error types for the TAS ecosystem
//!
//! This module provides a common error type [`TasError`] that can represent
//! errors from any part of the system. Domain-specific error types can be
//! converted to `TasError` for uniform error handling at API boundaries.
//!
//! # Example
//!
//! ```ignore
//! use tas_core::{TasError, TasResult};
//!
//! fn assemble(classes: Vec<TrafficClass>) -> TasResult<()> {
//!     validate_classes(&classes)?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Unified error type for all TAS operations.
///
/// This enum provides a common error representation for the TAS ecosystem,
/// allowing errors from model construction, validation, and solving to be
/// handled uniformly.
#[derive(Error, Debug)]
pub enum TasError {
    /// Configuration errors (missing or inconsistent assignment inputs)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Solver/algorithm errors
    #[error("Solver error: {0}")]
    Solver(String),

    /// Network structure errors
    #[error("Network error: {0}")]
    Network(String),

    /// Generic errors (for wrapping external errors)
    #[error("{0}")]
    Other(String),
}

/// Convenience type alias for Results using TasError.
pub type TasResult<T> = Result<T, TasError>;

// Conversion from anyhow::Error
impl From<anyhow::Error> for TasError {
    fn from(err: anyhow::Error) -> Self {
        TasError::Other(err.to_string())
    }
}

// Conversion from string-like types for convenience
impl From<String> for TasError {
    fn from(s: String) -> Self {
        TasError::Other(s)
    }
}

impl From<&str> for TasError {
    fn from(s: &str) -> Self {
        TasError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TasError::Solver("equilibration failed".into());
        assert!(err.to_string().contains("Solver error"));
        assert!(err.to_string().contains("equilibration failed"));
    }

    #[test]
    fn test_result_type_alias() {
        fn example_fn() -> TasResult<i32> {
            Ok(42)
        }
        assert_eq!(example_fn().unwrap(), 42);
    }

    #[test]
    fn test_question_mark_operator() {
        fn inner() -> TasResult<()> {
            Err(TasError::Validation("test".into()))
        }

        fn outer() -> TasResult<()> {
            inner()?;
            Ok(())
        }

        assert!(outer().is_err());
    }
}
