//! Error types for atticfan-core.
//!
//! # Error Classification
//!
//! | Error | Kind | Handling |
//! |-------|------|----------|
//! | [`Error::SensorIo`] | transient | counted, retried on the next tick |
//! | [`Error::MalformedReading`] | transient | counted, retried on the next tick |
//! | [`Error::Actuator`] | transient | logged; the next transition retries |
//! | [`Error::Validation`] | rejected input | reported to the caller, state unchanged |
//! | [`Error::TimeGateTimeout`] | startup | fatal before the loop starts |

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for atticfan-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the controller core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The sensor file could not be read.
    #[error("Failed to read sensor {sensor} at {path}: {source}")]
    SensorIo {
        sensor: String,
        path: PathBuf,
        source: std::io::Error,
    },

    /// The sensor answered, but not with a usable temperature.
    #[error("Malformed reading from sensor {sensor}: {reason}")]
    MalformedReading { sensor: String, reason: String },

    /// Driving a fan output failed.
    #[error("Failed to set GPIO pin {pin}: {source}")]
    Actuator { pin: u32, source: std::io::Error },

    /// Input rejected before touching any state.
    #[error("Validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),

    /// The wall clock never became trustworthy.
    #[error("Timed out after {0:?} waiting for an accurate system clock")]
    TimeGateTimeout(Duration),

    /// Other I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure is expected to clear up on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::SensorIo { .. }
                | Error::MalformedReading { .. }
                | Error::Actuator { .. }
                | Error::Io(_)
        )
    }

    /// Build a single-field validation error.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation(vec![ValidationError::new(field, message)])
    }
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// The field path (e.g., `control.delta_temp`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    /// Create a validation error.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Render a list of validation errors as an indented bullet list.
pub fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}
