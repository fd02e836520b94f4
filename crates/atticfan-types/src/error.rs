//! Error types for data parsing in atticfan-types.

use thiserror::Error;

/// Errors that can occur when parsing controller data from text.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// Fan state was neither `on` nor `off`.
    #[error("Invalid fan state: {0:?}")]
    InvalidFanState(String),

    /// Fan mode was not one of `auto`, `on`, `off`.
    #[error("Invalid fan mode: {0:?}")]
    InvalidFanMode(String),
}
