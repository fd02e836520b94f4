//! Durable history for the attic ventilation controller.
//!
//! This crate keeps the recorded temperature samples and fan on/off events
//! in memory, bounds their growth, and snapshots them to a line-oriented
//! text file that is always replaced atomically.
//!
//! # Features
//!
//! - Retention by item count and by whole local days
//! - Asynchronous writes that queue concurrent mutations in arrival order
//! - Tolerant loading that skips damaged rows instead of failing
//! - A daily outside-temperature high/low CSV log
//! - Compact chart projections
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use atticfan_store::{RetentionPolicy, TimeSeriesStore};
//! use atticfan_types::{LocalCalendar, Sample};
//!
//! let calendar = Arc::new(LocalCalendar::local());
//! let (mut store, _report) =
//!     TimeSeriesStore::open(atticfan_store::default_data_path(), RetentionPolicy::default(), calendar)?;
//! store.add_temperature(Sample::new(1_700_000_000_000, 32.5, 24.0));
//! store.write_sync()?;
//! # Ok::<(), atticfan_store::Error>(())
//! ```

mod error;
pub mod format;
mod highlow;
mod queries;
mod store;

pub use error::{Error, Result};
pub use format::{DecodedLog, LoadReport};
pub use highlow::{HighLowAggregator, read_high_low};
pub use queries::{ChartQuery, FanPoint, HighLowRow, TemperaturePoint, high_low_json};
pub use store::{Command, Logs, QUEUE_CAPACITY, RetentionPolicy, TimeSeriesStore};

/// Default data file path following platform conventions.
///
/// - Linux: `~/.local/share/atticfan/fan-data.txt`
/// - macOS: `~/Library/Application Support/atticfan/fan-data.txt`
pub fn default_data_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("atticfan")
        .join("fan-data.txt")
}

/// Default high/low log path, next to the data file.
pub fn default_high_low_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("atticfan")
        .join("hi-lo.txt")
}
