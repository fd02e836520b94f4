//! Shared data types for the attic ventilation controller.
//!
//! This crate holds the plain values that flow between the controller
//! components: recorded temperature samples, fan on/off events, the fan
//! control mode, and daily high/low records, plus the calendar helpers used
//! for day-based retention and aggregation.
//!
//! # Example
//!
//! ```
//! use atticfan_types::{FanEvent, FanState, Sample};
//!
//! let sample = Sample::new(1_700_000_000_000, 32.0, 28.0);
//! assert_eq!(sample.delta(), 4.0);
//!
//! let event = FanEvent::new(sample.t, FanState::On, "delta temp exceeded");
//! assert_eq!(event.event.to_string(), "on");
//! ```

pub mod calendar;
pub mod error;
pub mod types;

pub use calendar::{DayCalendar, LocalCalendar, ZoneCalendar, format_log_date, parse_log_date};
pub use error::ParseError;
pub use types::{
    DailyHighLow, FanEvent, FanMode, FanState, MINUTE_MS, Millis, Sample, round2, to_fahrenheit,
};
