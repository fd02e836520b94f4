//! Core types for the attic fan controller.

use core::fmt;
use core::str::FromStr;

use chrono::NaiveDate;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Milliseconds since the Unix epoch.
///
/// This is the unit of the `t` column in the durable log and of every
/// timestamp passed between the controller components.
pub type Millis = i64;

/// One minute in milliseconds.
pub const MINUTE_MS: Millis = 60 * 1000;

/// One recorded (averaged, calibrated) pair of temperatures in °C.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct Sample {
    /// When the sample was recorded.
    pub t: Millis,
    /// Attic temperature in °C.
    pub attic_temp: f64,
    /// Outside temperature in °C.
    pub outside_temp: f64,
}

impl Sample {
    /// Create a new sample.
    #[must_use]
    pub fn new(t: Millis, attic_temp: f64, outside_temp: f64) -> Self {
        Self {
            t,
            attic_temp,
            outside_temp,
        }
    }

    /// Attic temperature minus outside temperature.
    #[must_use]
    pub fn delta(&self) -> f64 {
        self.attic_temp - self.outside_temp
    }
}

/// Physical state of the fans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FanState {
    /// Fans are running.
    On,
    /// Fans are stopped.
    #[default]
    Off,
}

impl FanState {
    /// `true` for [`FanState::On`].
    #[must_use]
    pub fn is_on(self) -> bool {
        matches!(self, FanState::On)
    }

    /// GPIO level that produces this state.
    #[must_use]
    pub fn level(self) -> u8 {
        match self {
            FanState::On => 1,
            FanState::Off => 0,
        }
    }
}

impl From<bool> for FanState {
    fn from(on: bool) -> Self {
        if on { FanState::On } else { FanState::Off }
    }
}

impl fmt::Display for FanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FanState::On => write!(f, "on"),
            FanState::Off => write!(f, "off"),
        }
    }
}

impl FromStr for FanState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "on" => Ok(FanState::On),
            "off" => Ok(FanState::Off),
            other => Err(ParseError::InvalidFanState(other.to_string())),
        }
    }
}

/// One fan on/off transition.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FanEvent {
    /// When the transition happened.
    pub t: Millis,
    /// The state the fans were switched to.
    pub event: FanState,
    /// Human-readable cause ("delta temp exceeded", "manual off", ...).
    pub reason: String,
}

impl FanEvent {
    /// Create a new fan event.
    pub fn new(t: Millis, event: FanState, reason: impl Into<String>) -> Self {
        Self {
            t,
            event,
            reason: reason.into(),
        }
    }
}

/// Who decides the fan state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FanMode {
    /// Temperatures decide.
    #[default]
    Auto,
    /// Forced on by the operator.
    On,
    /// Forced off by the operator.
    Off,
}

impl fmt::Display for FanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FanMode::Auto => write!(f, "auto"),
            FanMode::On => write!(f, "on"),
            FanMode::Off => write!(f, "off"),
        }
    }
}

impl FromStr for FanMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(FanMode::Auto),
            "on" => Ok(FanMode::On),
            "off" => Ok(FanMode::Off),
            other => Err(ParseError::InvalidFanMode(other.to_string())),
        }
    }
}

/// High and low outside temperature of one fully elapsed calendar day.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct DailyHighLow {
    /// Local midnight that starts the day.
    pub day_start: Millis,
    /// Calendar date of the day.
    pub date: NaiveDate,
    /// Highest outside temperature seen that day, °C.
    pub high: f64,
    /// Lowest outside temperature seen that day, °C.
    pub low: f64,
}

/// Convert °C to °F.
#[must_use]
pub fn to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Round to two decimal places.
#[must_use]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
