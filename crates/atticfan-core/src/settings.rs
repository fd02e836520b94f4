//! Fan control thresholds and operator setting changes.
//!
//! [`Thresholds`] parameterizes the hysteresis decision. Operators change
//! them through a [`SettingsUpdate`], which is validated as a whole against
//! the merged result before anything is mutated.

use serde::{Deserialize, Serialize};

use atticfan_types::{MINUTE_MS, Millis};

use crate::error::{Error, Result, ValidationError};

/// Smallest accepted activation delta (°C).
pub const MIN_DELTA_TEMP: f64 = 2.0;
/// Smallest accepted overshoot (°C, about 1°F).
pub const MIN_OVERSHOOT: f64 = 0.55;
/// Accepted range for absolute temperature thresholds (°C).
pub const TEMP_RANGE: (f64, f64) = (-50.0, 80.0);
/// Longest accepted dwell time.
pub const MAX_WAIT_TIME: Millis = 24 * 60 * MINUTE_MS;
/// Shortest accepted averaging window.
pub const MIN_AVERAGING_TIME: Millis = 1_000;
/// Longest accepted averaging window.
pub const MAX_AVERAGING_TIME: Millis = 60 * MINUTE_MS;

/// Thresholds driving the hysteresis decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Attic must be warmer than this (°C) before the fan may turn on.
    pub min_temp: f64,
    /// Outside must be warmer than this (°C) before the fan may turn on.
    pub min_outside_temp: f64,
    /// Attic minus outside (°C) that turns the fan on.
    pub delta_temp: f64,
    /// Margin (°C) subtracted from the activation thresholds to get the
    /// deactivation thresholds.
    pub overshoot: f64,
    /// Minimum time between the last change and turning the fan back on.
    pub wait_time: Millis,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_temp: 29.444,
            min_outside_temp: -40.0,
            delta_temp: 3.333,
            overshoot: 0.556,
            wait_time: 10 * MINUTE_MS,
        }
    }
}

impl Thresholds {
    /// Check internal consistency, returning every problem found.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let field = |name: &str| format!("{}.{}", prefix, name);

        for (name, value) in [
            ("min_temp", self.min_temp),
            ("min_outside_temp", self.min_outside_temp),
        ] {
            if !value.is_finite() || value < TEMP_RANGE.0 || value > TEMP_RANGE.1 {
                errors.push(ValidationError::new(
                    field(name),
                    format!(
                        "{} is outside {}..{} °C",
                        value, TEMP_RANGE.0, TEMP_RANGE.1
                    ),
                ));
            }
        }

        if !self.delta_temp.is_finite() || self.delta_temp < MIN_DELTA_TEMP {
            errors.push(ValidationError::new(
                field("delta_temp"),
                format!(
                    "temperature delta {} must be at least {} °C",
                    self.delta_temp, MIN_DELTA_TEMP
                ),
            ));
        }

        if !self.overshoot.is_finite() || self.overshoot < MIN_OVERSHOOT {
            errors.push(ValidationError::new(
                field("overshoot"),
                format!(
                    "overshoot {} must be at least {} °C",
                    self.overshoot, MIN_OVERSHOOT
                ),
            ));
        } else if self.overshoot >= self.delta_temp {
            errors.push(ValidationError::new(
                field("overshoot"),
                format!(
                    "overshoot {} must be smaller than delta_temp {}",
                    self.overshoot, self.delta_temp
                ),
            ));
        }

        if !(0..=MAX_WAIT_TIME).contains(&self.wait_time) {
            errors.push(ValidationError::new(
                field("wait_time"),
                format!("wait time {} ms is outside 0..=24h", self.wait_time),
            ));
        }

        errors
    }
}

/// Check an averaging window against
/// [`MIN_AVERAGING_TIME`]..=[`MAX_AVERAGING_TIME`].
pub fn check_averaging_time(field: &str, window: Millis) -> Option<ValidationError> {
    if (MIN_AVERAGING_TIME..=MAX_AVERAGING_TIME).contains(&window) {
        return None;
    }
    Some(ValidationError::new(
        field,
        format!("averaging time {} ms is outside 1s..=1h", window),
    ))
}

/// A partial change to the control settings.
///
/// Fields left as `None` keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsUpdate {
    pub min_temp: Option<f64>,
    pub min_outside_temp: Option<f64>,
    pub delta_temp: Option<f64>,
    pub overshoot: Option<f64>,
    pub wait_time: Option<Millis>,
    /// New averaging window for both sensor averagers.
    pub averaging_time: Option<Millis>,
}

impl SettingsUpdate {
    /// Whether the update changes nothing.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge onto `current` and validate the result.
    ///
    /// Returns the new thresholds without modifying `current`; on error
    /// nothing should be applied.
    pub fn merged(&self, current: &Thresholds) -> Result<Thresholds> {
        let next = Thresholds {
            min_temp: self.min_temp.unwrap_or(current.min_temp),
            min_outside_temp: self.min_outside_temp.unwrap_or(current.min_outside_temp),
            delta_temp: self.delta_temp.unwrap_or(current.delta_temp),
            overshoot: self.overshoot.unwrap_or(current.overshoot),
            wait_time: self.wait_time.unwrap_or(current.wait_time),
        };

        let mut errors = next.validate("settings");
        if let Some(avg) = self.averaging_time
            && let Some(error) = check_averaging_time("settings.averaging_time", avg)
        {
            errors.push(error);
        }

        if errors.is_empty() {
            Ok(next)
        } else {
            Err(Error::Validation(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds_validate() {
        assert!(Thresholds::default().validate("control").is_empty());
    }

    #[test]
    fn test_validate_reports_every_field() {
        let bad = Thresholds {
            min_temp: 200.0,
            min_outside_temp: f64::NAN,
            delta_temp: 1.0,
            overshoot: 0.1,
            wait_time: -5,
        };
        let errors = bad.validate("control");
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            [
                "control.min_temp",
                "control.min_outside_temp",
                "control.delta_temp",
                "control.overshoot",
                "control.wait_time"
            ]
        );
    }

    #[test]
    fn test_overshoot_must_be_below_delta() {
        let t = Thresholds {
            delta_temp: 2.0,
            overshoot: 2.0,
            ..Thresholds::default()
        };
        let errors = t.validate("control");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("smaller than delta_temp"));
    }

    #[test]
    fn test_update_merges_partial_fields() {
        let current = Thresholds::default();
        let update = SettingsUpdate {
            delta_temp: Some(4.0),
            wait_time: Some(5 * MINUTE_MS),
            ..Default::default()
        };
        let next = update.merged(&current).unwrap();
        assert_eq!(next.delta_temp, 4.0);
        assert_eq!(next.wait_time, 5 * MINUTE_MS);
        assert_eq!(next.min_temp, current.min_temp);
        assert_eq!(next.overshoot, current.overshoot);
    }

    #[test]
    fn test_update_rejected_as_a_whole() {
        let current = Thresholds::default();
        let update = SettingsUpdate {
            min_temp: Some(30.0),
            overshoot: Some(0.01),
            averaging_time: Some(0),
            ..Default::default()
        };
        match update.merged(&current) {
            Err(Error::Validation(errors)) => {
                assert_eq!(errors.len(), 2);
                assert!(errors.iter().any(|e| e.field == "settings.overshoot"));
                assert!(errors.iter().any(|e| e.field == "settings.averaging_time"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_sub_second_averaging_rejected() {
        let update = SettingsUpdate {
            averaging_time: Some(MIN_AVERAGING_TIME - 1),
            ..Default::default()
        };
        assert!(update.merged(&Thresholds::default()).is_err());

        let update = SettingsUpdate {
            averaging_time: Some(MIN_AVERAGING_TIME),
            ..Default::default()
        };
        assert!(update.merged(&Thresholds::default()).is_ok());
        assert!(check_averaging_time("x", MAX_AVERAGING_TIME + 1).is_some());
    }

    #[test]
    fn test_empty_update() {
        assert!(SettingsUpdate::default().is_empty());
        let update = SettingsUpdate {
            averaging_time: Some(MINUTE_MS),
            ..Default::default()
        };
        assert!(!update.is_empty());
        assert!(update.merged(&Thresholds::default()).is_ok());
    }
}
