//! Controller configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use atticfan_core::{
    DEFAULT_GPIO_DIR, DEFAULT_W1_DIR, EngineState, Thresholds, ValidationError,
    check_averaging_time,
};
use atticfan_store::RetentionPolicy;
use atticfan_types::{FanMode, Millis};

/// Controller configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Temperature probes.
    pub sensors: SensorsConfig,
    /// Fan decision thresholds and sampling.
    pub control: ControlConfig,
    /// Fan relay outputs.
    pub fans: FansConfig,
    /// Data files, flushing and retention.
    pub storage: StorageConfig,
    /// Clock check before the loop starts.
    pub startup: StartupConfig,
    /// When to give up and let the supervisor restart the process.
    pub restart: RestartConfig,
    /// Operator's fan mode, kept across restarts.
    pub mode: ModeConfig,
}

impl Config {
    /// Load configuration from the default path, or defaults if it does not
    /// exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration, collecting every problem.
    ///
    /// # Example
    ///
    /// ```
    /// use atticfan_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.sensors.validate());
        errors.extend(self.control.validate());
        errors.extend(self.fans.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.restart.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Temperature probe configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorsConfig {
    /// Directory holding the 1-Wire devices.
    pub device_dir: PathBuf,
    /// 1-Wire id of the attic probe.
    pub attic_id: String,
    /// 1-Wire id of the outside probe.
    pub outside_id: String,
    /// Added to every raw attic reading (°C).
    pub attic_calibration: f64,
    /// Added to every raw outside reading (°C).
    pub outside_calibration: f64,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            device_dir: PathBuf::from(DEFAULT_W1_DIR),
            attic_id: "28-000005e947e8".to_string(),
            outside_id: "28-000005cf5a54".to_string(),
            attic_calibration: 0.0,
            outside_calibration: 0.0,
        }
    }
}

/// Largest accepted calibration offset (°C).
pub const MAX_CALIBRATION: f64 = 10.0;

impl SensorsConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for (field, id) in [("attic_id", &self.attic_id), ("outside_id", &self.outside_id)] {
            if id.trim().is_empty() {
                errors.push(ValidationError::new(
                    format!("sensors.{}", field),
                    "sensor id cannot be empty",
                ));
            }
        }
        if !self.attic_id.is_empty() && self.attic_id == self.outside_id {
            errors.push(ValidationError::new(
                "sensors.outside_id",
                format!("'{}' is also the attic sensor", self.outside_id),
            ));
        }

        for (field, value) in [
            ("attic_calibration", self.attic_calibration),
            ("outside_calibration", self.outside_calibration),
        ] {
            if !value.is_finite() || value.abs() > MAX_CALIBRATION {
                errors.push(ValidationError::new(
                    format!("sensors.{}", field),
                    format!(
                        "calibration {} is outside ±{} °C",
                        value, MAX_CALIBRATION
                    ),
                ));
            }
        }

        errors
    }
}

/// Fan decision and sampling configuration. Temperatures in °C.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub min_temp: f64,
    pub min_outside_temp: f64,
    pub delta_temp: f64,
    pub overshoot: f64,
    /// Seconds after a change before the fan may turn on again.
    pub wait_time: u64,
    /// Seconds of readings averaged before deciding.
    pub averaging_time: u64,
    /// Smallest change (°C) in either temperature that is recorded.
    pub min_record_diff: f64,
    /// Seconds between sensor reads.
    pub poll_interval: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        let t = Thresholds::default();
        Self {
            min_temp: t.min_temp,
            min_outside_temp: t.min_outside_temp,
            delta_temp: t.delta_temp,
            overshoot: t.overshoot,
            wait_time: (t.wait_time / 1000) as u64,
            averaging_time: 3 * 60,
            min_record_diff: 0.2,
            poll_interval: 10,
        }
    }
}

/// Minimum poll interval in seconds.
pub const MIN_POLL_INTERVAL: u64 = 1;
/// Maximum poll interval in seconds.
pub const MAX_POLL_INTERVAL: u64 = 600;

impl ControlConfig {
    /// Engine thresholds described by this section.
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            min_temp: self.min_temp,
            min_outside_temp: self.min_outside_temp,
            delta_temp: self.delta_temp,
            overshoot: self.overshoot,
            wait_time: secs_to_millis(self.wait_time),
        }
    }

    /// Averaging window in milliseconds.
    pub fn averaging_millis(&self) -> Millis {
        secs_to_millis(self.averaging_time)
    }

    /// Take over thresholds and an averaging window changed at runtime.
    ///
    /// Times are stored in whole seconds; sub-second parts are dropped.
    pub fn set_runtime_settings(&mut self, thresholds: &Thresholds, averaging_time: Millis) {
        self.min_temp = thresholds.min_temp;
        self.min_outside_temp = thresholds.min_outside_temp;
        self.delta_temp = thresholds.delta_temp;
        self.overshoot = thresholds.overshoot;
        self.wait_time = millis_to_secs(thresholds.wait_time);
        self.averaging_time = millis_to_secs(averaging_time);
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = self.thresholds().validate("control");

        if let Some(error) =
            check_averaging_time("control.averaging_time", self.averaging_millis())
        {
            errors.push(error);
        }

        if !self.min_record_diff.is_finite() || !(0.0..=5.0).contains(&self.min_record_diff) {
            errors.push(ValidationError::new(
                "control.min_record_diff",
                format!("{} is outside 0..=5 °C", self.min_record_diff),
            ));
        }

        if !(MIN_POLL_INTERVAL..=MAX_POLL_INTERVAL).contains(&self.poll_interval) {
            errors.push(ValidationError::new(
                "control.poll_interval",
                format!(
                    "poll interval {}s is outside {}..={}s",
                    self.poll_interval, MIN_POLL_INTERVAL, MAX_POLL_INTERVAL
                ),
            ));
        }

        errors
    }
}

/// Fan relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FansConfig {
    /// Drive the GPIO pins. When off, fan commands are only logged.
    pub enabled: bool,
    /// GPIO numbers (SoC numbering) of the relays.
    pub pins: Vec<u32>,
    /// Seconds between switching consecutive fans.
    pub separation: u64,
    /// sysfs GPIO directory.
    pub gpio_dir: PathBuf,
}

impl Default for FansConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pins: vec![24, 23],
            separation: 20,
            gpio_dir: PathBuf::from(DEFAULT_GPIO_DIR),
        }
    }
}

impl FansConfig {
    pub fn separation(&self) -> Duration {
        Duration::from_secs(self.separation)
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.enabled && self.pins.is_empty() {
            errors.push(ValidationError::new(
                "fans.pins",
                "at least one pin is required when fans are enabled",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for (i, pin) in self.pins.iter().enumerate() {
            if !seen.insert(pin) {
                errors.push(ValidationError::new(
                    format!("fans.pins[{}]", i),
                    format!("duplicate pin {}", pin),
                ));
            }
        }
        if self.separation > 120 {
            errors.push(ValidationError::new(
                "fans.separation",
                format!("separation {}s is longer than 120s", self.separation),
            ));
        }

        errors
    }
}

/// Data file configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Temperature and fan event history.
    pub data_file: PathBuf,
    /// Daily high/low log.
    pub high_low_file: PathBuf,
    /// Seconds between data file writes.
    pub flush_interval: u64,
    /// Seconds between high/low updates.
    pub high_low_interval: u64,
    /// Days of temperatures kept before today.
    pub temperature_retention_days: u32,
    /// Most temperature samples kept.
    pub temperature_retention_max_items: usize,
    /// Days of fan events kept before today.
    pub fan_event_retention_days: u32,
    /// Times to wait for a running write at shutdown.
    pub shutdown_wait_attempts: u32,
    /// Seconds per shutdown wait.
    pub shutdown_wait_interval: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let retention = RetentionPolicy::default();
        Self {
            data_file: atticfan_store::default_data_path(),
            high_low_file: atticfan_store::default_high_low_path(),
            flush_interval: 60 * 60,
            high_low_interval: 60 * 60,
            temperature_retention_days: retention.temperature_days,
            temperature_retention_max_items: retention.temperature_max_items,
            fan_event_retention_days: retention.fan_event_days,
            shutdown_wait_attempts: 20,
            shutdown_wait_interval: 30,
        }
    }
}

impl StorageConfig {
    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            temperature_days: self.temperature_retention_days,
            temperature_max_items: self.temperature_retention_max_items,
            fan_event_days: self.fan_event_retention_days,
        }
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.data_file.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.data_file",
                "data file path cannot be empty",
            ));
        }
        if self.high_low_file.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.high_low_file",
                "high/low file path cannot be empty",
            ));
        } else if self.high_low_file == self.data_file {
            errors.push(ValidationError::new(
                "storage.high_low_file",
                "must differ from storage.data_file",
            ));
        }

        for (field, secs) in [
            ("flush_interval", self.flush_interval),
            ("high_low_interval", self.high_low_interval),
        ] {
            if !(60..=24 * 60 * 60).contains(&secs) {
                errors.push(ValidationError::new(
                    format!("storage.{}", field),
                    format!("{}s is outside 60s..=24h", secs),
                ));
            }
        }

        if self.temperature_retention_max_items == 0 {
            errors.push(ValidationError::new(
                "storage.temperature_retention_max_items",
                "must be at least 1",
            ));
        }
        if self.temperature_retention_days == 0 {
            errors.push(ValidationError::new(
                "storage.temperature_retention_days",
                "must be at least 1",
            ));
        }
        if self.fan_event_retention_days == 0 {
            errors.push(ValidationError::new(
                "storage.fan_event_retention_days",
                "must be at least 1",
            ));
        }

        errors
    }
}

/// Startup clock check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    /// Wait for a trustworthy clock before sampling.
    pub wait_for_time: bool,
    /// The clock is trusted once it reads later than this date.
    pub time_floor: NaiveDate,
    /// Seconds to wait before giving up; 0 waits forever.
    pub time_timeout: u64,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            wait_for_time: true,
            time_floor: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default(),
            time_timeout: 0,
        }
    }
}

impl StartupConfig {
    /// The floor date as a timestamp (UTC midnight).
    pub fn floor_millis(&self) -> Millis {
        self.time_floor
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or_default()
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.time_timeout > 0).then(|| Duration::from_secs(self.time_timeout))
    }
}

/// Restart policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Consecutive failed sensor ticks tolerated before exiting.
    pub max_consecutive_failures: u32,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 20,
        }
    }
}

impl RestartConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        if self.max_consecutive_failures == 0 {
            vec![ValidationError::new(
                "restart.max_consecutive_failures",
                "must be at least 1",
            )]
        } else {
            Vec::new()
        }
    }
}

/// Fan mode set by the operator.
///
/// Rewritten whenever the mode changes so a restart resumes the same
/// override. A `return_to_auto_at` already in the past reverts to auto on
/// the first tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    pub mode: FanMode,
    /// When a manual mode reverts to auto (ms since the epoch).
    pub return_to_auto_at: Option<Millis>,
}

impl From<&EngineState> for ModeConfig {
    fn from(state: &EngineState) -> Self {
        Self {
            mode: state.mode,
            return_to_auto_at: state.return_to_auto_at,
        }
    }
}

fn secs_to_millis(secs: u64) -> Millis {
    Millis::try_from(secs.saturating_mul(1000)).unwrap_or(Millis::MAX)
}

fn millis_to_secs(millis: Millis) -> u64 {
    u64::try_from(millis / 1000).unwrap_or_default()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", atticfan_core::format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("atticfan")
        .join("atticfan.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_errors(config: &Config) -> Vec<String> {
        match config.validate() {
            Ok(()) => Vec::new(),
            Err(ConfigError::Validation(errors)) => errors.into_iter().map(|e| e.field).collect(),
            Err(e) => panic!("unexpected error {}", e),
        }
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.control.poll_interval, 10);
        assert_eq!(config.control.wait_time, 600);
        assert_eq!(config.storage.shutdown_wait_attempts, 20);
        assert_eq!(config.restart.max_consecutive_failures, 20);
        assert_eq!(config.storage.data_file, atticfan_store::default_data_path());
    }

    #[test]
    fn test_control_thresholds_conversion() {
        let control = ControlConfig {
            wait_time: 90,
            ..ControlConfig::default()
        };
        let t = control.thresholds();
        assert_eq!(t.wait_time, 90_000);
        assert_eq!(t.delta_temp, control.delta_temp);
        assert_eq!(control.averaging_millis(), 180_000);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml = r#"
            [sensors]
            attic_id = "28-aaa"
            outside_id = "28-bbb"
            attic_calibration = -0.5

            [control]
            delta_temp = 4.0

            [fans]
            pins = [17]
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.sensors.attic_id, "28-aaa");
        assert_eq!(config.sensors.attic_calibration, -0.5);
        assert_eq!(config.sensors.device_dir, PathBuf::from(DEFAULT_W1_DIR));
        assert_eq!(config.control.delta_temp, 4.0);
        assert_eq!(config.control.overshoot, ControlConfig::default().overshoot);
        assert_eq!(config.fans.pins, [17]);
        assert!(config.fans.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_time_floor_parses_date() {
        let config: Config = toml::from_str("[startup]\ntime_floor = \"2020-06-01\"\ntime_timeout = 30\n").unwrap();
        assert_eq!(config.startup.floor_millis(), 1_590_969_600_000);
        assert_eq!(config.startup.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(StartupConfig::default().timeout(), None);
    }

    #[test]
    fn test_validation_collects_all_sections() {
        let mut config = Config::default();
        config.sensors.outside_id = config.sensors.attic_id.clone();
        config.control.overshoot = 0.1;
        config.control.poll_interval = 0;
        config.fans.pins = vec![5, 5];
        config.storage.flush_interval = 1;
        config.storage.temperature_retention_max_items = 0;
        config.restart.max_consecutive_failures = 0;

        let fields = field_errors(&config);
        assert_eq!(
            fields,
            [
                "sensors.outside_id",
                "control.overshoot",
                "control.poll_interval",
                "fans.pins[1]",
                "storage.flush_interval",
                "storage.temperature_retention_max_items",
                "restart.max_consecutive_failures",
            ]
        );
    }

    #[test]
    fn test_validation_error_display() {
        let mut config = Config::default();
        config.control.delta_temp = 1.0;
        let text = config.validate().unwrap_err().to_string();
        assert!(text.starts_with("Configuration validation failed:\n"));
        assert!(text.contains("  - control.delta_temp:"));
    }

    #[test]
    fn test_disabled_fans_need_no_pins() {
        let mut config = Config::default();
        config.fans.enabled = false;
        config.fans.pins.clear();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("atticfan.toml");

        let mut config = Config::default();
        config.sensors.attic_id = "28-111".to_string();
        config.control.min_temp = 31.5;
        config.storage.data_file = PathBuf::from("/tmp/fan-data.txt");
        config.startup.time_timeout = 120;
        config.mode = ModeConfig {
            mode: FanMode::Off,
            return_to_auto_at: Some(1_720_000_000_000),
        };

        config.save(&config_path).unwrap();
        let loaded = Config::load_validated(&config_path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_runtime_settings_saved_in_seconds() {
        let mut control = ControlConfig::default();
        let thresholds = Thresholds {
            delta_temp: 5.0,
            wait_time: 90_500,
            ..Thresholds::default()
        };
        control.set_runtime_settings(&thresholds, 60_000);
        assert_eq!(control.delta_temp, 5.0);
        assert_eq!(control.wait_time, 90);
        assert_eq!(control.averaging_time, 60);
        assert!(control.validate().is_empty());
    }

    #[test]
    fn test_averaging_bound_matches_runtime_updates() {
        let mut control = ControlConfig {
            averaging_time: 0,
            ..ControlConfig::default()
        };
        let errors = control.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "control.averaging_time");

        // the shortest window a settings update accepts also loads from a file
        control.averaging_time = 1;
        assert_eq!(control.averaging_millis(), atticfan_core::MIN_AVERAGING_TIME);
        assert!(control.validate().is_empty());
    }

    #[test]
    fn test_mode_section_defaults_to_auto() {
        let config: Config = toml::from_str("[control]\ndelta_temp = 4.0\n").unwrap();
        assert_eq!(config.mode, ModeConfig::default());
        assert_eq!(config.mode.mode, FanMode::Auto);

        let config: Config =
            toml::from_str("[mode]\nmode = \"on\"\nreturn_to_auto_at = 1000\n").unwrap();
        assert_eq!(config.mode.mode, FanMode::On);
        assert_eq!(config.mode.return_to_auto_at, Some(1000));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/atticfan.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_invalid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("bad.toml");
        std::fs::write(&path, "[control\nmin_temp = ").unwrap();
        assert!(matches!(
            Config::load(&path).unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }
}
