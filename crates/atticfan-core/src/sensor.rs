//! DS18B20 1-Wire temperature sensor reader.
//!
//! The kernel's w1-therm driver exposes each probe as
//! `<device_dir>/<id>/w1_slave`:
//!
//! ```text
//! 91 01 4b 46 7f ff 0f 10 25 : crc=25 YES
//! 91 01 4b 46 7f ff 0f 10 25 t=25062
//! ```
//!
//! The first line ends in `YES` when the CRC matched, the second carries the
//! temperature in millidegrees Celsius.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::traits::TemperatureSensor;

/// Default sysfs directory holding the 1-Wire devices.
pub const DEFAULT_W1_DIR: &str = "/sys/bus/w1/devices";

/// A DS18B20 probe read through sysfs.
#[derive(Debug, Clone)]
pub struct W1Sensor {
    id: String,
    path: PathBuf,
}

impl W1Sensor {
    /// Sensor `id` (e.g. `28-0000063f1a2b`) under `device_dir`.
    pub fn new(device_dir: impl AsRef<Path>, id: impl Into<String>) -> Self {
        let id = id.into();
        let path = device_dir.as_ref().join(&id).join("w1_slave");
        Self { id, path }
    }

    /// Path of the `w1_slave` file read by this sensor.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TemperatureSensor for W1Sensor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read_celsius(&self) -> Result<f64> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| Error::SensorIo {
                sensor: self.id.clone(),
                path: self.path.clone(),
                source,
            })?;
        parse_w1_slave(&content).map_err(|reason| Error::MalformedReading {
            sensor: self.id.clone(),
            reason,
        })
    }
}

/// Parse the contents of a `w1_slave` file into °C.
pub fn parse_w1_slave(content: &str) -> std::result::Result<f64, String> {
    let mut lines = content.lines();
    let (Some(status), Some(data)) = (lines.next(), lines.next()) else {
        return Err("expected two lines".to_string());
    };

    if !status.trim_end().ends_with("YES") {
        return Err("CRC check did not report YES".to_string());
    }

    let raw = data
        .split_whitespace()
        .last()
        .and_then(|field| field.strip_prefix("t="))
        .ok_or_else(|| "missing t= field".to_string())?;

    let millis: i32 = raw
        .parse()
        .map_err(|_| format!("invalid temperature value {:?}", raw))?;
    Ok(f64::from(millis) / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "91 01 4b 46 7f ff 0f 10 25 : crc=25 YES\n\
                        91 01 4b 46 7f ff 0f 10 25 t=25062\n";

    #[test]
    fn test_parse_valid() {
        assert_eq!(parse_w1_slave(GOOD), Ok(25.062));
    }

    #[test]
    fn test_parse_negative() {
        let content = "ff ff : crc=aa YES\nff ff t=-1250\n";
        assert_eq!(parse_w1_slave(content), Ok(-1.25));
    }

    #[test]
    fn test_parse_crc_failure() {
        let content = "91 01 4b : crc=25 NO\n91 01 4b t=25062\n";
        assert!(parse_w1_slave(content).unwrap_err().contains("YES"));
    }

    #[test]
    fn test_parse_missing_value() {
        assert!(parse_w1_slave("aa : crc=25 YES\naa bb\n").is_err());
        assert!(parse_w1_slave("aa : crc=25 YES\naa t=abc\n").is_err());
        assert!(parse_w1_slave("aa : crc=25 YES").is_err());
        assert!(parse_w1_slave("").is_err());
    }

    #[tokio::test]
    async fn test_read_from_sysfs_layout() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().join("28-abc");
        std::fs::create_dir(&dev).unwrap();
        std::fs::write(dev.join("w1_slave"), GOOD).unwrap();

        let sensor = W1Sensor::new(dir.path(), "28-abc");
        assert_eq!(sensor.id(), "28-abc");
        assert_eq!(sensor.read_celsius().await.unwrap(), 25.062);
    }

    #[tokio::test]
    async fn test_read_missing_device_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let sensor = W1Sensor::new(dir.path(), "28-missing");
        let err = sensor.read_celsius().await.unwrap_err();
        assert!(matches!(err, Error::SensorIo { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_read_malformed_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let dev = dir.path().join("28-bad");
        std::fs::create_dir(&dev).unwrap();
        std::fs::write(dev.join("w1_slave"), "garbage").unwrap();

        let err = W1Sensor::new(dir.path(), "28-bad")
            .read_celsius()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedReading { .. }));
        assert!(err.is_transient());
    }
}
