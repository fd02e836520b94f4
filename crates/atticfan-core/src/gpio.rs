//! Fan relays driven through the sysfs GPIO interface.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use atticfan_types::FanState;

use crate::error::{Error, Result};
use crate::traits::FanActuator;

/// Default sysfs GPIO directory.
pub const DEFAULT_GPIO_DIR: &str = "/sys/class/gpio";

/// Drives one relay per fan through `<gpio_dir>/gpio<N>/value`.
///
/// When switching several fans, the writes are spaced by `separation` so
/// the motors do not all start at once.
#[derive(Debug, Clone)]
pub struct SysfsFans {
    base: PathBuf,
    pins: Vec<u32>,
    separation: Duration,
}

impl SysfsFans {
    pub fn new(base: impl Into<PathBuf>, pins: Vec<u32>, separation: Duration) -> Self {
        Self {
            base: base.into(),
            pins,
            separation,
        }
    }

    pub fn pins(&self) -> &[u32] {
        &self.pins
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.base.join(format!("gpio{}", pin))
    }

    fn value_path(&self, pin: u32) -> PathBuf {
        self.pin_dir(pin).join("value")
    }

    /// Export every pin and configure it as an output.
    ///
    /// A pin that is already exported is left as is.
    pub async fn open(&self) -> Result<()> {
        for &pin in &self.pins {
            if !tokio::fs::try_exists(self.pin_dir(pin)).await.unwrap_or(false) {
                let export = self.base.join("export");
                if let Err(e) = tokio::fs::write(&export, pin.to_string()).await {
                    // EBUSY means the pin was exported in the meantime
                    if e.raw_os_error() != Some(16) {
                        return Err(Error::Actuator { pin, source: e });
                    }
                    warn!("GPIO pin {} busy on export, assuming already exported", pin);
                }
            }
            tokio::fs::write(self.pin_dir(pin).join("direction"), "out")
                .await
                .map_err(|source| Error::Actuator { pin, source })?;
            debug!("GPIO pin {} opened as output", pin);
        }
        Ok(())
    }
}

fn level(state: FanState) -> &'static str {
    match state {
        FanState::On => "1",
        FanState::Off => "0",
    }
}

#[async_trait]
impl FanActuator for SysfsFans {
    async fn set_fans(&self, state: FanState) -> Result<()> {
        for (i, &pin) in self.pins.iter().enumerate() {
            if i > 0 && !self.separation.is_zero() {
                tokio::time::sleep(self.separation).await;
            }
            tokio::fs::write(self.value_path(pin), level(state))
                .await
                .map_err(|source| Error::Actuator { pin, source })?;
            debug!("GPIO pin {} set to {}", pin, level(state));
        }
        Ok(())
    }

    fn set_fans_blocking(&self, state: FanState) -> Result<()> {
        // every pin is attempted even if one fails
        let mut first_err = None;
        for &pin in &self.pins {
            if let Err(source) = std::fs::write(self.value_path(pin), level(state)) {
                warn!("Failed to set GPIO pin {}: {}", pin, source);
                first_err.get_or_insert(Error::Actuator { pin, source });
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Whether a sysfs GPIO tree exists at `base`.
pub fn gpio_available(base: &Path) -> bool {
    base.join("export").exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(pins: &[u32]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("export"), "").unwrap();
        for pin in pins {
            std::fs::create_dir(dir.path().join(format!("gpio{}", pin))).unwrap();
        }
        dir
    }

    fn read_value(dir: &Path, pin: u32) -> String {
        std::fs::read_to_string(dir.join(format!("gpio{}/value", pin))).unwrap()
    }

    #[tokio::test]
    async fn test_open_sets_direction() {
        let dir = fake_sysfs(&[17, 18]);
        let fans = SysfsFans::new(dir.path(), vec![17, 18], Duration::ZERO);
        fans.open().await.unwrap();
        let dir_17 = std::fs::read_to_string(dir.path().join("gpio17/direction")).unwrap();
        assert_eq!(dir_17, "out");
        assert!(gpio_available(dir.path()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_fans_spaces_writes() {
        let dir = fake_sysfs(&[17, 18, 27]);
        let fans = SysfsFans::new(dir.path(), vec![17, 18, 27], Duration::from_secs(20));

        let start = tokio::time::Instant::now();
        fans.set_fans(FanState::On).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(40));
        for pin in [17, 18, 27] {
            assert_eq!(read_value(dir.path(), pin), "1");
        }
    }

    #[test]
    fn test_blocking_off_writes_every_pin() {
        let dir = fake_sysfs(&[5]);
        // pin 6 has no directory, so its write fails
        let fans = SysfsFans::new(dir.path(), vec![6, 5], Duration::from_secs(20));
        let err = fans.set_fans_blocking(FanState::Off).unwrap_err();
        assert!(matches!(err, Error::Actuator { pin: 6, .. }));
        assert_eq!(read_value(dir.path(), 5), "0");
    }

    #[tokio::test]
    async fn test_missing_pin_reports_actuator_error() {
        let dir = fake_sysfs(&[]);
        let fans = SysfsFans::new(dir.path(), vec![22], Duration::ZERO);
        let err = fans.set_fans(FanState::On).await.unwrap_err();
        assert!(matches!(err, Error::Actuator { pin: 22, .. }));
    }
}
