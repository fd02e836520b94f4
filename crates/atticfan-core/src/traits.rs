//! Collaborator traits.
//!
//! The control loop only talks to hardware and the wall clock through these
//! traits, so tests can swap in the implementations from [`crate::mock`].

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use atticfan_types::{FanState, Millis};

use crate::error::Result;

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> Millis;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Millis {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Millis)
            .unwrap_or_default()
    }
}

/// A temperature probe.
#[async_trait]
pub trait TemperatureSensor: Send + Sync {
    /// Identifier used in logs and errors.
    fn id(&self) -> &str;

    /// Read the current temperature in °C.
    ///
    /// Fails on I/O errors and on content that is not a valid reading.
    async fn read_celsius(&self) -> Result<f64>;
}

/// Drives the physical fans.
#[async_trait]
pub trait FanActuator: Send + Sync {
    /// Switch every fan to `state`.
    async fn set_fans(&self, state: FanState) -> Result<()>;

    /// Switch every fan to `state` without yielding.
    ///
    /// Used during shutdown when the runtime may be going away.
    fn set_fans_blocking(&self, state: FanState) -> Result<()>;
}

/// Decides whether the wall clock can be trusted yet.
#[async_trait]
pub trait TimeGate: Send + Sync {
    /// `Ok(true)` once timestamps taken now are accurate.
    async fn is_trusted(&self) -> Result<bool>;
}

#[async_trait]
impl<T: TemperatureSensor + ?Sized> TemperatureSensor for std::sync::Arc<T> {
    fn id(&self) -> &str {
        (**self).id()
    }

    async fn read_celsius(&self) -> Result<f64> {
        (**self).read_celsius().await
    }
}

#[async_trait]
impl<T: FanActuator + ?Sized> FanActuator for std::sync::Arc<T> {
    async fn set_fans(&self, state: FanState) -> Result<()> {
        (**self).set_fans(state).await
    }

    fn set_fans_blocking(&self, state: FanState) -> Result<()> {
        (**self).set_fans_blocking(state)
    }
}

impl<T: Clock + ?Sized> Clock for std::sync::Arc<T> {
    fn now_millis(&self) -> Millis {
        (**self).now_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_2020() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }
}
