//! Waiting for a trustworthy wall clock before the control loop starts.
//!
//! A board without a real-time clock boots in 1970 and only learns the time
//! once the network is up. Every timestamp the controller records would be
//! wrong until then, so startup polls a [`TimeGate`] with a slowly growing
//! delay.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use atticfan_types::Millis;

use crate::error::{Error, Result};
use crate::traits::{Clock, TimeGate};

/// Retry delay that grows by a fixed factor every few attempts.
#[derive(Debug, Clone)]
pub struct Decay {
    current: Duration,
    max: Duration,
    factor: f64,
    every: u32,
    attempts: u32,
}

impl Default for Decay {
    /// 5 s, growing by half every 5 attempts, at most 15 min.
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(15 * 60), 1.5, 5)
    }
}

impl Decay {
    pub fn new(start: Duration, max: Duration, factor: f64, every: u32) -> Self {
        Self {
            current: start.min(max),
            max,
            factor: factor.max(1.0),
            every: every.max(1),
            attempts: 0,
        }
    }

    /// The delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        if self.attempts != 0 && self.attempts % self.every == 0 {
            self.current = self.current.mul_f64(self.factor).min(self.max);
        }
        self.attempts += 1;
        self.current
    }
}

/// Trusts the wall clock once it reads later than a floor date.
pub struct WallClockGate<C> {
    clock: C,
    floor: Millis,
}

impl<C: Clock> WallClockGate<C> {
    pub fn new(clock: C, floor: Millis) -> Self {
        Self { clock, floor }
    }
}

#[async_trait]
impl<C: Clock> TimeGate for WallClockGate<C> {
    async fn is_trusted(&self) -> Result<bool> {
        Ok(self.clock.now_millis() >= self.floor)
    }
}

/// Poll `gate` until it reports a trusted clock.
///
/// Errors from the gate count as "not yet". With a `timeout`, gives up with
/// [`Error::TimeGateTimeout`] once that much time has passed.
pub async fn wait_for_trusted_time<G: TimeGate + ?Sized>(
    gate: &G,
    mut decay: Decay,
    timeout: Option<Duration>,
) -> Result<()> {
    let start = Instant::now();
    let mut errors = 0u32;
    let mut untrusted = 0u32;

    loop {
        match gate.is_trusted().await {
            Ok(true) => {
                if errors > 0 || untrusted > 0 {
                    info!(
                        "System clock trusted after {:?} ({} errors, {} untrusted checks)",
                        start.elapsed(),
                        errors,
                        untrusted
                    );
                }
                return Ok(());
            }
            Ok(false) => untrusted += 1,
            Err(e) => {
                errors += 1;
                debug!("Time gate check failed: {}", e);
            }
        }

        if errors + untrusted == 10 {
            warn!("Still waiting for an accurate system clock");
        }

        if let Some(limit) = timeout
            && start.elapsed() > limit
        {
            warn!("Gave up waiting for an accurate system clock");
            return Err(Error::TimeGateTimeout(limit));
        }

        sleep(decay.next_delay()).await;
    }
}
