//! In-memory collaborators for tests and `--mock-hardware` runs.
//!
//! - [`ManualClock`]: a clock that only moves when told to
//! - [`MockSensor`]: a sensor with a settable value and failure injection
//! - [`RecordingActuator`]: an actuator that remembers every command
//! - [`ScriptedTimeGate`]: a time gate that replays a fixed script

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::info;

use atticfan_types::{FanState, Millis};

use crate::error::{Error, Result};
use crate::traits::{Clock, FanActuator, TemperatureSensor, TimeGate};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A clock under test control.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Millis) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Millis) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Millis) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Millis {
        self.now.load(Ordering::SeqCst)
    }
}

/// A sensor returning a settable temperature.
#[derive(Debug)]
pub struct MockSensor {
    id: String,
    value_bits: AtomicU64,
    remaining_failures: AtomicU32,
    always_fail: AtomicBool,
    read_count: AtomicU32,
}

impl MockSensor {
    pub fn new(id: impl Into<String>, celsius: f64) -> Self {
        Self {
            id: id.into(),
            value_bits: AtomicU64::new(celsius.to_bits()),
            remaining_failures: AtomicU32::new(0),
            always_fail: AtomicBool::new(false),
            read_count: AtomicU32::new(0),
        }
    }

    pub fn set_value(&self, celsius: f64) {
        self.value_bits.store(celsius.to_bits(), Ordering::SeqCst);
    }

    pub fn value(&self) -> f64 {
        f64::from_bits(self.value_bits.load(Ordering::SeqCst))
    }

    /// Fail the next `n` reads, then recover.
    pub fn fail_next(&self, n: u32) {
        self.remaining_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every read until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.always_fail.store(failing, Ordering::SeqCst);
    }

    /// Number of reads attempted so far.
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TemperatureSensor for MockSensor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read_celsius(&self) -> Result<f64> {
        self.read_count.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || self.always_fail.load(Ordering::SeqCst) {
            return Err(Error::MalformedReading {
                sensor: self.id.clone(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(self.value())
    }
}

/// An actuator that records every state it is asked for.
#[derive(Debug, Default)]
pub struct RecordingActuator {
    calls: Mutex<Vec<FanState>>,
    blocking_calls: Mutex<Vec<FanState>>,
    last: Mutex<Option<FanState>>,
    fail: AtomicBool,
    log: bool,
}

impl RecordingActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also log each command at info level, for simulated runs.
    pub fn logging() -> Self {
        Self {
            log: true,
            ..Self::default()
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// States requested through [`FanActuator::set_fans`].
    pub fn calls(&self) -> Vec<FanState> {
        lock(&self.calls).clone()
    }

    /// States requested through [`FanActuator::set_fans_blocking`].
    pub fn blocking_calls(&self) -> Vec<FanState> {
        lock(&self.blocking_calls).clone()
    }

    /// The most recent state requested through either path.
    pub fn last(&self) -> Option<FanState> {
        *lock(&self.last)
    }

    fn record(&self, into: &Mutex<Vec<FanState>>, state: FanState) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Actuator {
                pin: 0,
                source: std::io::Error::other("injected failure"),
            });
        }
        if self.log {
            info!("Simulated fans switched {}", state);
        }
        lock(into).push(state);
        *lock(&self.last) = Some(state);
        Ok(())
    }
}

#[async_trait]
impl FanActuator for RecordingActuator {
    async fn set_fans(&self, state: FanState) -> Result<()> {
        self.record(&self.calls, state)
    }

    fn set_fans_blocking(&self, state: FanState) -> Result<()> {
        self.record(&self.blocking_calls, state)
    }
}

/// A time gate replaying a script.
///
/// `Some(b)` answers `Ok(b)`, `None` answers with an error. Once the script
/// runs out every check answers `Ok(false)`.
#[derive(Debug)]
pub struct ScriptedTimeGate {
    script: Mutex<VecDeque<Option<bool>>>,
    calls: AtomicU32,
}

impl ScriptedTimeGate {
    pub fn new(script: impl IntoIterator<Item = Option<bool>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicU32::new(0),
        }
    }

    /// A gate that trusts the clock immediately.
    pub fn trusted() -> Self {
        Self::new([Some(true)])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TimeGate for ScriptedTimeGate {
    async fn is_trusted(&self) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match lock(&self.script).pop_front() {
            Some(Some(trusted)) => Ok(trusted),
            Some(None) => Err(Error::Io(std::io::Error::other("time source unreachable"))),
            None => Ok(false),
        }
    }
}
