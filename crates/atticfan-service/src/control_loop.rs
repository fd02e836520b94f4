//! The periodic control loop.
//!
//! One task owns the decision engine, both averagers, the history store and
//! the high/low aggregator. Each poll tick reads both sensors, smooths the
//! readings, records the sample if it moved enough, and lets the engine
//! decide the fan state. Flushes, high/low updates and client commands are
//! handled between ticks, so nothing here needs a lock.
//!
//! Switching the relays can take tens of seconds, so it runs on a separate
//! actuator task that follows the latest target state. The loop never waits
//! for it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::OptionFuture;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use atticfan_core::{
    ApplyOutcome, Clock, FanActuator, FanDecisionEngine, TemperatureSensor, Thresholds,
    TimeAverager,
};
use atticfan_store::{HighLowAggregator, TimeSeriesStore};
use atticfan_types::{DayCalendar, FanEvent, FanState, Millis, Sample, round2};

use crate::config::{Config, ModeConfig};
use crate::state::{
    COMMAND_BUFFER, ControlCommand, ControlHandle, EVENT_BUFFER, LoopEvent, StatusSnapshot,
};

/// Reason recorded when the fan is switched off on the way out.
pub const SHUTDOWN_REASON: &str = "process shutdown";

/// Slack for comparing rounded temperatures against the record threshold.
const RECORD_EPSILON: f64 = 1e-9;

type WriteTask = JoinHandle<atticfan_store::Result<()>>;

/// The devices the loop talks to.
#[derive(Clone)]
pub struct Hardware {
    pub attic: Arc<dyn TemperatureSensor>,
    pub outside: Arc<dyn TemperatureSensor>,
    pub fans: Arc<dyn FanActuator>,
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Hardware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hardware")
            .field("attic", &self.attic.id())
            .field("outside", &self.outside.id())
            .finish_non_exhaustive()
    }
}

/// Timing and filtering for the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopSettings {
    pub poll_interval: Duration,
    pub flush_interval: Duration,
    pub high_low_interval: Duration,
    pub averaging_time: Millis,
    pub min_record_diff: f64,
    pub attic_calibration: f64,
    pub outside_calibration: f64,
    pub max_consecutive_failures: u32,
    pub shutdown_wait_attempts: u32,
    pub shutdown_wait_interval: Duration,
}

impl From<&Config> for LoopSettings {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.control.poll_interval),
            flush_interval: Duration::from_secs(config.storage.flush_interval),
            high_low_interval: Duration::from_secs(config.storage.high_low_interval),
            averaging_time: config.control.averaging_millis(),
            min_record_diff: config.control.min_record_diff,
            attic_calibration: config.sensors.attic_calibration,
            outside_calibration: config.sensors.outside_calibration,
            max_consecutive_failures: config.restart.max_consecutive_failures,
            shutdown_wait_attempts: config.storage.shutdown_wait_attempts,
            shutdown_wait_interval: Duration::from_secs(config.storage.shutdown_wait_interval),
        }
    }
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Why the loop stopped without being asked to.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("Giving up after {failures} consecutive failed sensor reads")]
    SensorsFailed { failures: u32 },
}

/// Config file rewritten when the operator changes settings or mode.
struct SavedConfig {
    path: PathBuf,
    config: Config,
}

/// The control loop and everything it owns.
pub struct ControlLoop {
    hw: Hardware,
    settings: LoopSettings,
    engine: FanDecisionEngine,
    store: TimeSeriesStore,
    high_low: HighLowAggregator,
    attic_avg: TimeAverager,
    outside_avg: TimeAverager,
    events: broadcast::Sender<LoopEvent>,
    commands: mpsc::Receiver<ControlCommand>,
    current: Option<Sample>,
    last_recorded: Option<Sample>,
    consecutive_failures: u32,
    held: bool,
    fan_target: watch::Sender<FanState>,
    actuator: Option<JoinHandle<()>>,
    saved: Option<SavedConfig>,
}

impl ControlLoop {
    /// Assemble a loop and the handle used to talk to it.
    ///
    /// The engine starts in auto mode with the fan off; callers switch the
    /// hardware off before running so the two agree.
    pub fn new(
        hw: Hardware,
        settings: LoopSettings,
        thresholds: Thresholds,
        store: TimeSeriesStore,
        high_low: HighLowAggregator,
    ) -> (Self, ControlHandle) {
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let handle = ControlHandle::new(command_tx, events.clone());
        let last_recorded = store.last_temperature().copied();
        let (fan_target, _) = watch::channel(FanState::Off);

        let control = Self {
            engine: FanDecisionEngine::new(thresholds),
            attic_avg: TimeAverager::new(settings.averaging_time),
            outside_avg: TimeAverager::new(settings.averaging_time),
            hw,
            settings,
            store,
            high_low,
            events,
            commands,
            current: None,
            last_recorded,
            consecutive_failures: 0,
            held: false,
            fan_target,
            actuator: None,
            saved: None,
        };
        (control, handle)
    }

    /// Open the data files named in `config` and assemble a loop around them.
    ///
    /// A manual mode saved in `config` is restored; the first tick switches
    /// the fans to match it.
    pub fn from_config(
        config: &Config,
        hw: Hardware,
        calendar: Arc<dyn DayCalendar>,
    ) -> atticfan_store::Result<(Self, ControlHandle)> {
        let (store, _report) = TimeSeriesStore::open(
            &config.storage.data_file,
            config.storage.retention(),
            Arc::clone(&calendar),
        )?;
        let high_low = HighLowAggregator::open(&config.storage.high_low_file, calendar)?;
        let (mut control, handle) = Self::new(
            hw,
            LoopSettings::from(config),
            config.control.thresholds(),
            store,
            high_low,
        );
        control
            .engine
            .restore_mode(config.mode.mode, config.mode.return_to_auto_at);
        Ok((control, handle))
    }

    /// Save accepted settings and mode changes into `config` at `path`.
    ///
    /// `config` should be the file as loaded, before any command line
    /// overrides, since it is written back whole.
    pub fn persist_settings(&mut self, path: impl Into<PathBuf>, config: Config) {
        self.saved = Some(SavedConfig {
            path: path.into(),
            config,
        });
    }

    pub fn engine(&self) -> &FanDecisionEngine {
        &self.engine
    }

    pub fn store(&self) -> &TimeSeriesStore {
        &self.store
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Run until `shutdown` fires or the sensors fail too often.
    ///
    /// Either way the fans are switched off, a final fan event is recorded
    /// if they were on, and the history is written synchronously before
    /// returning.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), LoopError> {
        let mut poll = interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flush = interval_at(
            Instant::now() + self.settings.flush_interval,
            self.settings.flush_interval,
        );
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut high_low = interval(self.settings.high_low_interval);
        high_low.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Control loop started (poll {:?}, flush {:?})",
            self.settings.poll_interval, self.settings.flush_interval
        );

        let mut write: Option<WriteTask> = None;
        let mut outcome = Ok(());

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                Some(joined) = OptionFuture::from(write.as_mut()) => {
                    write = None;
                    let _ = self.store.finish_write(joined);
                }
                Some(command) = self.commands.recv() => self.handle_command(command),
                _ = poll.tick() => {
                    if let Err(e) = self.tick().await
                        && let Err(fatal) = self.record_failure(&e)
                    {
                        outcome = Err(fatal);
                        break;
                    }
                }
                _ = flush.tick() => {
                    if write.is_none() {
                        write = self.start_flush();
                    }
                }
                _ = high_low.tick() => self.update_high_low(),
            }
        }

        self.shutdown(write).await;
        outcome
    }

    /// Read, smooth, record and decide once.
    pub async fn tick(&mut self) -> atticfan_core::Result<()> {
        let (attic, outside) = tokio::join!(
            self.hw.attic.read_celsius(),
            self.hw.outside.read_celsius()
        );
        let attic_raw = attic? + self.settings.attic_calibration;
        let outside_raw = outside? + self.settings.outside_calibration;
        let now = self.hw.clock.now_millis();

        if self.consecutive_failures > 0 {
            info!(
                "Sensors recovered after {} failed reads",
                self.consecutive_failures
            );
            self.consecutive_failures = 0;
        }

        let (Some(attic), Some(outside)) = (
            self.attic_avg.add(attic_raw, now),
            self.outside_avg.add(outside_raw, now),
        ) else {
            return Ok(());
        };
        let sample = Sample::new(now, round2(attic), round2(outside));
        self.current = Some(sample);
        debug!(
            "Attic {:.2} °C, outside {:.2} °C (raw {:.2}, {:.2})",
            sample.attic_temp, sample.outside_temp, attic_raw, outside_raw
        );
        self.emit(LoopEvent::Reading {
            t: now,
            attic_raw,
            outside_raw,
            attic: sample.attic_temp,
            outside: sample.outside_temp,
        });

        if self.should_record(&sample) {
            self.store.add_temperature(sample);
            self.last_recorded = Some(sample);
            self.emit(LoopEvent::Recorded(sample));
        }
        // queued mutations are aged when the write finishes
        if !self.store.is_write_in_flight() {
            self.store.age_data(now);
        }

        let mode = self.engine.mode();
        let outcome = self
            .engine
            .step(sample.attic_temp, sample.outside_temp, now);
        if self.engine.mode() != mode {
            self.emit(LoopEvent::ModeChanged(self.engine.state()));
            self.save_settings();
        }

        match outcome {
            ApplyOutcome::Changed(event) => {
                self.held = false;
                self.commit(event);
            }
            ApplyOutcome::Held { remaining } => {
                if !self.held {
                    info!("Fan on held for another {}s", remaining / 1000);
                    self.held = true;
                }
            }
            ApplyOutcome::Unchanged => self.held = false,
        }
        Ok(())
    }

    fn should_record(&self, sample: &Sample) -> bool {
        let Some(last) = self.last_recorded else {
            return true;
        };
        let diff = self.settings.min_record_diff - RECORD_EPSILON;
        (sample.attic_temp - last.attic_temp).abs() >= diff
            || (sample.outside_temp - last.outside_temp).abs() >= diff
    }

    /// Record a committed fan change, then drive the outputs.
    fn commit(&mut self, event: FanEvent) {
        let state = event.event;
        self.store.add_fan_event(event.clone());
        self.emit(LoopEvent::FanChanged(event));
        self.drive_fans(state);
    }

    /// Hand `state` to the actuator task without waiting for the switch.
    fn drive_fans(&mut self, state: FanState) {
        if self.actuator.as_ref().is_none_or(|task| task.is_finished()) {
            let target = self.fan_target.subscribe();
            self.actuator = Some(tokio::spawn(run_actuator(
                Arc::clone(&self.hw.fans),
                target,
            )));
        }
        self.fan_target.send_replace(state);
    }

    fn record_failure(&mut self, e: &atticfan_core::Error) -> Result<(), LoopError> {
        self.consecutive_failures += 1;
        let failures = self.consecutive_failures;

        if failures <= 3 {
            warn!("Sensor read failed: {} (attempt {})", e, failures);
        } else if failures == 4 {
            error!(
                "Sensor reads failed {} times in a row, will keep trying quietly",
                failures
            );
        } else {
            debug!("Sensor read failed: {} (attempt {})", e, failures);
        }

        if failures > self.settings.max_consecutive_failures {
            error!(
                "Sensors failed {} times in a row, stopping for a restart",
                failures
            );
            return Err(LoopError::SensorsFailed { failures });
        }
        Ok(())
    }

    /// Apply one client command.
    pub fn handle_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::SetMode {
                mode,
                duration,
                reply,
            } => {
                let now = self.hw.clock.now_millis();
                let result = match self.engine.set_mode(mode, duration, now) {
                    Ok(outcome) => {
                        if let ApplyOutcome::Changed(event) = outcome {
                            self.held = false;
                            self.commit(event);
                        }
                        let state = self.engine.state();
                        self.emit(LoopEvent::ModeChanged(state));
                        self.save_settings();
                        Ok(state)
                    }
                    Err(e) => {
                        warn!("Rejected mode change to {}: {}", mode, e);
                        Err(e)
                    }
                };
                let _ = reply.send(result);
            }
            ControlCommand::UpdateSettings { update, reply } => {
                let result = match update.merged(self.engine.thresholds()) {
                    Ok(thresholds) => {
                        self.engine.set_thresholds(thresholds);
                        if let Some(window) = update.averaging_time {
                            self.attic_avg.set_window(window);
                            self.outside_avg.set_window(window);
                            self.settings.averaging_time = window;
                        }
                        info!("Control settings updated: {:?}", thresholds);
                        self.save_settings();
                        Ok(thresholds)
                    }
                    Err(e) => {
                        warn!("Rejected settings update: {}", e);
                        Err(e)
                    }
                };
                let _ = reply.send(result);
            }
            ControlCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            engine: self.engine.state(),
            thresholds: *self.engine.thresholds(),
            averaging_time: self.settings.averaging_time,
            current: self.current,
            last_recorded: self.last_recorded,
            last_event: self.store.last_fan_event().cloned(),
            temperature_count: self.store.temperature_len(),
            fan_event_count: self.store.fan_event_len(),
            write_in_flight: self.store.is_write_in_flight(),
            consecutive_failures: self.consecutive_failures,
        }
    }

    /// Write thresholds, averaging window and mode back to the config file.
    fn save_settings(&mut self) {
        let Some(saved) = self.saved.as_mut() else {
            return;
        };
        saved
            .config
            .control
            .set_runtime_settings(self.engine.thresholds(), self.settings.averaging_time);
        saved.config.mode = ModeConfig::from(&self.engine.state());
        match saved.config.save(&saved.path) {
            Ok(()) => debug!("Saved settings to {}", saved.path.display()),
            Err(e) => error!("Failed to save settings: {}", e),
        }
    }

    fn start_flush(&mut self) -> Option<WriteTask> {
        self.store.age_data(self.hw.clock.now_millis());
        self.store.spawn_write()
    }

    fn update_high_low(&mut self) {
        match self.high_low.update(&self.store.logs().temperatures) {
            Ok(days) => {
                for day in days {
                    self.emit(LoopEvent::DayClosed(day));
                }
            }
            Err(e) => error!("High/low update failed, will retry: {}", e),
        }
    }

    fn emit(&self, event: LoopEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn shutdown(&mut self, write: Option<WriteTask>) {
        if let Some(mut handle) = write {
            let attempts = self.settings.shutdown_wait_attempts.max(1);
            let mut joined = None;
            for attempt in 1..=attempts {
                match tokio::time::timeout(self.settings.shutdown_wait_interval, &mut handle).await
                {
                    Ok(result) => {
                        joined = Some(result);
                        break;
                    }
                    Err(_) => info!(
                        "Waiting for data write to finish ({}/{})",
                        attempt, attempts
                    ),
                }
            }
            let joined = joined.unwrap_or_else(|| {
                warn!("Data write still running after {} checks, giving up on it", attempts);
                Ok(Err(atticfan_store::Error::WriteTask(
                    "abandoned at shutdown".to_string(),
                )))
            });
            let _ = self.store.finish_write(joined);
        }

        // a switch still in progress must not land after the final off
        if let Some(task) = self.actuator.take() {
            task.abort();
            let _ = task.await;
        }
        if let Err(e) = self.hw.fans.set_fans_blocking(FanState::Off) {
            error!("Failed to switch fans off: {}", e);
        }
        let now = self.hw.clock.now_millis();
        if let ApplyOutcome::Changed(event) =
            self.engine.apply(FanState::Off, SHUTDOWN_REASON, true, now)
        {
            self.store.add_fan_event(event.clone());
            self.emit(LoopEvent::FanChanged(event));
        }

        if let Err(e) = self.store.write_sync() {
            error!("Final data write failed: {}", e);
        }
        info!("Control loop stopped");
    }
}

/// Switch the fans to each new target in turn.
///
/// Targets that come and go while a switch is running are skipped; only the
/// latest one is applied next.
async fn run_actuator(fans: Arc<dyn FanActuator>, mut target: watch::Receiver<FanState>) {
    while target.changed().await.is_ok() {
        let state = *target.borrow_and_update();
        debug!("Switching fans {}", state);
        if let Err(e) = fans.set_fans(state).await {
            error!("Failed to switch fans {}: {}", state, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atticfan_core::{ManualClock, MockSensor, RecordingActuator, SettingsUpdate};
    use atticfan_store::RetentionPolicy;
    use atticfan_types::{FanMode, MINUTE_MS, ZoneCalendar};
    use chrono::Utc;
    use tokio::sync::oneshot;

    const START: Millis = 1_720_000_000_000;

    struct Rig {
        attic: Arc<MockSensor>,
        outside: Arc<MockSensor>,
        fans: Arc<RecordingActuator>,
        clock: Arc<ManualClock>,
        control: ControlLoop,
        handle: ControlHandle,
        dir: tempfile::TempDir,
    }

    fn settings() -> LoopSettings {
        LoopSettings {
            averaging_time: 1_000,
            ..LoopSettings::default()
        }
    }

    fn rig(settings: LoopSettings) -> Rig {
        rig_with_retention(settings, RetentionPolicy::default())
    }

    fn rig_with_retention(settings: LoopSettings, retention: RetentionPolicy) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let calendar = Arc::new(ZoneCalendar::new(Utc));
        let store = TimeSeriesStore::new(
            dir.path().join("fan-data.txt"),
            retention,
            calendar.clone(),
        );
        let high_low = HighLowAggregator::open(dir.path().join("hi-lo.txt"), calendar).unwrap();

        let attic = Arc::new(MockSensor::new("attic", 25.0));
        let outside = Arc::new(MockSensor::new("outside", 20.0));
        let fans = Arc::new(RecordingActuator::new());
        let clock = Arc::new(ManualClock::new(START));
        let hw = Hardware {
            attic: attic.clone(),
            outside: outside.clone(),
            fans: fans.clone(),
            clock: clock.clone(),
        };
        let (control, handle) =
            ControlLoop::new(hw, settings, Thresholds::default(), store, high_low);
        Rig {
            attic,
            outside,
            fans,
            clock,
            control,
            handle,
            dir,
        }
    }

    impl Rig {
        async fn tick_at(&mut self, attic: f64, outside: f64) {
            self.clock.advance(10_000);
            self.attic.set_value(attic);
            self.outside.set_value(outside);
            self.control.tick().await.unwrap();
            settle().await;
        }
    }

    /// Let the actuator task catch up.
    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    // ==========================================================================
    // Tick
    // ==========================================================================

    #[tokio::test]
    async fn test_tick_turns_fan_on_and_records() {
        let mut rig = rig(settings());
        rig.tick_at(40.0, 30.0).await;

        assert_eq!(rig.fans.calls(), [FanState::On]);
        assert_eq!(rig.control.store().temperature_len(), 1);
        let event = rig.control.store().last_fan_event().unwrap();
        assert_eq!(event.event, FanState::On);
        assert_eq!(event.reason, "temp delta exceeded");
        assert_eq!(rig.control.engine().fan_state(), FanState::On);
    }

    #[tokio::test]
    async fn test_calibration_applied_before_rounding() {
        let mut rig = rig(LoopSettings {
            attic_calibration: -0.504,
            outside_calibration: 0.5,
            ..settings()
        });
        rig.tick_at(30.0, 20.0).await;

        let sample = *rig.control.store().last_temperature().unwrap();
        assert_eq!(sample.attic_temp, 29.5);
        assert_eq!(sample.outside_temp, 20.5);
    }

    #[tokio::test]
    async fn test_min_record_diff_filters_small_changes() {
        let mut rig = rig(settings());
        rig.tick_at(25.0, 20.0).await;
        rig.tick_at(25.1, 20.1).await;
        assert_eq!(rig.control.store().temperature_len(), 1);

        // exactly the threshold after rounding still counts
        rig.tick_at(25.2, 20.0).await;
        assert_eq!(rig.control.store().temperature_len(), 2);

        rig.tick_at(25.2, 19.7).await;
        assert_eq!(rig.control.store().temperature_len(), 3);
        assert_eq!(rig.control.status().current.unwrap().outside_temp, 19.7);
    }

    #[tokio::test]
    async fn test_averaging_smooths_decision_input() {
        let mut rig = rig(LoopSettings {
            averaging_time: 3 * MINUTE_MS,
            ..settings()
        });
        rig.tick_at(30.0, 31.0).await;
        // one hot reading is averaged away
        rig.tick_at(36.0, 31.0).await;
        assert_eq!(rig.control.status().current.unwrap().attic_temp, 33.0);
        assert!(rig.fans.calls().is_empty());
    }

    #[tokio::test]
    async fn test_history_capped_between_flushes() {
        let mut rig = rig_with_retention(
            settings(),
            RetentionPolicy {
                temperature_max_items: 3,
                ..RetentionPolicy::default()
            },
        );
        for i in 0..6 {
            rig.tick_at(25.0 + f64::from(i), 20.0).await;
        }
        let store = rig.control.store();
        assert_eq!(store.temperature_len(), 3);
        assert_eq!(store.logs().temperatures.front().unwrap().attic_temp, 28.0);
    }

    #[tokio::test]
    async fn test_failed_read_leaves_state_alone() {
        let mut rig = rig(settings());
        rig.tick_at(25.0, 20.0).await;
        rig.outside.fail_next(1);
        rig.clock.advance(10_000);
        assert!(rig.control.tick().await.is_err());
        assert_eq!(rig.control.store().temperature_len(), 1);
        assert_eq!(rig.attic.read_count(), 2);
    }

    #[tokio::test]
    async fn test_failure_escalation() {
        let mut rig = rig(LoopSettings {
            max_consecutive_failures: 2,
            ..settings()
        });
        let err = atticfan_core::Error::invalid("sensor", "test");
        assert!(rig.control.record_failure(&err).is_ok());
        assert!(rig.control.record_failure(&err).is_ok());
        assert!(matches!(
            rig.control.record_failure(&err),
            Err(LoopError::SensorsFailed { failures: 3 })
        ));

        rig.tick_at(25.0, 20.0).await;
        assert_eq!(rig.control.status().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_dwell_holds_fan_on() {
        let mut rig = rig(settings());
        rig.tick_at(40.0, 30.0).await;
        // delta collapses, fan off immediately
        rig.tick_at(31.0, 30.0).await;
        assert_eq!(rig.fans.calls(), [FanState::On, FanState::Off]);

        rig.tick_at(40.0, 30.0).await;
        assert_eq!(rig.fans.calls().len(), 2);

        rig.clock.advance(10 * MINUTE_MS);
        rig.tick_at(40.0, 30.0).await;
        assert_eq!(rig.fans.last(), Some(FanState::On));
    }

    // ==========================================================================
    // Commands
    // ==========================================================================

    #[tokio::test]
    async fn test_set_mode_command() {
        let mut rig = rig(settings());
        let mut events = rig.handle.subscribe();

        let (reply, rx) = oneshot::channel();
        rig.control
            .handle_command(ControlCommand::SetMode {
                mode: FanMode::On,
                duration: Some(30 * MINUTE_MS),
                reply,
            });
        let state = rx.await.unwrap().unwrap();
        assert_eq!(state.mode, FanMode::On);
        assert_eq!(state.return_to_auto_at, Some(START + 30 * MINUTE_MS));
        settle().await;
        assert_eq!(rig.fans.calls(), [FanState::On]);
        assert_eq!(
            rig.control.store().last_fan_event().unwrap().reason,
            "manual turn on"
        );

        assert!(matches!(events.recv().await.unwrap(), LoopEvent::FanChanged(_)));
        assert!(matches!(events.recv().await.unwrap(), LoopEvent::ModeChanged(_)));
    }

    #[tokio::test]
    async fn test_set_mode_rejects_short_override() {
        let mut rig = rig(settings());
        let (reply, rx) = oneshot::channel();
        rig.control
            .handle_command(ControlCommand::SetMode {
                mode: FanMode::Off,
                duration: Some(MINUTE_MS),
                reply,
            });
        assert!(rx.await.unwrap().is_err());
        assert_eq!(rig.control.engine().mode(), FanMode::Auto);
    }

    #[tokio::test]
    async fn test_override_returns_to_auto_on_tick() {
        let mut rig = rig(settings());
        let (reply, rx) = oneshot::channel();
        rig.control
            .handle_command(ControlCommand::SetMode {
                mode: FanMode::Off,
                duration: Some(5 * MINUTE_MS),
                reply,
            });
        rx.await.unwrap().unwrap();

        rig.tick_at(40.0, 30.0).await;
        assert_eq!(rig.control.engine().mode(), FanMode::Off);

        rig.clock.advance(5 * MINUTE_MS);
        rig.tick_at(40.0, 30.0).await;
        assert_eq!(rig.control.engine().mode(), FanMode::Auto);
        let event = rig.control.store().last_fan_event().unwrap();
        assert_eq!(event.event, FanState::On);
        assert!(event.reason.starts_with("return to auto - "));
    }

    #[tokio::test]
    async fn test_update_settings_command() {
        let mut rig = rig(settings());
        let (reply, rx) = oneshot::channel();
        rig.control
            .handle_command(ControlCommand::UpdateSettings {
                update: SettingsUpdate {
                    delta_temp: Some(5.0),
                    averaging_time: Some(60_000),
                    ..SettingsUpdate::default()
                },
                reply,
            });
        let thresholds = rx.await.unwrap().unwrap();
        assert_eq!(thresholds.delta_temp, 5.0);
        assert_eq!(rig.control.status().averaging_time, 60_000);

        let (reply, rx) = oneshot::channel();
        rig.control
            .handle_command(ControlCommand::UpdateSettings {
                update: SettingsUpdate {
                    delta_temp: Some(0.5),
                    min_temp: Some(35.0),
                    ..SettingsUpdate::default()
                },
                reply,
            });
        assert!(rx.await.unwrap().is_err());
        assert_eq!(rig.control.engine().thresholds().delta_temp, 5.0);
        assert_eq!(
            rig.control.engine().thresholds().min_temp,
            Thresholds::default().min_temp
        );
    }

    #[tokio::test]
    async fn test_accepted_changes_saved_to_config() {
        let mut rig = rig(settings());
        let path = rig.dir.path().join("atticfan.toml");
        let mut config = Config::default();
        config.storage.data_file = rig.dir.path().join("fan-data.txt");
        config.storage.high_low_file = rig.dir.path().join("hi-lo.txt");
        rig.control.persist_settings(&path, config);

        let (reply, rx) = oneshot::channel();
        rig.control.handle_command(ControlCommand::UpdateSettings {
            update: SettingsUpdate {
                delta_temp: Some(5.0),
                averaging_time: Some(60_000),
                ..SettingsUpdate::default()
            },
            reply,
        });
        rx.await.unwrap().unwrap();
        let (reply, rx) = oneshot::channel();
        rig.control.handle_command(ControlCommand::SetMode {
            mode: FanMode::On,
            duration: Some(30 * MINUTE_MS),
            reply,
        });
        rx.await.unwrap().unwrap();

        let saved = Config::load_validated(&path).unwrap();
        assert_eq!(saved.control.delta_temp, 5.0);
        assert_eq!(saved.control.averaging_time, 60);
        assert_eq!(saved.mode.mode, FanMode::On);
        assert_eq!(saved.mode.return_to_auto_at, Some(START + 30 * MINUTE_MS));

        // rejected changes leave the file alone
        let (reply, rx) = oneshot::channel();
        rig.control.handle_command(ControlCommand::UpdateSettings {
            update: SettingsUpdate {
                overshoot: Some(0.1),
                ..SettingsUpdate::default()
            },
            reply,
        });
        assert!(rx.await.unwrap().is_err());
        assert_eq!(Config::load_validated(&path).unwrap(), saved);

        let hw = Hardware {
            attic: rig.attic.clone(),
            outside: rig.outside.clone(),
            fans: rig.fans.clone(),
            clock: rig.clock.clone(),
        };
        let (restored, _handle) =
            ControlLoop::from_config(&saved, hw, Arc::new(ZoneCalendar::new(Utc))).unwrap();
        assert_eq!(restored.engine().mode(), FanMode::On);
        assert_eq!(
            restored.engine().return_to_auto_at(),
            Some(START + 30 * MINUTE_MS)
        );
        assert_eq!(restored.engine().thresholds().delta_temp, 5.0);
        assert_eq!(restored.settings().averaging_time, 60_000);
    }

    #[tokio::test]
    async fn test_expired_override_saved_as_auto() {
        let mut rig = rig(settings());
        let path = rig.dir.path().join("atticfan.toml");
        rig.control.persist_settings(&path, Config::default());

        let (reply, rx) = oneshot::channel();
        rig.control.handle_command(ControlCommand::SetMode {
            mode: FanMode::Off,
            duration: Some(5 * MINUTE_MS),
            reply,
        });
        rx.await.unwrap().unwrap();
        assert_eq!(Config::load(&path).unwrap().mode.mode, FanMode::Off);

        rig.clock.advance(5 * MINUTE_MS);
        rig.tick_at(25.0, 20.0).await;
        let saved = Config::load(&path).unwrap();
        assert_eq!(saved.mode.mode, FanMode::Auto);
        assert_eq!(saved.mode.return_to_auto_at, None);
    }

    // ==========================================================================
    // Shutdown
    // ==========================================================================

    #[tokio::test]
    async fn test_shutdown_turns_fans_off_and_writes() {
        let mut rig = rig(settings());
        rig.tick_at(40.0, 30.0).await;
        let write = rig.control.start_flush();
        assert!(write.is_some());
        rig.tick_at(40.5, 30.0).await;

        rig.control.shutdown(write).await;

        assert_eq!(rig.fans.blocking_calls(), [FanState::Off]);
        let store = rig.control.store();
        assert!(!store.is_write_in_flight());
        let last = store.last_fan_event().unwrap();
        assert_eq!(last.event, FanState::Off);
        assert_eq!(last.reason, SHUTDOWN_REASON);

        let decoded = atticfan_store::format::read_log(store.path()).unwrap();
        assert_eq!(decoded.temperatures.len(), 2);
        assert_eq!(decoded.fan_events.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_with_fan_off_adds_no_event() {
        let mut rig = rig(settings());
        rig.tick_at(25.0, 20.0).await;
        rig.control.shutdown(None).await;
        assert_eq!(rig.control.store().fan_event_len(), 0);
        assert_eq!(rig.fans.blocking_calls(), [FanState::Off]);
        assert!(rig.control.store().path().exists());
    }
}
