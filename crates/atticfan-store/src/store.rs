//! In-memory temperature and fan event history with durable snapshots.
//!
//! The control loop owns the [`TimeSeriesStore`] and is its only writer.
//! Persistence runs on a blocking thread against a shared snapshot of the
//! logs; while it runs, mutations are queued as [`Command`]s and replayed in
//! arrival order by [`TimeSeriesStore::finish_write`].

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use atticfan_types::{DayCalendar, FanEvent, Millis, Sample};

use crate::error::{Error, Result};
use crate::format::{self, LoadReport, WriteGate};

/// Most mutations held back while a write is in flight.
pub const QUEUE_CAPACITY: usize = 10_000;

/// How much history is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Whole days of temperatures kept before today.
    pub temperature_days: u32,
    /// Hard cap on the number of samples.
    pub temperature_max_items: usize,
    /// Whole days of fan events kept before today.
    pub fan_event_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            temperature_days: 14,
            temperature_max_items: 10_000,
            fan_event_days: 3 * 365 + 1,
        }
    }
}

/// The two history logs, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Logs {
    pub temperatures: VecDeque<Sample>,
    pub fan_events: VecDeque<FanEvent>,
}

/// A mutation deferred while a write is in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    AddTemperature(Sample),
    AddFanEvent(FanEvent),
    Age { now: Millis },
}

/// Temperature and fan event history.
pub struct TimeSeriesStore {
    path: PathBuf,
    logs: Arc<Logs>,
    retention: RetentionPolicy,
    calendar: Arc<dyn DayCalendar>,
    write_in_flight: bool,
    gate: WriteGate,
    queue: VecDeque<Command>,
    dropped: u64,
}

impl std::fmt::Debug for TimeSeriesStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeSeriesStore")
            .field("path", &self.path)
            .field("temperatures", &self.logs.temperatures.len())
            .field("fan_events", &self.logs.fan_events.len())
            .field("write_in_flight", &self.write_in_flight)
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl TimeSeriesStore {
    /// Create an empty store that persists to `path`.
    pub fn new(
        path: impl Into<PathBuf>,
        retention: RetentionPolicy,
        calendar: Arc<dyn DayCalendar>,
    ) -> Self {
        Self {
            path: path.into(),
            logs: Arc::new(Logs::default()),
            retention,
            calendar,
            write_in_flight: false,
            gate: WriteGate::default(),
            queue: VecDeque::new(),
            dropped: 0,
        }
    }

    /// Load the store from `path`.
    ///
    /// Leftover temporary files from interrupted writes are deleted first.
    /// A missing file gives an empty store; damaged rows are skipped.
    pub fn open(
        path: impl Into<PathBuf>,
        retention: RetentionPolicy,
        calendar: Arc<dyn DayCalendar>,
    ) -> Result<(Self, LoadReport)> {
        let mut store = Self::new(path, retention, calendar);
        format::remove_leftover_temps(&store.path);

        let decoded = format::read_log(&store.path)?;
        if !decoded.report.is_clean() {
            warn!(
                "Loaded {} with {} skipped rows and {} skipped sections",
                store.path.display(),
                decoded.report.skipped_rows,
                decoded.report.skipped_sections.len()
            );
        }
        info!(
            "Loaded {} temperatures and {} fan events from {}",
            decoded.temperatures.len(),
            decoded.fan_events.len(),
            store.path.display()
        );

        store.logs = Arc::new(Logs {
            temperatures: decoded.temperatures,
            fan_events: decoded.fan_events,
        });
        Ok((store, decoded.report))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    pub fn logs(&self) -> &Logs {
        &self.logs
    }

    // ======================================================================
    // Mutation
    // ======================================================================

    /// Append a temperature sample.
    pub fn add_temperature(&mut self, sample: Sample) {
        self.submit(Command::AddTemperature(sample));
    }

    /// Append a fan event.
    pub fn add_fan_event(&mut self, event: FanEvent) {
        self.submit(Command::AddFanEvent(event));
    }

    /// Apply both retention rules relative to `now`.
    ///
    /// The sample count is capped first, then everything older than local
    /// midnight `N` days before today is dropped, with separate `N` for
    /// temperatures and fan events.
    pub fn age_data(&mut self, now: Millis) {
        self.submit(Command::Age { now });
    }

    fn submit(&mut self, command: Command) {
        if !self.write_in_flight {
            self.apply(command);
            return;
        }

        if self.queue.len() >= QUEUE_CAPACITY {
            self.dropped += 1;
            if self.dropped == 1 || self.dropped.is_power_of_two() {
                error!(
                    "Write queue full, dropped {} mutations so far",
                    self.dropped
                );
            }
            return;
        }
        self.queue.push_back(command);
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::AddTemperature(sample) => {
                if let Some(last) = self.logs.temperatures.back()
                    && sample.t < last.t
                {
                    warn!(
                        "Dropping temperature at {} older than last at {}",
                        sample.t, last.t
                    );
                    return;
                }
                Arc::make_mut(&mut self.logs).temperatures.push_back(sample);
            }
            Command::AddFanEvent(event) => {
                if let Some(last) = self.logs.fan_events.back()
                    && event.t < last.t
                {
                    warn!(
                        "Dropping fan event at {} older than last at {}",
                        event.t, last.t
                    );
                    return;
                }
                Arc::make_mut(&mut self.logs).fan_events.push_back(event);
            }
            Command::Age { now } => self.age(now),
        }
    }

    fn age(&mut self, now: Millis) {
        let retention = self.retention;
        let temp_cutoff = self
            .calendar
            .shift_days(now, -i64::from(retention.temperature_days));
        let event_cutoff = self
            .calendar
            .shift_days(now, -i64::from(retention.fan_event_days));

        let needs_trim = self.logs.temperatures.len() > retention.temperature_max_items
            || self
                .logs
                .temperatures
                .front()
                .is_some_and(|s| s.t < temp_cutoff)
            || self
                .logs
                .fan_events
                .front()
                .is_some_and(|e| e.t < event_cutoff);
        if !needs_trim {
            return;
        }

        let logs = Arc::make_mut(&mut self.logs);
        let before = (logs.temperatures.len(), logs.fan_events.len());

        let excess = logs
            .temperatures
            .len()
            .saturating_sub(retention.temperature_max_items);
        logs.temperatures.drain(..excess);

        let stale = logs.temperatures.partition_point(|s| s.t < temp_cutoff);
        logs.temperatures.drain(..stale);
        let stale = logs.fan_events.partition_point(|e| e.t < event_cutoff);
        logs.fan_events.drain(..stale);

        debug!(
            "Aged data: {} temperatures and {} fan events removed",
            before.0 - logs.temperatures.len(),
            before.1 - logs.fan_events.len()
        );
    }

    // ======================================================================
    // Persistence
    // ======================================================================

    /// Whether an asynchronous write is running.
    pub fn is_write_in_flight(&self) -> bool {
        self.write_in_flight
    }

    /// Number of mutations waiting for the current write to finish.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Start writing a snapshot of the logs on a blocking thread.
    ///
    /// Until the returned task's result is handed to
    /// [`finish_write`](Self::finish_write), mutations are queued. Returns
    /// `None` if a write is already running.
    pub fn spawn_write(&mut self) -> Option<JoinHandle<Result<()>>> {
        if self.write_in_flight {
            debug!("Write requested while one is in flight, skipping");
            return None;
        }
        self.write_in_flight = true;

        let logs = Arc::clone(&self.logs);
        let path = self.path.clone();
        let ticket = self.gate.begin();
        Some(tokio::task::spawn_blocking(move || {
            format::write_log(&path, &ticket, &logs.temperatures, &logs.fan_events)
        }))
    }

    /// Complete a write started by [`spawn_write`](Self::spawn_write).
    ///
    /// Clears the in-flight flag and replays queued mutations in order,
    /// whether or not the write succeeded. The result is passed back.
    pub fn finish_write(
        &mut self,
        joined: std::result::Result<Result<()>, tokio::task::JoinError>,
    ) -> Result<()> {
        let result = joined.unwrap_or_else(|e| Err(Error::WriteTask(e.to_string())));
        match &result {
            Ok(()) => debug!("Data written to {}", self.path.display()),
            Err(e) => error!("Data write failed, will retry on next flush: {}", e),
        }

        self.write_in_flight = false;
        let queued = std::mem::take(&mut self.queue);
        if !queued.is_empty() {
            debug!("Replaying {} queued mutations", queued.len());
        }
        for command in queued {
            self.apply(command);
        }
        if self.dropped > 0 {
            warn!("{} mutations were dropped during the write", self.dropped);
            self.dropped = 0;
        }
        result
    }

    /// Write and wait, for callers that do not need to keep mutating
    /// meanwhile.
    pub async fn write(&mut self) -> Result<()> {
        match self.spawn_write() {
            Some(handle) => {
                let joined = handle.await;
                self.finish_write(joined)
            }
            None => Err(Error::WriteInFlight),
        }
    }

    /// Write on the calling thread. Used at shutdown.
    ///
    /// Fails with [`Error::WriteInFlight`] if an asynchronous write has not
    /// been finished yet. A write that was given up on still runs in the
    /// background but can no longer replace the file once this one starts.
    pub fn write_sync(&mut self) -> Result<()> {
        if self.write_in_flight {
            return Err(Error::WriteInFlight);
        }
        let ticket = self.gate.begin();
        format::write_log(
            &self.path,
            &ticket,
            &self.logs.temperatures,
            &self.logs.fan_events,
        )?;
        info!("Data written to {}", self.path.display());
        Ok(())
    }

    // ======================================================================
    // Queries
    // ======================================================================

    pub fn temperature_len(&self) -> usize {
        self.logs.temperatures.len()
    }

    pub fn fan_event_len(&self) -> usize {
        self.logs.fan_events.len()
    }

    /// Sample at `index`; negative indices count from the end (`-1` is the
    /// newest).
    pub fn get_temperature_item(&self, index: isize) -> Option<&Sample> {
        let len = self.logs.temperatures.len();
        let index = if index < 0 {
            len.checked_sub(index.unsigned_abs())?
        } else {
            index.unsigned_abs()
        };
        self.logs.temperatures.get(index)
    }

    pub fn last_temperature(&self) -> Option<&Sample> {
        self.logs.temperatures.back()
    }

    pub fn last_fan_event(&self) -> Option<&FanEvent> {
        self.logs.fan_events.back()
    }

    /// Visit samples oldest first until `f` breaks.
    pub fn each_temperature<F>(&self, mut f: F)
    where
        F: FnMut(&Sample) -> ControlFlow<()>,
    {
        for sample in &self.logs.temperatures {
            if f(sample).is_break() {
                break;
            }
        }
    }

    /// Visit fan events oldest first until `f` breaks.
    pub fn each_event<F>(&self, mut f: F)
    where
        F: FnMut(&FanEvent) -> ControlFlow<()>,
    {
        for event in &self.logs.fan_events {
            if f(event).is_break() {
                break;
            }
        }
    }

    /// Samples with `t >= since`, oldest first.
    pub fn temperatures_since(&self, since: Millis) -> impl Iterator<Item = &Sample> {
        let start = self.logs.temperatures.partition_point(|s| s.t < since);
        self.logs.temperatures.range(start..)
    }

    /// Fan events with `t >= since`, oldest first.
    pub fn fan_events_since(&self, since: Millis) -> impl Iterator<Item = &FanEvent> {
        let start = self.logs.fan_events.partition_point(|e| e.t < since);
        self.logs.fan_events.range(start..)
    }
}
