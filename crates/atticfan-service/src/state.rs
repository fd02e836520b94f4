//! Messages between the control loop and its clients.
//!
//! # Event Channel Behavior
//!
//! Loop events go out on a broadcast channel:
//!
//! - **Buffer size**: [`EVENT_BUFFER`] events
//! - **Message loss**: a subscriber that falls behind loses the oldest events
//! - **No blocking**: the loop never waits for subscribers
//!
//! Commands go the other way on a bounded mpsc channel and are answered on a
//! oneshot channel once the loop has applied them. The loop owns all of its
//! state, so clients never lock anything.

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use atticfan_core::{EngineState, SettingsUpdate, Thresholds};
use atticfan_types::{DailyHighLow, FanEvent, FanMode, Millis, Sample};

/// Events kept for slow subscribers.
pub const EVENT_BUFFER: usize = 100;

/// Commands waiting for the loop.
pub const COMMAND_BUFFER: usize = 16;

/// Something the control loop did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// A tick read both sensors.
    Reading {
        t: Millis,
        /// Calibrated instantaneous readings.
        attic_raw: f64,
        outside_raw: f64,
        /// Smoothed, rounded values the decision used.
        attic: f64,
        outside: f64,
    },
    /// A sample differed enough from the last one to be stored.
    Recorded(Sample),
    /// The fan changed state.
    FanChanged(FanEvent),
    /// The mode changed through a command.
    ModeChanged(EngineState),
    /// A day was added to the high/low log.
    DayClosed(DailyHighLow),
}

/// Point-in-time view of the loop for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub engine: EngineState,
    pub thresholds: Thresholds,
    pub averaging_time: Millis,
    /// Latest smoothed values, before the record filter.
    pub current: Option<Sample>,
    pub last_recorded: Option<Sample>,
    pub last_event: Option<FanEvent>,
    pub temperature_count: usize,
    pub fan_event_count: usize,
    pub write_in_flight: bool,
    pub consecutive_failures: u32,
}

/// Requests handled by the control loop between ticks.
#[derive(Debug)]
pub enum ControlCommand {
    /// Change the fan mode, optionally reverting to auto after `duration` ms.
    SetMode {
        mode: FanMode,
        duration: Option<Millis>,
        reply: oneshot::Sender<atticfan_core::Result<EngineState>>,
    },
    /// Change thresholds and the averaging window.
    UpdateSettings {
        update: SettingsUpdate,
        reply: oneshot::Sender<atticfan_core::Result<Thresholds>>,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
}

/// Errors returned to command senders.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The loop has exited and no longer takes commands.
    #[error("Control loop is not running")]
    Stopped,
    /// The loop refused the command.
    #[error(transparent)]
    Rejected(#[from] atticfan_core::Error),
}

/// Cloneable client for a running control loop.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    commands: mpsc::Sender<ControlCommand>,
    events: broadcast::Sender<LoopEvent>,
}

impl ControlHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<ControlCommand>,
        events: broadcast::Sender<LoopEvent>,
    ) -> Self {
        Self { commands, events }
    }

    /// Receive loop events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControlCommand,
    ) -> Result<T, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| ControlError::Stopped)?;
        rx.await.map_err(|_| ControlError::Stopped)
    }

    /// Switch the fan mode. See [`atticfan_core::FanDecisionEngine::set_mode`].
    pub async fn set_mode(
        &self,
        mode: FanMode,
        duration: Option<Millis>,
    ) -> Result<EngineState, ControlError> {
        Ok(self
            .request(|reply| ControlCommand::SetMode {
                mode,
                duration,
                reply,
            })
            .await??)
    }

    /// Apply a settings update. Nothing changes if any field is invalid.
    pub async fn update_settings(&self, update: SettingsUpdate) -> Result<Thresholds, ControlError> {
        Ok(self
            .request(|reply| ControlCommand::UpdateSettings { update, reply })
            .await??)
    }

    pub async fn status(&self) -> Result<StatusSnapshot, ControlError> {
        self.request(|reply| ControlCommand::Status { reply }).await
    }
}
