//! Hysteresis fan decision engine.
//!
//! The engine owns the fan mode, the pending return-to-auto time and the
//! runtime fan state. It never touches hardware: [`FanDecisionEngine::apply`]
//! returns the committed [`FanEvent`] and the caller records it and drives
//! the actuator.
//!
//! In auto mode two thresholds are used. The fan turns on once the attic is
//! `delta_temp` warmer than outside and turns off only when that delta falls
//! below `delta_temp - overshoot`, so readings hovering around one value do
//! not make the fan chatter.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use atticfan_types::{FanEvent, FanMode, FanState, MINUTE_MS, Millis};

use crate::error::{Error, Result};
use crate::settings::Thresholds;

/// Shortest accepted manual override.
pub const MIN_OVERRIDE: Millis = 5 * MINUTE_MS;

/// Prefix added to the reason of the decision that ends a manual override.
pub const RETURN_TO_AUTO_PREFIX: &str = "return to auto - ";

/// The state the engine wants the fan in, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub desired: FanState,
    pub reason: String,
}

impl Decision {
    fn new(desired: FanState, reason: impl Into<String>) -> Self {
        Self {
            desired,
            reason: reason.into(),
        }
    }
}

/// Result of [`FanDecisionEngine::apply`].
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The fan is already in the desired state.
    Unchanged,
    /// Turning on is blocked by the dwell time for another `remaining` ms.
    Held { remaining: Millis },
    /// The state changed; the event must be recorded and actuated.
    Changed(FanEvent),
}

impl ApplyOutcome {
    /// The committed event, if the state changed.
    pub fn event(&self) -> Option<&FanEvent> {
        match self {
            ApplyOutcome::Changed(event) => Some(event),
            _ => None,
        }
    }
}

/// Snapshot of the engine state for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineState {
    pub mode: FanMode,
    pub return_to_auto_at: Option<Millis>,
    pub fan: FanState,
    pub last_fan_change: Option<Millis>,
}

/// Hysteresis state machine with manual override and auto-return.
#[derive(Debug, Clone)]
pub struct FanDecisionEngine {
    thresholds: Thresholds,
    mode: FanMode,
    return_to_auto_at: Option<Millis>,
    fan: FanState,
    last_fan_change: Option<Millis>,
}

impl FanDecisionEngine {
    /// Create an engine in auto mode with the fan off.
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            mode: FanMode::Auto,
            return_to_auto_at: None,
            fan: FanState::Off,
            last_fan_change: None,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Replace the thresholds. Callers validate first.
    pub fn set_thresholds(&mut self, thresholds: Thresholds) {
        self.thresholds = thresholds;
    }

    pub fn mode(&self) -> FanMode {
        self.mode
    }

    pub fn return_to_auto_at(&self) -> Option<Millis> {
        self.return_to_auto_at
    }

    pub fn fan_state(&self) -> FanState {
        self.fan
    }

    pub fn last_fan_change(&self) -> Option<Millis> {
        self.last_fan_change
    }

    pub fn state(&self) -> EngineState {
        EngineState {
            mode: self.mode,
            return_to_auto_at: self.return_to_auto_at,
            fan: self.fan,
            last_fan_change: self.last_fan_change,
        }
    }

    /// Decide what the fan should do for the given smoothed temperatures.
    ///
    /// An expired manual override reverts to auto here, before deciding.
    pub fn evaluate(&mut self, attic_temp: f64, outside_temp: f64, now: Millis) -> Decision {
        let mut returned = false;
        if self.mode != FanMode::Auto
            && let Some(at) = self.return_to_auto_at
            && now >= at
        {
            info!("Manual {} override expired, returning to auto", self.mode);
            self.mode = FanMode::Auto;
            self.return_to_auto_at = None;
            returned = true;
        }

        let mut decision = match self.mode {
            FanMode::Off => Decision::new(FanState::Off, "manual off"),
            FanMode::On => Decision::new(FanState::On, "manual on"),
            FanMode::Auto => self.auto_decision(attic_temp, outside_temp),
        };

        if returned {
            decision.reason = format!("{}{}", RETURN_TO_AUTO_PREFIX, decision.reason);
        }
        decision
    }

    fn auto_decision(&self, attic: f64, outside: f64) -> Decision {
        let t = &self.thresholds;
        let delta = attic - outside;

        if self.fan.is_on() {
            if attic <= t.min_temp - t.overshoot {
                Decision::new(FanState::Off, "attic below minimum temp")
            } else if outside <= t.min_outside_temp - t.overshoot {
                Decision::new(FanState::Off, "outside below minimum temp")
            } else if delta < t.delta_temp - t.overshoot {
                Decision::new(FanState::Off, "temp delta below threshold")
            } else {
                Decision::new(FanState::On, "no change")
            }
        } else if attic <= t.min_temp || outside <= t.min_outside_temp {
            Decision::new(FanState::Off, "no change")
        } else if delta >= t.delta_temp {
            Decision::new(FanState::On, "temp delta exceeded")
        } else {
            Decision::new(FanState::Off, "no change")
        }
    }

    /// Commit `desired` unless it is already current or the dwell time holds
    /// it back.
    ///
    /// Turning off is always immediate. Turning on waits until `wait_time`
    /// has passed since the last change, unless `ignore_dwell` is set.
    pub fn apply(
        &mut self,
        desired: FanState,
        reason: &str,
        ignore_dwell: bool,
        now: Millis,
    ) -> ApplyOutcome {
        if desired == self.fan {
            return ApplyOutcome::Unchanged;
        }

        if desired.is_on()
            && !ignore_dwell
            && let Some(last) = self.last_fan_change
        {
            let elapsed = now - last;
            if elapsed < self.thresholds.wait_time {
                let remaining = self.thresholds.wait_time - elapsed;
                debug!("Fan on held for {} ms by dwell time", remaining);
                return ApplyOutcome::Held { remaining };
            }
        }

        self.fan = desired;
        self.last_fan_change = Some(now);
        info!("Fan {}: {}", desired, reason);
        ApplyOutcome::Changed(FanEvent::new(now, desired, reason))
    }

    /// Evaluate and apply in one tick. At most one state change results.
    pub fn step(&mut self, attic_temp: f64, outside_temp: f64, now: Millis) -> ApplyOutcome {
        let decision = self.evaluate(attic_temp, outside_temp, now);
        self.apply(decision.desired, &decision.reason, false, now)
    }

    /// Change the fan mode.
    ///
    /// `On` and `Off` take effect immediately, ignoring the dwell time, and
    /// revert to auto after `duration` (never, if `None`). `Auto` only clears
    /// the pending return; the next [`evaluate`](Self::evaluate) decides the
    /// fan state.
    pub fn set_mode(
        &mut self,
        mode: FanMode,
        duration: Option<Millis>,
        now: Millis,
    ) -> Result<ApplyOutcome> {
        let desired = match mode {
            FanMode::Auto => {
                self.mode = FanMode::Auto;
                self.return_to_auto_at = None;
                info!("Fan mode set to auto");
                return Ok(ApplyOutcome::Unchanged);
            }
            FanMode::On => FanState::On,
            FanMode::Off => FanState::Off,
        };

        if let Some(duration) = duration
            && duration < MIN_OVERRIDE
        {
            return Err(Error::invalid(
                "mode.duration",
                format!(
                    "override of {} ms is shorter than the {} minute minimum",
                    duration,
                    MIN_OVERRIDE / MINUTE_MS
                ),
            ));
        }

        self.mode = mode;
        self.return_to_auto_at = duration.map(|d| now.saturating_add(d));
        info!(
            "Fan mode set to {} until {:?}",
            mode, self.return_to_auto_at
        );

        let reason = match desired {
            FanState::On => "manual turn on",
            FanState::Off => "manual turn off",
        };
        Ok(self.apply(desired, reason, true, now))
    }

    /// Put back a mode saved by an earlier run without touching the fan.
    ///
    /// The next [`step`](Self::step) drives the fan to match. An override
    /// whose return time has already passed reverts to auto there.
    pub fn restore_mode(&mut self, mode: FanMode, return_to_auto_at: Option<Millis>) {
        self.mode = mode;
        self.return_to_auto_at = match mode {
            FanMode::Auto => None,
            FanMode::On | FanMode::Off => return_to_auto_at,
        };
        if mode != FanMode::Auto {
            info!(
                "Restored manual {} mode until {:?}",
                mode, self.return_to_auto_at
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const WAIT: Millis = 10 * MINUTE_MS;

    fn engine() -> FanDecisionEngine {
        FanDecisionEngine::new(Thresholds {
            min_temp: 29.0,
            min_outside_temp: -40.0,
            delta_temp: 3.0,
            overshoot: 1.0,
            wait_time: WAIT,
        })
    }

    // ==========================================================================
    // Auto hysteresis
    // ==========================================================================

    #[test]
    fn test_hysteresis_on_hold_off() {
        let mut e = engine();

        let out = e.step(32.0, 28.0, 0);
        assert_eq!(out.event().map(|ev| ev.event), Some(FanState::On));

        // delta 2 sits between the off and on thresholds
        assert_eq!(e.step(32.0, 30.0, 10_000), ApplyOutcome::Unchanged);
        assert!(e.fan_state().is_on());

        let out = e.step(32.0, 30.5, 20_000);
        let ev = out.event().unwrap();
        assert_eq!(ev.event, FanState::Off);
        assert_eq!(ev.reason, "temp delta below threshold");
    }

    #[test]
    fn test_below_delta_stays_off() {
        let mut e = engine();
        let d = e.evaluate(32.0, 29.5, 0);
        assert_eq!(d.desired, FanState::Off);
        assert_eq!(d.reason, "no change");
    }

    #[test]
    fn test_attic_floor_blocks_turn_on() {
        let mut e = engine();
        // delta is large but the attic is not warm enough
        let d = e.evaluate(29.0, 10.0, 0);
        assert_eq!(d.desired, FanState::Off);
    }

    #[test]
    fn test_outside_floor() {
        let mut e = engine();
        e.set_thresholds(Thresholds {
            min_outside_temp: 5.0,
            ..*e.thresholds()
        });
        assert_eq!(e.evaluate(35.0, 5.0, 0).desired, FanState::Off);

        e.step(35.0, 6.0, 0);
        assert!(e.fan_state().is_on());
        // above floor - overshoot keeps it on
        assert_eq!(e.evaluate(35.0, 4.5, 1).desired, FanState::On);
        let d = e.evaluate(35.0, 4.0, 2);
        assert_eq!(d.desired, FanState::Off);
        assert_eq!(d.reason, "outside below minimum temp");
    }

    #[test]
    fn test_attic_drop_turns_off() {
        let mut e = engine();
        e.step(40.0, 20.0, 0);
        assert_eq!(e.evaluate(28.5, 20.0, 1).desired, FanState::On);
        let d = e.evaluate(28.0, 20.0, 2);
        assert_eq!(d.desired, FanState::Off);
        assert_eq!(d.reason, "attic below minimum temp");
    }

    // ==========================================================================
    // Dwell time
    // ==========================================================================

    #[test]
    fn test_dwell_holds_second_on() {
        let mut e = engine();
        assert!(e.apply(FanState::On, "t", false, 0).event().is_some());
        // off is immediate
        assert!(e.apply(FanState::Off, "t", false, 1_000).event().is_some());

        assert_eq!(
            e.apply(FanState::On, "t", false, 2_000),
            ApplyOutcome::Held {
                remaining: WAIT - 1_000
            }
        );
        assert!(!e.fan_state().is_on());

        let out = e.apply(FanState::On, "t", false, 1_000 + WAIT);
        assert!(out.event().is_some());
    }

    #[test]
    fn test_ignore_dwell() {
        let mut e = engine();
        e.apply(FanState::On, "t", false, 0);
        e.apply(FanState::Off, "t", false, 1);
        let out = e.apply(FanState::On, "t", true, 2);
        assert_eq!(out.event().map(|ev| ev.t), Some(2));
    }

    #[test]
    fn test_first_turn_on_not_held() {
        let mut e = engine();
        assert!(e.apply(FanState::On, "t", false, 5).event().is_some());
        assert_eq!(e.last_fan_change(), Some(5));
    }

    // ==========================================================================
    // Manual override
    // ==========================================================================

    #[test]
    fn test_manual_off_ignores_conditions_then_returns_to_auto() {
        let mut e = engine();
        e.step(32.0, 28.0, 0);
        assert!(e.fan_state().is_on());

        let out = e.set_mode(FanMode::Off, Some(10 * MINUTE_MS), 1_000).unwrap();
        let ev = out.event().unwrap();
        assert_eq!(ev.event, FanState::Off);
        assert_eq!(ev.reason, "manual turn off");
        assert_eq!(e.return_to_auto_at(), Some(1_000 + 10 * MINUTE_MS));

        // conditions still favour the fan, but the override holds
        let d = e.evaluate(32.0, 28.0, 5 * MINUTE_MS);
        assert_eq!(d.desired, FanState::Off);
        assert_eq!(d.reason, "manual off");
        assert_eq!(e.mode(), FanMode::Off);

        let d = e.evaluate(32.0, 28.0, 1_000 + 10 * MINUTE_MS);
        assert_eq!(e.mode(), FanMode::Auto);
        assert_eq!(e.return_to_auto_at(), None);
        assert_eq!(d.desired, FanState::On);
        assert_eq!(d.reason, "return to auto - temp delta exceeded");
    }

    #[test]
    fn test_manual_on_bypasses_dwell() {
        let mut e = engine();
        e.apply(FanState::On, "t", false, 0);
        e.apply(FanState::Off, "t", false, 1);
        let out = e.set_mode(FanMode::On, Some(MIN_OVERRIDE), 2).unwrap();
        assert_eq!(out.event().map(|ev| ev.reason.as_str()), Some("manual turn on"));
    }

    #[test]
    fn test_override_without_duration_never_returns() {
        let mut e = engine();
        e.set_mode(FanMode::On, None, 0).unwrap();
        let d = e.evaluate(0.0, 0.0, i64::MAX / 2);
        assert_eq!(e.mode(), FanMode::On);
        assert_eq!(d.reason, "manual on");
    }

    #[test]
    fn test_short_override_rejected() {
        let mut e = engine();
        let err = e.set_mode(FanMode::On, Some(MIN_OVERRIDE - 1), 0).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(e.mode(), FanMode::Auto);
        assert!(!e.fan_state().is_on());
    }

    #[test]
    fn test_set_auto_clears_return_without_change() {
        let mut e = engine();
        e.set_mode(FanMode::On, Some(MIN_OVERRIDE), 0).unwrap();
        let out = e.set_mode(FanMode::Auto, None, 1).unwrap();
        assert_eq!(out, ApplyOutcome::Unchanged);
        assert_eq!(e.return_to_auto_at(), None);
        assert!(e.fan_state().is_on());

        // next tick re-derives the state
        let out = e.step(20.0, 20.0, 2);
        assert_eq!(out.event().map(|ev| ev.event), Some(FanState::Off));
    }

    #[test]
    fn test_restored_mode_drives_next_step() {
        let mut e = engine();
        e.restore_mode(FanMode::On, Some(20 * MINUTE_MS));
        assert!(!e.fan_state().is_on());

        let out = e.step(20.0, 20.0, 1_000);
        assert_eq!(out.event().map(|ev| ev.reason.as_str()), Some("manual on"));

        // already expired by the time it is restored
        let mut e = engine();
        e.restore_mode(FanMode::Off, Some(5_000));
        let out = e.step(32.0, 28.0, 10_000);
        assert_eq!(e.mode(), FanMode::Auto);
        assert_eq!(
            out.event().map(|ev| ev.reason.as_str()),
            Some("return to auto - temp delta exceeded")
        );

        e.restore_mode(FanMode::Auto, Some(5_000));
        assert_eq!(e.return_to_auto_at(), None);
    }

    // ==========================================================================
    // Properties
    // ==========================================================================

    proptest! {
        #[test]
        fn prop_step_changes_at_most_once_and_respects_dwell(
            ticks in proptest::collection::vec((20.0f64..45.0, 15.0f64..40.0), 1..300),
        ) {
            let mut e = engine();
            let mut last_change: Option<Millis> = None;
            for (i, (attic, outside)) in ticks.into_iter().enumerate() {
                let now = i as Millis * 10_000;
                let before = e.fan_state();
                if let ApplyOutcome::Changed(ev) = e.step(attic, outside, now) {
                    prop_assert_ne!(ev.event, before);
                    if ev.event.is_on()
                        && let Some(last) = last_change
                    {
                        prop_assert!(now - last >= WAIT);
                    }
                    last_change = Some(now);
                }
                // a second apply of the same decision changes nothing
                let again = e.evaluate(attic, outside, now);
                prop_assert!(!matches!(
                    e.apply(again.desired, &again.reason, false, now),
                    ApplyOutcome::Changed(_)
                ));
            }
        }
    }
}
