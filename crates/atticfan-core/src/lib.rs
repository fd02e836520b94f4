//! Control core for the attic ventilation controller.
//!
//! This crate turns raw sensor readings into fan decisions:
//!
//! - [`TimeAverager`] smooths each sensor over a trailing time window
//! - [`FanDecisionEngine`] maps smoothed temperatures and the operator's
//!   manual mode onto a fan state, with hysteresis and a dwell time
//! - [`W1Sensor`] and [`SysfsFans`] talk to the real hardware through sysfs
//! - [`wait_for_trusted_time`] holds startup until the wall clock is sane
//!
//! Hardware and time are reached only through the traits in [`traits`], so
//! the whole loop can run against [`mock`] implementations.
//!
//! # Example
//!
//! ```
//! use atticfan_core::{ApplyOutcome, FanDecisionEngine, Thresholds};
//! use atticfan_types::FanState;
//!
//! let mut engine = FanDecisionEngine::new(Thresholds::default());
//! match engine.step(38.0, 30.0, 0) {
//!     ApplyOutcome::Changed(event) => assert_eq!(event.event, FanState::On),
//!     other => panic!("unexpected {:?}", other),
//! }
//! ```

pub mod averager;
pub mod control;
pub mod error;
pub mod gpio;
pub mod mock;
pub mod sensor;
pub mod settings;
pub mod timegate;
pub mod traits;

pub use averager::TimeAverager;
pub use control::{
    ApplyOutcome, Decision, EngineState, FanDecisionEngine, MIN_OVERRIDE, RETURN_TO_AUTO_PREFIX,
};
pub use error::{Error, Result, ValidationError, format_validation_errors};
pub use gpio::{DEFAULT_GPIO_DIR, SysfsFans, gpio_available};
pub use mock::{ManualClock, MockSensor, RecordingActuator, ScriptedTimeGate};
pub use sensor::{DEFAULT_W1_DIR, W1Sensor, parse_w1_slave};
pub use settings::{
    MAX_AVERAGING_TIME, MIN_AVERAGING_TIME, SettingsUpdate, Thresholds, check_averaging_time,
};
pub use timegate::{Decay, WallClockGate, wait_for_trusted_time};
pub use traits::{Clock, FanActuator, SystemClock, TemperatureSensor, TimeGate};

pub use atticfan_types::{FanEvent, FanMode, FanState, Millis, Sample};
