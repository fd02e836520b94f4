//! Control loop daemon for the attic ventilation controller.
//!
//! This crate wires the sensors, fan relays, history store and decision
//! engine together:
//! - Reads both 1-Wire probes on a fixed poll interval
//! - Smooths the readings and drives the fans through the hysteresis engine
//! - Records samples and fan events, flushing them to disk periodically
//! - Maintains the daily outside high/low log
//! - Accepts mode and settings changes through a [`ControlHandle`]
//!
//! # Configuration
//!
//! The daemon reads `~/.config/atticfan/atticfan.toml`:
//!
//! ```toml
//! [sensors]
//! attic_id = "28-000005e947e8"
//! outside_id = "28-000005cf5a54"
//!
//! [control]
//! min_temp = 29.444
//! delta_temp = 3.333
//! overshoot = 0.556
//! wait_time = 600
//!
//! [fans]
//! pins = [24, 23]
//! separation = 20
//!
//! [storage]
//! data_file = "/home/pi/fan-control-data.txt"
//! high_low_file = "/home/pi/hi-lo.txt"
//! ```
//!
//! Every section and field is optional. Settings and mode changes made
//! through the handle are written back to the same file, the mode under a
//! `[mode]` section.

pub mod config;
pub mod control_loop;
pub mod state;

pub use config::{Config, ConfigError, ModeConfig, default_config_path};
pub use control_loop::{ControlLoop, Hardware, LoopError, LoopSettings, SHUTDOWN_REASON};
pub use state::{ControlCommand, ControlError, ControlHandle, LoopEvent, StatusSnapshot};
