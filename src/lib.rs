//! Real-time control engine for a fiber-extrusion device.
//!
//! A single control worker runs the die temperature loop, the spool speed
//! loop and the diameter cascade at a fixed tick; the camera captures and
//! measures on its own thread. Hardware is reached only through the port
//! traits in [`hardware`]; [`hardware::sim`] implements all of them for
//! development and tests.

pub mod calibration;
pub mod config;
pub mod control;
pub mod error;
pub mod hardware;
pub mod orchestrator;
pub mod utils;
pub mod vision;
