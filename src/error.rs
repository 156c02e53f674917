//! error.rs
//! Error taxonomy for the control engine.
//!
//! Per-tick failures are caught at each subsystem boundary and logged; only
//! `Startup` is allowed to abort the orchestrator.

use std::fmt;

/// Failures reported by the hardware port traits.
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareError {
    /// Device (ADC, encoder chip, camera) did not respond at initialisation.
    NotPresent(&'static str),
    /// Bus transfer or GPIO write failed.
    Io(String),
    /// Camera returned no frame this time.
    FrameUnavailable,
}

impl fmt::Display for HardwareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareError::NotPresent(what) => write!(f, "hardware not present: {}", what),
            HardwareError::Io(msg) => write!(f, "hardware i/o failed: {}", msg),
            HardwareError::FrameUnavailable => write!(f, "no frame available"),
        }
    }
}

impl std::error::Error for HardwareError {}

#[derive(Debug)]
pub enum ControlError {
    Hardware(HardwareError),
    /// Degenerate or out-of-range reading (e.g. thermistor voltage at a rail).
    SensorFault(String),
    /// Non-positive delta time between two samples.
    Timing { delta_time: f64 },
    CalibrationMissing(&'static str),
    Calibration(String),
    Store(String),
    Canceled,
    /// Unrecoverable initialisation failure; aborts before any loop starts.
    Startup(String),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::Hardware(e) => write!(f, "{}", e),
            ControlError::SensorFault(msg) => write!(f, "sensor fault: {}", msg),
            ControlError::Timing { delta_time } => {
                write!(f, "non-positive delta time ({:.6} s)", delta_time)
            }
            ControlError::CalibrationMissing(name) => write!(f, "calibration '{}' missing", name),
            ControlError::Calibration(msg) => write!(f, "calibration failed: {}", msg),
            ControlError::Store(msg) => write!(f, "calibration store: {}", msg),
            ControlError::Canceled => write!(f, "canceled"),
            ControlError::Startup(msg) => write!(f, "startup failed: {}", msg),
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControlError::Hardware(e) => Some(e),
            _ => None,
        }
    }
}

impl From<HardwareError> for ControlError {
    fn from(e: HardwareError) -> Self {
        ControlError::Hardware(e)
    }
}

impl From<csv::Error> for ControlError {
    fn from(e: csv::Error) -> Self {
        ControlError::Store(e.to_string())
    }
}

pub type ControlResult<T> = Result<T, ControlError>;
