//! Command surface ↔ control worker messages.
//!
//! Commands only set flags and targets; the orchestrator applies them at the
//! start of its next tick. Notices travel the other way and are never acted
//! on from the worker thread.

use std::fmt;

use crate::config::SpoolMode;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartDevice,
    StopDevice,
    SetSpoolMode(SpoolMode),
    SetTargetDiameter(f64),
    SetTargetRpm(f64),
    SetTargetTemperature(f64),
    SetExtrusionRpm(f64),
    SetFanDuty(f64),
    CalibrateMotor,
    CalibrateCamera { reference_diameter_mm: f64 },
    CancelCalibration,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// Closed loop engaged on the fallback duty model.
    MotorUncalibrated,
    /// Diameter readings use the default mm/pixel coefficient.
    CameraUncalibrated,
    SensorFault {
        subsystem: &'static str,
        message: String,
    },
    MotorCalibrated {
        slope: f64,
        intercept: f64,
    },
    CameraCalibrated {
        coefficient: f64,
    },
    CalibrationCanceled {
        target: &'static str,
    },
    CalibrationFailed {
        target: &'static str,
        message: String,
    },
    /// Every actuator has been driven to zero and the worker exited.
    Stopped,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::MotorUncalibrated => {
                write!(f, "motor is not calibrated; spool speed control uses a fallback model")
            }
            Notice::CameraUncalibrated => {
                write!(f, "camera is not calibrated; diameters are in pixels")
            }
            Notice::SensorFault { subsystem, message } => write!(f, "{} fault: {}", subsystem, message),
            Notice::MotorCalibrated { slope, intercept } => {
                write!(f, "motor calibrated: duty = {:.4} * rpm + {:.4}", slope, intercept)
            }
            Notice::CameraCalibrated { coefficient } => {
                write!(f, "camera calibrated: {:.6} mm/px", coefficient)
            }
            Notice::CalibrationCanceled { target } => write!(f, "{} calibration canceled", target),
            Notice::CalibrationFailed { target, message } => {
                write!(f, "{} calibration failed: {}", target, message)
            }
            Notice::Stopped => write!(f, "device stopped"),
        }
    }
}
