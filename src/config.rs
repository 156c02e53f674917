//! config.rs
//! Tunables for every loop, grouped per subsystem.
//!
//! All numeric constants live here as named defaults; the control code never
//! embeds literals. Structs are serde-serialisable so a run's configuration can
//! be archived next to its telemetry.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::control::pid::{PidGains, PidLimits};

// ---------------------------------------------------------------------------
// Thermistor (100k NTC, Beta model, 100k reference resistor, 3.3 V divider)
// ---------------------------------------------------------------------------
const REFERENCE_TEMPERATURE_K: f64 = 298.15;
const RESISTANCE_AT_REFERENCE_OHM: f64 = 100_000.0;
const BETA_COEFFICIENT_K: f64 = 3977.0;
const SUPPLY_VOLTAGE: f64 = 3.3;
const REFERENCE_RESISTOR_OHM: f64 = 100_000.0;
const MIN_VALID_VOLTAGE: f64 = 0.0001;
const READINGS_TO_AVERAGE: usize = 10;

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------
const SAMPLE_INTERVAL_S: f64 = 0.1;
const DEFAULT_TEMPERATURE_C: f64 = 95.0;
const HEATER_PWM_HZ: f64 = 1.0;

const ENCODER_PULSES_PER_REVOLUTION: u32 = 4704;
const DEFAULT_SPOOL_RPM: f64 = 30.0;
const SPOOL_PWM_HZ: f64 = 1000.0;
const MOTOR_INTEGRAL_LIMIT: f64 = 100.0;
// well past full duty for any fitted model; the duty clamp binds first
const MOTOR_OUTPUT_LIMIT_RPM: f64 = 1000.0;

const STEPS_PER_REVOLUTION: f64 = 200.0;
const DEFAULT_EXTRUSION_RPM: f64 = 30.0;
const STEPPER_DUTY: f64 = 50.0;

const FAN_PWM_HZ: f64 = 1000.0;
const FAN_DUTY: f64 = 45.0;

// Diameter cascade
const DIAMETER_WINDOW: usize = 10;
const DIAMETER_INTEGRAL_LIMIT: f64 = 0.5;
const DIAMETER_TRIM_LIMIT: f64 = 0.25;
const TRIM_RPM_PER_UNIT: f64 = 100.0;
const PREFORM_DIAMETER_MM: f64 = 7.0;
const SPOOL_DIAMETER_MM: f64 = 15.2;
/// Gear and draw ratio between stepper and spool: 25/28 * 11.
const GEOMETRY_CONSTANT: f64 = 25.0 / 28.0 * 11.0;
const MAX_SPOOL_RPM: f64 = 60.0;
const DEFAULT_TARGET_DIAMETER_MM: f64 = 0.35;

// Scheduler / camera cadence
const TICK_INTERVAL_MS: u64 = 50;
const CAPTURE_INTERVAL_MS: u64 = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermistorConfig {
    pub reference_temperature_k: f64,
    pub resistance_at_reference: f64,
    pub beta: f64,
    pub supply_voltage: f64,
    pub reference_resistor: f64,
    /// Readings at or below this are treated as an open/shorted divider.
    pub min_valid_voltage: f64,
    pub readings_to_average: usize,
}

impl Default for ThermistorConfig {
    fn default() -> Self {
        Self {
            reference_temperature_k: REFERENCE_TEMPERATURE_K,
            resistance_at_reference: RESISTANCE_AT_REFERENCE_OHM,
            beta: BETA_COEFFICIENT_K,
            supply_voltage: SUPPLY_VOLTAGE,
            reference_resistor: REFERENCE_RESISTOR_OHM,
            min_valid_voltage: MIN_VALID_VOLTAGE,
            readings_to_average: READINGS_TO_AVERAGE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermalConfig {
    pub thermistor: ThermistorConfig,
    pub sample_interval: f64,
    pub setpoint_c: f64,
    pub gains: PidGains,
    pub limits: PidLimits,
    pub heater_pwm_hz: f64,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            thermistor: ThermistorConfig::default(),
            sample_interval: SAMPLE_INTERVAL_S,
            setpoint_c: DEFAULT_TEMPERATURE_C,
            gains: PidGains::new(1.4, 0.2, 0.8),
            limits: PidLimits::new(0.0, 100.0, -200.0, 200.0),
            heater_pwm_hz: HEATER_PWM_HZ,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolConfig {
    pub pulses_per_revolution: u32,
    pub sample_interval: f64,
    pub setpoint_rpm: f64,
    pub gains: PidGains,
    /// Output bounds apply to the RPM correction; the integral clamp is the
    /// ±100 anti-windup range. The duty cycle has its own [0, 100] clamp.
    pub limits: PidLimits,
    pub duty_min: f64,
    pub duty_max: f64,
    pub pwm_hz: f64,
    /// Model used when no motor calibration is stored (duty = rpm).
    pub fallback_slope: f64,
    pub fallback_intercept: f64,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            pulses_per_revolution: ENCODER_PULSES_PER_REVOLUTION,
            sample_interval: SAMPLE_INTERVAL_S,
            setpoint_rpm: DEFAULT_SPOOL_RPM,
            gains: PidGains::new(0.4, 0.2, 0.05),
            limits: PidLimits::new(
                -MOTOR_OUTPUT_LIMIT_RPM,
                MOTOR_OUTPUT_LIMIT_RPM,
                -MOTOR_INTEGRAL_LIMIT,
                MOTOR_INTEGRAL_LIMIT,
            ),
            duty_min: 0.0,
            duty_max: 100.0,
            pwm_hz: SPOOL_PWM_HZ,
            fallback_slope: 1.0,
            fallback_intercept: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtrusionConfig {
    pub steps_per_revolution: f64,
    pub rpm: f64,
    pub duty_cycle: f64,
}

impl Default for ExtrusionConfig {
    fn default() -> Self {
        Self {
            steps_per_revolution: STEPS_PER_REVOLUTION,
            rpm: DEFAULT_EXTRUSION_RPM,
            duty_cycle: STEPPER_DUTY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanConfig {
    pub pwm_hz: f64,
    pub duty_cycle: f64,
}

impl Default for FanConfig {
    fn default() -> Self {
        Self {
            pwm_hz: FAN_PWM_HZ,
            duty_cycle: FAN_DUTY,
        }
    }
}

/// Probabilistic line detector parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoughConfig {
    pub rho: f64,
    pub theta: f64,
    pub threshold: u32,
    pub min_line_length: u32,
    pub max_line_gap: u32,
    pub max_lines: usize,
    pub seed: u64,
}

impl Default for HoughConfig {
    fn default() -> Self {
        Self {
            rho: 1.0,
            theta: std::f64::consts::PI / 180.0,
            threshold: 30,
            min_line_length: 30,
            max_line_gap: 100,
            max_lines: 64,
            seed: 0x5eed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    /// Fraction of rows kept, as (top, bottom) of the frame height.
    pub crop_rows: (f64, f64),
    pub use_erode: bool,
    pub use_dilate: bool,
    pub use_gaussian: bool,
    pub use_binary: bool,
    /// Edge detection runs on the binarised frame when true, else on the smoothed intensity.
    pub use_binary_for_edges: bool,
    pub morph_kernel: usize,
    pub morph_iterations: usize,
    pub gaussian_kernel: usize,
    /// Zero derives sigma from the kernel size.
    pub gaussian_sigma: f64,
    pub binary_threshold: u8,
    pub canny_low: f64,
    pub canny_high: f64,
    pub hough: HoughConfig,
    /// mm/pixel used until the camera has been calibrated.
    pub default_coefficient: f64,
    pub capture_interval: Duration,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            crop_rows: (0.25, 0.75),
            use_erode: true,
            use_dilate: true,
            use_gaussian: true,
            use_binary: true,
            use_binary_for_edges: true,
            morph_kernel: 5,
            morph_iterations: 2,
            gaussian_kernel: 5,
            gaussian_sigma: 0.0,
            binary_threshold: 100,
            canny_low: 100.0,
            canny_high: 250.0,
            hough: HoughConfig::default(),
            default_coefficient: 1.0,
            capture_interval: Duration::from_millis(CAPTURE_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeConfig {
    pub sample_interval: f64,
    pub target_diameter_mm: f64,
    pub window: usize,
    pub gains: PidGains,
    pub limits: PidLimits,
    /// Converts the outer loop output (diameter units) into spool RPM.
    pub trim_rpm_per_unit: f64,
    pub geometry_constant: f64,
    pub preform_diameter_mm: f64,
    pub spool_diameter_mm: f64,
    /// Device saturation for the spool setpoint.
    pub max_spool_rpm: f64,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            sample_interval: SAMPLE_INTERVAL_S,
            target_diameter_mm: DEFAULT_TARGET_DIAMETER_MM,
            window: DIAMETER_WINDOW,
            gains: PidGains::new(0.1, 0.01, 0.01),
            limits: PidLimits::new(
                -DIAMETER_TRIM_LIMIT,
                DIAMETER_TRIM_LIMIT,
                -DIAMETER_INTEGRAL_LIMIT,
                DIAMETER_INTEGRAL_LIMIT,
            ),
            trim_rpm_per_unit: TRIM_RPM_PER_UNIT,
            geometry_constant: GEOMETRY_CONSTANT,
            preform_diameter_mm: PREFORM_DIAMETER_MM,
            spool_diameter_mm: SPOOL_DIAMETER_MM,
            max_spool_rpm: MAX_SPOOL_RPM,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub camera_frames: usize,
    pub duty_start: u32,
    pub duty_end: u32,
    pub duty_step: u32,
    pub samples_per_step: usize,
    pub settle_time: Duration,
    pub measure_window: Duration,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            camera_frames: 50,
            duty_start: 20,
            duty_end: 100,
            duty_step: 10,
            samples_per_step: 5,
            settle_time: Duration::from_secs(2),
            measure_window: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Pin the control worker to this core when set.
    pub pin_core: Option<usize>,
    pub raise_priority: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(TICK_INTERVAL_MS),
            pin_core: None,
            raise_priority: true,
        }
    }
}

/// Which variant drives the spool motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SpoolMode {
    #[default]
    Off,
    /// PID on encoder RPM against the operator's RPM setpoint.
    ClosedLoopRpm,
    /// Diameter cascade supplies the RPM setpoint.
    DiameterCascade,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub thermal: ThermalConfig,
    pub spool: SpoolConfig,
    pub extrusion: ExtrusionConfig,
    pub fan: FanConfig,
    pub vision: VisionConfig,
    pub cascade: CascadeConfig,
    pub calibration: CalibrationConfig,
    pub scheduler: SchedulerConfig,
    pub spool_mode: SpoolMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_loop_limits_are_finite() {
        let config = DeviceConfig::default();
        for limits in [config.thermal.limits, config.spool.limits, config.cascade.limits] {
            for bound in [limits.output_min, limits.output_max, limits.integral_min, limits.integral_max] {
                assert!(bound.is_finite(), "{:?}", limits);
            }
        }
        assert_eq!(config.spool.limits.integral_max, 100.0);
    }
}
