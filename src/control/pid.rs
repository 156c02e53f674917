//! pid.rs
//! Canonical PID law shared by the thermal, spool and diameter loops.
//!
//! Integral is accumulated in error·seconds and clamped to the loop's
//! anti-windup range on every step; the output is clamped to
//! [output_min, output_max] before anyone can apply it to an actuator.

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidGains {
    pub const fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidLimits {
    pub output_min: f64,
    pub output_max: f64,
    pub integral_min: f64,
    pub integral_max: f64,
}

impl PidLimits {
    /// Bounds are normalised so min <= max. An inverted pair (the
    /// `max(min(x, lo), hi)` mistake) would otherwise pin the output to one rail.
    pub fn new(output_min: f64, output_max: f64, integral_min: f64, integral_max: f64) -> Self {
        Self {
            output_min: output_min.min(output_max),
            output_max: output_max.max(output_min),
            integral_min: integral_min.min(integral_max),
            integral_max: integral_max.max(integral_min),
        }
    }

    #[inline]
    pub fn clamp_output(&self, value: f64) -> f64 {
        clamp(value, self.output_min, self.output_max)
    }

    #[inline]
    pub fn clamp_integral(&self, value: f64) -> f64 {
        clamp(value, self.integral_min, self.integral_max)
    }
}

/// `f64::clamp` panics on inverted or NaN bounds; this never does.
#[inline]
pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

/// Result of one PID step, kept for telemetry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidStep {
    pub error: f64,
    pub delta_time: f64,
    pub proportional: f64,
    pub integral: f64,
    pub derivative: f64,
    pub output: f64,
}

/// PID loop state. One instance per controlled quantity, owned by its loop.
#[derive(Debug, Clone)]
pub struct PidLoop {
    gains: PidGains,
    limits: PidLimits,
    integral: f64,
    previous_error: f64,
    previous_time: f64,
}

impl PidLoop {
    pub fn new(gains: PidGains, limits: PidLimits) -> Self {
        Self {
            gains,
            limits,
            integral: 0.0,
            previous_error: 0.0,
            previous_time: 0.0,
        }
    }

    /// True once strictly more than `interval` seconds passed since the last step.
    #[inline]
    pub fn is_due(&self, now: f64, interval: f64) -> bool {
        now - self.previous_time > interval
    }

    /// Advance the loop to `now` with the given error.
    ///
    /// A non-positive delta time is a timing fault: nothing is mutated.
    pub fn step(&mut self, error: f64, now: f64) -> ControlResult<PidStep> {
        let delta_time = now - self.previous_time;
        if !(delta_time > 0.0) {
            return Err(ControlError::Timing { delta_time });
        }

        self.integral = self.limits.clamp_integral(self.integral + error * delta_time);
        let derivative = (error - self.previous_error) / delta_time;

        let proportional = self.gains.kp * error;
        let integral = self.gains.ki * self.integral;
        let derivative = self.gains.kd * derivative;
        let output = self.limits.clamp_output(proportional + integral + derivative);

        self.previous_error = error;
        self.previous_time = now;

        Ok(PidStep {
            error,
            delta_time,
            proportional,
            integral,
            derivative,
            output,
        })
    }

    /// Clear accumulated state and re-anchor the time base.
    pub fn reset(&mut self, now: f64) {
        self.integral = 0.0;
        self.previous_error = 0.0;
        self.previous_time = now;
    }

    /// Move the time base without integrating (loop held this interval).
    pub fn hold(&mut self, now: f64) {
        self.previous_time = self.previous_time.max(now);
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    pub fn set_gains(&mut self, gains: PidGains) {
        self.gains = gains;
    }

    pub fn limits(&self) -> PidLimits {
        self.limits
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn previous_error(&self) -> f64 {
        self.previous_error
    }

    pub fn previous_time(&self) -> f64 {
        self.previous_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn motor_like() -> PidLoop {
        PidLoop::new(
            PidGains::new(0.4, 0.2, 0.05),
            PidLimits::new(-50.0, 50.0, -100.0, 100.0),
        )
    }

    #[test]
    fn integral_and_output_stay_bounded() {
        let mut pid = motor_like();
        let mut rng = StdRng::seed_from_u64(7);
        let mut now = 0.0;

        for _ in 0..5_000 {
            now += rng.random_range(0.01..0.5);
            let error = rng.random_range(-5_000.0..5_000.0);
            let step = pid.step(error, now).unwrap();
            assert!(pid.integral() >= -100.0 && pid.integral() <= 100.0);
            assert!(step.output >= -50.0 && step.output <= 50.0);
        }
    }

    #[test]
    fn sustained_error_saturates_integral_at_the_clamp() {
        let mut pid = motor_like();
        for i in 1..=200 {
            pid.step(1_000.0, i as f64 * 0.1).unwrap();
        }
        assert_eq!(pid.integral(), 100.0);
    }

    #[test]
    fn non_positive_delta_time_leaves_state_untouched() {
        let mut pid = motor_like();
        pid.step(10.0, 0.2).unwrap();
        let before = (pid.integral(), pid.previous_error(), pid.previous_time());

        assert!(matches!(pid.step(99.0, 0.2), Err(ControlError::Timing { .. })));
        assert!(matches!(pid.step(99.0, 0.1), Err(ControlError::Timing { .. })));

        assert_eq!(before, (pid.integral(), pid.previous_error(), pid.previous_time()));
    }

    #[test]
    fn textbook_step_values() {
        let mut pid = PidLoop::new(
            PidGains::new(1.4, 0.2, 0.8),
            PidLimits::new(0.0, 100.0, -1e9, 1e9),
        );
        let step = pid.step(10.0, 0.5).unwrap();
        // p = 14, i = 0.2 * 5, d = 0.8 * 20
        assert!((step.proportional - 14.0).abs() < 1e-9);
        assert!((step.integral - 1.0).abs() < 1e-9);
        assert!((step.derivative - 16.0).abs() < 1e-9);
        assert!((step.output - 31.0).abs() < 1e-9);
    }

    #[test]
    fn inverted_limits_are_normalised() {
        // max(min(x, 0), 60) would always yield 60; normalised bounds clamp conventionally
        let limits = PidLimits::new(60.0, 0.0, 1.0, -1.0);
        assert_eq!(limits.clamp_output(30.0), 30.0);
        assert_eq!(limits.clamp_output(-5.0), 0.0);
        assert_eq!(limits.clamp_output(75.0), 60.0);
        assert_eq!(limits.clamp_integral(3.0), 1.0);
    }

    #[test]
    fn due_only_after_interval_strictly_elapsed() {
        let pid = motor_like();
        assert!(!pid.is_due(0.1, 0.1));
        assert!(pid.is_due(0.1001, 0.1));
    }
}
