//! motor.rs
//! Duty-cycle sweep of the spool motor.
//!
//! For each duty step: apply, settle, take `samples_per_step` encoder RPM
//! readings over `measure_window` each, average. The (rpm, duty) points are
//! fitted with least squares into the controller's duty model.
//!
//! The PWM is wrapped in `SafeDuty` for the whole sweep, so every way out
//! of this function (finished, failed, canceled, panicked) leaves the motor
//! at zero duty.

use log::info;
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use super::fit::fit_line;
use crate::config::CalibrationConfig;
use crate::control::spool::{EncoderRpmEstimator, MotorModel};
use crate::error::{ControlError, ControlResult};
use crate::hardware::{SafeDuty, SpoolDrive};
use crate::utils::clock::Clock;

/// Longest uninterrupted sleep while waiting; bounds cancel latency.
const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPoint {
    pub duty: f64,
    pub rpm: f64,
}

#[derive(Debug, Clone)]
pub struct MotorCalibration {
    pub model: MotorModel,
    pub points: Vec<SweepPoint>,
}

fn sleep_unless_canceled(clock: &dyn Clock, duration: Duration, cancel: &AtomicBool) -> ControlResult<()> {
    let mut remaining = duration;
    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(ControlError::Canceled);
        }
        if remaining.is_zero() {
            return Ok(());
        }
        let slice = remaining.min(CANCEL_POLL);
        clock.sleep(slice);
        remaining -= slice;
    }
}

pub fn calibrate_motor(
    drive: &mut SpoolDrive,
    clock: &dyn Clock,
    config: &CalibrationConfig,
    pulses_per_revolution: u32,
    cancel: &AtomicBool,
) -> ControlResult<MotorCalibration> {
    if config.duty_step == 0 || config.duty_start > config.duty_end {
        return Err(ControlError::Calibration(format!(
            "invalid sweep {}..={} step {}",
            config.duty_start, config.duty_end, config.duty_step
        )));
    }

    let SpoolDrive { encoder, pwm } = drive;
    let mut pwm = SafeDuty::new(pwm.as_mut());
    let samples = config.samples_per_step.max(1);
    let mut points = Vec::new();

    info!(
        "[Calibration] motor sweep {}..={}% step {}",
        config.duty_start, config.duty_end, config.duty_step
    );
    for duty in (config.duty_start..=config.duty_end).step_by(config.duty_step as usize) {
        let duty = f64::from(duty);
        pwm.set_duty_cycle(duty)?;
        sleep_unless_canceled(clock, config.settle_time, cancel)?;

        let mut total = 0.0;
        for _ in 0..samples {
            let mut estimator =
                EncoderRpmEstimator::new(pulses_per_revolution, encoder.read_count()?, clock.now());
            sleep_unless_canceled(clock, config.measure_window, cancel)?;
            total += estimator.sample(encoder.read_count()?, clock.now())?;
        }
        let rpm = total / samples as f64;
        info!("[Calibration] duty {:.0}% -> {:.2} rpm", duty, rpm);
        points.push(SweepPoint { duty, rpm });
    }

    let rpms: Vec<f64> = points.iter().map(|p| p.rpm).collect();
    let duties: Vec<f64> = points.iter().map(|p| p.duty).collect();
    let fit = fit_line(&rpms, &duties)?;
    let model = MotorModel::new(fit.slope, fit.intercept);
    info!(
        "[Calibration] motor model: duty = {:.4} * rpm + {:.4}",
        model.slope, model.intercept
    );

    Ok(MotorCalibration { model, points })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::SimulatedMotor;
    use crate::utils::clock::ManualClock;
    use std::sync::Arc;

    fn quick() -> CalibrationConfig {
        CalibrationConfig {
            settle_time: Duration::from_millis(1_500),
            ..CalibrationConfig::default()
        }
    }

    #[test]
    fn fitted_model_reproduces_swept_duties() {
        let clock = ManualClock::shared();
        let motor = SimulatedMotor::new(clock.clone());
        let mut drive = motor.drive();
        let cancel = AtomicBool::new(false);

        let cal = calibrate_motor(&mut drive, clock.as_ref(), &quick(), 4704, &cancel).unwrap();
        assert_eq!(cal.points.len(), 9);
        for p in &cal.points {
            assert!((cal.model.duty_for(p.rpm) - p.duty).abs() < 1.0, "{:?}", p);
        }
        // sweep leaves the motor stopped
        assert_eq!(motor.duty(), 0.0);
    }

    /// Raises the cancel flag once simulated time passes `at`.
    struct CancelAt {
        inner: Arc<ManualClock>,
        at: f64,
        flag: Arc<AtomicBool>,
    }

    impl Clock for CancelAt {
        fn now(&self) -> f64 {
            self.inner.now()
        }

        fn sleep(&self, duration: Duration) {
            self.inner.sleep(duration);
            if self.inner.now() >= self.at {
                self.flag.store(true, Ordering::Relaxed);
            }
        }
    }

    #[test]
    fn cancel_returns_drive_to_zero() {
        let clock = ManualClock::shared();
        let motor = SimulatedMotor::new(clock.clone());
        let mut drive = motor.drive();
        let cancel = Arc::new(AtomicBool::new(false));
        let canceling = CancelAt {
            inner: clock.clone(),
            at: 3.0,
            flag: cancel.clone(),
        };

        let result = calibrate_motor(&mut drive, &canceling, &quick(), 4704, &cancel);

        assert!(matches!(result, Err(ControlError::Canceled)));
        assert!(clock.now() < 3.2);
        assert!(motor.duty_writes() > 1);
        assert_eq!(motor.duty(), 0.0);
    }

    #[test]
    fn invalid_sweep_is_rejected_without_touching_the_motor() {
        let clock = ManualClock::shared();
        let motor = SimulatedMotor::new(clock.clone());
        let mut drive = motor.drive();
        let cfg = CalibrationConfig { duty_step: 0, ..CalibrationConfig::default() };
        let cancel = AtomicBool::new(false);
        assert!(calibrate_motor(&mut drive, clock.as_ref(), &cfg, 4704, &cancel).is_err());
        assert_eq!(motor.duty_writes(), 0);
    }
}
