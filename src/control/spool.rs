//! spool.rs
//! Spool motor: encoder RPM estimation and the closed-loop speed controller.
//!
//! The controller owns the `SpoolDrive` as an `Option`. A motor calibration
//! takes the drive away (`detach_drive`) and hands it back when it finishes;
//! while detached every update is a no-op, so the loop and the sweep can
//! never command the motor at the same time.

use log::{debug, error, info, warn};

use crate::calibration::store::{self, CalibrationStore};
use crate::config::SpoolConfig;
use crate::control::{pid::PidLoop, FaultLatch};
use crate::error::{ControlError, ControlResult};
use crate::hardware::SpoolDrive;
use crate::utils::telemetry::{SpoolRecord, TelemetryRing};

/// RPM from successive readings of a free-running 32-bit counter.
#[derive(Debug, Clone)]
pub struct EncoderRpmEstimator {
    pulses_per_revolution: f64,
    previous_count: u32,
    previous_time: f64,
}

impl EncoderRpmEstimator {
    pub fn new(pulses_per_revolution: u32, count: u32, time: f64) -> Self {
        Self {
            pulses_per_revolution: f64::from(pulses_per_revolution.max(1)),
            previous_count: count,
            previous_time: time,
        }
    }

    /// RPM since the previous sample. The count difference is taken modulo
    /// 2^32 and read as signed, so a counter wrap between samples is harmless.
    pub fn sample(&mut self, count: u32, time: f64) -> ControlResult<f64> {
        let delta_time = time - self.previous_time;
        if !(delta_time > 0.0) {
            return Err(ControlError::Timing { delta_time });
        }
        let delta_count = f64::from(count.wrapping_sub(self.previous_count) as i32);
        let rpm = delta_count / self.pulses_per_revolution * (60.0 / delta_time);

        self.previous_count = count;
        self.previous_time = time;
        Ok(rpm)
    }

    pub fn previous_count(&self) -> u32 {
        self.previous_count
    }

    pub fn previous_time(&self) -> f64 {
        self.previous_time
    }
}

/// Linear duty-cycle model: `duty = slope * rpm + intercept`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorModel {
    pub slope: f64,
    pub intercept: f64,
}

impl MotorModel {
    pub fn new(slope: f64, intercept: f64) -> Self {
        Self { slope, intercept }
    }

    /// Stored model, or None while either coefficient holds the sentinel.
    pub fn from_store(store: &dyn CalibrationStore) -> Option<Self> {
        let slope = store.get(store::MOTOR_SLOPE);
        let intercept = store.get(store::MOTOR_INTERCEPT);
        if store::is_uncalibrated(slope) || store::is_uncalibrated(intercept) {
            return None;
        }
        Some(Self { slope, intercept })
    }

    pub fn persist(&self, store: &dyn CalibrationStore) -> ControlResult<()> {
        store.set(store::MOTOR_SLOPE, self.slope)?;
        store.set(store::MOTOR_INTERCEPT, self.intercept)
    }

    #[inline]
    pub fn duty_for(&self, rpm: f64) -> f64 {
        self.slope * rpm + self.intercept
    }
}

pub struct MotorSpeedController {
    config: SpoolConfig,
    drive: Option<SpoolDrive>,
    estimator: Option<EncoderRpmEstimator>,
    pid: PidLoop,
    model: Option<MotorModel>,
    fallback: MotorModel,
    telemetry: TelemetryRing<SpoolRecord>,
    setpoint_rpm: f64,
    engaged: bool,
    uncalibrated_notice: bool,
    last_rpm: f64,
    last_duty: f64,
    fault: FaultLatch,
}

impl MotorSpeedController {
    pub fn new(
        config: SpoolConfig,
        drive: SpoolDrive,
        model: Option<MotorModel>,
        telemetry: TelemetryRing<SpoolRecord>,
    ) -> Self {
        Self {
            pid: PidLoop::new(config.gains, config.limits),
            fallback: MotorModel::new(config.fallback_slope, config.fallback_intercept),
            setpoint_rpm: config.setpoint_rpm,
            config,
            drive: Some(drive),
            estimator: None,
            model,
            telemetry,
            engaged: false,
            uncalibrated_notice: false,
            last_rpm: 0.0,
            last_duty: 0.0,
            fault: FaultLatch::default(),
        }
    }

    /// Clear the encoder, configure the PWM at zero duty and prime the estimator.
    pub fn arm(&mut self, now: f64) -> ControlResult<()> {
        let drive = self
            .drive
            .as_mut()
            .ok_or(ControlError::Startup("spool drive is detached".into()))?;
        drive.encoder.clear()?;
        drive.pwm.set_frequency(self.config.pwm_hz)?;
        drive.pwm.set_duty_cycle(0.0)?;
        let count = drive.encoder.read_count()?;
        self.estimator = Some(EncoderRpmEstimator::new(
            self.config.pulses_per_revolution,
            count,
            now,
        ));
        self.last_duty = 0.0;
        Ok(())
    }

    /// Start closing the loop. Raises the uncalibrated notice when running
    /// on the fallback model.
    pub fn engage(&mut self, now: f64) {
        if self.engaged {
            return;
        }
        self.engaged = true;
        self.pid.reset(now);
        self.reprime(now);
        if self.model.is_none() {
            warn!("[Spool] no motor calibration stored; using fallback duty model");
            self.uncalibrated_notice = true;
        }
        info!("[Spool] closed loop engaged at {:.1} rpm", self.setpoint_rpm);
    }

    /// Stop closing the loop and drive the motor to zero.
    pub fn disengage(&mut self) {
        let was_engaged = std::mem::replace(&mut self.engaged, false);
        self.write_zero();
        if was_engaged {
            info!("[Spool] closed loop released");
        }
    }

    pub fn set_setpoint(&mut self, rpm: f64) {
        self.setpoint_rpm = rpm;
    }

    /// Hand the drive to a calibration job. The motor is stopped first.
    pub fn detach_drive(&mut self) -> Option<SpoolDrive> {
        self.write_zero();
        self.estimator = None;
        self.drive.take()
    }

    /// Take the drive back after calibration and re-anchor the estimator
    /// so the sweep's counts do not show up as one huge RPM step.
    pub fn attach_drive(&mut self, drive: SpoolDrive, now: f64) {
        self.drive = Some(drive);
        self.pid.reset(now);
        self.reprime(now);
        if !self.engaged {
            self.write_zero();
        }
    }

    pub fn apply_calibration(&mut self, model: MotorModel) {
        info!(
            "[Spool] motor model updated: duty = {:.4} * rpm + {:.4}",
            model.slope, model.intercept
        );
        self.model = Some(model);
        self.uncalibrated_notice = false;
    }

    /// Run one rate-gated step. Returns the duty written, None when nothing
    /// was written this tick.
    pub fn update(&mut self, now: f64) -> Option<f64> {
        if !self.engaged || self.drive.is_none() {
            return None;
        }
        if !self.pid.is_due(now, self.config.sample_interval) {
            return None;
        }

        match self.step(now) {
            Ok(Some(duty)) => {
                self.fault.clear();
                Some(duty)
            }
            Ok(None) => {
                self.fault.clear();
                debug!("[Spool] encoder primed at t={:.3}, first step next tick", now);
                None
            }
            Err(ControlError::Timing { delta_time }) => {
                debug!("[Spool] skipped step, dt={:.6}", delta_time);
                None
            }
            Err(e) => {
                error!("[Spool] step failed: {}", e);
                self.fault.raise(e.to_string());
                None
            }
        }
    }

    /// One speed step. Returns None when the estimator had to be primed
    /// first; the PID is not due-stamped then, so the next tick steps.
    fn step(&mut self, now: f64) -> ControlResult<Option<f64>> {
        let drive = self
            .drive
            .as_mut()
            .ok_or(ControlError::CalibrationMissing("spool drive"))?;
        let position = drive.encoder.read_count()?;

        let Some(mut estimator) = self.estimator.clone() else {
            self.estimator = Some(EncoderRpmEstimator::new(
                self.config.pulses_per_revolution,
                position,
                now,
            ));
            return Ok(None);
        };
        let rpm = estimator.sample(position, now)?;

        let mut pid = self.pid.clone();
        let step = pid.step(self.setpoint_rpm - rpm, now)?;

        let model = self.model.unwrap_or(self.fallback);
        let duty = model
            .duty_for(step.output)
            .max(self.config.duty_min)
            .min(self.config.duty_max);

        drive.pwm.set_duty_cycle(duty)?;

        self.estimator = Some(estimator);
        self.pid = pid;
        self.last_rpm = rpm;
        self.last_duty = duty;

        let gains = self.pid.gains();
        self.telemetry.record(SpoolRecord {
            time: now,
            delta_time: step.delta_time,
            position,
            rpm,
            setpoint_rpm: self.setpoint_rpm,
            error: step.error,
            pid_output: step.output,
            duty_cycle: duty,
            kp: gains.kp,
            ki: gains.ki,
            kd: gains.kd,
            calibrated: self.model.is_some(),
        });
        debug!(
            "[Spool] t={:.2} rpm={:.1} sp={:.1} duty={:.1}%",
            now, rpm, self.setpoint_rpm, duty
        );
        Ok(Some(duty))
    }

    fn reprime(&mut self, now: f64) {
        let Some(drive) = self.drive.as_mut() else {
            return;
        };
        match drive.encoder.read_count() {
            Ok(count) => {
                self.estimator = Some(EncoderRpmEstimator::new(
                    self.config.pulses_per_revolution,
                    count,
                    now,
                ));
            }
            Err(e) => {
                // the next step with a good read primes it and runs one tick later
                warn!("[Spool] encoder read failed while priming: {}", e);
                self.estimator = None;
            }
        }
    }

    fn write_zero(&mut self) {
        if let Some(drive) = self.drive.as_mut() {
            if let Err(e) = drive.pwm.set_duty_cycle(0.0) {
                error!("[Spool] failed to stop motor: {}", e);
            }
        }
        self.last_duty = 0.0;
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    pub fn has_drive(&self) -> bool {
        self.drive.is_some()
    }

    pub fn is_calibrated(&self) -> bool {
        self.model.is_some()
    }

    pub fn model(&self) -> Option<MotorModel> {
        self.model
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint_rpm
    }

    pub fn last_rpm(&self) -> f64 {
        self.last_rpm
    }

    pub fn last_duty(&self) -> f64 {
        self.last_duty
    }

    pub fn pid(&self) -> &PidLoop {
        &self.pid
    }

    /// True once per engagement while running on the fallback model.
    pub fn take_uncalibrated_notice(&mut self) -> bool {
        std::mem::take(&mut self.uncalibrated_notice)
    }

    pub fn take_fault(&mut self) -> Option<String> {
        self.fault.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::store::MemoryStore;
    use crate::error::HardwareError;
    use crate::hardware::{EncoderCounter, PwmChannel};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Counter(Arc<Mutex<u32>>);

    impl EncoderCounter for Counter {
        fn read_count(&mut self) -> Result<u32, HardwareError> {
            Ok(*self.0.lock())
        }
        fn clear(&mut self) -> Result<(), HardwareError> {
            *self.0.lock() = 0;
            Ok(())
        }
    }

    /// Counter whose next `fail_reads` reads error out.
    #[derive(Clone, Default)]
    struct Flaky {
        count: Arc<Mutex<u32>>,
        fail_reads: Arc<Mutex<u32>>,
    }

    impl EncoderCounter for Flaky {
        fn read_count(&mut self) -> Result<u32, HardwareError> {
            let mut failures = self.fail_reads.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(HardwareError::Io("encoder bus timeout".into()));
            }
            Ok(*self.count.lock())
        }
        fn clear(&mut self) -> Result<(), HardwareError> {
            *self.count.lock() = 0;
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Writes(Arc<Mutex<Vec<f64>>>);

    impl PwmChannel for Writes {
        fn set_frequency(&mut self, _hz: f64) -> Result<(), HardwareError> {
            Ok(())
        }
        fn set_duty_cycle(&mut self, percent: f64) -> Result<(), HardwareError> {
            self.0.lock().push(percent);
            Ok(())
        }
    }

    fn controller(model: Option<MotorModel>) -> (MotorSpeedController, Counter, Writes, TelemetryRing<SpoolRecord>) {
        let counter = Counter::default();
        let writes = Writes::default();
        let ring = TelemetryRing::new(64);
        let drive = SpoolDrive {
            encoder: Box::new(counter.clone()),
            pwm: Box::new(writes.clone()),
        };
        let mut ctl = MotorSpeedController::new(SpoolConfig::default(), drive, model, ring.clone());
        ctl.arm(0.0).unwrap();
        (ctl, counter, writes, ring)
    }

    #[test]
    fn rpm_from_count_sequence() {
        let mut est = EncoderRpmEstimator::new(4704, 0, 0.0);
        let first = est.sample(100, 0.1).unwrap();
        assert!((first - 100.0 / 4704.0 * 600.0).abs() < 1e-9);
        let second = est.sample(4804, 0.2).unwrap();
        assert!((second - 600.0).abs() < 1e-9, "{}", second);
    }

    #[test]
    fn rpm_survives_counter_wrap() {
        let mut est = EncoderRpmEstimator::new(4704, u32::MAX - 49, 0.0);
        let rpm = est.sample(4654, 0.1).unwrap();
        assert!((rpm - 600.0).abs() < 1e-9, "{}", rpm);

        // reverse rotation across zero
        let mut est = EncoderRpmEstimator::new(4704, 10, 0.0);
        let rpm = est.sample(10u32.wrapping_sub(4704), 0.1).unwrap();
        assert!((rpm + 600.0).abs() < 1e-9);
    }

    #[test]
    fn non_positive_dt_skips_without_mutation() {
        let mut est = EncoderRpmEstimator::new(4704, 5, 1.0);
        assert!(matches!(est.sample(500, 1.0), Err(ControlError::Timing { .. })));
        assert_eq!((est.previous_count(), est.previous_time()), (5, 1.0));
    }

    #[test]
    fn model_requires_both_coefficients() {
        let values = MemoryStore::with_values(&[(store::MOTOR_SLOPE, 0.7)]);
        assert_eq!(MotorModel::from_store(&values), None);
        values.set(store::MOTOR_INTERCEPT, 9.0).unwrap();
        assert_eq!(MotorModel::from_store(&values), Some(MotorModel::new(0.7, 9.0)));
    }

    #[test]
    fn duty_is_clamped_and_recorded() {
        let (mut ctl, counter, writes, ring) = controller(Some(MotorModel::new(0.5, 10.0)));
        ctl.engage(0.0);
        *counter.0.lock() = 0;

        let duty = ctl.update(0.15).unwrap();
        assert!((0.0..=100.0).contains(&duty));
        assert_eq!(writes.0.lock().last().copied(), Some(duty));

        let rows = ring.drain();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].calibrated);
        assert_eq!(rows[0].setpoint_rpm, 30.0);
    }

    #[test]
    fn uncalibrated_runs_on_fallback_and_warns_once() {
        let (mut ctl, _, _, ring) = controller(None);
        ctl.engage(0.0);
        assert!(ctl.take_uncalibrated_notice());
        assert!(!ctl.take_uncalibrated_notice());

        assert!(ctl.update(0.2).is_some());
        assert!(!ring.drain()[0].calibrated);
    }

    #[test]
    fn gated_update_is_idempotent() {
        let (mut ctl, counter, writes, ring) = controller(Some(MotorModel::new(1.0, 0.0)));
        ctl.engage(0.0);
        ctl.update(0.2).unwrap();

        let before = (ctl.pid().integral(), writes.0.lock().len(), ring.len());
        *counter.0.lock() = 999;
        assert_eq!(ctl.update(0.25), None);
        assert_eq!(before, (ctl.pid().integral(), writes.0.lock().len(), ring.len()));
    }

    #[test]
    fn encoder_glitch_while_engaging_recovers_next_tick() {
        let encoder = Flaky::default();
        let writes = Writes::default();
        let drive = SpoolDrive {
            encoder: Box::new(encoder.clone()),
            pwm: Box::new(writes.clone()),
        };
        let mut ctl = MotorSpeedController::new(
            SpoolConfig::default(),
            drive,
            Some(MotorModel::new(1.0, 0.0)),
            TelemetryRing::new(64),
        );
        ctl.arm(0.0).unwrap();

        *encoder.fail_reads.lock() = 1;
        ctl.engage(0.0);

        // first due tick only primes the estimator
        *encoder.count.lock() = 470;
        assert_eq!(ctl.update(0.2), None);
        assert!(ctl.take_fault().is_none());

        let mut steps = 0;
        for i in 1..=50u32 {
            *encoder.count.lock() = 470 + i * 470;
            if ctl.update(0.2 + f64::from(i) * 0.2).is_some() {
                steps += 1;
            }
        }
        assert_eq!(steps, 50);
        assert!((ctl.last_rpm() - 470.0 / 4704.0 * 300.0).abs() < 1e-6);
    }

    #[test]
    fn detached_drive_blocks_updates() {
        let (mut ctl, counter, writes, _) = controller(Some(MotorModel::new(1.0, 0.0)));
        ctl.engage(0.0);
        let drive = ctl.detach_drive().unwrap();
        assert_eq!(writes.0.lock().last().copied(), Some(0.0));
        assert_eq!(ctl.update(1.0), None);

        // counts accumulated during calibration must not leak into the next estimate
        *counter.0.lock() = 1_000_000;
        ctl.attach_drive(drive, 5.0);
        *counter.0.lock() = 1_000_000 + 4704;
        ctl.update(5.2).unwrap();
        assert!((ctl.last_rpm() - 4704.0 / 4704.0 * 60.0 / 0.2).abs() < 1e-6);
    }
}
