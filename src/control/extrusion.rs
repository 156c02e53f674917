//! Preform feed stepper.
//!
//! Open loop by construction: the axis has no encoder, so the commanded RPM
//! is turned straight into a step-pulse frequency at a fixed 50 % duty. Its
//! accuracy rests on the stepper not losing steps.

use log::{error, info};

use crate::config::ExtrusionConfig;
use crate::error::ControlResult;
use crate::hardware::PwmChannel;
use crate::utils::telemetry::{ExtrusionRecord, TelemetryRing};

/// steps/s = rpm * steps_per_revolution / 60
#[inline]
pub fn step_frequency(rpm: f64, steps_per_revolution: f64) -> f64 {
    rpm * steps_per_revolution / 60.0
}

pub struct ExtrusionDrive {
    config: ExtrusionConfig,
    pwm: Box<dyn PwmChannel>,
    telemetry: TelemetryRing<ExtrusionRecord>,
    started: bool,
    /// Last (rpm, frequency) pair actually written.
    applied: Option<(f64, f64)>,
}

impl ExtrusionDrive {
    pub fn new(
        config: ExtrusionConfig,
        pwm: Box<dyn PwmChannel>,
        telemetry: TelemetryRing<ExtrusionRecord>,
    ) -> Self {
        Self {
            config,
            pwm,
            telemetry,
            started: false,
            applied: None,
        }
    }

    pub fn arm(&mut self) -> ControlResult<()> {
        self.pwm.set_duty_cycle(0.0)?;
        self.applied = Some((0.0, 0.0));
        Ok(())
    }

    pub fn start(&mut self) {
        self.started = true;
        info!("[Extruder] started");
    }

    pub fn stop(&mut self, now: f64) {
        self.started = false;
        self.update(now, 0.0);
        info!("[Extruder] stopped");
    }

    /// Apply `rpm` if it differs from what the stepper is already doing.
    /// A stopped drive or a non-positive RPM parks the output at zero duty.
    pub fn update(&mut self, now: f64, rpm: f64) {
        let rpm = if self.started { rpm.max(0.0) } else { 0.0 };
        let frequency = step_frequency(rpm, self.config.steps_per_revolution);

        if self.applied == Some((rpm, frequency)) {
            return;
        }

        let result = if frequency > 0.0 {
            self.pwm
                .set_frequency(frequency)
                .and_then(|_| self.pwm.set_duty_cycle(self.config.duty_cycle))
        } else {
            self.pwm.set_duty_cycle(0.0)
        };

        match result {
            Ok(()) => {
                self.applied = Some((rpm, frequency));
                self.telemetry.record(ExtrusionRecord {
                    time: now,
                    rpm,
                    step_frequency: frequency,
                });
            }
            Err(e) => {
                // retried on the next tick since `applied` is unchanged
                error!("[Extruder] failed to apply {:.1} rpm: {}", rpm, e);
                self.applied = None;
            }
        }
    }

    pub fn rpm(&self) -> f64 {
        self.applied.map(|(rpm, _)| rpm).unwrap_or(0.0)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HardwareError;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    enum Write {
        Frequency(f64),
        Duty(f64),
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Write>>>);

    impl PwmChannel for Recorder {
        fn set_frequency(&mut self, hz: f64) -> Result<(), HardwareError> {
            self.0.lock().push(Write::Frequency(hz));
            Ok(())
        }
        fn set_duty_cycle(&mut self, percent: f64) -> Result<(), HardwareError> {
            self.0.lock().push(Write::Duty(percent));
            Ok(())
        }
    }

    fn drive() -> (ExtrusionDrive, Recorder) {
        let rec = Recorder::default();
        let mut d = ExtrusionDrive::new(
            ExtrusionConfig::default(),
            Box::new(rec.clone()),
            TelemetryRing::new(16),
        );
        d.arm().unwrap();
        rec.0.lock().clear();
        (d, rec)
    }

    #[test]
    fn rpm_maps_to_step_frequency() {
        assert_eq!(step_frequency(30.0, 200.0), 100.0);
        assert_eq!(step_frequency(0.0, 200.0), 0.0);
    }

    #[test]
    fn stopped_drive_stays_at_zero() {
        let (mut d, rec) = drive();
        d.update(0.0, 30.0);
        assert!(rec.0.lock().is_empty());
        assert_eq!(d.rpm(), 0.0);
    }

    #[test]
    fn started_drive_writes_only_on_change() {
        let (mut d, rec) = drive();
        d.start();
        d.update(0.0, 30.0);
        d.update(0.05, 30.0);
        assert_eq!(*rec.0.lock(), vec![Write::Frequency(100.0), Write::Duty(50.0)]);

        d.update(0.1, 0.0);
        assert_eq!(rec.0.lock().last(), Some(&Write::Duty(0.0)));

        d.update(0.15, 60.0);
        d.stop(0.2);
        assert_eq!(rec.0.lock().last(), Some(&Write::Duty(0.0)));
        assert!(!d.is_started());
    }
}
