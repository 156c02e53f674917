//! Cooling fan on a fixed-frequency PWM channel.

use log::{error, info};

use crate::config::FanConfig;
use crate::error::ControlResult;
use crate::hardware::PwmChannel;

pub struct FanDrive {
    config: FanConfig,
    pwm: Box<dyn PwmChannel>,
    duty: f64,
}

impl FanDrive {
    pub fn new(config: FanConfig, pwm: Box<dyn PwmChannel>) -> Self {
        Self {
            duty: config.duty_cycle,
            config,
            pwm,
        }
    }

    /// Configure the channel and spin up at the configured duty.
    pub fn start(&mut self) -> ControlResult<()> {
        self.pwm.set_frequency(self.config.pwm_hz)?;
        self.pwm.set_duty_cycle(self.duty)?;
        info!("[Fan] running at {:.0}%", self.duty);
        Ok(())
    }

    pub fn set_duty(&mut self, percent: f64) {
        self.duty = percent.max(0.0).min(100.0);
    }

    /// Re-apply the commanded duty; a failed write is logged and retried next tick.
    pub fn apply(&mut self) {
        if let Err(e) = self.pwm.set_duty_cycle(self.duty) {
            error!("[Fan] failed to apply {:.0}%: {}", self.duty, e);
        }
    }

    pub fn stop(&mut self) {
        self.duty = 0.0;
        self.apply();
    }

    pub fn duty(&self) -> f64 {
        self.duty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HardwareError;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Last(Arc<Mutex<Option<f64>>>);

    impl PwmChannel for Last {
        fn set_frequency(&mut self, _hz: f64) -> Result<(), HardwareError> {
            Ok(())
        }
        fn set_duty_cycle(&mut self, percent: f64) -> Result<(), HardwareError> {
            *self.0.lock() = Some(percent);
            Ok(())
        }
    }

    #[test]
    fn starts_at_configured_duty_and_clamps_commands() {
        let last = Last::default();
        let mut fan = FanDrive::new(FanConfig::default(), Box::new(last.clone()));
        fan.start().unwrap();
        assert_eq!(*last.0.lock(), Some(45.0));

        fan.set_duty(140.0);
        fan.apply();
        assert_eq!(*last.0.lock(), Some(100.0));

        fan.stop();
        assert_eq!(*last.0.lock(), Some(0.0));
    }
}
