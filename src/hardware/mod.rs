//! Hardware ports consumed by the control core.
//!
//! The real bindings (SPI transfers to the ADC and encoder counter, GPIO PWM,
//! V4L capture) live outside this crate; the core only relies on these
//! synchronous, fast, side-effecting calls. `sim` provides a simulated device
//! implementing every port.

pub mod sim;

use crate::error::HardwareError;
use crate::vision::frame::ColorFrame;

/// Single analog channel (thermistor divider on the ADC).
pub trait AnalogInput: Send {
    fn read_voltage(&mut self) -> Result<f64, HardwareError>;
}

/// Free-running 32-bit quadrature counter.
pub trait EncoderCounter: Send {
    fn read_count(&mut self) -> Result<u32, HardwareError>;

    /// Zero the hardware counter (done once when the device is armed).
    fn clear(&mut self) -> Result<(), HardwareError>;
}

/// Pulse-width output channel. Duty cycle is in percent, 0..=100.
pub trait PwmChannel: Send {
    fn set_frequency(&mut self, hz: f64) -> Result<(), HardwareError>;
    fn set_duty_cycle(&mut self, percent: f64) -> Result<(), HardwareError>;
}

pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<ColorFrame, HardwareError>;
}

/// Encoder + PWM pair driving the spool. Moved as one unit so that a motor
/// calibration can take exclusive ownership of it.
pub struct SpoolDrive {
    pub encoder: Box<dyn EncoderCounter>,
    pub pwm: Box<dyn PwmChannel>,
}

/// Ports driven from the control tick.
pub struct ControlPorts {
    pub thermistor: Box<dyn AnalogInput>,
    pub heater: Box<dyn PwmChannel>,
    pub spool: SpoolDrive,
    pub stepper: Box<dyn PwmChannel>,
    pub fan: Box<dyn PwmChannel>,
}

/// Every port the device exposes. The camera goes to its own worker thread,
/// the rest to the orchestrator.
pub struct DeviceHardware {
    pub control: ControlPorts,
    pub camera: Box<dyn FrameSource>,
}

/// Writes zero duty to a PWM channel when dropped.
///
/// Calibration routines hold one for their whole run so that success, error,
/// panic unwinding and cancellation all leave the actuator at a safe level.
pub struct SafeDuty<'a> {
    pwm: &'a mut dyn PwmChannel,
}

impl<'a> SafeDuty<'a> {
    pub fn new(pwm: &'a mut dyn PwmChannel) -> Self {
        Self { pwm }
    }

    pub fn set_duty_cycle(&mut self, percent: f64) -> Result<(), HardwareError> {
        self.pwm.set_duty_cycle(percent)
    }
}

impl Drop for SafeDuty<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.pwm.set_duty_cycle(0.0) {
            log::error!("[Hardware] failed to return drive to safe level: {}", e);
        }
    }
}
