//! sim.rs
//! Simulated extrusion line implementing every hardware port.
//!
//! Plants are integrated analytically against the shared clock, so they
//! behave identically under `MonotonicClock` and `ManualClock`:
//! - die: first-order thermal lag toward ambient + gain·heater
//! - spool: first-order motor lag, dead zone below 10 % duty
//! - camera: bright band whose width follows the spool draw ratio

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::Arc;

use super::{
    AnalogInput, ControlPorts, DeviceHardware, EncoderCounter, FrameSource, PwmChannel, SpoolDrive,
};
use crate::config::ThermistorConfig;
use crate::error::HardwareError;
use crate::utils::clock::SharedClock;
use crate::vision::frame::ColorFrame;

const AMBIENT_C: f64 = 25.0;
const THERMAL_GAIN_C_PER_PCT: f64 = 1.5;
const THERMAL_TAU_S: f64 = 30.0;

const MOTOR_TAU_S: f64 = 0.3;
const MOTOR_DEAD_ZONE_PCT: f64 = 10.0;
const MOTOR_RPM_PER_PCT: f64 = 1.5;
const PULSES_PER_REVOLUTION: f64 = 4704.0;

const FRAME_WIDTH: usize = 320;
const FRAME_HEIGHT: usize = 240;
const MM_PER_PIXEL: f64 = 0.01;
const BASE_DIAMETER_MM: f64 = 0.5;
const BASE_SPOOL_RPM: f64 = 30.0;
const MAX_DIAMETER_MM: f64 = 2.5;
const BACKGROUND: u8 = 30;
const FIBER: u8 = 200;
const NOISE: i16 = 12;

// ---------------------------------------------------------------------------
// Spool motor + encoder
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MotorState {
    duty: f64,
    rpm: f64,
    /// Encoder position in pulses, unwrapped.
    position: f64,
    last_time: f64,
    duty_writes: usize,
    present: bool,
}

impl MotorState {
    fn advance(&mut self, now: f64) {
        let dt = now - self.last_time;
        if dt <= 0.0 {
            return;
        }
        let target = ((self.duty - MOTOR_DEAD_ZONE_PCT) * MOTOR_RPM_PER_PCT).max(0.0);
        let decay = (-dt / MOTOR_TAU_S).exp();
        // ∫ rpm dt over the interval, in revolutions
        let revolutions = (target * dt + (self.rpm - target) * MOTOR_TAU_S * (1.0 - decay)) / 60.0;
        self.position += revolutions * PULSES_PER_REVOLUTION;
        self.rpm = target + (self.rpm - target) * decay;
        self.last_time = now;
    }
}

/// DC spool motor with a quadrature encoder. Clones share one plant.
#[derive(Clone)]
pub struct SimulatedMotor {
    state: Arc<Mutex<MotorState>>,
    clock: SharedClock,
}

impl SimulatedMotor {
    pub fn new(clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            state: Arc::new(Mutex::new(MotorState {
                duty: 0.0,
                rpm: 0.0,
                position: 0.0,
                last_time: now,
                duty_writes: 0,
                present: true,
            })),
            clock,
        }
    }

    pub fn drive(&self) -> SpoolDrive {
        SpoolDrive {
            encoder: Box::new(SimEncoder(self.clone())),
            pwm: Box::new(SimMotorPwm(self.clone())),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MotorState) -> R) -> R {
        let mut state = self.state.lock();
        state.advance(self.clock.now());
        f(&mut state)
    }

    pub fn rpm(&self) -> f64 {
        self.with_state(|s| s.rpm)
    }

    pub fn duty(&self) -> f64 {
        self.state.lock().duty
    }

    pub fn duty_writes(&self) -> usize {
        self.state.lock().duty_writes
    }

    /// A missing encoder chip fails `clear`, which aborts startup.
    pub fn set_present(&self, present: bool) {
        self.state.lock().present = present;
    }
}

struct SimEncoder(SimulatedMotor);

impl EncoderCounter for SimEncoder {
    fn read_count(&mut self) -> Result<u32, HardwareError> {
        self.0.with_state(|s| {
            if !s.present {
                return Err(HardwareError::NotPresent("encoder counter"));
            }
            // free-running 32-bit counter
            Ok(s.position.floor() as i64 as u32)
        })
    }

    fn clear(&mut self) -> Result<(), HardwareError> {
        self.0.with_state(|s| {
            if !s.present {
                return Err(HardwareError::NotPresent("encoder counter"));
            }
            s.position = 0.0;
            Ok(())
        })
    }
}

struct SimMotorPwm(SimulatedMotor);

impl PwmChannel for SimMotorPwm {
    fn set_frequency(&mut self, _hz: f64) -> Result<(), HardwareError> {
        Ok(())
    }

    fn set_duty_cycle(&mut self, percent: f64) -> Result<(), HardwareError> {
        self.0.with_state(|s| {
            s.duty = percent.max(0.0).min(100.0);
            s.duty_writes += 1;
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Heated die + thermistor
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ThermalState {
    heater: f64,
    temperature: f64,
    last_time: f64,
    sensor_fault: bool,
}

impl ThermalState {
    fn advance(&mut self, now: f64) {
        let dt = now - self.last_time;
        if dt <= 0.0 {
            return;
        }
        let target = AMBIENT_C + THERMAL_GAIN_C_PER_PCT * self.heater;
        self.temperature = target + (self.temperature - target) * (-dt / THERMAL_TAU_S).exp();
        self.last_time = now;
    }
}

#[derive(Clone)]
pub struct SimulatedDie {
    state: Arc<Mutex<ThermalState>>,
    thermistor: ThermistorConfig,
    clock: SharedClock,
}

impl SimulatedDie {
    pub fn new(clock: SharedClock, thermistor: ThermistorConfig) -> Self {
        let now = clock.now();
        Self {
            state: Arc::new(Mutex::new(ThermalState {
                heater: 0.0,
                temperature: AMBIENT_C,
                last_time: now,
                sensor_fault: false,
            })),
            thermistor,
            clock,
        }
    }

    pub fn temperature(&self) -> f64 {
        let mut s = self.state.lock();
        s.advance(self.clock.now());
        s.temperature
    }

    pub fn heater(&self) -> f64 {
        self.state.lock().heater
    }

    /// Drive the divider to the supply rail (open thermistor).
    pub fn set_sensor_fault(&self, fault: bool) {
        self.state.lock().sensor_fault = fault;
    }

    /// Divider voltage for a die temperature (inverse Beta model).
    pub fn voltage_for(&self, celsius: f64) -> f64 {
        let c = &self.thermistor;
        let kelvin = celsius + 273.15;
        let resistance =
            c.resistance_at_reference * (c.beta * (1.0 / kelvin - 1.0 / c.reference_temperature_k)).exp();
        c.supply_voltage * c.reference_resistor / (resistance + c.reference_resistor)
    }
}

impl AnalogInput for SimulatedDie {
    fn read_voltage(&mut self) -> Result<f64, HardwareError> {
        let (temperature, fault) = {
            let mut s = self.state.lock();
            s.advance(self.clock.now());
            (s.temperature, s.sensor_fault)
        };
        if fault {
            return Ok(self.thermistor.supply_voltage);
        }
        Ok(self.voltage_for(temperature))
    }
}

struct SimHeater(SimulatedDie);

impl PwmChannel for SimHeater {
    fn set_frequency(&mut self, _hz: f64) -> Result<(), HardwareError> {
        Ok(())
    }

    fn set_duty_cycle(&mut self, percent: f64) -> Result<(), HardwareError> {
        let mut s = self.0.state.lock();
        s.advance(self.0.clock.now());
        s.heater = percent.max(0.0).min(100.0);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Plain PWM outputs (stepper, fan)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct PwmState {
    pub frequency: f64,
    pub duty: f64,
    pub writes: usize,
}

/// Records what was last written to a channel. Clones share the record.
#[derive(Clone, Default)]
pub struct PwmProbe(Arc<Mutex<PwmState>>);

impl PwmProbe {
    pub fn state(&self) -> PwmState {
        *self.0.lock()
    }
}

impl PwmChannel for PwmProbe {
    fn set_frequency(&mut self, hz: f64) -> Result<(), HardwareError> {
        let mut s = self.0.lock();
        s.frequency = hz;
        s.writes += 1;
        Ok(())
    }

    fn set_duty_cycle(&mut self, percent: f64) -> Result<(), HardwareError> {
        let mut s = self.0.lock();
        s.duty = percent;
        s.writes += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Camera
// ---------------------------------------------------------------------------

pub struct SimulatedCamera {
    motor: SimulatedMotor,
    rng: StdRng,
    /// Overrides the draw model with a fixed fiber diameter (reference wire).
    fixed_diameter_mm: Arc<Mutex<Option<f64>>>,
}

impl SimulatedCamera {
    pub fn new(motor: SimulatedMotor, seed: u64) -> Self {
        Self {
            motor,
            rng: StdRng::seed_from_u64(seed),
            fixed_diameter_mm: Arc::new(Mutex::new(None)),
        }
    }

    /// Handle for placing (Some) or removing (None) a reference wire.
    pub fn reference_wire(&self) -> Arc<Mutex<Option<f64>>> {
        self.fixed_diameter_mm.clone()
    }

    /// Fiber diameter produced at the current spool speed.
    pub fn drawn_diameter_mm(spool_rpm: f64) -> f64 {
        if spool_rpm <= 0.0 {
            return MAX_DIAMETER_MM;
        }
        (BASE_DIAMETER_MM * (BASE_SPOOL_RPM / spool_rpm).sqrt()).min(MAX_DIAMETER_MM)
    }

    pub fn mm_per_pixel() -> f64 {
        MM_PER_PIXEL
    }
}

impl FrameSource for SimulatedCamera {
    fn capture(&mut self) -> Result<ColorFrame, HardwareError> {
        let fixed = *self.fixed_diameter_mm.lock();
        let diameter = fixed.unwrap_or_else(|| Self::drawn_diameter_mm(self.motor.rpm()));
        let band = ((diameter / MM_PER_PIXEL).round() as usize).min(FRAME_WIDTH - 2);
        let x0 = (FRAME_WIDTH - band) / 2;

        let mut frame = ColorFrame::new(FRAME_WIDTH, FRAME_HEIGHT);
        for y in 0..FRAME_HEIGHT {
            for x in 0..FRAME_WIDTH {
                let base = if (x0..x0 + band).contains(&x) { FIBER } else { BACKGROUND };
                let v = (i16::from(base) + self.rng.random_range(-NOISE..=NOISE)).clamp(0, 255) as u8;
                frame.set_pixel(x, y, [v, v, v]);
            }
        }
        Ok(frame)
    }
}

// ---------------------------------------------------------------------------
// Whole device
// ---------------------------------------------------------------------------

/// Every simulated plant plus observation handles for tests and the binary.
pub struct SimulatedDevice {
    pub die: SimulatedDie,
    pub motor: SimulatedMotor,
    pub stepper: PwmProbe,
    pub fan: PwmProbe,
    pub reference_wire: Arc<Mutex<Option<f64>>>,
    camera: Option<SimulatedCamera>,
}

impl SimulatedDevice {
    pub fn new(clock: SharedClock, thermistor: ThermistorConfig, seed: u64) -> Self {
        let motor = SimulatedMotor::new(clock.clone());
        let camera = SimulatedCamera::new(motor.clone(), seed);
        Self {
            die: SimulatedDie::new(clock, thermistor),
            reference_wire: camera.reference_wire(),
            camera: Some(camera),
            motor,
            stepper: PwmProbe::default(),
            fan: PwmProbe::default(),
        }
    }

    /// Port bundle for the orchestrator. The camera can be handed out once.
    pub fn hardware(&mut self) -> Option<DeviceHardware> {
        let camera = self.camera.take()?;
        Some(DeviceHardware {
            control: self.control_ports(),
            camera: Box::new(camera),
        })
    }

    /// Ports for driving an orchestrator directly, without a camera worker.
    pub fn control_ports(&self) -> ControlPorts {
        ControlPorts {
            thermistor: Box::new(self.die.clone()),
            heater: Box::new(SimHeater(self.die.clone())),
            spool: self.motor.drive(),
            stepper: Box::new(self.stepper.clone()),
            fan: Box::new(self.fan.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::thermal::Thermistor;
    use crate::utils::clock::ManualClock;

    #[test]
    fn motor_settles_to_linear_speed() {
        let clock = ManualClock::shared();
        let motor = SimulatedMotor::new(clock.clone());
        let mut drive = motor.drive();
        drive.pwm.set_duty_cycle(50.0).unwrap();
        clock.advance(5.0);
        assert!((motor.rpm() - 60.0).abs() < 0.01);

        let a = drive.encoder.read_count().unwrap();
        clock.advance(1.0);
        let b = drive.encoder.read_count().unwrap();
        // one revolution per second at 60 rpm
        assert!((f64::from(b.wrapping_sub(a)) - 4704.0).abs() < 10.0);
    }

    #[test]
    fn die_voltage_round_trips_through_thermistor() {
        let cfg = ThermistorConfig::default();
        let die = SimulatedDie::new(ManualClock::shared(), cfg.clone());
        let t = Thermistor::new(cfg);
        for celsius in [25.0, 60.0, 95.0, 150.0] {
            let back = t.temperature(die.voltage_for(celsius)).unwrap();
            assert!((back - celsius).abs() < 1e-6);
        }
    }

    #[test]
    fn die_heats_toward_steady_state() {
        let clock = ManualClock::shared();
        let die = SimulatedDie::new(clock.clone(), ThermistorConfig::default());
        let mut heater = SimHeater(die.clone());
        heater.set_duty_cycle(50.0).unwrap();
        clock.advance(300.0);
        assert!((die.temperature() - 100.0).abs() < 0.1);
    }

    #[test]
    fn camera_band_matches_drawn_diameter() {
        let clock = ManualClock::shared();
        let motor = SimulatedMotor::new(clock.clone());
        let mut cam = SimulatedCamera::new(motor, 1);
        let frame = cam.capture().unwrap();
        let lit = (0..FRAME_WIDTH)
            .filter(|&x| frame.pixel(x, FRAME_HEIGHT / 2)[0] > 100)
            .count();
        assert_eq!(lit, (MAX_DIAMETER_MM / MM_PER_PIXEL).round() as usize);
        assert!((SimulatedCamera::drawn_diameter_mm(30.0) - 0.5).abs() < 1e-12);
    }
}
