//! thermal.rs
//! Heated-die temperature loop.
//!
//! Pipeline: ADC voltage → Beta-model thermistor → moving average (last 10
//! conversions) → PID → heater duty cycle in [0, 100].
//! Rate-gated at 0.1 s; a skipped tick leaves the heater untouched.

use log::{debug, error, warn};
use std::collections::VecDeque;

use crate::config::{ThermalConfig, ThermistorConfig};
use crate::control::{
    pid::{PidLoop, PidStep},
    FaultLatch,
};
use crate::error::{ControlError, ControlResult};
use crate::hardware::{AnalogInput, PwmChannel};
use crate::utils::telemetry::{TelemetryRing, ThermalRecord};

const KELVIN_OFFSET: f64 = 273.15;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureSample {
    pub voltage: f64,
    pub temperature_c: f64,
    pub timestamp: f64,
}

/// Voltage-divider NTC thermistor.
#[derive(Debug, Clone)]
pub struct Thermistor {
    config: ThermistorConfig,
}

impl Thermistor {
    pub fn new(config: ThermistorConfig) -> Self {
        Self { config }
    }

    /// Divider resistance, or None for a reading at or beyond either rail.
    pub fn resistance(&self, voltage: f64) -> Option<f64> {
        let c = &self.config;
        if !(voltage > c.min_valid_voltage) || voltage >= c.supply_voltage {
            return None;
        }
        Some((c.supply_voltage - voltage) * c.reference_resistor / voltage)
    }

    /// Temperature in °C: 1 / (ln(R/R0)/B + 1/T0) − 273.15.
    pub fn temperature(&self, voltage: f64) -> Option<f64> {
        let c = &self.config;
        let resistance = self.resistance(voltage)?;
        let ln = (resistance / c.resistance_at_reference).ln();
        let kelvin = 1.0 / (ln / c.beta + 1.0 / c.reference_temperature_k);
        Some(kelvin - KELVIN_OFFSET)
    }
}

/// Fixed-size window of raw conversions.
#[derive(Debug, Clone)]
pub struct SmoothingWindow {
    values: VecDeque<f64>,
    capacity: usize,
}

impl SmoothingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a raw value and return the mean of what is retained.
    pub fn push(&mut self, value: f64) -> f64 {
        if self.values.len() >= self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
        self.mean().unwrap_or(value)
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

pub struct ThermalController {
    config: ThermalConfig,
    thermistor: Thermistor,
    window: SmoothingWindow,
    pid: PidLoop,
    input: Box<dyn AnalogInput>,
    heater: Box<dyn PwmChannel>,
    telemetry: TelemetryRing<ThermalRecord>,
    setpoint: f64,
    started: bool,
    last_output: f64,
    last_sample: Option<TemperatureSample>,
    fault: FaultLatch,
}

impl ThermalController {
    pub fn new(
        config: ThermalConfig,
        input: Box<dyn AnalogInput>,
        heater: Box<dyn PwmChannel>,
        telemetry: TelemetryRing<ThermalRecord>,
    ) -> Self {
        Self {
            thermistor: Thermistor::new(config.thermistor.clone()),
            window: SmoothingWindow::new(config.thermistor.readings_to_average),
            pid: PidLoop::new(config.gains, config.limits),
            setpoint: config.setpoint_c,
            config,
            input,
            heater,
            telemetry,
            started: false,
            last_output: 0.0,
            last_sample: None,
            fault: FaultLatch::default(),
        }
    }

    /// Configure the heater PWM and force it off.
    pub fn arm(&mut self) -> ControlResult<()> {
        self.heater.set_frequency(self.config.heater_pwm_hz)?;
        self.heater.set_duty_cycle(0.0)?;
        self.last_output = 0.0;
        Ok(())
    }

    pub fn start(&mut self, now: f64) {
        self.started = true;
        self.pid.reset(now);
    }

    /// Leave the started state; the heater is driven to zero immediately.
    pub fn stop(&mut self) {
        self.started = false;
        if let Err(e) = self.heater.set_duty_cycle(0.0) {
            error!("[Thermal] failed to switch heater off: {}", e);
        }
        self.last_output = 0.0;
    }

    pub fn set_setpoint(&mut self, celsius: f64) {
        self.setpoint = celsius;
    }

    /// Run one rate-gated step. Returns the new heater level when it was
    /// rewritten this tick, None when gated, stopped or faulted.
    pub fn update(&mut self, now: f64) -> Option<f64> {
        if !self.started {
            return None;
        }
        if !self.pid.is_due(now, self.config.sample_interval) {
            return None;
        }

        match self.step(now) {
            Ok(output) => {
                self.fault.clear();
                Some(output)
            }
            Err(ControlError::SensorFault(msg)) => {
                warn!("[Thermal] {}; heater held at {:.1}%", msg, self.last_output);
                self.fault.raise(msg);
                None
            }
            Err(e) => {
                error!("[Thermal] step failed: {}", e);
                self.fault.raise(e.to_string());
                None
            }
        }
    }

    fn step(&mut self, now: f64) -> ControlResult<f64> {
        let voltage = self.input.read_voltage()?;
        let raw = self.thermistor.temperature(voltage).ok_or_else(|| {
            ControlError::SensorFault(format!("thermistor voltage {:.4} V out of range", voltage))
        })?;

        // Smooth on a scratch copy so a failing actuator write leaves no trace
        let mut window = self.window.clone();
        let temperature = window.push(raw);

        let mut pid = self.pid.clone();
        let PidStep { error, delta_time, output, .. } =
            pid.step(self.setpoint - temperature, now)?;

        self.heater.set_duty_cycle(output)?;

        self.window = window;
        self.pid = pid;
        self.last_output = output;
        self.last_sample = Some(TemperatureSample {
            voltage,
            temperature_c: temperature,
            timestamp: now,
        });

        let gains = self.pid.gains();
        self.telemetry.record(ThermalRecord {
            time: now,
            delta_time,
            voltage,
            temperature,
            setpoint: self.setpoint,
            error,
            output,
            kp: gains.kp,
            ki: gains.ki,
            kd: gains.kd,
        });
        debug!("[Thermal] t={:.2} T={:.2}C out={:.1}%", now, temperature, output);

        Ok(output)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    pub fn last_output(&self) -> f64 {
        self.last_output
    }

    pub fn last_sample(&self) -> Option<TemperatureSample> {
        self.last_sample
    }

    pub fn pid(&self) -> &PidLoop {
        &self.pid
    }

    pub fn take_fault(&mut self) -> Option<String> {
        self.fault.take()
    }
}
