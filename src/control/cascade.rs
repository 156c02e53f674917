//! cascade.rs
//! Diameter cascade: outer loop producing the spool RPM setpoint.
//!
//! setpoint = clamp(feedforward − trim_rpm_per_unit · pid(target − mean(window)), 0, max_spool_rpm)
//!
//! The feedforward comes from volume conservation through the draw:
//! rpm_ff = k · extrusion_rpm · preform² / (spool · d²), evaluated at the
//! commanded target diameter. A positive error (fiber thinner than target)
//! therefore pulls the spool below feedforward.

use log::{debug, error, warn};
use std::collections::VecDeque;

use crate::config::CascadeConfig;
use crate::control::pid::{clamp, PidLoop};
use crate::error::ControlResult;
use crate::utils::telemetry::{CascadeRecord, TelemetryRing};

/// Last N valid diameter measurements. Zero ("no fiber found") and
/// non-finite values are never admitted.
#[derive(Debug, Clone)]
pub struct DiameterWindow {
    values: VecDeque<f64>,
    capacity: usize,
}

impl DiameterWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns false when the value was rejected.
    pub fn push(&mut self, diameter_mm: f64) -> bool {
        if !(diameter_mm > 0.0) || !diameter_mm.is_finite() {
            return false;
        }
        if self.values.len() >= self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(diameter_mm);
        true
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

/// Spool RPM that draws the preform down to `diameter_mm` at the given feed.
pub fn feedforward_rpm(config: &CascadeConfig, extrusion_rpm: f64, diameter_mm: f64) -> f64 {
    if !(diameter_mm > 0.0) || !(config.spool_diameter_mm > 0.0) {
        return 0.0;
    }
    config.geometry_constant * extrusion_rpm * config.preform_diameter_mm.powi(2)
        / (config.spool_diameter_mm * diameter_mm.powi(2))
}

pub struct DiameterCascade {
    config: CascadeConfig,
    window: DiameterWindow,
    pid: PidLoop,
    telemetry: TelemetryRing<CascadeRecord>,
    last_setpoint: Option<f64>,
    target_rejected: bool,
}

impl DiameterCascade {
    pub fn new(config: CascadeConfig, telemetry: TelemetryRing<CascadeRecord>) -> Self {
        Self {
            window: DiameterWindow::new(config.window),
            pid: PidLoop::new(config.gains, config.limits),
            config,
            telemetry,
            last_setpoint: None,
            target_rejected: false,
        }
    }

    /// Feed one camera measurement; zero means "no measurement" and is dropped.
    pub fn push_measurement(&mut self, diameter_mm: f64) -> bool {
        self.window.push(diameter_mm)
    }

    /// Forget buffered measurements and PID history (after a mode change or
    /// a new camera coefficient).
    pub fn reset(&mut self, now: f64) {
        self.window.clear();
        self.pid.reset(now);
        self.last_setpoint = None;
    }

    /// Run one rate-gated step and return the spool RPM setpoint.
    ///
    /// Without any valid measurement the setpoint is pure feedforward and the
    /// outer PID is held, not integrated.
    pub fn update(&mut self, now: f64, target_diameter_mm: f64, extrusion_rpm: f64) -> Option<f64> {
        if !self.pid.is_due(now, self.config.sample_interval) {
            return None;
        }
        if !(target_diameter_mm > 0.0) {
            if !std::mem::replace(&mut self.target_rejected, true) {
                warn!(
                    "[Cascade] target diameter {:.4} mm is not positive; holding",
                    target_diameter_mm
                );
            }
            self.pid.hold(now);
            return None;
        }
        self.target_rejected = false;

        match self.step(now, target_diameter_mm, extrusion_rpm) {
            Ok(setpoint) => Some(setpoint),
            Err(e) => {
                error!("[Cascade] step failed: {}", e);
                None
            }
        }
    }

    fn step(&mut self, now: f64, target: f64, extrusion_rpm: f64) -> ControlResult<f64> {
        let feedforward = feedforward_rpm(&self.config, extrusion_rpm, target);

        let (measured, error, trim, delta_time) = match self.window.mean() {
            Some(measured) => {
                let step = self.pid.step(target - measured, now)?;
                let trim = self.config.trim_rpm_per_unit * step.output;
                (measured, step.error, trim, step.delta_time)
            }
            None => {
                let delta_time = now - self.pid.previous_time();
                self.pid.hold(now);
                (0.0, 0.0, 0.0, delta_time)
            }
        };

        let setpoint = clamp(feedforward - trim, 0.0, self.config.max_spool_rpm);
        self.last_setpoint = Some(setpoint);

        self.telemetry.record(CascadeRecord {
            time: now,
            delta_time,
            target_diameter: target,
            measured_diameter: measured,
            error,
            feedforward_rpm: feedforward,
            trim_rpm: trim,
            setpoint_rpm: setpoint,
        });
        debug!(
            "[Cascade] d={:.4}/{:.4} ff={:.2} trim={:.2} -> {:.2} rpm",
            measured, target, feedforward, trim, setpoint
        );
        Ok(setpoint)
    }

    pub fn last_setpoint(&self) -> Option<f64> {
        self.last_setpoint
    }

    pub fn averaged_diameter(&self) -> Option<f64> {
        self.window.mean()
    }

    pub fn pid(&self) -> &PidLoop {
        &self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CascadeConfig {
        CascadeConfig {
            max_spool_rpm: 1_000.0,
            ..CascadeConfig::default()
        }
    }

    #[test]
    fn feedforward_follows_volume_conservation() {
        let cfg = config();
        let rpm = feedforward_rpm(&cfg, 30.0, 0.35);
        let expected = 25.0 / 28.0 * 11.0 * 30.0 * 49.0 / (15.2 * 0.35 * 0.35);
        assert!((rpm - expected).abs() < 1e-9);

        // halving the diameter needs four times the draw
        let ratio = feedforward_rpm(&cfg, 30.0, 0.2) / feedforward_rpm(&cfg, 30.0, 0.4);
        assert!((ratio - 4.0).abs() < 1e-9);
        assert_eq!(feedforward_rpm(&cfg, 30.0, 0.0), 0.0);
    }

    #[test]
    fn zero_measurements_never_enter_the_window() {
        let mut w = DiameterWindow::new(3);
        assert!(!w.push(0.0));
        assert!(!w.push(f64::NAN));
        assert!(w.mean().is_none());
        for d in [0.3, 0.4, 0.5, 0.6] {
            assert!(w.push(d));
        }
        assert_eq!(w.len(), 3);
        assert!((w.mean().unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn no_measurement_means_pure_feedforward_and_held_pid() {
        let cfg = config();
        let ff = feedforward_rpm(&cfg, 1.0, 0.35);
        let mut cascade = DiameterCascade::new(cfg, TelemetryRing::new(8));

        let sp = cascade.update(0.2, 0.35, 1.0).unwrap();
        assert!((sp - ff).abs() < 1e-9);
        assert_eq!(cascade.pid().integral(), 0.0);
        assert_eq!(cascade.pid().previous_time(), 0.2);
    }

    #[test]
    fn thin_fiber_slows_the_spool() {
        let cfg = config();
        let ff = feedforward_rpm(&cfg, 1.0, 0.35);
        let mut cascade = DiameterCascade::new(cfg, TelemetryRing::new(8));
        cascade.push_measurement(0.30);

        let sp = cascade.update(0.2, 0.35, 1.0).unwrap();
        assert!(sp < ff);

        let mut thick = DiameterCascade::new(config(), TelemetryRing::new(8));
        thick.push_measurement(0.40);
        assert!(thick.update(0.2, 0.35, 1.0).unwrap() > ff);
    }

    #[test]
    fn setpoint_saturates_at_device_maximum() {
        let mut cascade = DiameterCascade::new(CascadeConfig::default(), TelemetryRing::new(8));
        // default feed gives a feedforward far above the 60 rpm bound
        let sp = cascade.update(0.2, 0.35, 30.0).unwrap();
        assert_eq!(sp, 60.0);
        assert_eq!(cascade.update(0.2, 0.35, 0.0), None);
    }

    #[test]
    fn non_positive_target_holds_without_output() {
        let ring = TelemetryRing::new(8);
        let mut cascade = DiameterCascade::new(config(), ring.clone());
        cascade.push_measurement(0.33);

        assert_eq!(cascade.update(0.2, 0.0, 1.0), None);
        assert_eq!(cascade.update(0.4, -1.0, 1.0), None);
        assert!(cascade.target_rejected);
        assert_eq!(cascade.pid().integral(), 0.0);
        assert_eq!(cascade.last_setpoint(), None);
        assert!(ring.is_empty());

        // a valid target resumes on the next due tick
        assert!(cascade.update(0.6, 0.35, 1.0).is_some());
        assert!(!cascade.target_rejected);
    }

    #[test]
    fn gated_update_is_idempotent() {
        let ring = TelemetryRing::new(8);
        let mut cascade = DiameterCascade::new(config(), ring.clone());
        cascade.push_measurement(0.33);
        cascade.update(0.2, 0.35, 1.0).unwrap();
        let integral = cascade.pid().integral();

        cascade.push_measurement(0.2);
        assert_eq!(cascade.update(0.25, 0.35, 1.0), None);
        assert_eq!(cascade.pid().integral(), integral);
        assert_eq!(ring.len(), 1);
    }
}
