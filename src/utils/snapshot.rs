//! Published device state for display readers.
//!
//! Written only by the control worker (and the camera worker for the diameter
//! fields); everything else takes read locks. Histories are capped at
//! `MAX_POINTS` so plots never grow unbounded.

use parking_lot::RwLock;
use std::{collections::VecDeque, sync::Arc};

use crate::config::SpoolMode;

pub const MAX_POINTS: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalibrationStatus {
    #[default]
    Missing,
    Calibrated,
    InProgress,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    pub time: f64,
    pub started: bool,
    pub spool_mode: SpoolMode,

    pub temperature_c: f64,
    pub target_temperature_c: f64,
    pub heater_output: f64,

    pub spool_rpm: f64,
    pub spool_setpoint_rpm: f64,
    pub spool_duty: f64,
    pub extrusion_rpm: f64,
    pub fan_duty: f64,

    pub diameter_mm: f64,
    pub target_diameter_mm: f64,

    pub motor_calibration: CalibrationStatus,
    pub camera_calibration: CalibrationStatus,

    /// Recent history (last MAX_POINTS samples)
    pub temperature_history: VecDeque<f64>,
    pub rpm_history: VecDeque<f64>,
    pub diameter_history: VecDeque<f64>,

    pub ticks: u64,
    pub faults: u64,
}

pub type SharedSnapshot = Arc<RwLock<DeviceSnapshot>>;

pub fn shared_snapshot() -> SharedSnapshot {
    Arc::new(RwLock::new(DeviceSnapshot::default()))
}

/// Appends value to a history buffer; removes oldest if at capacity (FIFO).
#[inline]
pub fn push_capped(buf: &mut VecDeque<f64>, val: f64) {
    if buf.len() >= MAX_POINTS {
        buf.pop_front();
    }
    buf.push_back(val);
}

/// Statistics summary for a history buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: usize,
}

pub fn calculate_stats(data: &VecDeque<f64>) -> Option<Stats> {
    if data.is_empty() {
        return None;
    }

    let count = data.len();
    let min = data.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = data.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mean = data.iter().sum::<f64>() / count as f64;

    Some(Stats { min, max, mean, count })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_capped() {
        let mut buf = VecDeque::new();
        for i in 0..(MAX_POINTS + 10) {
            push_capped(&mut buf, i as f64);
        }
        assert_eq!(buf.len(), MAX_POINTS);
        assert_eq!(buf.front().copied(), Some(10.0));
    }

    #[test]
    fn stats_of_empty_history_is_none() {
        assert!(calculate_stats(&VecDeque::new()).is_none());
        let s = calculate_stats(&VecDeque::from(vec![1.0, 3.0, 2.0])).unwrap();
        assert_eq!((s.min, s.max, s.mean, s.count), (1.0, 3.0, 2.0, 3));
    }
}
