//! Telemetry records and per-subsystem ring buffers.
//!
//! Two independent paths, one for export and one for display:
//! - **TelemetryRing:** bounded lock-free queue per subsystem, one row per
//!   control step, drained by the CSV exporter. When full the oldest row is
//!   overwritten, so memory never grows with run length.
//! - **DeviceSnapshot:** latest values + short histories for display readers
//!   (see `snapshot.rs`).

use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

pub const RING_CAPACITY: usize = 4_096;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThermalRecord {
    pub time: f64,
    pub delta_time: f64,
    pub voltage: f64,
    pub temperature: f64,
    pub setpoint: f64,
    pub error: f64,
    pub output: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpoolRecord {
    pub time: f64,
    pub delta_time: f64,
    pub position: u32,
    pub rpm: f64,
    pub setpoint_rpm: f64,
    pub error: f64,
    pub pid_output: f64,
    pub duty_cycle: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub calibrated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CascadeRecord {
    pub time: f64,
    pub delta_time: f64,
    pub target_diameter: f64,
    pub measured_diameter: f64,
    pub error: f64,
    pub feedforward_rpm: f64,
    pub trim_rpm: f64,
    pub setpoint_rpm: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiameterRecord {
    pub time: f64,
    pub delta_time: f64,
    pub pixel_width: f64,
    pub diameter_mm: f64,
    pub lines: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtrusionRecord {
    pub time: f64,
    pub rpm: f64,
    pub step_frequency: f64,
}

/// Append-only ring for one subsystem.
///
/// `record()` never blocks; clones share the same queue so the owning loop
/// writes and the exporter drains.
pub struct TelemetryRing<T> {
    queue: Arc<ArrayQueue<T>>,
    overwritten: Arc<AtomicU64>,
}

impl<T> TelemetryRing<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
            overwritten: Arc::new(AtomicU64::new(0)),
        }
    }

    #[inline]
    pub fn record(&self, row: T) {
        if self.queue.force_push(row).is_some() {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove and return every buffered row, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let mut rows = Vec::with_capacity(self.queue.len());
        while let Some(row) = self.queue.pop() {
            rows.push(row);
        }
        rows
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Rows lost because the exporter fell behind.
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}

impl<T> Default for TelemetryRing<T> {
    fn default() -> Self {
        Self::new(RING_CAPACITY)
    }
}

impl<T> Clone for TelemetryRing<T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            overwritten: self.overwritten.clone(),
        }
    }
}

/// Handles to every subsystem ring, given to the exporter.
#[derive(Clone, Default)]
pub struct TelemetryRings {
    pub thermal: TelemetryRing<ThermalRecord>,
    pub spool: TelemetryRing<SpoolRecord>,
    pub cascade: TelemetryRing<CascadeRecord>,
    pub diameter: TelemetryRing<DiameterRecord>,
    pub extrusion: TelemetryRing<ExtrusionRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(time: f64) -> ExtrusionRecord {
        ExtrusionRecord { time, rpm: 30.0, step_frequency: 100.0 }
    }

    #[test]
    fn ring_overwrites_oldest_when_full() {
        let ring = TelemetryRing::new(3);
        for t in 0..5 {
            ring.record(row(t as f64));
        }
        assert_eq!(ring.overwritten(), 2);
        let times: Vec<f64> = ring.drain().iter().map(|r| r.time).collect();
        assert_eq!(times, vec![2.0, 3.0, 4.0]);
        assert!(ring.is_empty());
    }

    #[test]
    fn clones_share_the_same_buffer() {
        let writer = TelemetryRing::new(8);
        let reader = writer.clone();
        writer.record(row(1.0));
        assert_eq!(reader.len(), 1);
        assert_eq!(reader.drain()[0].time, 1.0);
        assert!(writer.is_empty());
    }
}
