//! Telemetry export.
//!
//! - `spawn_exporter`: background thread draining every subsystem ring into
//!   its own CSV file (`thermal.csv`, `spool.csv`, `cascade.csv`,
//!   `diameter.csv`, `extrusion.csv`), one row per control step.
//! - `write_summary`: min/max/mean of the snapshot histories for one run.

use csv::Writer;
use log::{error, info, warn};
use serde::Serialize;
use std::{
    fs::{create_dir_all, File},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::error::{ControlError, ControlResult};
use crate::utils::{
    snapshot::{calculate_stats, DeviceSnapshot},
    telemetry::{
        CascadeRecord, DiameterRecord, ExtrusionRecord, SpoolRecord, TelemetryRing, TelemetryRings,
        ThermalRecord,
    },
};

/// One ring bound to its CSV file.
struct RingSink<T> {
    ring: TelemetryRing<T>,
    writer: Writer<File>,
    rows: u64,
}

impl<T: Serialize> RingSink<T> {
    fn open(dir: &Path, name: &str, ring: TelemetryRing<T>) -> ControlResult<Self> {
        let path = dir.join(name);
        let writer = Writer::from_path(&path)?;
        Ok(Self { ring, writer, rows: 0 })
    }

    fn drain(&mut self) {
        for row in self.ring.drain() {
            match self.writer.serialize(&row) {
                Ok(()) => self.rows += 1,
                Err(e) => error!("[Export] row dropped: {}", e),
            }
        }
        if let Err(e) = self.writer.flush() {
            error!("[Export] flush failed: {}", e);
        }
    }
}

struct Sinks {
    thermal: RingSink<ThermalRecord>,
    spool: RingSink<SpoolRecord>,
    cascade: RingSink<CascadeRecord>,
    diameter: RingSink<DiameterRecord>,
    extrusion: RingSink<ExtrusionRecord>,
}

impl Sinks {
    fn open(dir: &Path, rings: TelemetryRings) -> ControlResult<Self> {
        Ok(Self {
            thermal: RingSink::open(dir, "thermal.csv", rings.thermal)?,
            spool: RingSink::open(dir, "spool.csv", rings.spool)?,
            cascade: RingSink::open(dir, "cascade.csv", rings.cascade)?,
            diameter: RingSink::open(dir, "diameter.csv", rings.diameter)?,
            extrusion: RingSink::open(dir, "extrusion.csv", rings.extrusion)?,
        })
    }

    fn drain(&mut self) {
        self.thermal.drain();
        self.spool.drain();
        self.cascade.drain();
        self.diameter.drain();
        self.extrusion.drain();
    }

    fn overwritten(&self) -> u64 {
        self.thermal.ring.overwritten()
            + self.spool.ring.overwritten()
            + self.cascade.ring.overwritten()
            + self.diameter.ring.overwritten()
            + self.extrusion.ring.overwritten()
    }
}

pub struct TelemetryExporter {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl TelemetryExporter {
    /// Stop after one last drain and wait for the files to be flushed.
    pub fn finish(self) {
        self.running.store(false, Ordering::Relaxed);
        if self.handle.join().is_err() {
            error!("[Export] exporter thread panicked");
        }
    }
}

/// Create `dir` and start draining `rings` into it every `interval`.
pub fn spawn_exporter(
    dir: impl Into<PathBuf>,
    rings: TelemetryRings,
    interval: Duration,
) -> ControlResult<TelemetryExporter> {
    let dir = dir.into();
    create_dir_all(&dir).map_err(|e| ControlError::Store(format!("{}: {}", dir.display(), e)))?;
    let mut sinks = Sinks::open(&dir, rings)?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    let handle = thread::Builder::new()
        .name("telemetry-export".into())
        .spawn(move || {
            while flag.load(Ordering::Relaxed) {
                sinks.drain();
                thread::sleep(interval);
            }
            sinks.drain();

            let lost = sinks.overwritten();
            if lost > 0 {
                warn!("[Export] {} row(s) overwritten before export", lost);
            }
            info!(
                "[Export] wrote {} thermal, {} spool, {} cascade, {} diameter, {} extrusion row(s) to {}",
                sinks.thermal.rows,
                sinks.spool.rows,
                sinks.cascade.rows,
                sinks.diameter.rows,
                sinks.extrusion.rows,
                dir.display()
            );
        })
        .map_err(|e| ControlError::Startup(format!("exporter thread: {}", e)))?;

    Ok(TelemetryExporter { running, handle })
}

/// Write `metric,value,description` rows summarising the snapshot histories.
pub fn write_summary(path: impl AsRef<Path>, snapshot: &DeviceSnapshot) -> ControlResult<()> {
    let mut writer = Writer::from_path(path.as_ref())?;
    writer.write_record(["metric", "value", "description"])?;

    let histories = [
        ("temperature_c", &snapshot.temperature_history, "die temperature"),
        ("spool_rpm", &snapshot.rpm_history, "measured spool speed"),
        ("diameter_mm", &snapshot.diameter_history, "measured fiber diameter"),
    ];
    for (name, history, description) in histories {
        let Some(stats) = calculate_stats(history) else {
            continue;
        };
        for (suffix, value) in [("min", stats.min), ("max", stats.max), ("avg", stats.mean)] {
            writer.write_record([
                format!("{}_{}", name, suffix),
                format!("{:.4}", value),
                format!("{} {}", suffix, description),
            ])?;
        }
        writer.write_record([
            format!("{}_samples", name),
            stats.count.to_string(),
            format!("{} samples", description),
        ])?;
    }

    writer.write_record(["ticks".to_string(), snapshot.ticks.to_string(), "control ticks".to_string()])?;
    writer.write_record(["faults".to_string(), snapshot.faults.to_string(), "sensor faults reported".to_string()])?;
    writer
        .flush()
        .map_err(|e| ControlError::Store(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fiberline-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn exporter_writes_every_ring_on_finish() {
        let dir = scratch("export");
        let rings = TelemetryRings::default();
        let exporter = spawn_exporter(&dir, rings.clone(), Duration::from_millis(5)).unwrap();

        rings.extrusion.record(ExtrusionRecord { time: 0.05, rpm: 30.0, step_frequency: 100.0 });
        rings.extrusion.record(ExtrusionRecord { time: 0.10, rpm: 0.0, step_frequency: 0.0 });
        exporter.finish();

        let text = std::fs::read_to_string(dir.join("extrusion.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "time,rpm,step_frequency");
        assert_eq!(lines.len(), 3);
        assert!(dir.join("thermal.csv").exists());
        assert!(rings.extrusion.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn summary_skips_empty_histories() {
        let dir = scratch("summary");
        create_dir_all(&dir).unwrap();
        let path = dir.join("summary.csv");
        let snapshot = DeviceSnapshot {
            temperature_history: VecDeque::from(vec![20.0, 30.0]),
            ticks: 7,
            ..DeviceSnapshot::default()
        };

        write_summary(&path, &snapshot).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("temperature_c_avg,25.0000"));
        assert!(!text.contains("spool_rpm"));
        assert!(text.contains("ticks,7"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
