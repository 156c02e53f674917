//! Full device on real threads: camera worker, control worker, exporter.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use fiberline::{
    calibration::store::MemoryStore,
    config::DeviceConfig,
    error::ControlError,
    hardware::sim::SimulatedDevice,
    orchestrator::{spawn_device, Command, Notice},
    utils::{clock::MonotonicClock, export::spawn_exporter},
};

fn test_config() -> DeviceConfig {
    let mut config = DeviceConfig::default();
    config.scheduler.raise_priority = false;
    config.vision.capture_interval = Duration::from_millis(20);
    config
}

fn eventually(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn device_runs_measures_and_shuts_down() {
    let clock = MonotonicClock::shared();
    let config = test_config();
    let mut sim = SimulatedDevice::new(clock.clone(), config.thermal.thermistor.clone(), 5);
    let hardware = sim.hardware().unwrap();
    assert!(sim.hardware().is_none());

    let handle = spawn_device(hardware, config, clock, Arc::new(MemoryStore::new())).unwrap();
    let notices = handle.notices.clone();
    let dir = std::env::temp_dir().join(format!("fiberline-device-{}", std::process::id()));
    let exporter = spawn_exporter(&dir, handle.telemetry.clone(), Duration::from_millis(20)).unwrap();

    assert!(handle.send(Command::StartDevice));
    assert!(eventually(|| handle.snapshot.read().ticks > 5));
    assert!(eventually(|| !handle.debug_frames.read().lines.is_empty()));
    // uncalibrated scale: the reading is in pixels
    assert!(eventually(|| handle.snapshot.read().diameter_mm > 0.0));
    assert!(eventually(|| sim.die.heater() > 0.0));

    handle.shutdown();
    exporter.finish();

    let received: Vec<Notice> = notices.try_iter().collect();
    assert_eq!(received.first(), Some(&Notice::CameraUncalibrated));
    assert_eq!(received.last(), Some(&Notice::Stopped));
    assert_eq!(sim.die.heater(), 0.0);
    assert_eq!(sim.motor.duty(), 0.0);
    assert_eq!(sim.fan.state().duty, 0.0);

    let thermal = std::fs::read_to_string(dir.join("thermal.csv")).unwrap();
    assert!(thermal.lines().count() > 1);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn startup_failure_is_reported_before_any_loop_runs() {
    let clock = MonotonicClock::shared();
    let config = test_config();
    let mut sim = SimulatedDevice::new(clock.clone(), config.thermal.thermistor.clone(), 5);
    sim.motor.set_present(false);

    let result = spawn_device(sim.hardware().unwrap(), config, clock, Arc::new(MemoryStore::new()));
    assert!(matches!(result, Err(ControlError::Startup(_))));
    assert_eq!(sim.die.heater(), 0.0);
}
