//! # Fiber extrusion controller
//!
//! Runs the control engine against the simulated device with an interactive
//! command menu. Calibration values persist in `data/calibration.csv`; per-step
//! telemetry is exported to `data/telemetry/`, and a run summary is written to
//! `data/summary.csv` on exit.
//!
//! Set `RUST_LOG=info` (or `debug`) for the controller logs.

use fiberline::{
    calibration::store::{CsvStore, SharedStore},
    config::{DeviceConfig, SpoolMode},
    hardware::sim::SimulatedDevice,
    orchestrator::{spawn_device, Command, DeviceHandle, Notice},
    utils::{
        clock::MonotonicClock,
        export::{spawn_exporter, write_summary},
        snapshot::CalibrationStatus,
    },
};
use log::{error, info};
use parking_lot::Mutex;
use std::{
    fs::create_dir_all,
    io::{stdin, stdout, Write},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

const DATA_DIR: &str = "data";
const EXPORT_INTERVAL: Duration = Duration::from_millis(250);
const SIM_SEED: u64 = 7;

fn main() -> ExitCode {
    env_logger::init();
    info!("=== FIBERLINE START ===");

    if let Err(e) = create_dir_all(DATA_DIR) {
        error!("[Main] cannot create {}: {}", DATA_DIR, e);
        return ExitCode::FAILURE;
    }
    let store: SharedStore = match CsvStore::open(format!("{}/calibration.csv", DATA_DIR)) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("[Main] calibration store: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let config = DeviceConfig::default();
    let clock = MonotonicClock::shared();
    let mut device = SimulatedDevice::new(clock.clone(), config.thermal.thermistor.clone(), SIM_SEED);
    let reference_wire = device.reference_wire.clone();
    let Some(hardware) = device.hardware() else {
        error!("[Main] simulated hardware already in use");
        return ExitCode::FAILURE;
    };

    let handle = match spawn_device(hardware, config, clock, store) {
        Ok(handle) => handle,
        Err(e) => {
            error!("[Main] startup aborted: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let exporter = match spawn_exporter(
        format!("{}/telemetry", DATA_DIR),
        handle.telemetry.clone(),
        EXPORT_INTERVAL,
    ) {
        Ok(exporter) => Some(exporter),
        Err(e) => {
            error!("[Main] telemetry export disabled: {}", e);
            None
        }
    };

    loop {
        print_notices(&handle, &reference_wire);
        let choice = prompt_menu();
        let command = match choice.as_str() {
            "1" => Some(Command::StartDevice),
            "2" => Some(Command::StopDevice),
            "3" => prompt_spool_mode().map(Command::SetSpoolMode),
            "4" => prompt_number("Target temperature [C]").map(Command::SetTargetTemperature),
            "5" => prompt_number("Target spool speed [rpm]").map(Command::SetTargetRpm),
            "6" => prompt_number("Target diameter [mm]").map(Command::SetTargetDiameter),
            "7" => prompt_number("Extrusion speed [rpm]").map(Command::SetExtrusionRpm),
            "8" => prompt_number("Fan duty [%]").map(Command::SetFanDuty),
            "9" => Some(Command::CalibrateMotor),
            "10" => prompt_number("Reference wire diameter [mm]").map(|mm| {
                // the simulated camera sees the wire until calibration reports back
                *reference_wire.lock() = Some(mm);
                Command::CalibrateCamera {
                    reference_diameter_mm: mm,
                }
            }),
            "11" => Some(Command::CancelCalibration),
            "12" | "" => {
                print_status(&handle);
                None
            }
            "0" => break,
            other => {
                println!("Unrecognized option '{}', please try again.", other);
                None
            }
        };

        if let Some(command) = command {
            if !handle.send(command) {
                error!("[Main] control worker is gone");
                break;
            }
        }
    }

    let snapshot = handle.snapshot.read().clone();
    handle.shutdown();
    if let Some(exporter) = exporter {
        exporter.finish();
    }
    match write_summary(format!("{}/summary.csv", DATA_DIR), &snapshot) {
        Ok(()) => println!("Summary written to {}/summary.csv", DATA_DIR),
        Err(e) => error!("[Main] summary: {}", e),
    }

    println!("Exiting. Goodbye!");
    info!("=== FIBERLINE FINISHED ===");
    ExitCode::SUCCESS
}

fn prompt_menu() -> String {
    println!("\n┌─────────────────────────────────────────────┐");
    println!("│     FIBER EXTRUSION CONTROL                 │");
    println!("├─────────────────────────────────────────────┤");
    println!("│  1) Start device      2) Stop device        │");
    println!("│  3) Spool mode        4) Target temperature │");
    println!("│  5) Target rpm        6) Target diameter    │");
    println!("│  7) Extrusion rpm     8) Fan duty           │");
    println!("│  9) Calibrate motor  10) Calibrate camera   │");
    println!("│ 11) Cancel calibration                      │");
    println!("│ 12) Status            0) Exit               │");
    println!("└─────────────────────────────────────────────┘");
    print!("Select (default: 12): ");
    let _ = stdout().flush();

    let mut input = String::new();
    let _ = stdin().read_line(&mut input);
    input.trim().to_string()
}

fn prompt_number(label: &str) -> Option<f64> {
    print!("{}: ", label);
    let _ = stdout().flush();
    let mut input = String::new();
    let _ = stdin().read_line(&mut input);
    match input.trim().parse::<f64>() {
        Ok(value) => Some(value),
        Err(_) => {
            println!("Not a number, ignored.");
            None
        }
    }
}

fn prompt_spool_mode() -> Option<SpoolMode> {
    print!("Spool mode [0=off, 1=closed-loop rpm, 2=diameter cascade]: ");
    let _ = stdout().flush();
    let mut input = String::new();
    let _ = stdin().read_line(&mut input);
    match input.trim() {
        "0" => Some(SpoolMode::Off),
        "1" => Some(SpoolMode::ClosedLoopRpm),
        "2" => Some(SpoolMode::DiameterCascade),
        other => {
            println!("Unknown mode '{}', ignored.", other);
            None
        }
    }
}

fn print_notices(handle: &DeviceHandle, reference_wire: &Mutex<Option<f64>>) {
    for notice in handle.notices() {
        if matches!(
            notice,
            Notice::CameraCalibrated { .. }
                | Notice::CalibrationCanceled { target: "camera" }
                | Notice::CalibrationFailed { target: "camera", .. }
        ) {
            *reference_wire.lock() = None;
        }
        println!(">> {}", notice);
    }
}

fn status_label(status: CalibrationStatus) -> &'static str {
    match status {
        CalibrationStatus::Missing => "missing",
        CalibrationStatus::Calibrated => "ok",
        CalibrationStatus::InProgress => "running",
    }
}

fn print_status(handle: &DeviceHandle) {
    let s = handle.snapshot.read();
    println!("t={:.1}s  started={}  mode={:?}  ticks={}  faults={}", s.time, s.started, s.spool_mode, s.ticks, s.faults);
    println!(
        "die      {:7.2} C   target {:7.2} C   heater {:5.1} %",
        s.temperature_c, s.target_temperature_c, s.heater_output
    );
    println!(
        "spool    {:7.2} rpm target {:7.2} rpm duty   {:5.1} %",
        s.spool_rpm, s.spool_setpoint_rpm, s.spool_duty
    );
    println!(
        "fiber    {:7.4} mm  target {:7.4} mm",
        s.diameter_mm, s.target_diameter_mm
    );
    println!("extruder {:7.2} rpm fan {:5.1} %", s.extrusion_rpm, s.fan_duty);
    println!(
        "calibration: motor {}, camera {}",
        status_label(s.motor_calibration),
        status_label(s.camera_calibration)
    );
}
