//! Control worker.
//!
//! One `Orchestrator` owns every control loop and runs them in a fixed order
//! each tick:
//!
//! 1. apply queued commands, collect finished calibration jobs, take camera events
//! 2. thermal loop
//! 3. spool loop (closed-loop RPM or cascade setpoint)
//! 4. diameter cascade
//! 5. extrusion stepper, fan
//! 6. notices and the published snapshot
//!
//! Motor calibration takes the spool drive away from the speed loop and runs
//! on its own thread; camera calibration runs inside the camera worker. Both
//! report back through the same channels the tick already drains.

pub mod commands;

use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use log::{debug, error, info, warn};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use thread_priority::{ThreadBuilderExt, ThreadPriority};

pub use commands::{Command, Notice};

use crate::calibration::{
    motor::{calibrate_motor, MotorCalibration},
    store::{self, SharedStore},
};
use crate::config::{DeviceConfig, SpoolMode};
use crate::control::{
    cascade::{feedforward_rpm, DiameterCascade},
    extrusion::ExtrusionDrive,
    fan::FanDrive,
    pid::clamp,
    spool::{MotorModel, MotorSpeedController},
    thermal::ThermalController,
};
use crate::error::{ControlError, ControlResult};
use crate::hardware::{ControlPorts, DeviceHardware, SpoolDrive};
use crate::utils::{
    clock::SharedClock,
    snapshot::{push_capped, shared_snapshot, CalibrationStatus, SharedSnapshot},
    telemetry::TelemetryRings,
};
use crate::vision::{
    diameter::{DiameterEstimator, VisionPipeline},
    worker::{spawn_camera, CameraEvent, CameraLink, CameraRequest, SharedDebugFrames},
};

const COMMAND_CAPACITY: usize = 64;
const NOTICE_CAPACITY: usize = 64;

/// Channels and shared state the orchestrator is wired to.
pub struct OrchestratorWiring {
    pub commands: Receiver<Command>,
    pub notices: Sender<Notice>,
    pub snapshot: SharedSnapshot,
    pub telemetry: TelemetryRings,
    pub camera: CameraLink,
}

type MotorJobResult = Option<(SpoolDrive, ControlResult<MotorCalibration>)>;

struct MotorJob {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<MotorJobResult>,
}

/// Values that changed this tick and feed the snapshot histories.
#[derive(Default)]
struct TickOutputs {
    temperature: Option<f64>,
    rpm: Option<f64>,
    diameters: Vec<f64>,
}

fn startup(what: &'static str) -> impl FnOnce(ControlError) -> ControlError {
    move |e| ControlError::Startup(format!("{}: {}", what, e))
}

pub struct Orchestrator {
    config: DeviceConfig,
    clock: SharedClock,
    store: SharedStore,

    thermal: ThermalController,
    spool: MotorSpeedController,
    cascade: DiameterCascade,
    extruder: ExtrusionDrive,
    fan: FanDrive,
    camera: CameraLink,

    commands: Receiver<Command>,
    notices: Sender<Notice>,
    snapshot: SharedSnapshot,

    started: bool,
    running: bool,
    mode: SpoolMode,
    target_rpm: f64,
    target_diameter_mm: f64,
    extrusion_rpm: f64,
    latest_diameter_mm: f64,
    camera_calibrated: bool,

    motor_job: Option<MotorJob>,
    camera_job: Option<Arc<AtomicBool>>,

    ticks: u64,
    faults: u64,
}

impl Orchestrator {
    /// Build every loop and arm the hardware. Any port failing here aborts
    /// startup with `ControlError::Startup`; no loop has run yet.
    pub fn new(
        ports: ControlPorts,
        config: DeviceConfig,
        clock: SharedClock,
        store: SharedStore,
        wiring: OrchestratorWiring,
    ) -> ControlResult<Self> {
        let ControlPorts {
            thermistor,
            heater,
            spool,
            stepper,
            fan,
        } = ports;
        let OrchestratorWiring {
            commands,
            notices,
            snapshot,
            telemetry,
            camera,
        } = wiring;
        let now = clock.now();

        let mut thermal =
            ThermalController::new(config.thermal.clone(), thermistor, heater, telemetry.thermal.clone());
        let mut spool = MotorSpeedController::new(
            config.spool.clone(),
            spool,
            MotorModel::from_store(store.as_ref()),
            telemetry.spool.clone(),
        );
        let mut extruder =
            ExtrusionDrive::new(config.extrusion.clone(), stepper, telemetry.extrusion.clone());
        let mut fan = FanDrive::new(config.fan.clone(), fan);
        let cascade = DiameterCascade::new(config.cascade.clone(), telemetry.cascade.clone());

        thermal.arm().map_err(startup("heater"))?;
        spool.arm(now).map_err(startup("spool drive"))?;
        extruder.arm().map_err(startup("extrusion stepper"))?;
        fan.start().map_err(startup("fan"))?;

        let camera_calibrated = !store::is_uncalibrated(store.get(store::DIAMETER_COEFFICIENT));

        let mut orchestrator = Self {
            target_rpm: config.spool.setpoint_rpm,
            target_diameter_mm: config.cascade.target_diameter_mm,
            extrusion_rpm: config.extrusion.rpm,
            mode: config.spool_mode,
            config,
            clock,
            store,
            thermal,
            spool,
            cascade,
            extruder,
            fan,
            camera,
            commands,
            notices,
            snapshot,
            started: false,
            running: true,
            latest_diameter_mm: 0.0,
            camera_calibrated,
            motor_job: None,
            camera_job: None,
            ticks: 0,
            faults: 0,
        };

        if !camera_calibrated {
            warn!("[Orchestrator] no camera coefficient stored; diameters use the default scale");
            orchestrator.notify(Notice::CameraUncalibrated);
        }
        info!("[Orchestrator] hardware armed, spool mode {:?}", orchestrator.mode);
        orchestrator.publish(now, TickOutputs::default());
        Ok(orchestrator)
    }

    /// One control tick. Never fails: every subsystem catches its own errors.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        let mut outputs = TickOutputs::default();

        self.drain_commands(now);
        self.poll_motor_job(now);
        self.drain_camera(now, &mut outputs);
        self.sync_spool(now);

        if self.started {
            if self.thermal.update(now).is_some() {
                outputs.temperature = self.thermal.last_sample().map(|s| s.temperature_c);
            }
            if self.update_spool(now).is_some() {
                outputs.rpm = Some(self.spool.last_rpm());
            }
            if self.mode == SpoolMode::DiameterCascade && !self.calibrating() {
                self.cascade
                    .update(now, self.target_diameter_mm, self.extrusion_rpm);
            }
            self.extruder.update(now, self.extrusion_rpm);
        }
        self.fan.apply();

        self.collect_faults();
        self.ticks += 1;
        self.publish(now, outputs);
    }

    /// Tick at the configured interval until `Shutdown` arrives or every
    /// command sender is gone, then drive everything to zero.
    pub fn run(mut self) {
        let interval = self.config.scheduler.tick_interval.as_secs_f64();
        info!("[Orchestrator] control loop running every {:.0} ms", interval * 1_000.0);

        while self.running {
            let tick_start = self.clock.now();
            self.tick();
            let remaining = interval - (self.clock.now() - tick_start);
            if remaining > 0.0 {
                self.clock.sleep(Duration::from_secs_f64(remaining));
            } else {
                debug!("[Orchestrator] tick overran by {:.3} ms", -remaining * 1_000.0);
            }
        }

        self.shutdown();
    }

    /// Cancel calibrations, take the spool drive back and drive every
    /// actuator to zero.
    pub fn shutdown(&mut self) {
        info!("[Orchestrator] shutting down");
        self.running = false;

        if let Some(cancel) = self.camera_job.take() {
            cancel.store(true, Ordering::Relaxed);
        }
        if let Some(job) = self.motor_job.take() {
            job.cancel.store(true, Ordering::Relaxed);
            match job.handle.join() {
                Ok(Some((drive, _))) => self.spool.attach_drive(drive, self.clock.now()),
                Ok(None) => error!("[Orchestrator] motor calibration never received the drive"),
                Err(_) => error!("[Orchestrator] motor calibration panicked; spool drive lost"),
            }
        }

        let now = self.clock.now();
        self.started = false;
        self.spool.disengage();
        self.thermal.stop();
        self.extruder.stop(now);
        self.fan.stop();

        if let Err(e) = self.camera.request(CameraRequest::Stop) {
            debug!("[Orchestrator] camera stop not delivered: {}", e);
        }

        self.publish(now, TickOutputs::default());
        self.notify(Notice::Stopped);
        info!("[Orchestrator] all actuators at zero");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn spool_mode(&self) -> SpoolMode {
        self.mode
    }

    fn calibrating(&self) -> bool {
        self.motor_job.is_some() || self.camera_job.is_some()
    }

    fn drain_commands(&mut self, now: f64) {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.apply(command, now),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.running {
                        info!("[Orchestrator] command surface closed");
                    }
                    self.running = false;
                    break;
                }
            }
        }
    }

    fn apply(&mut self, command: Command, now: f64) {
        debug!("[Orchestrator] command {:?}", command);
        match command {
            Command::StartDevice => {
                if !self.started {
                    self.started = true;
                    self.thermal.start(now);
                    self.extruder.start();
                    self.cascade.reset(now);
                    info!("[Orchestrator] device started");
                }
            }
            Command::StopDevice => {
                if self.started {
                    self.started = false;
                    self.thermal.stop();
                    self.extruder.stop(now);
                    info!("[Orchestrator] device stopped");
                }
            }
            Command::SetSpoolMode(mode) => {
                if mode != self.mode {
                    info!("[Orchestrator] spool mode {:?} -> {:?}", self.mode, mode);
                    self.mode = mode;
                    self.cascade.reset(now);
                    // re-engage from a clean PID in the new mode
                    self.spool.disengage();
                }
            }
            Command::SetTargetDiameter(mm) => {
                if mm > 0.0 && mm.is_finite() {
                    self.target_diameter_mm = mm;
                } else {
                    warn!("[Orchestrator] ignoring target diameter {}", mm);
                }
            }
            Command::SetTargetRpm(rpm) => {
                if rpm.is_finite() {
                    self.target_rpm = rpm.max(0.0);
                } else {
                    warn!("[Orchestrator] ignoring target rpm {}", rpm);
                }
            }
            Command::SetTargetTemperature(celsius) => {
                if celsius.is_finite() {
                    self.thermal.set_setpoint(celsius);
                } else {
                    warn!("[Orchestrator] ignoring target temperature {}", celsius);
                }
            }
            Command::SetExtrusionRpm(rpm) => {
                if rpm.is_finite() {
                    self.extrusion_rpm = rpm.max(0.0);
                } else {
                    warn!("[Orchestrator] ignoring extrusion rpm {}", rpm);
                }
            }
            Command::SetFanDuty(percent) => self.fan.set_duty(percent),
            Command::CalibrateMotor => self.start_motor_calibration(now),
            Command::CalibrateCamera {
                reference_diameter_mm,
            } => self.start_camera_calibration(reference_diameter_mm),
            Command::CancelCalibration => {
                if let Some(job) = &self.motor_job {
                    job.cancel.store(true, Ordering::Relaxed);
                }
                if let Some(cancel) = &self.camera_job {
                    cancel.store(true, Ordering::Relaxed);
                }
            }
            Command::Shutdown => self.running = false,
        }
    }

    fn start_motor_calibration(&mut self, now: f64) {
        if self.motor_job.is_some() {
            warn!("[Orchestrator] motor calibration already running");
            return;
        }

        self.spool.disengage();
        let Some(drive) = self.spool.detach_drive() else {
            error!("[Orchestrator] spool drive unavailable for calibration");
            self.notify(Notice::CalibrationFailed {
                target: "motor",
                message: "spool drive unavailable".into(),
            });
            return;
        };

        let cancel = Arc::new(AtomicBool::new(false));
        let (drive_tx, drive_rx) = bounded::<SpoolDrive>(1);
        let flag = cancel.clone();
        let clock = self.clock.clone();
        let sweep = self.config.calibration.clone();
        let ppr = self.config.spool.pulses_per_revolution;

        let spawned = thread::Builder::new()
            .name("motor-calibration".into())
            .spawn(move || -> MotorJobResult {
                let mut drive = drive_rx.recv().ok()?;
                let result = calibrate_motor(&mut drive, clock.as_ref(), &sweep, ppr, &flag);
                Some((drive, result))
            });

        match spawned {
            Ok(handle) => match drive_tx.send(drive) {
                Ok(()) => {
                    info!("[Orchestrator] motor calibration started; speed loop suspended");
                    self.motor_job = Some(MotorJob { cancel, handle });
                }
                Err(returned) => {
                    error!("[Orchestrator] motor calibration thread exited early");
                    self.spool.attach_drive(returned.into_inner(), now);
                }
            },
            Err(e) => {
                error!("[Orchestrator] could not spawn motor calibration: {}", e);
                self.spool.attach_drive(drive, now);
                self.notify(Notice::CalibrationFailed {
                    target: "motor",
                    message: e.to_string(),
                });
            }
        }
    }

    fn poll_motor_job(&mut self, now: f64) {
        if !self
            .motor_job
            .as_ref()
            .is_some_and(|job| job.handle.is_finished())
        {
            return;
        }
        let Some(job) = self.motor_job.take() else {
            return;
        };

        let (drive, result) = match job.handle.join() {
            Ok(Some(finished)) => finished,
            Ok(None) => {
                error!("[Orchestrator] motor calibration never received the drive");
                return;
            }
            Err(_) => {
                error!("[Orchestrator] motor calibration panicked; spool drive lost");
                self.notify(Notice::CalibrationFailed {
                    target: "motor",
                    message: "calibration thread panicked".into(),
                });
                return;
            }
        };
        self.spool.attach_drive(drive, now);

        match result {
            Ok(calibration) => {
                let model = calibration.model;
                if let Err(e) = model.persist(self.store.as_ref()) {
                    error!("[Orchestrator] motor model not persisted: {}", e);
                }
                self.spool.apply_calibration(model);
                self.notify(Notice::MotorCalibrated {
                    slope: model.slope,
                    intercept: model.intercept,
                });
            }
            Err(ControlError::Canceled) => {
                info!("[Orchestrator] motor calibration canceled");
                self.notify(Notice::CalibrationCanceled { target: "motor" });
            }
            Err(e) => {
                error!("[Orchestrator] motor calibration failed: {}", e);
                self.notify(Notice::CalibrationFailed {
                    target: "motor",
                    message: e.to_string(),
                });
            }
        }
    }

    fn start_camera_calibration(&mut self, reference_mm: f64) {
        if self.camera_job.is_some() {
            warn!("[Orchestrator] camera calibration already running");
            return;
        }
        let cancel = Arc::new(AtomicBool::new(false));
        let request = CameraRequest::Calibrate {
            reference_mm,
            cancel: cancel.clone(),
        };
        match self.camera.request(request) {
            Ok(()) => {
                info!("[Orchestrator] camera calibration requested ({:.4} mm)", reference_mm);
                self.camera_job = Some(cancel);
            }
            Err(e) => {
                error!("[Orchestrator] {}", e);
                self.notify(Notice::CalibrationFailed {
                    target: "camera",
                    message: e.to_string(),
                });
            }
        }
    }

    fn drain_camera(&mut self, now: f64, outputs: &mut TickOutputs) {
        for event in self.camera.drain() {
            match event {
                CameraEvent::Measurement(m) => {
                    // frames taken before the calibration request used the old scale
                    if self.camera_job.is_some() || !m.is_valid() {
                        continue;
                    }
                    self.latest_diameter_mm = m.diameter_mm;
                    self.cascade.push_measurement(m.diameter_mm);
                    outputs.diameters.push(m.diameter_mm);
                }
                CameraEvent::Calibrated(result) => {
                    self.camera_job = None;
                    match result {
                        Ok(coefficient) => {
                            self.camera_calibrated = true;
                            self.cascade.reset(now);
                            self.notify(Notice::CameraCalibrated { coefficient });
                        }
                        Err(ControlError::Canceled) => {
                            self.notify(Notice::CalibrationCanceled { target: "camera" })
                        }
                        Err(e) => self.notify(Notice::CalibrationFailed {
                            target: "camera",
                            message: e.to_string(),
                        }),
                    }
                }
            }
        }
    }

    /// Engage the speed loop exactly when the device runs in a spool mode and
    /// owns the drive.
    fn sync_spool(&mut self, now: f64) {
        let wanted = self.started && self.mode != SpoolMode::Off && self.motor_job.is_none();
        if wanted && !self.spool.is_engaged() {
            self.spool.engage(now);
        } else if !wanted && self.spool.is_engaged() {
            self.spool.disengage();
        }
    }

    fn update_spool(&mut self, now: f64) -> Option<f64> {
        match self.mode {
            SpoolMode::Off => return None,
            SpoolMode::ClosedLoopRpm => self.spool.set_setpoint(self.target_rpm),
            SpoolMode::DiameterCascade => {
                let setpoint = self.cascade.last_setpoint().unwrap_or_else(|| {
                    let cascade = &self.config.cascade;
                    let ff = feedforward_rpm(cascade, self.extrusion_rpm, self.target_diameter_mm);
                    clamp(ff, 0.0, cascade.max_spool_rpm)
                });
                self.spool.set_setpoint(setpoint);
            }
        }
        let duty = self.spool.update(now);
        if self.spool.take_uncalibrated_notice() {
            self.notify(Notice::MotorUncalibrated);
        }
        duty
    }

    fn collect_faults(&mut self) {
        if let Some(message) = self.thermal.take_fault() {
            self.faults += 1;
            self.notify(Notice::SensorFault {
                subsystem: "thermal",
                message,
            });
        }
        if let Some(message) = self.spool.take_fault() {
            self.faults += 1;
            self.notify(Notice::SensorFault {
                subsystem: "spool",
                message,
            });
        }
    }

    fn notify(&self, notice: Notice) {
        match self.notices.try_send(notice) {
            Ok(()) => {}
            Err(TrySendError::Full(notice)) => {
                warn!("[Orchestrator] notice queue full, dropped: {}", notice)
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn publish(&self, now: f64, outputs: TickOutputs) {
        let motor_calibration = if self.motor_job.is_some() {
            CalibrationStatus::InProgress
        } else if self.spool.is_calibrated() {
            CalibrationStatus::Calibrated
        } else {
            CalibrationStatus::Missing
        };
        let camera_calibration = if self.camera_job.is_some() {
            CalibrationStatus::InProgress
        } else if self.camera_calibrated {
            CalibrationStatus::Calibrated
        } else {
            CalibrationStatus::Missing
        };

        let mut s = self.snapshot.write();
        s.time = now;
        s.started = self.started;
        s.spool_mode = self.mode;
        if let Some(sample) = self.thermal.last_sample() {
            s.temperature_c = sample.temperature_c;
        }
        s.target_temperature_c = self.thermal.setpoint();
        s.heater_output = self.thermal.last_output();
        s.spool_rpm = self.spool.last_rpm();
        s.spool_setpoint_rpm = self.spool.setpoint();
        s.spool_duty = self.spool.last_duty();
        s.extrusion_rpm = self.extruder.rpm();
        s.fan_duty = self.fan.duty();
        s.diameter_mm = self.latest_diameter_mm;
        s.target_diameter_mm = self.target_diameter_mm;
        s.motor_calibration = motor_calibration;
        s.camera_calibration = camera_calibration;
        s.ticks = self.ticks;
        s.faults = self.faults;

        if let Some(t) = outputs.temperature {
            push_capped(&mut s.temperature_history, t);
        }
        if let Some(rpm) = outputs.rpm {
            push_capped(&mut s.rpm_history, rpm);
        }
        for d in outputs.diameters {
            push_capped(&mut s.diameter_history, d);
        }
    }
}

/// Command surface of a running device.
pub struct DeviceHandle {
    pub commands: Sender<Command>,
    pub notices: Receiver<Notice>,
    pub snapshot: SharedSnapshot,
    pub debug_frames: SharedDebugFrames,
    pub telemetry: TelemetryRings,
    control: JoinHandle<()>,
    camera: JoinHandle<()>,
}

impl DeviceHandle {
    /// Queue a command for the next tick. False once the worker has exited.
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Every notice raised since the last call.
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.try_iter().collect()
    }

    /// Request shutdown and wait for both workers.
    pub fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if self.control.join().is_err() {
            error!("[Orchestrator] control thread panicked");
        }
        if self.camera.join().is_err() {
            error!("[Camera] worker panicked");
        }
    }
}

fn pin_to_core(core: usize) {
    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
    match core_ids.get(core) {
        Some(id) if core_affinity::set_for_current(*id) => {
            info!("[Orchestrator] control thread pinned to core {}", core)
        }
        Some(_) => error!("[Orchestrator] failed to pin control thread to core {}", core),
        None => error!("[Orchestrator] core {} not among available cores", core),
    }
}

/// Arm the hardware and start the camera and control workers.
pub fn spawn_device(
    hardware: DeviceHardware,
    config: DeviceConfig,
    clock: SharedClock,
    store: SharedStore,
) -> ControlResult<DeviceHandle> {
    let DeviceHardware { control, camera } = hardware;
    let (command_tx, command_rx) = bounded::<Command>(COMMAND_CAPACITY);
    let (notice_tx, notice_rx) = bounded::<Notice>(NOTICE_CAPACITY);
    let snapshot = shared_snapshot();
    let telemetry = TelemetryRings::default();

    let stored = store.get(store::DIAMETER_COEFFICIENT);
    let coefficient = if store::is_uncalibrated(stored) {
        config.vision.default_coefficient
    } else {
        stored
    };
    let estimator = DiameterEstimator::new(
        VisionPipeline::new(config.vision.clone()),
        coefficient,
        telemetry.diameter.clone(),
    );
    let camera_worker = spawn_camera(
        camera,
        estimator,
        clock.clone(),
        store.clone(),
        config.vision.capture_interval,
        config.calibration.camera_frames,
    )?;

    let wiring = OrchestratorWiring {
        commands: command_rx,
        notices: notice_tx,
        snapshot: snapshot.clone(),
        telemetry: telemetry.clone(),
        camera: camera_worker.link,
    };
    let scheduler = config.scheduler.clone();
    let orchestrator = match Orchestrator::new(control, config, clock, store, wiring) {
        Ok(o) => o,
        Err(e) => {
            // the camera link was dropped with the wiring, so the worker exits
            let _ = camera_worker.handle.join();
            return Err(e);
        }
    };

    let body = move || {
        if let Some(core) = scheduler.pin_core {
            pin_to_core(core);
        }
        orchestrator.run();
    };
    let builder = thread::Builder::new().name("control".into());
    let spawned = if scheduler.raise_priority {
        builder.spawn_with_priority(ThreadPriority::Max, move |priority| {
            if let Err(e) = priority {
                warn!("[Orchestrator] running at default priority: {:?}", e);
            }
            body()
        })
    } else {
        builder.spawn(body)
    };
    let control = spawned.map_err(|e| ControlError::Startup(format!("control thread: {}", e)))?;

    Ok(DeviceHandle {
        commands: command_tx,
        notices: notice_rx,
        snapshot,
        debug_frames: camera_worker.debug_frames,
        telemetry,
        control,
        camera: camera_worker.handle,
    })
}
