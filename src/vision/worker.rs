//! worker.rs
//! Camera thread.
//!
//! Captures on its own cadence (`capture_interval`) so a slow frame never
//! delays the control tick, and forwards each measurement to the
//! orchestrator over a bounded channel. Camera calibration runs here too,
//! since it needs exclusive use of the frame source; live measurements pause
//! while it runs.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::{
    sync::{atomic::AtomicBool, Arc},
    thread::{self, JoinHandle},
    time::Duration,
};

use super::diameter::{DebugFrames, DiameterEstimator, DiameterMeasurement};
use crate::calibration::{
    camera::calibrate_camera,
    store::{self, SharedStore},
};
use crate::error::{ControlError, ControlResult, HardwareError};
use crate::hardware::FrameSource;
use crate::utils::clock::SharedClock;

const EVENT_CAPACITY: usize = 64;
const REQUEST_CAPACITY: usize = 8;

pub enum CameraRequest {
    Calibrate {
        reference_mm: f64,
        cancel: Arc<AtomicBool>,
    },
    Stop,
}

#[derive(Debug)]
pub enum CameraEvent {
    Measurement(DiameterMeasurement),
    /// New mm/pixel coefficient, already persisted and in use.
    Calibrated(ControlResult<f64>),
}

/// Latest debug frames for the display; written by the camera thread only.
pub type SharedDebugFrames = Arc<RwLock<DebugFrames>>;

/// Orchestrator side of the camera channels.
pub struct CameraLink {
    requests: Sender<CameraRequest>,
    events: Receiver<CameraEvent>,
}

impl CameraLink {
    pub fn new(requests: Sender<CameraRequest>, events: Receiver<CameraEvent>) -> Self {
        Self { requests, events }
    }

    pub fn request(&self, request: CameraRequest) -> ControlResult<()> {
        self.requests
            .try_send(request)
            .map_err(|e| ControlError::Calibration(format!("camera worker unavailable: {}", e)))
    }

    /// Every event received since the last call.
    pub fn drain(&self) -> Vec<CameraEvent> {
        self.events.try_iter().collect()
    }
}

pub struct CameraWorker {
    pub link: CameraLink,
    pub debug_frames: SharedDebugFrames,
    pub handle: JoinHandle<()>,
}

struct CameraLoop {
    source: Box<dyn FrameSource>,
    estimator: DiameterEstimator,
    clock: SharedClock,
    store: SharedStore,
    calibration_frames: usize,
    events: Sender<CameraEvent>,
    debug_frames: SharedDebugFrames,
}

impl CameraLoop {
    fn capture_once(&mut self) {
        match self.source.capture() {
            Ok(frame) => {
                let (measurement, debug) = self.estimator.estimate(&frame, self.clock.now());
                *self.debug_frames.write() = debug;
                self.emit(CameraEvent::Measurement(measurement));
            }
            Err(HardwareError::FrameUnavailable) => debug!("[Camera] no frame this cycle"),
            Err(e) => warn!("[Camera] capture failed: {}", e),
        }
    }

    fn calibrate(&mut self, reference_mm: f64, cancel: &AtomicBool) {
        info!("[Camera] calibrating against {:.4} mm reference", reference_mm);
        let result = calibrate_camera(
            self.source.as_mut(),
            self.estimator.pipeline(),
            self.calibration_frames,
            reference_mm,
            cancel,
        )
        .and_then(|coefficient| {
            self.store.set(store::DIAMETER_COEFFICIENT, coefficient)?;
            self.estimator.set_coefficient(coefficient);
            Ok(coefficient)
        });
        if let Err(e) = &result {
            error!("[Camera] calibration ended: {}", e);
        }
        self.emit(CameraEvent::Calibrated(result));
    }

    fn emit(&self, event: CameraEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            // orchestrator is behind; a dropped measurement is replaced by the next one
            Err(TrySendError::Full(CameraEvent::Measurement(_))) => {
                debug!("[Camera] event queue full, measurement dropped")
            }
            Err(TrySendError::Full(event)) => {
                // calibration results must arrive
                if self.events.send(event).is_err() {
                    warn!("[Camera] orchestrator gone, calibration result lost");
                }
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Spawn the camera thread. It stops on `CameraRequest::Stop` or when the
/// orchestrator drops its `CameraLink`.
pub fn spawn_camera(
    source: Box<dyn FrameSource>,
    estimator: DiameterEstimator,
    clock: SharedClock,
    store: SharedStore,
    capture_interval: Duration,
    calibration_frames: usize,
) -> ControlResult<CameraWorker> {
    let (request_tx, request_rx) = bounded::<CameraRequest>(REQUEST_CAPACITY);
    let (event_tx, event_rx) = bounded::<CameraEvent>(EVENT_CAPACITY);
    let debug_frames: SharedDebugFrames = Arc::new(RwLock::new(DebugFrames::default()));

    let mut camera = CameraLoop {
        source,
        estimator,
        clock,
        store,
        calibration_frames,
        events: event_tx,
        debug_frames: debug_frames.clone(),
    };

    let handle = thread::Builder::new()
        .name("camera".into())
        .spawn(move || {
            info!("[Camera] worker started, every {:?}", capture_interval);
            loop {
                camera.capture_once();
                match request_rx.recv_timeout(capture_interval) {
                    Ok(CameraRequest::Calibrate { reference_mm, cancel }) => {
                        camera.calibrate(reference_mm, &cancel)
                    }
                    Ok(CameraRequest::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
            info!("[Camera] worker stopped");
        })
        .map_err(|e| ControlError::Startup(format!("camera thread: {}", e)))?;

    Ok(CameraWorker {
        link: CameraLink::new(request_tx, event_rx),
        debug_frames,
        handle,
    })
}
