//! Camera scale calibration: mm per pixel from a reference wire.

use average::Mean;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ControlError, ControlResult};
use crate::hardware::FrameSource;
use crate::vision::diameter::VisionPipeline;

/// `reference / mean(valid widths)`. Zero and non-finite widths are dropped;
/// with nothing left the mean defaults to 1 px, so the coefficient equals the
/// reference diameter.
pub fn coefficient_from_samples(reference_mm: f64, pixel_widths: &[f64]) -> f64 {
    let mean: Mean = pixel_widths
        .iter()
        .copied()
        .filter(|w| *w > 0.0 && w.is_finite())
        .collect();
    let average = if mean.len() == 0 { 1.0 } else { mean.mean() };
    reference_mm / average
}

/// Measure `frames` frames of a wire of known diameter with the uncalibrated
/// pipeline. Frames the camera fails to deliver are skipped.
pub fn calibrate_camera(
    source: &mut dyn FrameSource,
    pipeline: &VisionPipeline,
    frames: usize,
    reference_mm: f64,
    cancel: &AtomicBool,
) -> ControlResult<f64> {
    if !(reference_mm > 0.0) || !reference_mm.is_finite() {
        return Err(ControlError::Calibration(format!(
            "reference diameter must be positive, got {}",
            reference_mm
        )));
    }

    let mut widths = Vec::with_capacity(frames);
    for _ in 0..frames {
        if cancel.load(Ordering::Relaxed) {
            return Err(ControlError::Canceled);
        }
        match source.capture() {
            Ok(frame) => widths.push(pipeline.measure_pixels(&frame).0),
            Err(e) => warn!("[Camera] calibration frame skipped: {}", e),
        }
    }

    let valid = widths.iter().filter(|w| **w > 0.0).count();
    if valid == 0 {
        warn!("[Camera] no valid width in {} frame(s); coefficient falls back to reference", frames);
    }
    let coefficient = coefficient_from_samples(reference_mm, &widths);
    info!(
        "[Camera] calibrated: {} valid of {} frame(s), {:.6} mm/px",
        valid, frames, coefficient
    );
    Ok(coefficient)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VisionConfig;
    use crate::error::HardwareError;
    use crate::vision::frame::ColorFrame;

    struct NoFrames;

    impl FrameSource for NoFrames {
        fn capture(&mut self) -> Result<ColorFrame, HardwareError> {
            Err(HardwareError::FrameUnavailable)
        }
    }

    #[test]
    fn coefficient_is_reference_over_mean_width() {
        assert_eq!(coefficient_from_samples(0.5, &[64.0, 0.0, 64.0]), 0.0078125);
    }

    #[test]
    fn no_valid_samples_falls_back_to_reference() {
        assert_eq!(coefficient_from_samples(0.5, &[]), 0.5);
        assert_eq!(coefficient_from_samples(0.5, &[0.0, 0.0]), 0.5);
    }

    #[test]
    fn dead_camera_still_yields_a_coefficient() {
        let pipeline = VisionPipeline::new(VisionConfig::default());
        let cancel = AtomicBool::new(false);
        let c = calibrate_camera(&mut NoFrames, &pipeline, 5, 0.4, &cancel).unwrap();
        assert_eq!(c, 0.4);
    }

    #[test]
    fn cancel_and_bad_reference_are_errors() {
        let pipeline = VisionPipeline::new(VisionConfig::default());
        let cancel = AtomicBool::new(true);
        assert!(matches!(
            calibrate_camera(&mut NoFrames, &pipeline, 5, 0.4, &cancel),
            Err(ControlError::Canceled)
        ));
        let cancel = AtomicBool::new(false);
        assert!(calibrate_camera(&mut NoFrames, &pipeline, 5, 0.0, &cancel).is_err());
    }
}
