//! diameter.rs
//! Frame → pixel width → millimetres.
//!
//! Width extraction works on segment endpoints along x. For every segment
//! the smaller x is its left end and the larger its right end; the width is
//! the mean of the spread of left ends and the spread of right ends:
//!
//! width = ((max(left) - min(left)) + (max(right) - min(right))) / 2
//!
//! A fiber seen as one segment per edge yields the edge distance, tilt
//! included; several segments on one edge do not shrink it. Fewer than two
//! segments is no measurement.

use log::debug;

use super::canny::canny;
use super::filters::{crop_rows, dilate, erode, gaussian_blur, threshold_binary, to_gray};
use super::frame::{ColorFrame, GrayFrame};
use super::hough::{detect_segments, LineSegment};
use crate::config::VisionConfig;
use crate::utils::telemetry::{DiameterRecord, TelemetryRing};

/// Fiber width in pixels from the detected edge segments.
pub fn pixel_width(lines: &[LineSegment]) -> f64 {
    if lines.len() < 2 {
        return 0.0;
    }
    let (mut left_min, mut left_max) = (i32::MAX, i32::MIN);
    let (mut right_min, mut right_max) = (i32::MAX, i32::MIN);
    for line in lines {
        left_min = left_min.min(line.min_x());
        left_max = left_max.max(line.min_x());
        right_min = right_min.min(line.max_x());
        right_max = right_max.max(line.max_x());
    }
    f64::from((left_max - left_min) + (right_max - right_min)) / 2.0
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiameterMeasurement {
    pub pixel_width: f64,
    pub diameter_mm: f64,
    pub timestamp: f64,
}

impl DiameterMeasurement {
    /// False for the zero "no measurement" sentinel.
    pub fn is_valid(&self) -> bool {
        self.diameter_mm > 0.0
    }
}

/// Intermediate images for the operator display.
#[derive(Debug, Clone, Default)]
pub struct DebugFrames {
    pub edges: Option<GrayFrame>,
    pub binary: Option<GrayFrame>,
    pub lines: Vec<LineSegment>,
}

/// Stateless image pipeline; each stage is switched by `VisionConfig`.
#[derive(Debug, Clone)]
pub struct VisionPipeline {
    config: VisionConfig,
}

impl VisionPipeline {
    pub fn new(config: VisionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VisionConfig {
        &self.config
    }

    /// Grayscale and crop to the band of rows the fiber crosses.
    pub fn prepare(&self, frame: &ColorFrame) -> GrayFrame {
        let (top, bottom) = self.config.crop_rows;
        crop_rows(&to_gray(frame), top, bottom)
    }

    /// Run every enabled stage on an already prepared frame.
    pub fn detect(&self, gray: &GrayFrame) -> DebugFrames {
        let c = &self.config;
        let mut img = gray.clone();
        if c.use_erode {
            img = erode(&img, c.morph_kernel, c.morph_iterations);
        }
        if c.use_dilate {
            img = dilate(&img, c.morph_kernel, c.morph_iterations);
        }
        if c.use_gaussian {
            img = gaussian_blur(&img, c.gaussian_kernel, c.gaussian_sigma);
        }
        let binary = c
            .use_binary
            .then(|| threshold_binary(&img, c.binary_threshold));

        let edge_input = match (&binary, c.use_binary_for_edges) {
            (Some(b), true) => b,
            _ => &img,
        };
        let edges = canny(edge_input, c.canny_low, c.canny_high);
        let lines = detect_segments(&edges, &c.hough);

        DebugFrames {
            edges: Some(edges),
            binary,
            lines,
        }
    }

    /// Uncalibrated width in pixels for one raw frame.
    pub fn measure_pixels(&self, frame: &ColorFrame) -> (f64, DebugFrames) {
        let debug = self.detect(&self.prepare(frame));
        (pixel_width(&debug.lines), debug)
    }
}

pub struct DiameterEstimator {
    pipeline: VisionPipeline,
    coefficient: f64,
    telemetry: TelemetryRing<DiameterRecord>,
    previous_time: Option<f64>,
}

impl DiameterEstimator {
    pub fn new(
        pipeline: VisionPipeline,
        coefficient: f64,
        telemetry: TelemetryRing<DiameterRecord>,
    ) -> Self {
        Self {
            pipeline,
            coefficient,
            telemetry,
            previous_time: None,
        }
    }

    pub fn estimate(&mut self, frame: &ColorFrame, now: f64) -> (DiameterMeasurement, DebugFrames) {
        let (pixel_width, debug) = self.pipeline.measure_pixels(frame);
        let measurement = DiameterMeasurement {
            pixel_width,
            diameter_mm: pixel_width * self.coefficient,
            timestamp: now,
        };

        let delta_time = self.previous_time.map(|t| now - t).unwrap_or(0.0);
        self.previous_time = Some(now);
        self.telemetry.record(DiameterRecord {
            time: now,
            delta_time,
            pixel_width,
            diameter_mm: measurement.diameter_mm,
            lines: debug.lines.len(),
        });
        debug!(
            "[Camera] {} line(s), {:.1}px -> {:.4}mm",
            debug.lines.len(),
            pixel_width,
            measurement.diameter_mm
        );

        (measurement, debug)
    }

    pub fn pipeline(&self) -> &VisionPipeline {
        &self.pipeline
    }

    pub fn coefficient(&self) -> f64 {
        self.coefficient
    }

    pub fn set_coefficient(&mut self, coefficient: f64) {
        self.coefficient = coefficient;
    }
}
