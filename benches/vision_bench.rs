// Per-frame cost of the diameter pipeline on a simulated 320x240 frame; it
// has to stay well under the capture interval.

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use fiberline::{
    config::VisionConfig,
    hardware::{
        sim::{SimulatedCamera, SimulatedMotor},
        FrameSource,
    },
    utils::clock::ManualClock,
    vision::{canny::canny, diameter::VisionPipeline},
};

fn vision_bench(c: &mut Criterion) {
    let mut camera = SimulatedCamera::new(SimulatedMotor::new(ManualClock::shared()), 42);
    *camera.reference_wire().lock() = Some(0.4);
    let frame = camera.capture().expect("simulated frame");
    let pipeline = VisionPipeline::new(VisionConfig::default());
    let gray = pipeline.prepare(&frame);
    let config = pipeline.config().clone();

    c.bench_function("canny_edges", |b| {
        b.iter(|| black_box(canny(black_box(&gray), config.canny_low, config.canny_high)))
    });

    c.bench_function("measure_pixels", |b| {
        b.iter(|| black_box(pipeline.measure_pixels(black_box(&frame)).0))
    });
}

criterion_group!(benches, vision_bench);
criterion_main!(benches);
