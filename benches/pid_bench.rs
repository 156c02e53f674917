use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use fiberline::{
    config::{SpoolConfig, ThermalConfig},
    control::{
        pid::PidLoop,
        spool::{MotorModel, MotorSpeedController},
    },
    hardware::sim::SimulatedMotor,
    utils::{clock::ManualClock, telemetry::TelemetryRing},
};

fn pid_step_bench(c: &mut Criterion) {
    let config = ThermalConfig::default();
    let mut pid = PidLoop::new(config.gains, config.limits);
    let mut now = 0.0;

    c.bench_function("pid_step", |b| {
        b.iter(|| {
            now += 0.1;
            black_box(pid.step(black_box(12.5), now).ok());
        })
    });
}

fn spool_update_bench(c: &mut Criterion) {
    let clock = ManualClock::shared();
    let motor = SimulatedMotor::new(clock.clone());
    let mut spool = MotorSpeedController::new(
        SpoolConfig::default(),
        motor.drive(),
        Some(MotorModel::new(1.0 / 1.5, 10.0)),
        TelemetryRing::new(64),
    );
    spool.arm(0.0).ok();
    spool.engage(0.0);

    // encoder read, PID, duty write and telemetry row per iteration
    c.bench_function("spool_closed_loop_step", |b| {
        b.iter(|| {
            clock.advance(0.11);
            black_box(spool.update(black_box(clock.now())));
        })
    });
}

criterion_group!(benches, pid_step_bench, spool_update_bench);
criterion_main!(benches);
