//! clock.rs
//! Monotonic time source shared read-only by every subsystem.
//!
//! `now()` is the ControlTick: seconds elapsed since the device was armed.
//! Subsystems never read a hidden global timer; the orchestrator hands each of
//! them the same `SharedClock`.

use spin_sleep::{SpinSleeper, SpinStrategy};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

pub trait Clock: Send + Sync {
    /// Seconds since the device was armed. Never decreases.
    fn now(&self) -> f64;

    /// Bounded suspension used by the tick loop, the camera worker and calibration.
    fn sleep(&self, duration: Duration);
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall clock backed by `Instant`, sleeping with a spin sleeper for tick accuracy.
pub struct MonotonicClock {
    armed_at: Instant,
    sleeper: SpinSleeper,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            armed_at: Instant::now(),
            // 100 µs native accuracy, yield while spinning (same as the periodic release loops)
            sleeper: SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.armed_at.elapsed().as_secs_f64()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeper.sleep(duration);
    }
}

/// Hand-driven clock for tests and offline replays.
///
/// `sleep` advances time instead of blocking, so multi-second calibration
/// sweeps finish instantly.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn advance(&self, seconds: f64) {
        let delta = (seconds.max(0.0) * 1e9) as u64;
        self.nanos.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set(&self, seconds: f64) {
        let target = (seconds.max(0.0) * 1e9) as u64;
        // fetch_max keeps the clock monotonic even if a caller goes backwards
        self.nanos.fetch_max(target, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        self.nanos.load(Ordering::SeqCst) as f64 / 1e9
    }

    fn sleep(&self, duration: Duration) {
        self.nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_forward() {
        let clock = ManualClock::new();
        clock.advance(0.25);
        clock.set(0.1);
        assert!((clock.now() - 0.25).abs() < 1e-9);
        clock.sleep(Duration::from_millis(50));
        assert!((clock.now() - 0.30).abs() < 1e-9);
    }

    #[test]
    fn monotonic_clock_is_monotonic() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        clock.sleep(Duration::from_millis(1));
        assert!(clock.now() > a);
    }
}
