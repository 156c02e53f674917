// Control loops: each owns its PID state, its actuator and its telemetry ring.
// Every public `update` catches its own failures; nothing here can stop the tick loop.

pub mod pid;
pub mod thermal;
pub mod spool;
pub mod extrusion;
pub mod fan;
pub mod cascade;

/// Edge-triggered fault flag: a fault is reported once, then suppressed until
/// a healthy step clears it.
#[derive(Debug, Default)]
pub struct FaultLatch {
    active: bool,
    pending: Option<String>,
}

impl FaultLatch {
    pub fn raise(&mut self, message: String) {
        if !self.active {
            self.pending = Some(message);
        }
        self.active = true;
    }

    pub fn clear(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Newly raised fault since the last call, if any.
    pub fn take(&mut self) -> Option<String> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::FaultLatch;

    #[test]
    fn latch_reports_once_per_episode() {
        let mut latch = FaultLatch::default();
        latch.raise("rail".into());
        latch.raise("rail".into());
        assert_eq!(latch.take().as_deref(), Some("rail"));
        assert_eq!(latch.take(), None);

        latch.clear();
        latch.raise("again".into());
        assert_eq!(latch.take().as_deref(), Some("again"));
    }
}
