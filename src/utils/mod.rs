pub mod clock;
pub mod export;
pub mod snapshot;
pub mod telemetry;
