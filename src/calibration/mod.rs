// Calibration procedures and the store their results live in.
// Both routines need exclusive use of the hardware they calibrate; the
// orchestrator hands it over and takes it back.

pub mod store;
pub mod fit;
pub mod camera;
pub mod motor;
