// Fiber diameter from camera frames: filters, edge and line detection,
// width extraction, and the camera worker thread.

pub mod frame;
pub mod filters;
pub mod canny;
pub mod hough;
pub mod diameter;
pub mod worker;
