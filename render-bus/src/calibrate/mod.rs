//! Statistical calibration passes. Each one turns noisy per-frame readings
//! into a single parameter and reports "no signal" as `None` rather than an
//! error.

pub mod block;
pub mod crop;
pub mod orientation;

pub use block::{block_size_limit, estimate_block_size};
pub use crop::{Crop, estimate_crop};
pub use orientation::estimate_orientation;

use crate::frame::Frame;

pub(crate) fn progress(frame: &Frame, duration_us: i64) {
    log::debug!(
        "Analyzing {:.2}/{:.2}",
        frame.timestamp() as f64 / 1_000_000.0,
        duration_us as f64 / 1_000_000.0
    );
}

#[cfg(test)]
#[path = "calibrate_test.rs"]
mod calibrate_test;
