use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::{BusError, BusResult};
use crate::sink::SEGMENT_SIZE;

pub const MAX_WORKERS: usize = 6;
pub const MAX_OUTPUT_DIM: u32 = 5968;

/// Per-frame render parameters. A snapshot of this travels with every job and
/// is never mutated while the job is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Channel level separating the two states of a code block.
    pub threshold: u8,
    /// Distance from `threshold` under which a reading is ambiguous.
    pub sensitivity: u8,
    pub block_size: Option<u32>,
    /// Index of the rotation code field that carries the rotation.
    pub orientation: Option<usize>,
    pub crop_left: u32,
    pub crop_top: u32,
    pub crop_right: u32,
    pub crop_bottom: u32,
    pub output_dim: u32,
    pub ring_radius: u32,
    pub ring_stroke: u32,
    pub trim_start_us: i64,
    /// `None` runs to the end of the input.
    pub trim_end_us: Option<i64>,
    /// bits/s at 30 fps
    pub output_bitrate: u64,
    /// Negative disables forced keyframes.
    pub key_interval_us: i64,
    pub codec: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            threshold: 127,
            sensitivity: 24,
            block_size: None,
            orientation: None,
            crop_left: 0,
            crop_top: 0,
            crop_right: 0,
            crop_bottom: 0,
            output_dim: 1920,
            ring_radius: 0,
            ring_stroke: 0,
            trim_start_us: 0,
            trim_end_us: None,
            output_bitrate: 8_000_000,
            key_interval_us: 2_000_000,
            codec: "avc1.640034".to_string(),
        }
    }
}

impl RenderConfig {
    pub fn trim_end(&self) -> i64 {
        self.trim_end_us.unwrap_or(i64::MAX)
    }

    /// Frame size left after cropping, `None` if the crop eats the frame.
    pub fn cropped_size(&self, width: u32, height: u32) -> Option<(u32, u32)> {
        let w = width.checked_sub(self.crop_left + self.crop_right)?;
        let h = height.checked_sub(self.crop_top + self.crop_bottom)?;
        if w == 0 || h == 0 {
            return None;
        }
        Some((w, h))
    }

    pub fn validate(&self) -> BusResult<()> {
        if self.output_dim == 0 {
            return Err(BusError::Config("output_dim must be positive".to_string()));
        }
        if let Some(field) = self.orientation {
            if field >= crate::frame::RotationCode::FIELDS {
                return Err(BusError::Config(format!(
                    "orientation field {} out of range",
                    field
                )));
            }
        }
        if let Some(end) = self.trim_end_us {
            if end <= self.trim_start_us {
                return Err(BusError::Config(format!(
                    "trim end {}us is not after trim start {}us",
                    end, self.trim_start_us
                )));
            }
        }
        if self.codec.is_empty() {
            return Err(BusError::Config("codec must be set".to_string()));
        }
        Ok(())
    }
}

/// Vote weights for the orientation estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrientationWeights {
    pub raw: f64,
    pub first_difference: f64,
    pub second_difference: f64,
    /// Disorder of a uniformly random 3-bit field.
    pub max_disorder: f64,
}

impl Default for OrientationWeights {
    fn default() -> Self {
        Self {
            raw: 1.0,
            first_difference: 2.0,
            second_difference: 2.0,
            max_disorder: 3.0,
        }
    }
}

impl OrientationWeights {
    pub fn level(&self, level: usize) -> f64 {
        match level {
            0 => self.raw,
            1 => self.first_difference,
            _ => self.second_difference,
        }
    }
}

/// Knobs of the pipeline itself, independent of any one input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub workers: usize,
    /// Run every transform on the async runtime instead of a worker pool.
    pub inline: bool,
    pub backpressure_threshold: usize,
    pub throttle_scale: f64,
    pub segment_size: usize,
    pub crop_samples_per_window: usize,
    pub orientation_samples: usize,
    pub framerate: u32,
    pub orientation_weights: OrientationWeights,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: MAX_WORKERS,
            inline: false,
            backpressure_threshold: 16,
            throttle_scale: 0.25,
            segment_size: SEGMENT_SIZE,
            crop_samples_per_window: 33,
            orientation_samples: 127,
            framerate: 30,
            orientation_weights: OrientationWeights::default(),
        }
    }
}

impl PipelineConfig {
    /// Worker count clamped to `1..=6` and to the machine's parallelism.
    pub fn effective_workers(&self) -> usize {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.workers.min(available).clamp(1, MAX_WORKERS)
    }
}

pub fn pipeline_config() -> &'static PipelineConfig {
    static CONFIG: LazyLock<PipelineConfig> = LazyLock::new(PipelineConfig::default);
    &CONFIG
}
