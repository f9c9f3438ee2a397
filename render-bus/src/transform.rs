//! Reference worker: reads the rotation code from the four corner blocks,
//! undoes the rotation and renders a square output on a flat background.

use std::f64::consts::FRAC_PI_4;

use crate::config::RenderConfig;
use crate::error::{BusError, BusResult};
use crate::frame::{Frame, RotationCode};
use crate::worker::{FrameTransform, RenderOutcome, RenderRequest, RenderResponse};

pub const BACKGROUND: [u8; 4] = [0x66, 0x55, 0x77, 0xff];
pub const RING: [u8; 4] = [0xee, 0xee, 0xee, 0xff];

/// Corner block readings of one frame, in field order: top-left,
/// top-right, bottom-right, bottom-left.
#[derive(Debug, Clone, Copy)]
pub struct CornerReading {
    pub means: [[f64; 3]; 4],
    pub code: RotationCode,
}

impl CornerReading {
    pub fn read(frame: &Frame, config: &RenderConfig, block: u32) -> Option<Self> {
        let (w, h) = config.cropped_size(frame.width(), frame.height())?;
        if block < 2 || block > w || block > h {
            return None;
        }
        let left = config.crop_left as i64;
        let top = config.crop_top as i64;
        let right = left + (w - block) as i64;
        let bottom = top + (h - block) as i64;
        let origins = [(left, top), (right, top), (right, bottom), (left, bottom)];

        let mut means = [[0.0; 3]; 4];
        let mut fields = [0u8; 4];
        for (i, (x, y)) in origins.into_iter().enumerate() {
            let mean = frame.mean_rgb(x + 1, y + 1, block - 1, block - 1);
            let t = config.threshold as f64;
            fields[i] = ((mean[0] > t) as u8) << 2 | ((mean[1] > t) as u8) << 1 | (mean[2] > t) as u8;
            means[i] = mean;
        }
        Some(Self {
            means,
            code: RotationCode::from_fields(fields),
        })
    }

    /// Whether any channel of `field`'s block sits too close to the threshold
    /// to trust.
    pub fn is_ambiguous(&self, field: usize, config: &RenderConfig) -> bool {
        let t = config.threshold as f64;
        let s = config.sensitivity as f64;
        self.means[field.min(3)]
            .iter()
            .any(|&m| (m - t).abs() < s)
    }

    /// 2x2 image of the corner means.
    pub fn sample(&self) -> Frame {
        let mut sample = Frame::filled(2, 2, [0, 0, 0, 0xff]);
        let positions = [(0, 0), (1, 0), (1, 1), (0, 1)];
        for (mean, (x, y)) in self.means.iter().zip(positions) {
            let px = [mean[0] as u8, mean[1] as u8, mean[2] as u8, 0xff];
            sample.put_pixel(x, y, px);
        }
        sample
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuTransform;

impl CpuTransform {
    pub fn new() -> Self {
        Self
    }

    fn render_frame(
        &self,
        frame: &Frame,
        config: &RenderConfig,
        scale: Option<f32>,
        steps: u8,
    ) -> BusResult<Frame> {
        let (w, h) = config.cropped_size(frame.width(), frame.height()).ok_or_else(|| {
            BusError::Transform(format!("crop leaves nothing of {}", frame))
        })?;
        let dim = config.output_dim;
        if dim == 0 {
            return Err(BusError::Transform("output dimension is zero".to_string()));
        }
        let diagonal = ((w as f64).powi(2) + (h as f64).powi(2)).sqrt();
        let scale = match scale {
            Some(s) if s > 0.0 => s as f64,
            _ => (dim as f64 / diagonal).min(1.0),
        };

        let angle = steps as f64 * FRAC_PI_4;
        let (sin, cos) = angle.sin_cos();
        let half = dim as f64 / 2.0;
        let cx = config.crop_left as f64 + w as f64 / 2.0;
        let cy = config.crop_top as f64 + h as f64 / 2.0;
        let x_range = config.crop_left as f64..(config.crop_left + w) as f64;
        let y_range = config.crop_top as f64..(config.crop_top + h) as f64;

        let ring_radius = config.ring_radius as f64 * scale;
        let ring_half = config.ring_stroke as f64 * scale / 2.0;

        let mut out = Frame::filled(dim, dim, BACKGROUND)
            .with_timing(frame.timestamp(), frame.duration());
        for oy in 0..dim {
            for ox in 0..dim {
                let dx = ox as f64 + 0.5 - half;
                let dy = oy as f64 + 0.5 - half;
                let sx = cx + (dx * cos - dy * sin) / scale;
                let sy = cy + (dx * sin + dy * cos) / scale;
                if x_range.contains(&sx) && y_range.contains(&sy) {
                    out.put_pixel(ox, oy, frame.pixel_or_clear(sx.floor() as i64, sy.floor() as i64));
                } else if ring_half > 0.0 && ((dx * dx + dy * dy).sqrt() - ring_radius).abs() <= ring_half {
                    out.put_pixel(ox, oy, RING);
                }
            }
        }
        Ok(out)
    }
}

impl FrameTransform for CpuTransform {
    fn render(&self, request: RenderRequest) -> BusResult<RenderResponse> {
        let RenderRequest {
            job_id,
            config,
            frame,
            scale,
            previous_rotation,
        } = request;
        let field = config.orientation.unwrap_or(0);

        let reading = config
            .block_size
            .and_then(|block| CornerReading::read(&frame, &config, block));
        let (code, sample) = match reading {
            Some(reading) => {
                let mut code = reading.code;
                if reading.is_ambiguous(field, &config) {
                    match previous_rotation {
                        Some(prev) => code = code.with_field(field, prev.field(field)),
                        None => {
                            return Ok(RenderResponse {
                                job_id,
                                outcome: RenderOutcome::NeedsHint {
                                    frame,
                                    attempted: code,
                                },
                            });
                        }
                    }
                }
                (code, reading.sample())
            }
            None => (RotationCode::default(), Frame::filled(2, 2, [0, 0, 0, 0xff])),
        };

        let rendered = self.render_frame(&frame, &config, scale, code.field(field))?;
        Ok(RenderResponse {
            job_id,
            outcome: RenderOutcome::Rendered {
                frame: rendered,
                sample,
                rotation: code,
            },
        })
    }
}

#[cfg(test)]
#[path = "transform_test.rs"]
mod transform_test;
