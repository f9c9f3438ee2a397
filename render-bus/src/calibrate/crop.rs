use serde::{Deserialize, Serialize};

use crate::config::{PipelineConfig, RenderConfig};
use crate::error::BusResult;
use crate::frame::Frame;
use crate::reader::FrameReader;
use crate::source::SeekMode;

use super::progress;

// sampling windows as fractions of the duration
const WINDOWS: [f64; 3] = [0.0, 0.45, 0.9];
const DARK_MAX: u8 = 31;
const LIGHT_MIN: u8 = 224;

/// Border depth per edge, in coded pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crop {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Crop {
    pub fn apply(&self, config: &mut RenderConfig) {
        config.crop_left = self.left;
        config.crop_top = self.top;
        config.crop_right = self.right;
        config.crop_bottom = self.bottom;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    Left,
    Right,
    Top,
    Bottom,
}

/// Per-edge histograms over candidate crop depths.
#[derive(Debug, Clone)]
pub struct CropVotes {
    left: Vec<u32>,
    right: Vec<u32>,
    top: Vec<u32>,
    bottom: Vec<u32>,
    frames: usize,
}

impl CropVotes {
    pub fn new(width: u32, height: u32) -> Self {
        let horizontal = (width / 100) as usize + 2;
        let vertical = (height / 100) as usize + 2;
        Self {
            left: vec![0; horizontal],
            right: vec![0; horizontal],
            top: vec![0; vertical],
            bottom: vec![0; vertical],
            frames: 0,
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn add_frame(&mut self, frame: &Frame) {
        for edge in [Edge::Left, Edge::Right, Edge::Top, Edge::Bottom] {
            let votes = match edge {
                Edge::Left => &mut self.left,
                Edge::Right => &mut self.right,
                Edge::Top => &mut self.top,
                Edge::Bottom => &mut self.bottom,
            };
            let depth = vote_depth(frame, edge, votes.len() - 1);
            votes[depth] += 1;
        }
        self.frames += 1;
    }

    pub fn consensus(&self) -> Crop {
        Crop {
            left: consensus(&self.left),
            top: consensus(&self.top),
            right: consensus(&self.right),
            bottom: consensus(&self.bottom),
        }
    }
}

/// Deepest candidate in `1..=max` whose line is all extreme bytes, 0 if none.
fn vote_depth(frame: &Frame, edge: Edge, max: usize) -> usize {
    (1..=max)
        .rev()
        .find(|&depth| line_is_flat(frame, edge, depth as i64))
        .unwrap_or(0)
}

// the row or column just inside a crop of `depth`
fn line_is_flat(frame: &Frame, edge: Edge, depth: i64) -> bool {
    let w = frame.width() as i64;
    let h = frame.height() as i64;
    let (x0, y0, len, vertical) = match edge {
        Edge::Left => (depth - 1, 0, h, true),
        Edge::Right => (w - depth, 0, h, true),
        Edge::Top => (0, depth - 1, w, false),
        Edge::Bottom => (0, h - depth, w, false),
    };
    (0..len).all(|i| {
        let (x, y) = if vertical { (x0, y0 + i) } else { (x0 + i, y0) };
        frame.pixel_or_clear(x, y)[..3]
            .iter()
            .all(|&b| b <= DARK_MAX || b >= LIGHT_MIN)
    })
}

/// Drops the no-signal top bucket, then returns the smallest depth whose
/// cumulative count reaches 80% of the remaining votes.
pub fn consensus(votes: &[u32]) -> u32 {
    let Some((_, counted)) = votes.split_last() else {
        return 0;
    };
    let total: u64 = counted.iter().map(|&v| v as u64).sum();
    let threshold = total as f64 * 4.0 / 5.0;
    let mut cumulative = 0u64;
    for (depth, &count) in counted.iter().enumerate() {
        cumulative += count as u64;
        if cumulative as f64 >= threshold {
            return depth as u32;
        }
    }
    0
}

/// Votes over frames from three windows of the input and returns the
/// consensus crop. Running out of input early uses the votes gathered so far.
pub async fn estimate_crop(
    reader: &mut FrameReader<'_>,
    width: u32,
    height: u32,
    config: &PipelineConfig,
) -> BusResult<Crop> {
    let duration_us = reader.info().duration_us;
    let per_window = config.crop_samples_per_window.max(1);
    let mut votes = CropVotes::new(width, height);
    log::info!("estimating crop over {} frames", per_window * WINDOWS.len());

    for (i, fraction) in WINDOWS.iter().enumerate() {
        let target = (duration_us as f64 * fraction) as i64;
        reader.seek(target, SeekMode::Approximate)?;

        let mut sampled = 0;
        while sampled < per_window {
            let Some(frame) = reader.next_frame().await? else {
                log::debug!("crop window {} ended after {} frames", i, sampled);
                break;
            };
            progress(&frame, duration_us);
            votes.add_frame(&frame);
            sampled += 1;
        }
        reader.discard()?;
    }

    let crop = votes.consensus();
    log::info!(
        "crop from {} frames: left {} top {} right {} bottom {}",
        votes.frames(),
        crop.left,
        crop.top,
        crop.right,
        crop.bottom
    );
    Ok(crop)
}
