use crate::config::RenderConfig;
use crate::error::BusResult;
use crate::frame::Frame;
use crate::reader::FrameReader;
use crate::source::SeekMode;

use super::progress;

const FIRST_CANDIDATE: u32 = 6;
const MAX_CHANNEL_DELTA: f64 = 31.0;
const SIGNAL_LEVEL: f64 = 127.0;

/// Default upper bound on the block size for a coded frame size.
pub fn block_size_limit(width: u32, height: u32) -> u32 {
    width.max(height) / 100
}

/// Whether the probe block at (2, 2) of the cropped frame is lit.
pub fn has_signal(frame: &Frame, crop_left: u32, crop_top: u32) -> bool {
    let [r, g, _] = frame.mean_rgb(crop_left as i64 + 2, crop_top as i64 + 2, 3, 3);
    r > SIGNAL_LEVEL && g > SIGNAL_LEVEL
}

/// Grows the candidate from 6 until the interior of the top-left block stops
/// matching the ring of pixels just outside it. Returns `limit` when it never
/// does, and never less than the first candidate.
pub fn measure_block_size(frame: &Frame, crop_left: u32, crop_top: u32, limit: u32) -> u32 {
    let ox = crop_left as i64;
    let oy = crop_top as i64;
    for size in FIRST_CANDIDATE..=limit {
        let inner = frame.mean_rgb(ox + 1, oy + 1, size - 1, size - 1);
        let column = frame.mean_rgb(ox + size as i64, oy, 1, size);
        let row = frame.mean_rgb(ox, oy + size as i64, size, 1);
        let differs = (0..3).any(|c| {
            let ring = (column[c] + row[c]) / 2.0;
            (ring - inner[c]).abs() > MAX_CHANNEL_DELTA
        });
        if differs {
            return size;
        }
    }
    limit.max(FIRST_CANDIDATE)
}

/// Seeks to an eighth of the input, waits for a frame with the probe block
/// lit and measures the block size on it. `None` when no frame carries the
/// signal.
pub async fn estimate_block_size(
    reader: &mut FrameReader<'_>,
    config: &RenderConfig,
    limit: u32,
) -> BusResult<Option<u32>> {
    let duration_us = reader.info().duration_us;
    reader.seek(duration_us / 8, SeekMode::AtOrBefore)?;

    let mut found = None;
    while let Some(frame) = reader.next_frame().await? {
        progress(&frame, duration_us);
        if has_signal(&frame, config.crop_left, config.crop_top) {
            found = Some(frame);
            break;
        }
    }
    reader.discard()?;

    let Some(frame) = found else {
        log::info!("no block signal found, block size left unset");
        return Ok(None);
    };
    let size = measure_block_size(&frame, config.crop_left, config.crop_top, limit);
    log::info!("block size {} (limit {}) at {}us", size, limit, frame.timestamp());
    Ok(Some(size))
}
