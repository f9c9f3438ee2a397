use std::sync::Arc;

use rand::{Rng, SeedableRng, rngs::StdRng};

use super::block::{has_signal, measure_block_size};
use super::crop::{CropVotes, consensus};
use super::orientation::{disorder, field_votes, select_field};
use super::*;
use crate::config::{OrientationWeights, PipelineConfig, RenderConfig};
use crate::error::BusResult;
use crate::frame::RotationCode;
use crate::memory::{MemoryMedia, RawVideoDecoder};
use crate::reader::FrameReader;
use crate::scheduler::RenderScheduler;
use crate::stream::TimeBase;
use crate::worker::{RenderOutcome, RenderRequest, RenderResponse};

const BLACK: [u8; 4] = [0, 0, 0, 255];
const WHITE: [u8; 4] = [255, 255, 255, 255];

fn bordered(rng: &mut StdRng, width: u32, height: u32, crop: Crop) -> Frame {
    let mut frame = Frame::filled(width, height, BLACK);
    for y in crop.top..height - crop.bottom {
        for x in crop.left..width - crop.right {
            let px = [
                rng.gen_range(64..=192),
                rng.gen_range(64..=192),
                rng.gen_range(64..=192),
                255,
            ];
            frame.put_pixel(x, y, px);
        }
    }
    frame
}

fn checkerboard(width: u32, height: u32, ox: u32, oy: u32, unit: u32) -> Frame {
    let mut frame = Frame::filled(width, height, BLACK);
    for y in oy..height {
        for x in ox..width {
            if ((x - ox) / unit + (y - oy) / unit) % 2 == 0 {
                frame.put_pixel(x, y, WHITE);
            }
        }
    }
    frame
}

fn media_from(frames: Vec<Frame>) -> MemoryMedia {
    let (w, h) = (frames[0].width(), frames[0].height());
    let mut media = MemoryMedia::new(w, h, TimeBase::new(1, 90_000));
    for (i, frame) in frames.into_iter().enumerate() {
        let frame = frame.with_timing(i as i64 * 33_333, 33_333);
        media.push_frame(&frame, true).unwrap();
    }
    media
}

#[test]
fn test_consensus_skips_top_bucket() {
    assert_eq!(consensus(&[0, 0, 5, 90, 3, 50]), 3);
    assert_eq!(consensus(&[10, 0, 0, 1000]), 0);
    assert_eq!(consensus(&[0, 0, 0, 0]), 0);
    assert_eq!(consensus(&[]), 0);
    // 80% reached only once the deeper bucket is included
    assert_eq!(consensus(&[0, 30, 70, 0]), 2);
}

#[test]
fn test_crop_votes_converge_on_border() {
    let mut rng = StdRng::seed_from_u64(7);
    let crop = Crop {
        left: 2,
        top: 3,
        right: 6,
        bottom: 1,
    };
    let mut votes = CropVotes::new(640, 480);
    for i in 0..99 {
        if i % 10 == 0 {
            // fade to black votes for the no-signal bucket
            votes.add_frame(&Frame::filled(640, 480, BLACK));
        } else {
            votes.add_frame(&bordered(&mut rng, 640, 480, crop));
        }
    }
    assert_eq!(votes.frames(), 99);
    assert_eq!(votes.consensus(), crop);
}

#[tokio::test]
async fn test_estimate_crop_through_reader() -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(11);
    let crop = Crop {
        left: 1,
        top: 2,
        right: 3,
        bottom: 2,
    };
    let frames: Vec<Frame> = (0..120).map(|_| bordered(&mut rng, 300, 300, crop)).collect();
    let mut source = media_from(frames).into_source();
    let mut decoder = RawVideoDecoder::new(300, 300).with_delay(1);
    let mut reader = FrameReader::new(&mut source, &mut decoder);

    let estimated = estimate_crop(&mut reader, 300, 300, &PipelineConfig::default()).await?;
    assert_eq!(estimated, crop);
    Ok(())
}

#[test]
fn test_block_size_matches_checkerboard_unit() {
    for unit in [6, 8, 13] {
        let frame = checkerboard(120, 100, 3, 2, unit);
        assert!(has_signal(&frame, 3, 2));
        assert_eq!(measure_block_size(&frame, 3, 2, 20), unit);
    }
}

#[test]
fn test_block_size_without_contrast_is_limit() {
    let frame = Frame::filled(64, 64, WHITE);
    assert!(has_signal(&frame, 0, 0));
    assert_eq!(measure_block_size(&frame, 0, 0, 17), 17);
}

#[test]
fn test_block_size_small_limit_keeps_first_candidate() {
    // inputs under 600px give a limit below the first candidate
    assert_eq!(block_size_limit(64, 64), 0);
    let frame = checkerboard(64, 64, 0, 0, 8);
    assert_eq!(measure_block_size(&frame, 0, 0, 4), 6);
    assert_eq!(measure_block_size(&frame, 0, 0, 0), 6);
}

#[tokio::test]
async fn test_estimate_block_size_waits_for_signal() -> anyhow::Result<()> {
    let mut frames = Vec::new();
    for i in 0..40 {
        if i < 20 {
            frames.push(Frame::filled(100, 100, BLACK));
        } else {
            frames.push(checkerboard(100, 100, 4, 4, 9));
        }
    }
    let mut source = media_from(frames).into_source();
    let mut decoder = RawVideoDecoder::new(100, 100);
    let mut reader = FrameReader::new(&mut source, &mut decoder).with_throttle(true);
    let config = RenderConfig {
        crop_left: 4,
        crop_top: 4,
        ..Default::default()
    };

    let size = estimate_block_size(&mut reader, &config, 30).await?;
    assert_eq!(size, Some(9));
    Ok(())
}

#[tokio::test]
async fn test_estimate_block_size_without_signal() -> anyhow::Result<()> {
    let frames = (0..10).map(|_| Frame::filled(50, 50, BLACK)).collect();
    let mut source = media_from(frames).into_source();
    let mut decoder = RawVideoDecoder::new(50, 50);
    let mut reader = FrameReader::new(&mut source, &mut decoder);

    let size = estimate_block_size(&mut reader, &RenderConfig::default(), 10).await?;
    assert_eq!(size, None);
    Ok(())
}

#[test]
fn test_disorder_bounds() {
    assert_eq!(disorder(&[4; 16]), 0.0);
    let uniform: Vec<u8> = (0..64).map(|i| (i % 8) as u8).collect();
    assert!((disorder(&uniform) - 3.0).abs() < 1e-9);
}

fn noisy_codes(rng: &mut StdRng, n: usize, constant_field: usize) -> Vec<RotationCode> {
    (0..n)
        .map(|_| {
            let mut fields = [0u8; 4];
            for f in fields.iter_mut() {
                *f = rng.gen_range(0..8);
            }
            fields[constant_field] = 5;
            RotationCode::from_fields(fields)
        })
        .collect()
}

#[test]
fn test_orientation_selects_constant_field() {
    let mut rng = StdRng::seed_from_u64(3);
    let weights = OrientationWeights::default();
    for field in 0..4 {
        let codes = noisy_codes(&mut rng, 128, field);
        assert_eq!(select_field(&codes, &weights), Some(field));
    }
    assert_eq!(select_field(&noisy_codes(&mut rng, 2, 1), &weights), None);
}

#[test]
fn test_field_votes_reward_consistency() {
    let mut rng = StdRng::seed_from_u64(9);
    let weights = OrientationWeights::default();
    let codes: Vec<RotationCode> = (0..64)
        .map(|i| RotationCode::from_fields([5, (i % 8) as u8, rng.gen_range(0..8), 0]))
        .collect();
    let votes = field_votes(&codes, &weights);
    // constant at every level: 3 bits each, weighted 1 + 2 + 2
    assert!((votes[0] - 15.0).abs() < 1e-9);
    assert!((votes[3] - 15.0).abs() < 1e-9);
    // a steady cycle has full raw disorder but constant differences
    assert!((votes[1] - 12.0).abs() < 1e-9);
    assert!(votes[2] < votes[1]);
    // ties keep the lower index
    assert_eq!(select_field(&codes, &weights), Some(0));
}

// code carried in the first two bytes of the top-left pixel
fn code_transform(request: RenderRequest) -> BusResult<RenderResponse> {
    let p = request.frame.pixel(0, 0).unwrap_or_default();
    let rotation = RotationCode(u16::from_le_bytes([p[0], p[1]]));
    Ok(RenderResponse {
        job_id: request.job_id,
        outcome: RenderOutcome::Rendered {
            frame: request.frame,
            sample: Frame::filled(1, 1, BLACK),
            rotation,
        },
    })
}

#[tokio::test]
async fn test_estimate_orientation_through_scheduler() -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(5);
    let mut frames = Vec::new();
    for i in 0..300 {
        let code = if i < 110 {
            RotationCode(0)
        } else {
            noisy_codes(&mut rng, 1, 2)[0]
        };
        let [lo, hi] = code.0.to_le_bytes();
        frames.push(Frame::filled(2, 2, [lo, hi, 0, 255]));
    }
    let mut source = media_from(frames).into_source();
    let mut decoder = RawVideoDecoder::new(2, 2);
    let mut reader = FrameReader::new(&mut source, &mut decoder);
    let scheduler = RenderScheduler::new(Arc::new(code_transform), 3);

    let field = estimate_orientation(
        &mut reader,
        &scheduler,
        Arc::new(RenderConfig::default()),
        None,
        &PipelineConfig::default(),
    )
    .await?;
    assert_eq!(field, Some(2));
    Ok(())
}

#[tokio::test]
async fn test_estimate_orientation_too_few_samples() -> anyhow::Result<()> {
    let frames = (0..30).map(|_| Frame::filled(2, 2, [0, 0, 0, 255])).collect();
    let mut source = media_from(frames).into_source();
    let mut decoder = RawVideoDecoder::new(2, 2);
    let mut reader = FrameReader::new(&mut source, &mut decoder);
    let scheduler = RenderScheduler::inline(Arc::new(code_transform));

    let field = estimate_orientation(
        &mut reader,
        &scheduler,
        Arc::new(RenderConfig::default()),
        None,
        &PipelineConfig::default(),
    )
    .await?;
    assert_eq!(field, None);
    Ok(())
}
