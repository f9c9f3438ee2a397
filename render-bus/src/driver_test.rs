use std::sync::Arc;
use std::time::Duration;

use super::*;
use crate::memory::{MemoryBackend, MemoryMedia, MemoryMuxer, MuxedPacket};
use crate::stream::TimeBase;
use crate::transform::CpuTransform;
use crate::worker::{RenderOutcome, RenderRequest, RenderResponse};

const FRAME_US: i64 = 40_000;
const SIDE: u32 = 32;
// centre pixel of the 32x32 output
const CENTRE: usize = ((16 * SIDE + 16) * 4) as usize;

fn video(frames: usize) -> MemoryMedia {
    let mut media = MemoryMedia::new(SIDE, SIDE, TimeBase::new(1, 90_000));
    for i in 0..frames {
        let frame = Frame::filled(SIDE, SIDE, [i as u8, 0, 0, 255])
            .with_timing(i as i64 * FRAME_US, FRAME_US);
        media.push_frame(&frame, i % 10 == 0).unwrap();
    }
    media
}

fn video_with_audio(frames: usize) -> MemoryMedia {
    let mut media = MemoryMedia::new(SIDE, SIDE, TimeBase::new(1, 90_000))
        .with_audio("opus", TimeBase::new(1, 48_000));
    for i in 0..frames {
        let frame = Frame::filled(SIDE, SIDE, [i as u8, 0, 0, 255])
            .with_timing(i as i64 * FRAME_US, FRAME_US);
        media.push_frame(&frame, i % 10 == 0).unwrap();
        // two 20ms packets per frame
        let pts = i as i64 * 1920;
        media.push_audio(pts, 960, vec![i as u8; 8]).unwrap();
        media.push_audio(pts + 960, 960, vec![i as u8; 8]).unwrap();
    }
    media
}

fn pipeline() -> PipelineConfig {
    PipelineConfig {
        segment_size: 4096,
        ..Default::default()
    }
}

async fn encode(
    backend: &MemoryBackend,
    scheduler: &RenderScheduler,
    config: &RenderConfig,
) -> BusResult<EncodeOutput> {
    let (mut source, mut decoder) = backend.open("in")?;
    let pipeline = pipeline();
    EncodeDriver::new(source.as_mut(), decoder.as_mut(), backend, scheduler)
        .with_pipeline(&pipeline)
        .run(config)
        .await
}

fn stream(packets: &[MuxedPacket], index: usize) -> Vec<&MuxedPacket> {
    packets.iter().filter(|p| p.stream == index).collect()
}

#[tokio::test]
async fn test_encode_trims_and_keeps_order() -> anyhow::Result<()> {
    let backend = MemoryBackend::new()
        .with_media("in", video(50))
        .with_delays(1, 2);
    let scheduler = RenderScheduler::new(Arc::new(CpuTransform::new()), 3);
    let config = RenderConfig {
        trim_start_us: 1_000_000,
        trim_end_us: Some(1_600_000),
        key_interval_us: 200_000,
        ..Default::default()
    };

    let output = encode(&backend, &scheduler, &config).await?;
    assert_eq!(output.summary.frames, 15);
    assert_eq!(output.summary.packets, 15);
    assert_eq!(output.summary.audio_packets, 0);
    assert_eq!(output.summary.bytes, output.data.len() as u64);
    assert_eq!(output.summary.container, Container::Mp4);
    assert!(output.summary.file_name.ends_with(".mp4"));

    let packets = MemoryMuxer::parse(&output.data)?;
    let video = stream(&packets, 0);
    assert_eq!(video.len(), 15);
    for (i, packet) in video.iter().enumerate() {
        assert_eq!(packet.pts, i as i64 * FRAME_US);
        assert_eq!(packet.duration, FRAME_US);
        assert_eq!(packet.data.len(), (SIDE * SIDE * 4) as usize);
        // frames 25..40 survive the trim, in input order
        assert_eq!(packet.data[CENTRE], 25 + i as u8);
    }

    let keys: Vec<i64> = video.iter().filter(|p| p.key).map(|p| p.pts).collect();
    assert_eq!(keys, vec![200_000, 400_000]);
    Ok(())
}

#[tokio::test]
async fn test_audio_passthrough_follows_trim_point() -> anyhow::Result<()> {
    let backend = MemoryBackend::new().with_media("in", video_with_audio(50));
    let scheduler = RenderScheduler::new(Arc::new(CpuTransform::new()), 2);
    let config = RenderConfig {
        // the audio packet covering 1.01s starts at 1.00s
        trim_start_us: 1_010_000,
        trim_end_us: Some(1_600_000),
        codec: "vp09.00.10.08".to_string(),
        ..Default::default()
    };

    let output = encode(&backend, &scheduler, &config).await?;
    assert_eq!(output.summary.container, Container::WebM);
    assert_eq!(output.summary.frames, 15);
    assert_eq!(output.summary.audio_packets, 31);

    let packets = MemoryMuxer::parse(&output.data)?;
    let audio = stream(&packets, 1);
    assert_eq!(audio.len(), 31);
    assert_eq!(audio[0].pts, 0);
    assert_eq!(audio[30].pts, 28_800);
    assert_eq!(audio[0].time_base, TimeBase::new(1, 48_000));
    assert_eq!(&audio[0].data[..], &[25u8; 8][..]);

    // audio read before the first video packet is written after the header
    assert_eq!(packets[0].stream, 1);
    let video = stream(&packets, 0);
    assert_eq!(video[0].pts, 0);
    assert_eq!(video[0].data[CENTRE], 25);
    Ok(())
}

#[tokio::test]
async fn test_encode_without_frames_in_range() -> anyhow::Result<()> {
    let backend = MemoryBackend::new().with_media("in", video(10));
    let scheduler = RenderScheduler::inline(Arc::new(CpuTransform::new()));
    let config = RenderConfig {
        trim_start_us: 5_000_000,
        ..Default::default()
    };

    let result = encode(&backend, &scheduler, &config).await;
    assert!(matches!(result, Err(BusError::NoFrames)));
    Ok(())
}

fn flaky_transform(request: RenderRequest) -> BusResult<RenderResponse> {
    let value = request.frame.pixel(0, 0).unwrap_or_default()[0];
    if value == 3 {
        return Err(BusError::Transform("bad frame".to_string()));
    }
    let dim = request.config.output_dim;
    Ok(RenderResponse {
        job_id: request.job_id,
        outcome: RenderOutcome::Rendered {
            frame: Frame::filled(dim, dim, [value, 0, 0, 255]),
            sample: Frame::filled(2, 2, [0, 0, 0, 255]),
            rotation: Default::default(),
        },
    })
}

#[tokio::test]
async fn test_failed_render_skips_frame() -> anyhow::Result<()> {
    let backend = MemoryBackend::new().with_media("in", video(8));
    let scheduler = RenderScheduler::new(Arc::new(flaky_transform), 2);

    let output = encode(&backend, &scheduler, &RenderConfig::default()).await?;
    assert_eq!(output.summary.frames, 7);
    let packets = MemoryMuxer::parse(&output.data)?;
    let values: Vec<u8> = packets.iter().map(|p| p.data[0]).collect();
    assert_eq!(values, vec![0, 1, 2, 4, 5, 6, 7]);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_encode() -> anyhow::Result<()> {
    let backend = MemoryBackend::new().with_media("in", video(8));
    let scheduler = RenderScheduler::new(Arc::new(CpuTransform::new()), 1);
    let (mut source, mut decoder) = backend.open("in")?;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = EncodeDriver::new(source.as_mut(), decoder.as_mut(), &backend, &scheduler)
        .with_cancel(cancel)
        .run(&RenderConfig::default())
        .await;
    assert!(matches!(result, Err(BusError::Cancelled)));
    Ok(())
}

#[test]
fn test_throttle_delay() {
    let second = Duration::from_secs(1);
    assert_eq!(throttle_delay(16, 100, second, 16, 0.25), None);
    assert_eq!(throttle_delay(40, 0, second, 16, 0.25), None);

    // 100 packets in 1000ms is 0.1/ms; 32 / 0.1 / 4 = 80ms
    let delay = throttle_delay(32, 100, second, 16, 0.25).unwrap();
    assert!((delay.as_secs_f64() - 0.080).abs() < 1e-6);

    let deeper = throttle_delay(64, 100, second, 16, 0.25).unwrap();
    assert!(deeper > delay);
}

#[test]
fn test_keyframe_clock() {
    let mut clock = KeyframeClock::new(1_000_000);
    let keys: Vec<i64> = (0..60)
        .map(|i| i * FRAME_US)
        .filter(|&ts| clock.should_key(ts, FRAME_US))
        .collect();
    assert_eq!(keys, vec![1_000_000, 2_000_000]);

    let mut clock = KeyframeClock::new(1_000_000);
    assert!(!clock.should_key(0, FRAME_US));
    clock.observe_key(600_000);
    assert!(!clock.should_key(1_000_000, FRAME_US));
    assert!(clock.should_key(1_600_000, FRAME_US));

    let mut never = KeyframeClock::new(-1);
    assert!((0..100).all(|i| !never.should_key(i * FRAME_US, FRAME_US)));
}
