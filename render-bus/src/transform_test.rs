use std::sync::Arc;

use super::*;
use crate::worker::JobId;

const BLACK: [u8; 4] = [0, 0, 0, 255];
const MAGENTA: [u8; 4] = [255, 0, 255, 255];

fn paint(frame: &mut Frame, x0: u32, y0: u32, w: u32, h: u32, rgba: [u8; 4]) {
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            frame.put_pixel(x, y, rgba);
        }
    }
}

fn request(frame: Frame, config: RenderConfig, scale: Option<f32>, hint: Option<RotationCode>) -> RenderRequest {
    RenderRequest {
        job_id: JobId(1),
        config: Arc::new(config),
        frame,
        scale,
        previous_rotation: hint,
    }
}

fn rendered(response: RenderResponse) -> (Frame, Frame, RotationCode) {
    match response.outcome {
        RenderOutcome::Rendered {
            frame,
            sample,
            rotation,
        } => (frame, sample, rotation),
        RenderOutcome::NeedsHint { attempted, .. } => panic!("unexpected hint request for {}", attempted),
    }
}

#[test]
fn test_corner_reading() {
    let mut frame = Frame::filled(64, 48, [40, 40, 40, 255]);
    paint(&mut frame, 0, 0, 8, 8, [255, 255, 255, 255]);
    paint(&mut frame, 56, 0, 8, 8, [255, 0, 0, 255]);
    paint(&mut frame, 56, 40, 8, 8, [0, 255, 0, 255]);
    paint(&mut frame, 0, 40, 8, 8, [0, 0, 255, 255]);
    let config = RenderConfig::default();

    let reading = CornerReading::read(&frame, &config, 8).unwrap();
    assert_eq!(reading.code.fields(), [7, 4, 2, 1]);
    for field in 0..4 {
        assert!(!reading.is_ambiguous(field, &config));
    }
    let sample = reading.sample();
    assert_eq!(sample.pixel(1, 0), Some([255, 0, 0, 255]));
    assert_eq!(sample.pixel(0, 1), Some([0, 0, 255, 255]));

    // block larger than the cropped frame
    assert!(CornerReading::read(&frame, &config, 49).is_none());
}

#[test]
fn test_identity_without_rotation() {
    let mut frame = Frame::filled(40, 40, BLACK);
    paint(&mut frame, 10, 20, 3, 3, MAGENTA);
    let config = RenderConfig {
        block_size: Some(4),
        orientation: Some(0),
        output_dim: 40,
        ring_radius: 0,
        ring_stroke: 0,
        ..Default::default()
    };

    let response = CpuTransform::new().render(request(frame, config, Some(1.0), None)).unwrap();
    let (out, _, rotation) = rendered(response);
    assert_eq!(rotation.field(0), 0);
    assert_eq!((out.width(), out.height()), (40, 40));
    assert_eq!(out.pixel(11, 21), Some(MAGENTA));
    assert_eq!(out.pixel(28, 18), Some(BLACK));
}

#[test]
fn test_half_turn_is_undone() {
    let mut frame = Frame::filled(40, 40, BLACK).with_timing(66_666, 33_333);
    // field 0 reads 4: four eighths of a turn
    paint(&mut frame, 0, 0, 4, 4, [255, 0, 0, 255]);
    paint(&mut frame, 10, 20, 3, 3, MAGENTA);
    let config = RenderConfig {
        block_size: Some(4),
        orientation: Some(0),
        output_dim: 40,
        ring_radius: 0,
        ring_stroke: 0,
        ..Default::default()
    };

    let response = CpuTransform::new().render(request(frame, config, Some(1.0), None)).unwrap();
    let (out, sample, rotation) = rendered(response);
    assert_eq!(rotation.field(0), 4);
    assert_eq!((out.timestamp(), out.duration()), (66_666, 33_333));
    for y in 17..20 {
        for x in 27..30 {
            assert_eq!(out.pixel(x, y), Some(MAGENTA), "({}, {})", x, y);
        }
    }
    assert_eq!(out.pixel(11, 21), Some(BLACK));
    assert_eq!(sample.pixel(0, 0), Some([255, 0, 0, 255]));
}

#[test]
fn test_ambiguous_field_needs_hint() {
    let mut frame = Frame::filled(32, 32, BLACK);
    paint(&mut frame, 0, 0, 4, 4, [130, 0, 0, 255]);
    let config = RenderConfig {
        block_size: Some(4),
        orientation: Some(0),
        output_dim: 16,
        ..Default::default()
    };

    let response = CpuTransform::new()
        .render(request(frame, config.clone(), None, None))
        .unwrap();
    let frame = match response.outcome {
        RenderOutcome::NeedsHint { frame, attempted } => {
            assert_eq!(attempted.field(0), 4);
            frame
        }
        RenderOutcome::Rendered { .. } => panic!("ambiguous block rendered without a hint"),
    };

    let hint = RotationCode::from_fields([6, 0, 0, 0]);
    let response = CpuTransform::new()
        .render(request(frame, config, None, Some(hint)))
        .unwrap();
    let (_, _, rotation) = rendered(response);
    assert_eq!(rotation.field(0), 6);
}

#[test]
fn test_ambiguity_only_counts_on_selected_field() {
    let mut frame = Frame::filled(32, 32, BLACK);
    paint(&mut frame, 0, 0, 4, 4, [130, 0, 0, 255]);
    let config = RenderConfig {
        block_size: Some(4),
        orientation: Some(1),
        output_dim: 16,
        ..Default::default()
    };

    let response = CpuTransform::new().render(request(frame, config, None, None)).unwrap();
    let (_, _, rotation) = rendered(response);
    assert_eq!(rotation.fields(), [4, 0, 0, 0]);
}

#[test]
fn test_uncalibrated_frame_is_centred() {
    let frame = Frame::filled(16, 16, MAGENTA);
    let config = RenderConfig {
        output_dim: 32,
        ring_radius: 0,
        ring_stroke: 0,
        ..Default::default()
    };

    let response = CpuTransform::new().render(request(frame, config, None, None)).unwrap();
    let (out, _, rotation) = rendered(response);
    assert!(rotation.is_zero());
    assert_eq!(out.pixel(0, 0), Some(BACKGROUND));
    assert_eq!(out.pixel(16, 16), Some(MAGENTA));
}

#[test]
fn test_ring_drawn_outside_image() {
    let frame = Frame::filled(8, 8, MAGENTA);
    let config = RenderConfig {
        output_dim: 32,
        ring_radius: 14,
        ring_stroke: 2,
        ..Default::default()
    };

    let response = CpuTransform::new().render(request(frame, config, Some(1.0), None)).unwrap();
    let (out, _, _) = rendered(response);
    assert_eq!(out.pixel(29, 16), Some(RING));
    assert_eq!(out.pixel(16, 16), Some(MAGENTA));
    assert_eq!(out.pixel(24, 16), Some(BACKGROUND));
}

#[test]
fn test_zero_output_is_an_error() {
    let config = RenderConfig {
        output_dim: 0,
        ..Default::default()
    };
    let result = CpuTransform::new().render(request(Frame::filled(8, 8, BLACK), config, None, None));
    assert!(matches!(result, Err(BusError::Transform(_))));
}
