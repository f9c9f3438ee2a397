use std::time::{Duration, UNIX_EPOCH};

use super::*;

#[test]
fn test_plan_rounds_to_macroblock() {
    let config = RenderConfig {
        output_dim: 4000,
        ..Default::default()
    };
    // 1920x1080 diagonal is 2202
    let plan = plan_output(&config, 1920, 1080).unwrap();
    assert_eq!(plan.diagonal, 2202);
    assert_eq!(plan.output_dim, 2192);
    assert!((plan.scale - 2192.0 / 2202.0).abs() < 1e-6);
}

#[test]
fn test_plan_respects_request_and_crop() {
    let config = RenderConfig {
        output_dim: 1000,
        crop_left: 10,
        crop_right: 10,
        crop_top: 20,
        crop_bottom: 20,
        ..Default::default()
    };
    let plan = plan_output(&config, 1940, 1120).unwrap();
    assert_eq!(plan.diagonal, 2202);
    assert_eq!(plan.output_dim, 992);
    assert!(plan.scale < 0.46);
}

#[test]
fn test_plan_caps_huge_outputs() {
    let config = RenderConfig {
        output_dim: 100_000,
        ..Default::default()
    };
    let plan = plan_output(&config, 7680, 4320).unwrap();
    assert_eq!(plan.output_dim, 5968);
}

#[test]
fn test_plan_scale_never_exceeds_one() {
    let config = RenderConfig {
        output_dim: 4096,
        ..Default::default()
    };
    let plan = plan_output(&config, 30, 40).unwrap();
    assert_eq!(plan.diagonal, 50);
    assert_eq!(plan.output_dim, 48);
    assert!(plan.scale <= 1.0);
}

#[test]
fn test_plan_rejects_empty_crop() {
    let config = RenderConfig {
        crop_left: 50,
        crop_right: 50,
        ..Default::default()
    };
    assert!(matches!(
        plan_output(&config, 100, 100),
        Err(BusError::Config(_))
    ));
}

#[test]
fn test_bitrate_normalized_to_thirty_fps() {
    // 60 fps input halves the per-frame budget
    assert_eq!(encoder_bitrate(8_000_000, 600, 10_000_000), 4_000_000);
    assert_eq!(encoder_bitrate(8_000_000, 150, 10_000_000), 16_000_000);
    assert_eq!(encoder_bitrate(8_000_000, 0, 10_000_000), 8_000_000);
}

#[test]
fn test_container_choice() {
    assert_eq!(choose_container("vp09.00.10.08", None), Container::WebM);
    assert_eq!(choose_container("av01.0.08M.08", Some("opus")), Container::WebM);
    assert_eq!(choose_container("vp8", Some("vorbis")), Container::WebM);
    assert_eq!(choose_container("vp09.00.10.08", Some("aac")), Container::Mp4);
    assert_eq!(choose_container("avc1.640034", None), Container::Mp4);
    assert_eq!(choose_container("hvc1.1.6.L123.00", Some("pcm_s16le")), Container::Mp4);
    assert_eq!(choose_container("avc1.640034", Some("vorbis")), Container::Matroska);
    assert_eq!(choose_container("vp8", Some("aac")), Container::Matroska);
    assert_eq!(choose_container("rawvideo", None), Container::Matroska);
}

#[test]
fn test_file_name_uses_unix_millis() {
    let now = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
    assert_eq!(output_file_name(Container::WebM, now), "1700000000123.webm");
    assert_eq!(output_file_name(Container::Matroska, now), "1700000000123.mkv");
}

#[test]
fn test_ring_suggestion() {
    // 16:9 is not wide enough for the strip formula
    assert_eq!(suggest_ring(1920, 1080), (841, 8));
    assert_eq!(suggest_ring(1080, 1920), (841, 8));
    // very wide strip
    let (radius, stroke) = suggest_ring(1400, 100);
    assert_eq!(radius, 467);
    assert_eq!(stroke, 4);
    assert_eq!(suggest_ring(10, 10), (7, 0));
}

#[test]
fn test_trim_end_suggestion() {
    assert_eq!(suggest_trim_end(60_123_456), 58_100_000);
    assert_eq!(suggest_trim_end(1_000_000), 0);
}
