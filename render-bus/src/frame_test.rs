use super::{Frame, RotationCode};

#[test]
fn test_frame_rejects_short_buffer() {
    assert!(Frame::new(4, 4, vec![0; 10]).is_err());
    assert!(Frame::new(4, 4, vec![0; 64]).is_ok());
}

#[test]
fn test_pixel_outside_reads_clear() {
    let frame = Frame::filled(2, 2, [10, 20, 30, 255]);
    assert_eq!(frame.pixel_or_clear(1, 1), [10, 20, 30, 255]);
    assert_eq!(frame.pixel_or_clear(-1, 0), [0, 0, 0, 0]);
    assert_eq!(frame.pixel_or_clear(2, 0), [0, 0, 0, 0]);
}

#[test]
fn test_mean_rgb_counts_outside_as_black() {
    let frame = Frame::filled(2, 2, [200, 100, 50, 255]);
    assert_eq!(frame.mean_rgb(0, 0, 2, 2), [200.0, 100.0, 50.0]);
    // half of the 4x1 strip is outside
    assert_eq!(frame.mean_rgb(0, 0, 4, 1), [100.0, 50.0, 25.0]);
}

#[test]
fn test_rotation_code_fields() {
    let code = RotationCode::from_fields([1, 2, 3, 4]);
    assert_eq!(code.0, 512 + 2 * 64 + 3 * 8 + 4);
    assert_eq!(code.fields(), [1, 2, 3, 4]);
    assert_eq!(code.field(2), 3);
    assert_eq!(code.with_field(0, 7).fields(), [7, 2, 3, 4]);
    assert_eq!(code.to_string(), "1234");
    assert!(RotationCode::default().is_zero());
}
