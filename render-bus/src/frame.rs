use std::fmt::{Display, Formatter};

use crate::error::{BusError, BusResult};

const CHANNELS: usize = 4;

/// A decoded RGBA8 image owned by exactly one pipeline stage at a time.
///
/// `Frame` is intentionally not `Clone`: handing it to a worker moves it, and
/// dropping it releases the pixel buffer.
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    display_width: u32,
    display_height: u32,
    // microseconds
    timestamp: i64,
    duration: i64,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> BusResult<Self> {
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            return Err(BusError::Decode(format!(
                "frame buffer is {} bytes, {}x{} rgba needs {}",
                data.len(),
                width,
                height,
                expected
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            display_width: width,
            display_height: height,
            timestamp: 0,
            duration: 0,
        })
    }

    /// A frame with every pixel set to `rgba`.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * CHANNELS);
        for _ in 0..pixels {
            data.extend_from_slice(&rgba);
        }
        Self {
            data,
            width,
            height,
            display_width: width,
            display_height: height,
            timestamp: 0,
            duration: 0,
        }
    }

    pub fn with_timing(mut self, timestamp: i64, duration: i64) -> Self {
        self.timestamp = timestamp;
        self.duration = duration;
        self
    }

    pub fn with_display_size(mut self, display_width: u32, display_height: u32) -> Self {
        self.display_width = display_width;
        self.display_height = display_height;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn display_width(&self) -> u32 {
        self.display_width
    }

    pub fn display_height(&self) -> u32 {
        self.display_height
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn duration(&self) -> i64 {
        self.duration
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * CHANNELS
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let o = self.offset(x, y);
        Some([
            self.data[o],
            self.data[o + 1],
            self.data[o + 2],
            self.data[o + 3],
        ])
    }

    /// Reads like a canvas: coordinates outside the frame are transparent black.
    pub fn pixel_or_clear(&self, x: i64, y: i64) -> [u8; 4] {
        if x < 0 || y < 0 {
            return [0; 4];
        }
        self.pixel(x as u32, y as u32).unwrap_or([0; 4])
    }

    pub fn put_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let o = self.offset(x, y);
        self.data[o..o + CHANNELS].copy_from_slice(&rgba);
    }

    /// Mean RGB over a rectangle, canvas semantics outside the frame.
    pub fn mean_rgb(&self, x: i64, y: i64, w: u32, h: u32) -> [f64; 3] {
        let count = w as u64 * h as u64;
        if count == 0 {
            return [0.0; 3];
        }
        let mut sum = [0u64; 3];
        for dy in 0..h as i64 {
            for dx in 0..w as i64 {
                let p = self.pixel_or_clear(x + dx, y + dy);
                sum[0] += p[0] as u64;
                sum[1] += p[1] as u64;
                sum[2] += p[2] as u64;
            }
        }
        [
            sum[0] as f64 / count as f64,
            sum[1] as f64 / count as f64,
            sum[2] as f64 / count as f64,
        ]
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Frame {}x{} (display {}x{}), ts: {}us, dur: {}us",
            self.width,
            self.height,
            self.display_width,
            self.display_height,
            self.timestamp,
            self.duration
        )
    }
}

/// Four 3-bit rotation readings packed into one integer. Field 0 occupies the
/// most significant bits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RotationCode(pub u16);

impl RotationCode {
    pub const FIELDS: usize = 4;
    pub const FIELD_VALUES: u8 = 8;

    pub fn from_fields(fields: [u8; 4]) -> Self {
        let mut code = 0u16;
        for v in fields {
            code = (code << 3) | (v & 7) as u16;
        }
        Self(code)
    }

    pub fn field(self, index: usize) -> u8 {
        let shift = 3 * (Self::FIELDS - 1 - index.min(Self::FIELDS - 1));
        ((self.0 >> shift) & 7) as u8
    }

    pub fn fields(self) -> [u8; 4] {
        [self.field(0), self.field(1), self.field(2), self.field(3)]
    }

    pub fn with_field(self, index: usize, value: u8) -> Self {
        let mut fields = self.fields();
        fields[index.min(Self::FIELDS - 1)] = value & 7;
        Self::from_fields(fields)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Display for RotationCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        let [a, b, c, d] = self.fields();
        write!(f, "{}{}{}{}", a, b, c, d)
    }
}

/// Worker output committed in submission order.
#[derive(Debug)]
pub struct RenderedFrame {
    pub frame: Frame,
    pub rotation: RotationCode,
}

#[cfg(test)]
#[path = "frame_test.rs"]
mod frame_test;
