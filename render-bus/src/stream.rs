use std::fmt::{Display, Formatter};

/// Rational time base, e.g. 1/90000.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    pub const MICROS: TimeBase = TimeBase {
        num: 1,
        den: 1_000_000,
    };

    pub fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn to_us(&self, ts: i64) -> i64 {
        if self.den == 0 {
            return 0;
        }
        (ts as i128 * self.num as i128 * 1_000_000 / self.den as i128) as i64
    }

    pub fn from_us(&self, us: i64) -> i64 {
        if self.num == 0 {
            return 0;
        }
        (us as i128 * self.den as i128 / (self.num as i128 * 1_000_000)) as i64
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::MICROS
    }
}

impl Display for TimeBase {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[derive(Debug, Clone)]
pub struct AudioStreamInfo {
    pub index: usize,
    /// Short codec name as FFmpeg spells it ("aac", "opus", "pcm_s16le", ...).
    pub codec: String,
    pub time_base: TimeBase,
}

/// Input metadata the core needs from the demuxer.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub video_index: usize,
    pub time_base: TimeBase,
    pub duration_us: i64,
    pub total_frames: u64,
    pub codec: String,
    pub coded_width: u32,
    pub coded_height: u32,
    pub audio: Option<AudioStreamInfo>,
}

impl StreamInfo {
    /// Average frame rate derived from frame count and duration; `None` when
    /// either is unknown.
    pub fn average_fps(&self) -> Option<f64> {
        if self.total_frames == 0 || self.duration_us <= 0 {
            return None;
        }
        Some(self.total_frames as f64 * 1_000_000.0 / self.duration_us as f64)
    }
}

impl Display for StreamInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        writeln!(f, "[VIDEO]")?;
        writeln!(f, "index={}", self.video_index)?;
        writeln!(f, "codec={}", self.codec)?;
        writeln!(f, "coded_size={}x{}", self.coded_width, self.coded_height)?;
        writeln!(f, "time_base={}", self.time_base)?;
        writeln!(f, "duration_sec={:.3}", self.duration_us as f64 / 1_000_000.0)?;
        writeln!(f, "nb_frames={}", self.total_frames)?;
        writeln!(f, "[/VIDEO]")?;
        if let Some(audio) = &self.audio {
            writeln!(f, "[AUDIO]")?;
            writeln!(f, "index={}", audio.index)?;
            writeln!(f, "codec={}", audio.codec)?;
            writeln!(f, "time_base={}", audio.time_base)?;
            writeln!(f, "[/AUDIO]")?;
        }
        Ok(())
    }
}
