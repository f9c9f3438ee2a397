//! Output geometry, bitrate and container decisions made before encoding.

use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::{MAX_OUTPUT_DIM, RenderConfig};
use crate::error::{BusError, BusResult};

const MACROBLOCK: u32 = 16;

// audio codecs an MP4 muxer accepts, FFmpeg spelling
const MP4_AUDIO: &[&str] = &[
    "aac",
    "ac3",
    "ac4",
    "alac",
    "dts",
    "eac3",
    "dvaudio",
    "gsm",
    "ilbc",
    "mace3",
    "mace6",
    "mp1",
    "mp2",
    "mp3",
    "nellymoser",
    "qcelp",
    "qdm2",
    "qdmc",
    "speex",
    "evrc",
    "smv",
    "flac",
    "truehd",
    "opus",
    "mpegh_3d_audio",
    "amr_nb",
    "amr_wb",
    "adpcm_ima_qt",
    "pcm_mulaw",
    "pcm_alaw",
    "pcm_f32be",
    "pcm_f32le",
    "pcm_f64be",
    "pcm_f64le",
    "pcm_s16be",
    "pcm_s16le",
    "pcm_s24be",
    "pcm_s24le",
    "pcm_s32be",
    "pcm_s32le",
    "pcm_s8",
    "pcm_u8",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Container {
    WebM,
    Mp4,
    Matroska,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Container::WebM => "webm",
            Container::Mp4 => "mp4",
            Container::Matroska => "mkv",
        }
    }

    /// Short name of the FFmpeg muxer.
    pub fn format_name(&self) -> &'static str {
        match self {
            Container::WebM => "webm",
            Container::Mp4 => "mp4",
            Container::Matroska => "matroska",
        }
    }
}

impl Display for Container {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.format_name())
    }
}

/// Picks the container for a video codec string and optional audio codec.
pub fn choose_container(codec: &str, audio_codec: Option<&str>) -> Container {
    let family = codec.split('.').next().unwrap_or_default();
    let webm_video = matches!(family, "av01" | "vp09" | "vp8");
    let webm_audio = matches!(audio_codec, None | Some("opus") | Some("vorbis"));
    if webm_video && webm_audio {
        return Container::WebM;
    }

    let mp4_video = matches!(family, "avc1" | "hvc1" | "av01" | "vp09");
    let mp4_audio = audio_codec.is_none_or(|a| MP4_AUDIO.contains(&a));
    if mp4_video && mp4_audio {
        return Container::Mp4;
    }

    Container::Matroska
}

/// `<unix-ms>.<ext>`
pub fn output_file_name(container: Container, now: SystemTime) -> String {
    let ms = now
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{}.{}", ms, container.extension())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputPlan {
    /// Side of the square output, a multiple of 16.
    pub output_dim: u32,
    /// Diagonal of the cropped input; the rotated frame always fits in it.
    pub diagonal: u32,
    /// Input-to-output scale, never above 1.
    pub scale: f32,
}

pub fn plan_output(config: &RenderConfig, width: u32, height: u32) -> BusResult<OutputPlan> {
    let (w, h) = config.cropped_size(width, height).ok_or_else(|| {
        BusError::Config(format!(
            "crop {}/{}/{}/{} leaves nothing of a {}x{} frame",
            config.crop_left, config.crop_top, config.crop_right, config.crop_bottom, width, height
        ))
    })?;
    let diagonal = ((w as f64).powi(2) + (h as f64).powi(2)).sqrt().floor() as u32;
    let macroblock_dim = diagonal / MACROBLOCK * MACROBLOCK;
    let requested = config.output_dim / MACROBLOCK * MACROBLOCK;
    let output_dim = requested.min(macroblock_dim).min(MAX_OUTPUT_DIM);
    if output_dim == 0 {
        return Err(BusError::Config(format!(
            "output size {} is too small for a {}x{} crop",
            config.output_dim, w, h
        )));
    }
    let scale = (output_dim as f32 / diagonal as f32).min(1.0);
    Ok(OutputPlan {
        output_dim,
        diagonal,
        scale,
    })
}

/// Scales a bitrate given for 30 fps to the input's real frame rate.
pub fn encoder_bitrate(output_bitrate: u64, total_frames: u64, duration_us: i64) -> u64 {
    if total_frames == 0 || duration_us <= 0 {
        return output_bitrate;
    }
    let fps = total_frames as f64 * 1_000_000.0 / duration_us as f64;
    (output_bitrate as f64 * 30.0 / fps).round() as u64
}

/// Suggested background ring radius and stroke for a cropped frame.
pub fn suggest_ring(width: u32, height: u32) -> (u32, u32) {
    let (long, short) = if height > width {
        (height as f64, width as f64)
    } else {
        (width as f64, height as f64)
    };
    if short <= 0.0 {
        return (0, 0);
    }
    let r = if long * 3.0 / short > 7.0 {
        long / 7.0 * 3.0
    } else {
        short
    };
    let radius = (r * 1.5575 / 2.0).floor();
    let stroke = (3.0 * r / 328.0 - 46.0 / 41.0).floor();
    (radius.max(0.0) as u32, stroke.max(0.0) as u32)
}

/// Default trim end: two seconds before the end, on a 100 ms grid.
pub fn suggest_trim_end(duration_us: i64) -> i64 {
    let tenths = duration_us / 100_000;
    (tenths * 100_000 - 2_000_000).max(0)
}

#[cfg(test)]
#[path = "output_test.rs"]
mod output_test;
