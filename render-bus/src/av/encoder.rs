use std::any::Any;

use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{Context as ScalingContext, flag::Flags};
use ffmpeg_next::{Dictionary, Rational, picture};

use crate::error::{BusError, BusResult};
use crate::frame::Frame;
use crate::packet::Packet;
use crate::source::{EncoderSettings, FrameEncoder, RateControl};
use crate::stream::TimeBase;

use super::av_error;

/// Software encoder for a codec string family.
pub fn software_encoder(family: &str) -> Option<&'static str> {
    match family {
        "avc1" | "avc3" => Some("libx264"),
        "hvc1" | "hev1" => Some("libx265"),
        "vp09" => Some("libvpx-vp9"),
        "vp08" | "vp8" => Some("libvpx"),
        "av01" => Some("libsvtav1"),
        _ => None,
    }
}

/// First available hardware encoder matching a software encoder name.
pub fn find_hw_encoder(codec_name: &str) -> Option<ffmpeg_next::Codec> {
    let hw_names: &[&str] = match codec_name {
        "libx264" => &["h264_nvenc", "h264_vaapi", "h264_qsv", "h264_v4l2m2m"],
        "libx265" => &["hevc_nvenc", "hevc_vaapi", "hevc_qsv", "hevc_v4l2m2m"],
        "libvpx-vp9" => &["vp9_vaapi", "vp9_qsv"],
        "libsvtav1" | "libaom-av1" => &["av1_nvenc", "av1_vaapi", "av1_qsv"],
        _ => &[],
    };

    for name in hw_names {
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
            log::info!("found hardware encoder: {}", name);
            return Some(codec);
        }
    }
    None
}

fn is_hw(codec_name: &str) -> bool {
    ["nvenc", "vaapi", "qsv", "v4l2m2m"]
        .iter()
        .any(|suffix| codec_name.contains(suffix))
}

fn open_encoder(
    codec: ffmpeg_next::Codec,
    settings: &EncoderSettings,
) -> BusResult<(ffmpeg_next::codec::encoder::Video, Pixel)> {
    let name = codec.name().to_string();
    let format = if is_hw(&name) { Pixel::NV12 } else { Pixel::YUV420P };

    let mut encoder = ffmpeg_next::codec::Context::new_with_codec(codec)
        .encoder()
        .video()
        .map_err(|e| av_error(BusError::Encode, e))?;
    encoder.set_width(settings.width);
    encoder.set_height(settings.height);
    encoder.set_format(format);
    encoder.set_frame_rate(Some(Rational(settings.framerate as i32, 1)));
    encoder.set_time_base(ffmpeg_next::util::mathematics::rescale::TIME_BASE);
    encoder.set_bit_rate(settings.bitrate as usize);
    if settings.rate_control == RateControl::Constant {
        encoder.set_max_bit_rate(settings.bitrate as usize);
    }

    let mut opts = Dictionary::new();
    if name == "libx264" || name == "libx265" {
        opts.set("preset", "veryfast");
    }
    let encoder = encoder
        .open_with(opts)
        .map_err(|e| av_error(BusError::Encode, e))?;
    Ok((encoder, format))
}

pub struct AvEncoder {
    settings: EncoderSettings,
    inner: ffmpeg_next::codec::encoder::Video,
    format: Pixel,
    scaler: ScalingContext,
    in_flight: usize,
}

// the scaler holds raw pointers but is never shared
unsafe impl Send for AvEncoder {}

impl AvEncoder {
    pub fn new(settings: &EncoderSettings) -> BusResult<Self> {
        let family = settings.family();
        let sw_name = software_encoder(family)
            .ok_or_else(|| BusError::Encode(format!("unsupported codec {}", settings.codec)))?;

        // hardware first, software when it is missing or refuses to open
        let opened = match find_hw_encoder(sw_name) {
            Some(hw) => {
                let hw_name = hw.name().to_string();
                log::info!("attempting hardware encoder: {}", hw_name);
                match open_encoder(hw, settings) {
                    Ok(opened) => Some(opened),
                    Err(e) => {
                        log::warn!(
                            "hardware encoder {} failed: {}, falling back to {}",
                            hw_name,
                            e,
                            sw_name
                        );
                        None
                    }
                }
            }
            None => None,
        };
        let (inner, format) = match opened {
            Some(opened) => opened,
            None => {
                let sw = ffmpeg_next::encoder::find_by_name(sw_name)
                    .ok_or_else(|| BusError::Encode(format!("codec not found: {}", sw_name)))?;
                open_encoder(sw, settings)?
            }
        };
        log::info!(
            "encoder opened: {}x{} {} @ {}bps",
            settings.width,
            settings.height,
            settings.codec,
            settings.bitrate
        );

        let scaler = ScalingContext::get(
            Pixel::RGBA,
            settings.width,
            settings.height,
            format,
            settings.width,
            settings.height,
            Flags::BILINEAR,
        )
        .map_err(|e| av_error(BusError::Encode, e))?;

        Ok(Self {
            settings: settings.clone(),
            inner,
            format,
            scaler,
            in_flight: 0,
        })
    }

    /// Stream parameters for the muxer.
    pub fn parameters(&self) -> ffmpeg_next::codec::Parameters {
        ffmpeg_next::codec::Parameters::from(&self.inner)
    }

    fn convert(&mut self, frame: &Frame) -> BusResult<ffmpeg_next::frame::Video> {
        let (w, h) = (frame.width(), frame.height());
        let mut rgba = ffmpeg_next::frame::Video::new(Pixel::RGBA, w, h);
        let row = w as usize * 4;
        let stride = rgba.stride(0);
        let plane = rgba.data_mut(0);
        for (y, src) in frame.data().chunks_exact(row).enumerate() {
            plane[y * stride..y * stride + row].copy_from_slice(src);
        }

        let mut converted = ffmpeg_next::frame::Video::new(self.format, w, h);
        self.scaler
            .run(&rgba, &mut converted)
            .map_err(|e| av_error(BusError::Encode, e))?;
        Ok(converted)
    }
}

impl FrameEncoder for AvEncoder {
    fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    fn encode(&mut self, frame: Frame, keyframe: bool) -> BusResult<()> {
        if frame.width() != self.settings.width || frame.height() != self.settings.height {
            return Err(BusError::Encode(format!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                self.settings.width,
                self.settings.height
            )));
        }
        let mut converted = self.convert(&frame)?;
        converted.set_pts(Some(frame.timestamp()));
        if keyframe {
            converted.set_kind(picture::Type::I);
        }
        self.inner
            .send_frame(&converted)
            .map_err(|e| av_error(BusError::Encode, e))?;
        self.in_flight += 1;
        Ok(())
    }

    fn receive_packet(&mut self) -> BusResult<Option<Packet>> {
        let mut packet = ffmpeg_next::Packet::empty();
        match self.inner.receive_packet(&mut packet) {
            Ok(()) => {}
            Err(ffmpeg_next::Error::Other { errno })
                if errno == ffmpeg_next::util::error::EAGAIN =>
            {
                return Ok(None);
            }
            Err(ffmpeg_next::Error::Eof) => return Ok(None),
            Err(e) => return Err(av_error(BusError::Encode, e)),
        }
        self.in_flight = self.in_flight.saturating_sub(1);

        let mut duration = packet.duration();
        if duration <= 0 && self.settings.framerate > 0 {
            duration = 1_000_000 / self.settings.framerate as i64;
        }
        let data = packet.data().map(|d| d.to_vec()).unwrap_or_default();
        let mut out = Packet::new(0, data, TimeBase::MICROS)
            .with_duration(duration)
            .with_key(packet.is_key());
        if let Some(pts) = packet.pts() {
            out = out.with_pts(pts);
        }
        if let Some(dts) = packet.dts() {
            out = out.with_dts(dts);
        }
        Ok(Some(out))
    }

    fn pending(&self) -> usize {
        self.in_flight
    }

    fn flush(&mut self) -> BusResult<()> {
        self.inner
            .send_eof()
            .map_err(|e| av_error(BusError::Encode, e))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
