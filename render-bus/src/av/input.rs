use std::any::Any;
use std::path::Path;

use bytes::Bytes;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::media::Type;
use ffmpeg_next::software::scaling::{Context as ScalingContext, flag::Flags};

use crate::error::{BusError, BusResult};
use crate::frame::Frame;
use crate::packet::Packet;
use crate::source::{FrameDecoder, MediaSource, SeekMode};
use crate::stream::{AudioStreamInfo, StreamInfo, TimeBase};

use super::{av_error, time_base};

pub struct AvSource {
    inner: ffmpeg_next::format::context::Input,
    info: StreamInfo,
    time_bases: Vec<TimeBase>,
}

// the demuxer context is only ever used from one task at a time
unsafe impl Send for AvSource {}

impl AvSource {
    /// Opens `url` and builds a decoder for its best video stream.
    pub fn open(url: &str) -> BusResult<(Self, AvDecoder)> {
        let input = ffmpeg_next::format::input(&Path::new(url)).map_err(|e| {
            BusError::Io(std::io::Error::other(format!("open {}: {}", url, e)))
        })?;

        let video = input
            .streams()
            .best(Type::Video)
            .ok_or(BusError::NoVideoStream)?;
        let video_index = video.index();
        let video_tb = time_base(video.time_base());

        let decoder_ctx = ffmpeg_next::codec::Context::from_parameters(video.parameters())
            .map_err(|e| av_error(BusError::Decode, e))?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .map_err(|e| av_error(BusError::Decode, e))?;
        if decoder.format() == Pixel::None || decoder.width() == 0 || decoder.height() == 0 {
            return Err(BusError::Decode("missing codec parameters".to_string()));
        }

        let duration_us = if video.duration() > 0 {
            video_tb.to_us(video.duration())
        } else {
            // container duration is in AV_TIME_BASE units
            input.duration().max(0)
        };
        let rate = video.avg_frame_rate();
        let total_frames = if video.frames() > 0 {
            video.frames() as u64
        } else if rate.numerator() > 0 && rate.denominator() > 0 {
            (duration_us as f64 * rate.numerator() as f64
                / rate.denominator() as f64
                / 1_000_000.0) as u64
        } else {
            0
        };

        let audio = input.streams().best(Type::Audio).map(|a| AudioStreamInfo {
            index: a.index(),
            codec: a.parameters().id().name().to_string(),
            time_base: time_base(a.time_base()),
        });

        let info = StreamInfo {
            video_index,
            time_base: video_tb,
            duration_us,
            total_frames,
            codec: video.parameters().id().name().to_string(),
            coded_width: decoder.width(),
            coded_height: decoder.height(),
            audio,
        };
        let frame_us = if rate.numerator() > 0 {
            1_000_000 * rate.denominator() as i64 / rate.numerator() as i64
        } else {
            0
        };
        let time_bases = input.streams().map(|s| time_base(s.time_base())).collect();

        let decoder = AvDecoder {
            inner: decoder,
            scaler: None,
            time_base: video_tb,
            frame_us,
            in_flight: 0,
        };
        Ok((
            Self {
                inner: input,
                info,
                time_bases,
            },
            decoder,
        ))
    }

    /// Codec parameters of an input stream, for stream copy.
    pub fn parameters(&self, index: usize) -> Option<ffmpeg_next::codec::Parameters> {
        self.inner.stream(index).map(|s| s.parameters())
    }
}

impl MediaSource for AvSource {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn read_packet(&mut self) -> BusResult<Option<Packet>> {
        let mut packet = ffmpeg_next::Packet::empty();
        match packet.read(&mut self.inner) {
            Ok(()) => {}
            Err(ffmpeg_next::Error::Eof) => return Ok(None),
            Err(e) => return Err(av_error(BusError::Decode, e)),
        }
        let index = packet.stream();
        let tb = self.time_bases.get(index).copied().unwrap_or_default();
        let data = packet.data().map(Bytes::copy_from_slice).unwrap_or_default();
        let mut out = Packet::new(index, data, tb)
            .with_duration(packet.duration())
            .with_key(packet.is_key());
        if let Some(pts) = packet.pts() {
            out = out.with_pts(pts);
        }
        if let Some(dts) = packet.dts() {
            out = out.with_dts(dts);
        }
        Ok(Some(out))
    }

    fn seek(&mut self, ts_us: i64, mode: SeekMode) -> BusResult<()> {
        let (min, max) = match mode {
            SeekMode::AtOrBefore => (i64::MIN, ts_us),
            SeekMode::AtOrAfter => (ts_us, i64::MAX),
            SeekMode::Approximate => (i64::MIN, i64::MAX),
        };
        let ret = unsafe {
            ffmpeg_next::ffi::avformat_seek_file(self.inner.as_mut_ptr(), -1, min, ts_us, max, 0)
        };
        if ret < 0 {
            return Err(BusError::Seek {
                ts_us,
                reason: ffmpeg_next::Error::from(ret).to_string(),
            });
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Video decoder converting every picture to RGBA.
pub struct AvDecoder {
    inner: ffmpeg_next::codec::decoder::Video,
    scaler: Option<ScalingContext>,
    time_base: TimeBase,
    frame_us: i64,
    in_flight: usize,
}

// the scaler holds raw pointers but is never shared
unsafe impl Send for AvDecoder {}

impl AvDecoder {
    fn to_rgba(&mut self, decoded: &ffmpeg_next::frame::Video) -> BusResult<Frame> {
        let (w, h) = (decoded.width(), decoded.height());
        let rebuild = match &self.scaler {
            Some(s) => {
                let input = s.input();
                input.format != decoded.format() || input.width != w || input.height != h
            }
            None => true,
        };
        if rebuild {
            let context =
                ScalingContext::get(decoded.format(), w, h, Pixel::RGBA, w, h, Flags::BILINEAR)
                    .map_err(|e| av_error(BusError::Decode, e))?;
            self.scaler = Some(context);
        }
        let Some(scaler) = self.scaler.as_mut() else {
            return Err(BusError::Decode("scaler unavailable".to_string()));
        };

        let mut rgba = ffmpeg_next::frame::Video::empty();
        scaler
            .run(decoded, &mut rgba)
            .map_err(|e| av_error(BusError::Decode, e))?;

        let row = w as usize * 4;
        let stride = rgba.stride(0);
        let plane = rgba.data(0);
        let mut data = Vec::with_capacity(row * h as usize);
        for y in 0..h as usize {
            data.extend_from_slice(&plane[y * stride..y * stride + row]);
        }

        let timestamp = decoded.timestamp().or(decoded.pts()).unwrap_or_default();
        let sar = decoded.aspect_ratio();
        let display_width = if sar.numerator() > 0 && sar.denominator() > 0 {
            (w as i64 * sar.numerator() as i64 / sar.denominator() as i64) as u32
        } else {
            w
        };
        Ok(Frame::new(w, h, data)?
            .with_timing(self.time_base.to_us(timestamp), self.frame_us)
            .with_display_size(display_width, h))
    }
}

impl FrameDecoder for AvDecoder {
    fn decode(&mut self, packet: &Packet) -> BusResult<()> {
        let mut av = ffmpeg_next::Packet::copy(packet.data());
        av.set_pts(packet.pts());
        av.set_dts(packet.dts());
        av.set_duration(packet.duration());
        if packet.is_key() {
            av.set_flags(ffmpeg_next::packet::Flags::KEY);
        }
        self.inner
            .send_packet(&av)
            .map_err(|e| av_error(BusError::Decode, e))?;
        self.in_flight += 1;
        Ok(())
    }

    fn receive_frame(&mut self) -> BusResult<Option<Frame>> {
        let mut decoded = ffmpeg_next::frame::Video::empty();
        match self.inner.receive_frame(&mut decoded) {
            Ok(()) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.to_rgba(&decoded).map(Some)
            }
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(None)
            }
            Err(e) => Err(av_error(BusError::Decode, e)),
        }
    }

    fn pending(&self) -> usize {
        self.in_flight
    }

    fn flush(&mut self) -> BusResult<Vec<Frame>> {
        let mut frames = Vec::new();
        if let Err(e) = self.inner.send_eof() {
            log::warn!("decoder send eof error: {}", e);
        }
        while let Some(frame) = self.receive_frame()? {
            frames.push(frame);
        }
        self.inner.flush();
        self.in_flight = 0;
        Ok(frames)
    }
}
