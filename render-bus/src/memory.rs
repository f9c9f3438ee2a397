//! In-memory collaborators for uncompressed RGBA video.
//!
//! Video packets carry raw RGBA rows; the "codec" is `rawvideo`. The muxer
//! writes a small length-prefixed container into a [`ChunkedSink`] and can
//! parse it back, which is enough to exercise the whole pipeline without any
//! native codec library.
//!
//! [`ChunkedSink`]: crate::sink::ChunkedSink

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::io::{Seek, SeekFrom, Write};

use bytes::{Buf, Bytes};

use crate::error::{BusError, BusResult};
use crate::frame::Frame;
use crate::packet::Packet;
use crate::sink::{SharedSink, SinkWriter};
use crate::source::{
    EncoderSettings, FrameDecoder, FrameEncoder, MediaBackend, MediaSource, MuxPlan, Muxer,
    SeekMode,
};
use crate::stream::{AudioStreamInfo, StreamInfo, TimeBase};

pub const RAW_CODEC: &str = "rawvideo";

const MAGIC: &[u8; 4] = b"DRVM";
const HEADER_LEN: u64 = 12;
const COUNT_OFFSET: u64 = 8;

/// A complete "file": stream layout plus interleaved packets.
#[derive(Debug, Clone)]
pub struct MemoryMedia {
    info: StreamInfo,
    packets: Vec<Packet>,
}

impl MemoryMedia {
    pub fn new(width: u32, height: u32, time_base: TimeBase) -> Self {
        Self {
            info: StreamInfo {
                video_index: 0,
                time_base,
                duration_us: 0,
                total_frames: 0,
                codec: RAW_CODEC.to_string(),
                coded_width: width,
                coded_height: height,
                audio: None,
            },
            packets: Vec::new(),
        }
    }

    pub fn with_audio(mut self, codec: &str, time_base: TimeBase) -> Self {
        self.info.audio = Some(AudioStreamInfo {
            index: 1,
            codec: codec.to_string(),
            time_base,
        });
        self
    }

    /// Appends a video packet holding `frame`'s pixels. The frame's
    /// microsecond timing is converted to the video time base.
    pub fn push_frame(&mut self, frame: &Frame, key: bool) -> BusResult<()> {
        if frame.width() != self.info.coded_width || frame.height() != self.info.coded_height {
            return Err(BusError::Config(format!(
                "frame is {}x{}, stream is {}x{}",
                frame.width(),
                frame.height(),
                self.info.coded_width,
                self.info.coded_height
            )));
        }
        let tb = self.info.time_base;
        let packet = Packet::new(
            self.info.video_index,
            Bytes::copy_from_slice(frame.data()),
            tb,
        )
        .with_pts(tb.from_us(frame.timestamp()))
        .with_duration(tb.from_us(frame.duration()))
        .with_key(key);
        self.info.total_frames += 1;
        self.info.duration_us = self
            .info
            .duration_us
            .max(frame.timestamp() + frame.duration());
        self.packets.push(packet);
        Ok(())
    }

    /// Appends an audio packet, timestamps in the audio time base.
    pub fn push_audio(&mut self, pts: i64, duration: i64, data: impl Into<Bytes>) -> BusResult<()> {
        let audio = self
            .info
            .audio
            .as_ref()
            .ok_or_else(|| BusError::Config("media has no audio stream".to_string()))?;
        let packet = Packet::new(audio.index, data, audio.time_base)
            .with_pts(pts)
            .with_duration(duration)
            .with_key(true);
        self.packets.push(packet);
        Ok(())
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    pub fn into_source(self) -> MemorySource {
        MemorySource {
            info: self.info,
            packets: self.packets,
            cursor: 0,
        }
    }
}

pub struct MemorySource {
    info: StreamInfo,
    packets: Vec<Packet>,
    cursor: usize,
}

impl MemorySource {
    pub fn position(&self) -> usize {
        self.cursor
    }

    fn video_keys(&self) -> impl Iterator<Item = (usize, i64)> + '_ {
        let video = self.info.video_index;
        self.packets
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.index() == video && p.is_key())
            .filter_map(|(i, p)| p.pts_us().map(|ts| (i, ts)))
    }
}

impl MediaSource for MemorySource {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn read_packet(&mut self) -> BusResult<Option<Packet>> {
        let packet = self.packets.get(self.cursor).cloned();
        if packet.is_some() {
            self.cursor += 1;
        }
        Ok(packet)
    }

    fn seek(&mut self, ts_us: i64, mode: SeekMode) -> BusResult<()> {
        let before = self.video_keys().filter(|(_, ts)| *ts <= ts_us).last();
        let after = self.video_keys().find(|(_, ts)| *ts >= ts_us);
        let target = match mode {
            SeekMode::AtOrBefore => before.or_else(|| self.video_keys().next()),
            SeekMode::AtOrAfter => after,
            SeekMode::Approximate => match (before, after) {
                (Some(b), Some(a)) if a.1 - ts_us < ts_us - b.1 => Some(a),
                (Some(b), _) => Some(b),
                (None, a) => a,
            },
        };
        match target {
            Some((index, _)) => {
                // start the read at the earliest packet of any stream sharing
                // the keyframe's time so interleaved audio is not skipped
                let key_ts = self.packets[index].pts_us().unwrap_or_default();
                let start = self.packets[..index]
                    .iter()
                    .rposition(|p| p.pts_us().is_some_and(|ts| ts < key_ts))
                    .map(|i| i + 1)
                    .unwrap_or(0);
                self.cursor = start;
                Ok(())
            }
            None => Err(BusError::Seek {
                ts_us,
                reason: format!("no keyframe for {:?}", mode),
            }),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Turns raw RGBA packets into frames, holding back `delay` frames the way a
/// real decoder's reorder buffer does.
pub struct RawVideoDecoder {
    width: u32,
    height: u32,
    delay: usize,
    queue: VecDeque<Frame>,
}

impl RawVideoDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            delay: 0,
            queue: VecDeque::new(),
        }
    }

    pub fn with_delay(mut self, delay: usize) -> Self {
        self.delay = delay;
        self
    }
}

impl FrameDecoder for RawVideoDecoder {
    fn decode(&mut self, packet: &Packet) -> BusResult<()> {
        let tb = packet.time_base();
        let timestamp = packet.pts_us().unwrap_or_default();
        let duration = tb.to_us(packet.duration());
        let frame = Frame::new(self.width, self.height, packet.data().to_vec())?
            .with_timing(timestamp, duration);
        self.queue.push_back(frame);
        Ok(())
    }

    fn receive_frame(&mut self) -> BusResult<Option<Frame>> {
        if self.queue.len() > self.delay {
            return Ok(self.queue.pop_front());
        }
        Ok(None)
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }

    fn flush(&mut self) -> BusResult<Vec<Frame>> {
        Ok(self.queue.drain(..).collect())
    }
}

/// Emits each frame's pixels as one packet, microsecond time base.
pub struct RawVideoEncoder {
    settings: EncoderSettings,
    delay: usize,
    flushing: bool,
    queue: VecDeque<Packet>,
}

impl RawVideoEncoder {
    pub fn new(settings: EncoderSettings) -> Self {
        Self {
            settings,
            delay: 0,
            flushing: false,
            queue: VecDeque::new(),
        }
    }

    pub fn with_delay(mut self, delay: usize) -> Self {
        self.delay = delay;
        self
    }
}

impl FrameEncoder for RawVideoEncoder {
    fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    fn encode(&mut self, frame: Frame, keyframe: bool) -> BusResult<()> {
        if self.flushing {
            return Err(BusError::Encode("encoder already flushed".to_string()));
        }
        if frame.width() != self.settings.width || frame.height() != self.settings.height {
            return Err(BusError::Encode(format!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                self.settings.width,
                self.settings.height
            )));
        }
        let packet = Packet::new(0, frame.data().to_vec(), TimeBase::MICROS)
            .with_pts(frame.timestamp())
            .with_duration(frame.duration())
            .with_key(keyframe);
        self.queue.push_back(packet);
        Ok(())
    }

    fn receive_packet(&mut self) -> BusResult<Option<Packet>> {
        if self.flushing || self.queue.len() > self.delay {
            return Ok(self.queue.pop_front());
        }
        Ok(None)
    }

    fn pending(&self) -> usize {
        self.queue.len()
    }

    fn flush(&mut self) -> BusResult<()> {
        self.flushing = true;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// One record of the raw container.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxedPacket {
    pub stream: usize,
    pub key: bool,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub time_base: TimeBase,
    pub data: Bytes,
}

pub struct MemoryMuxer {
    writer: SinkWriter,
    streams: usize,
    started: bool,
    packets: u32,
}

impl MemoryMuxer {
    pub fn new(sink: SharedSink, streams: usize) -> Self {
        Self {
            writer: SinkWriter::new(sink),
            streams,
            started: false,
            packets: 0,
        }
    }

    /// Parses bytes produced by [`MemoryMuxer`].
    pub fn parse(data: &[u8]) -> BusResult<Vec<MuxedPacket>> {
        let malformed = |what: &str| BusError::Mux(format!("malformed raw container: {}", what));
        let mut buf = data;
        if buf.remaining() < HEADER_LEN as usize || &buf[..4] != MAGIC {
            return Err(malformed("bad header"));
        }
        buf.advance(8);
        let count = buf.get_u32_le();

        let mut packets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if buf.remaining() < 36 {
                return Err(malformed("truncated record"));
            }
            let stream = buf.get_u8() as usize;
            let key = buf.get_u8() != 0;
            buf.advance(2);
            let pts = buf.get_i64_le();
            let dts = buf.get_i64_le();
            let duration = buf.get_i64_le();
            let time_base = TimeBase::new(buf.get_i32_le(), buf.get_i32_le());
            if buf.remaining() < 4 {
                return Err(malformed("truncated record"));
            }
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                return Err(malformed("truncated payload"));
            }
            let data = Bytes::copy_from_slice(&buf[..len]);
            buf.advance(len);
            packets.push(MuxedPacket {
                stream,
                key,
                pts,
                dts,
                duration,
                time_base,
                data,
            });
        }
        Ok(packets)
    }

    fn io(e: std::io::Error) -> BusError {
        BusError::Mux(e.to_string())
    }
}

impl Muxer for MemoryMuxer {
    fn write_header(&mut self) -> BusResult<()> {
        if self.started {
            return Err(BusError::Mux("header already written".to_string()));
        }
        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(MAGIC);
        header.push(1);
        header.push(self.streams as u8);
        header.extend_from_slice(&[0, 0]);
        header.extend_from_slice(&0u32.to_le_bytes());
        self.writer.write_all(&header).map_err(Self::io)?;
        self.started = true;
        Ok(())
    }

    fn write_packet(&mut self, packet: Packet, stream: usize) -> BusResult<()> {
        if !self.started {
            return Err(BusError::Mux("packet before header".to_string()));
        }
        if stream >= self.streams {
            return Err(BusError::Mux(format!("no output stream {}", stream)));
        }
        let tb = packet.time_base();
        let mut record = Vec::with_capacity(40 + packet.size());
        record.push(stream as u8);
        record.push(packet.is_key() as u8);
        record.extend_from_slice(&[0, 0]);
        record.extend_from_slice(&packet.pts().unwrap_or_default().to_le_bytes());
        record.extend_from_slice(&packet.dts().unwrap_or_default().to_le_bytes());
        record.extend_from_slice(&packet.duration().to_le_bytes());
        record.extend_from_slice(&tb.num.to_le_bytes());
        record.extend_from_slice(&tb.den.to_le_bytes());
        record.extend_from_slice(&(packet.size() as u32).to_le_bytes());
        record.extend_from_slice(packet.data());
        self.writer.write_all(&record).map_err(Self::io)?;
        self.packets += 1;
        Ok(())
    }

    fn finish(&mut self) -> BusResult<()> {
        if !self.started {
            return Err(BusError::Mux("finish before header".to_string()));
        }
        let end = self.writer.position();
        self.writer
            .seek(SeekFrom::Start(COUNT_OFFSET))
            .map_err(Self::io)?;
        self.writer
            .write_all(&self.packets.to_le_bytes())
            .map_err(Self::io)?;
        self.writer.seek(SeekFrom::Start(end)).map_err(Self::io)?;
        log::debug!("raw container finished with {} packets", self.packets);
        Ok(())
    }
}

/// Serves named [`MemoryMedia`] and builds raw collaborators around them.
#[derive(Default)]
pub struct MemoryBackend {
    media: HashMap<String, MemoryMedia>,
    decoder_delay: usize,
    encoder_delay: usize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_media(mut self, name: &str, media: MemoryMedia) -> Self {
        self.media.insert(name.to_string(), media);
        self
    }

    pub fn with_delays(mut self, decoder: usize, encoder: usize) -> Self {
        self.decoder_delay = decoder;
        self.encoder_delay = encoder;
        self
    }
}

impl MediaBackend for MemoryBackend {
    fn open(&self, path: &str) -> BusResult<(Box<dyn MediaSource>, Box<dyn FrameDecoder>)> {
        let media = self.media.get(path).cloned().ok_or_else(|| {
            BusError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no in-memory media named {}", path),
            ))
        })?;
        let decoder = RawVideoDecoder::new(media.info.coded_width, media.info.coded_height)
            .with_delay(self.decoder_delay);
        Ok((Box::new(media.into_source()), Box::new(decoder)))
    }

    fn encoder(&self, settings: &EncoderSettings) -> BusResult<Box<dyn FrameEncoder>> {
        Ok(Box::new(
            RawVideoEncoder::new(settings.clone()).with_delay(self.encoder_delay),
        ))
    }

    fn muxer(
        &self,
        plan: &MuxPlan,
        _source: &dyn MediaSource,
        _encoder: &dyn FrameEncoder,
        sink: SharedSink,
    ) -> BusResult<Box<dyn Muxer>> {
        let streams = if plan.audio.is_some() { 2 } else { 1 };
        Ok(Box::new(MemoryMuxer::new(sink, streams)))
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod memory_test;
