//! Seams to the demux/decode/encode/mux collaborators.
//!
//! Every call is synchronous and cheap enough to run on the driver task; heavy
//! pixel work lives in the render workers instead.

use std::any::Any;

use crate::error::BusResult;
use crate::frame::Frame;
use crate::output::Container;
use crate::packet::Packet;
use crate::sink::SharedSink;
use crate::stream::{AudioStreamInfo, StreamInfo, TimeBase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// Nearest keyframe at or before the target.
    AtOrBefore,
    /// Nearest keyframe at or after the target.
    AtOrAfter,
    /// Whatever position is cheapest to reach near the target.
    Approximate,
}

pub trait MediaSource: Send {
    fn info(&self) -> &StreamInfo;

    /// Next packet of any stream, `None` at end of input.
    fn read_packet(&mut self) -> BusResult<Option<Packet>>;

    fn seek(&mut self, ts_us: i64, mode: SeekMode) -> BusResult<()>;

    fn as_any(&self) -> &dyn Any;
}

pub trait FrameDecoder: Send {
    fn decode(&mut self, packet: &Packet) -> BusResult<()>;

    fn receive_frame(&mut self) -> BusResult<Option<Frame>>;

    /// Packets accepted but not yet turned into frames.
    fn pending(&self) -> usize;

    /// Drains every frame still buffered and resets the decoder so it can be
    /// fed again after a seek.
    fn flush(&mut self) -> BusResult<Vec<Frame>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateControl {
    #[default]
    Variable,
    Constant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    /// Codec string such as `avc1.640034` or `vp09.00.10.08`.
    pub codec: String,
    pub bitrate: u64,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub rate_control: RateControl,
}

impl EncoderSettings {
    /// Leading four-character family of the codec string.
    pub fn family(&self) -> &str {
        self.codec.split('.').next().unwrap_or_default()
    }
}

pub trait FrameEncoder: Send {
    fn settings(&self) -> &EncoderSettings;

    /// Frame timestamps are microseconds; packets come back in
    /// [`FrameEncoder::time_base`].
    fn encode(&mut self, frame: Frame, keyframe: bool) -> BusResult<()>;

    fn receive_packet(&mut self) -> BusResult<Option<Packet>>;

    fn pending(&self) -> usize;

    /// Signals end of input; the remaining packets become receivable.
    fn flush(&mut self) -> BusResult<()>;

    fn time_base(&self) -> TimeBase {
        TimeBase::MICROS
    }

    fn as_any(&self) -> &dyn Any;
}

pub trait Muxer: Send {
    fn write_header(&mut self) -> BusResult<()>;

    /// `stream` is the output stream: 0 video, 1 audio.
    fn write_packet(&mut self, packet: Packet, stream: usize) -> BusResult<()>;

    fn finish(&mut self) -> BusResult<()>;
}

/// What the muxer has to lay out.
#[derive(Debug, Clone)]
pub struct MuxPlan {
    pub container: Container,
    pub file_name: String,
    pub video: EncoderSettings,
    pub video_time_base: TimeBase,
    pub audio: Option<AudioStreamInfo>,
}

/// Factory for one family of collaborators.
pub trait MediaBackend: Send + Sync {
    fn open(&self, path: &str) -> BusResult<(Box<dyn MediaSource>, Box<dyn FrameDecoder>)>;

    fn encoder(&self, settings: &EncoderSettings) -> BusResult<Box<dyn FrameEncoder>>;

    fn muxer(
        &self,
        plan: &MuxPlan,
        source: &dyn MediaSource,
        encoder: &dyn FrameEncoder,
        sink: SharedSink,
    ) -> BusResult<Box<dyn Muxer>>;
}
