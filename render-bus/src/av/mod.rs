//! FFmpeg-backed collaborators.
//!
//! Demuxing and decoding go through `ffmpeg-next`, pictures reach the core as
//! RGBA; rendered RGBA frames are converted back for the encoder and the muxer
//! writes the container into a [`ChunkedSink`](crate::sink::ChunkedSink).

mod encoder;
mod input;
mod output;

pub use encoder::{AvEncoder, find_hw_encoder, software_encoder};
pub use input::{AvDecoder, AvSource};
pub use output::AvMuxer;

use crate::error::{BusError, BusResult};
use crate::sink::SharedSink;
use crate::source::{
    EncoderSettings, FrameDecoder, FrameEncoder, MediaBackend, MediaSource, MuxPlan, Muxer,
};
use crate::stream::TimeBase;

/// Registers FFmpeg components. Call once at startup.
pub fn init() -> BusResult<()> {
    ffmpeg_next::init().map_err(|e| BusError::Config(format!("ffmpeg_next init: {}", e)))
}

pub(crate) fn av_error(kind: fn(String) -> BusError, e: ffmpeg_next::Error) -> BusError {
    kind(e.to_string())
}

pub(crate) fn time_base(r: ffmpeg_next::Rational) -> TimeBase {
    TimeBase::new(r.numerator(), r.denominator())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AvBackend;

impl AvBackend {
    pub fn new() -> Self {
        Self
    }
}

impl MediaBackend for AvBackend {
    fn open(&self, path: &str) -> BusResult<(Box<dyn MediaSource>, Box<dyn FrameDecoder>)> {
        let (source, decoder) = AvSource::open(path)?;
        Ok((Box::new(source), Box::new(decoder)))
    }

    fn encoder(&self, settings: &EncoderSettings) -> BusResult<Box<dyn FrameEncoder>> {
        Ok(Box::new(AvEncoder::new(settings)?))
    }

    fn muxer(
        &self,
        plan: &MuxPlan,
        source: &dyn MediaSource,
        encoder: &dyn FrameEncoder,
        sink: SharedSink,
    ) -> BusResult<Box<dyn Muxer>> {
        let encoder = encoder
            .as_any()
            .downcast_ref::<AvEncoder>()
            .ok_or_else(|| BusError::Mux("encoder is not an ffmpeg encoder".to_string()))?;
        let audio = match &plan.audio {
            Some(info) => {
                let source = source
                    .as_any()
                    .downcast_ref::<AvSource>()
                    .ok_or_else(|| BusError::Mux("source is not an ffmpeg input".to_string()))?;
                Some(source.parameters(info.index).ok_or_else(|| {
                    BusError::Mux(format!("audio stream {} not found", info.index))
                })?)
            }
            None => None,
        };
        Ok(Box::new(AvMuxer::new(plan, encoder.parameters(), audio, sink)?))
    }
}
