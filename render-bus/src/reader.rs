use std::collections::VecDeque;
use std::time::Duration;

use crate::error::BusResult;
use crate::frame::Frame;
use crate::source::{FrameDecoder, MediaSource, SeekMode};
use crate::stream::StreamInfo;

/// Pulls decoded video frames out of a source/decoder pair.
///
/// Non-video packets are skipped and decode errors are logged and skipped.
/// At end of input the decoder is drained so its buffered frames still come
/// out.
pub struct FrameReader<'a> {
    source: &'a mut dyn MediaSource,
    decoder: &'a mut dyn FrameDecoder,
    drained: VecDeque<Frame>,
    eof: bool,
    throttle: bool,
}

impl<'a> FrameReader<'a> {
    pub fn new(source: &'a mut dyn MediaSource, decoder: &'a mut dyn FrameDecoder) -> Self {
        Self {
            source,
            decoder,
            drained: VecDeque::new(),
            eof: false,
            throttle: false,
        }
    }

    /// Sleeps after each packet while the decoder holds more than two.
    pub fn with_throttle(mut self, throttle: bool) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn info(&self) -> &StreamInfo {
        self.source.info()
    }

    pub fn pending(&self) -> usize {
        self.decoder.pending() + self.drained.len()
    }

    /// Repositions the source and drops whatever the decoder still holds.
    /// Any mode other than `AtOrBefore` falls back to it on failure.
    pub fn seek(&mut self, ts_us: i64, mode: SeekMode) -> BusResult<()> {
        self.discard()?;
        self.eof = false;
        match self.source.seek(ts_us, mode) {
            Ok(()) => Ok(()),
            Err(e) if mode != SeekMode::AtOrBefore => {
                log::warn!("seek {:?} to {}us failed, retrying at-or-before: {}", mode, ts_us, e);
                self.source.seek(ts_us, SeekMode::AtOrBefore)
            }
            Err(e) => Err(e),
        }
    }

    /// Drops every buffered frame.
    pub fn discard(&mut self) -> BusResult<usize> {
        let dropped = self.decoder.flush()?.len() + self.drained.len();
        self.drained.clear();
        Ok(dropped)
    }

    /// Takes every buffered frame and resets the decoder.
    pub fn drain(&mut self) -> BusResult<Vec<Frame>> {
        let mut frames: Vec<Frame> = self.drained.drain(..).collect();
        frames.extend(self.decoder.flush()?);
        Ok(frames)
    }

    /// Next decoded frame, `None` once input and decoder are exhausted.
    pub async fn next_frame(&mut self) -> BusResult<Option<Frame>> {
        loop {
            if let Some(frame) = self.drained.pop_front() {
                return Ok(Some(frame));
            }
            match self.decoder.receive_frame() {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => {}
                Err(e) => log::warn!("receive frame error: {:#?}", e),
            }
            if self.eof {
                return Ok(None);
            }

            let Some(packet) = self.source.read_packet()? else {
                self.eof = true;
                self.drained.extend(self.decoder.flush()?);
                continue;
            };
            if packet.index() != self.source.info().video_index {
                continue;
            }
            if let Err(e) = self.decoder.decode(&packet) {
                log::warn!("decode error at pts {:?}: {:#?}", packet.pts(), e);
                continue;
            }

            let queued = self.decoder.pending();
            if self.throttle && queued > 2 {
                let duration_us = packet.time_base().to_us(packet.duration()).max(0) as u64;
                tokio::time::sleep(Duration::from_micros(duration_us * queued as u64 / 2)).await;
            }
        }
    }
}
