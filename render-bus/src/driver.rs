//! Decode → render → encode → mux loop.
//!
//! The driver reads the input once, from just before the trim start until both
//! streams pass the trim end. Video frames go through the render scheduler and
//! reach the encoder in submission order; audio packets are copied through
//! with their timestamps moved back by the trim point. The muxer header is
//! only written once the first encoded video packet exists, so audio read
//! before that is held back.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::config::{PipelineConfig, RenderConfig, pipeline_config};
use crate::error::{BusError, BusResult};
use crate::frame::{Frame, RenderedFrame};
use crate::output::{Container, choose_container, encoder_bitrate, output_file_name, plan_output};
use crate::packet::Packet;
use crate::scheduler::{RenderHandle, RenderScheduler};
use crate::sink::{ChunkedSink, SharedSink, shared};
use crate::source::{
    EncoderSettings, FrameDecoder, FrameEncoder, MediaBackend, MediaSource, MuxPlan, Muxer,
    RateControl, SeekMode,
};
use crate::stream::{AudioStreamInfo, StreamInfo};

const PRE_ROLL_US: i64 = 100_000;

#[derive(Debug, Clone, PartialEq)]
pub struct EncodeSummary {
    pub frames: u64,
    pub packets: u64,
    pub audio_packets: u64,
    pub bytes: u64,
    pub container: Container,
    pub file_name: String,
}

#[derive(Debug, Clone)]
pub struct EncodeOutput {
    pub summary: EncodeSummary,
    pub data: Bytes,
}

/// How long to back off when collaborator queues run deep. `None` at or
/// below `threshold`.
///
/// The delay is the queue depth divided by the submission rate so far
/// (video packets per millisecond), times `scale`.
pub fn throttle_delay(
    max_queue: usize,
    messages: u64,
    elapsed: Duration,
    threshold: usize,
    scale: f64,
) -> Option<Duration> {
    if max_queue <= threshold || messages == 0 {
        return None;
    }
    let per_ms = messages as f64 / (elapsed.as_secs_f64() * 1000.0);
    if !per_ms.is_finite() || per_ms <= 0.0 {
        return None;
    }
    let ms = max_queue as f64 / per_ms * scale;
    Some(Duration::from_secs_f64(ms / 1000.0))
}

/// Forces a keyframe whenever a frame would end past `interval` after the
/// last one. A negative interval never forces.
#[derive(Debug, Clone)]
pub struct KeyframeClock {
    interval_us: i64,
    last_key: Option<i64>,
}

impl KeyframeClock {
    pub fn new(interval_us: i64) -> Self {
        Self {
            interval_us,
            last_key: None,
        }
    }

    pub fn should_key(&mut self, timestamp: i64, duration: i64) -> bool {
        let last = *self.last_key.get_or_insert(timestamp);
        if self.interval_us >= 0 && timestamp + duration > last + self.interval_us {
            self.last_key = Some(timestamp);
            return true;
        }
        false
    }

    /// Keyframes the encoder chose on its own also restart the interval.
    pub fn observe_key(&mut self, timestamp: i64) {
        self.last_key = Some(self.last_key.map_or(timestamp, |last| last.max(timestamp)));
    }
}

struct QueuedFrame {
    handle: RenderHandle,
    timestamp: i64,
    duration: i64,
    keyframe: bool,
}

/// Muxer that writes its header on the first video packet.
struct LazyMuxer {
    muxer: Box<dyn Muxer>,
    started: bool,
    buffered: Vec<(Packet, usize)>,
}

impl LazyMuxer {
    fn new(muxer: Box<dyn Muxer>) -> Self {
        Self {
            muxer,
            started: false,
            buffered: Vec::new(),
        }
    }

    fn write_audio(&mut self, packet: Packet) -> BusResult<()> {
        if self.started {
            self.muxer.write_packet(packet, 1)
        } else {
            self.buffered.push((packet, 1));
            Ok(())
        }
    }

    fn write_video(&mut self, packet: Packet) -> BusResult<()> {
        if !self.started {
            self.muxer.write_header()?;
            self.started = true;
            for (buffered, stream) in std::mem::take(&mut self.buffered) {
                self.muxer.write_packet(buffered, stream)?;
            }
        }
        self.muxer.write_packet(packet, 0)
    }

    fn finish(&mut self) -> BusResult<()> {
        if !self.buffered.is_empty() {
            log::warn!("{} audio packets dropped, no video was muxed", self.buffered.len());
        }
        if self.started {
            self.muxer.finish()?;
        }
        Ok(())
    }
}

/// One encode run over an opened input.
pub struct EncodeDriver<'a> {
    source: &'a mut dyn MediaSource,
    decoder: &'a mut dyn FrameDecoder,
    backend: &'a dyn MediaBackend,
    scheduler: &'a RenderScheduler,
    pipeline: &'a PipelineConfig,
    cancel: CancellationToken,
}

/// Mutable state of one run.
struct EncodeRun {
    info: StreamInfo,
    config: Arc<RenderConfig>,
    scale: f32,
    trim_start: i64,
    trim_end: i64,
    real_trim: Option<i64>,
    clock: KeyframeClock,
    queued: VecDeque<QueuedFrame>,
    frames: u64,
    packets: u64,
    audio_packets: u64,
    messages: u64,
}

impl<'a> EncodeDriver<'a> {
    pub fn new(
        source: &'a mut dyn MediaSource,
        decoder: &'a mut dyn FrameDecoder,
        backend: &'a dyn MediaBackend,
        scheduler: &'a RenderScheduler,
    ) -> Self {
        Self {
            source,
            decoder,
            backend,
            scheduler,
            pipeline: pipeline_config(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: &'a PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(mut self, config: &RenderConfig) -> BusResult<EncodeOutput> {
        config.validate()?;
        let info = self.source.info().clone();
        let plan = plan_output(config, info.coded_width, info.coded_height)?;
        let mut snapshot = config.clone();
        snapshot.output_dim = plan.output_dim;

        let settings = EncoderSettings {
            codec: config.codec.clone(),
            bitrate: encoder_bitrate(config.output_bitrate, info.total_frames, info.duration_us),
            width: plan.output_dim,
            height: plan.output_dim,
            framerate: self.pipeline.framerate,
            rate_control: RateControl::Variable,
        };
        log::info!(
            "encoding {} {}x{} at {} bit/s, trim {}us..{}us",
            settings.codec,
            settings.width,
            settings.height,
            settings.bitrate,
            config.trim_start_us,
            config.trim_end()
        );

        let seek_start = (config.trim_start_us - PRE_ROLL_US).max(0);
        let real_trim = match &info.audio {
            Some(audio) => self.find_audio_trim(audio, seek_start, config.trim_start_us)?,
            None => None,
        };

        let mut encoder = self.backend.encoder(&settings)?;
        let container = choose_container(&settings.codec, info.audio.as_ref().map(|a| a.codec.as_str()));
        let file_name = output_file_name(container, SystemTime::now());
        let mux_plan = MuxPlan {
            container,
            file_name: file_name.clone(),
            video: settings,
            video_time_base: info.time_base,
            audio: info.audio.clone(),
        };
        let sink = shared(ChunkedSink::with_segment_size(self.pipeline.segment_size));
        let muxer = self
            .backend
            .muxer(&mux_plan, &*self.source, &*encoder, sink.clone())?;
        let mut muxer = LazyMuxer::new(muxer);

        let mut run = EncodeRun {
            info,
            config: Arc::new(snapshot),
            scale: plan.scale,
            trim_start: config.trim_start_us,
            trim_end: config.trim_end(),
            real_trim,
            clock: KeyframeClock::new(config.key_interval_us),
            queued: VecDeque::new(),
            frames: 0,
            packets: 0,
            audio_packets: 0,
            messages: 0,
        };

        self.reposition(seek_start)?;
        self.pump(&mut run, encoder.as_mut(), &mut muxer).await?;

        for frame in self.decoder.flush()? {
            self.accept_frame(&mut run, frame).await?;
        }
        while let Some(queued) = run.queued.pop_front() {
            let result = queued.handle.await;
            encode_rendered(&mut run, encoder.as_mut(), result, queued.timestamp, queued.duration, queued.keyframe)?;
        }
        encoder.flush()?;
        drain_packets(&mut run, encoder.as_mut(), &mut muxer)?;

        if run.frames == 0 {
            return Err(BusError::NoFrames);
        }
        muxer.finish()?;
        drop(muxer);

        let data = take_sink(&sink).finalize()?;
        let summary = EncodeSummary {
            frames: run.frames,
            packets: run.packets,
            audio_packets: run.audio_packets,
            bytes: data.len() as u64,
            container,
            file_name,
        };
        log::info!(
            "encoded {} frames into {} ({} bytes)",
            summary.frames,
            summary.file_name,
            summary.bytes
        );
        Ok(EncodeOutput { summary, data })
    }

    /// Start of the first audio packet that ends after the trim start.
    fn find_audio_trim(
        &mut self,
        audio: &AudioStreamInfo,
        seek_start: i64,
        trim_start: i64,
    ) -> BusResult<Option<i64>> {
        self.reposition(seek_start)?;
        let mut real_trim = None;
        while let Some(packet) = self.source.read_packet()? {
            if packet.index() != audio.index {
                continue;
            }
            let (Some(start), Some(end)) = (packet.pts_us(), packet.end_us()) else {
                continue;
            };
            real_trim = Some(start);
            if end > trim_start {
                break;
            }
        }
        log::debug!("audio trim point {:?}", real_trim);
        Ok(real_trim)
    }

    fn reposition(&mut self, ts_us: i64) -> BusResult<()> {
        self.decoder.flush()?;
        self.source.seek(ts_us, SeekMode::AtOrBefore)
    }

    async fn pump(
        &mut self,
        run: &mut EncodeRun,
        encoder: &mut dyn FrameEncoder,
        muxer: &mut LazyMuxer,
    ) -> BusResult<()> {
        let started = Instant::now();
        let audio = run.info.audio.clone();
        let mut audio_end = audio.is_none();
        let mut video_end = false;

        while let Some(mut packet) = self.source.read_packet()? {
            if self.cancel.is_cancelled() {
                return Err(BusError::Cancelled);
            }

            let pts_us = packet.pts_us().unwrap_or_default();
            match &audio {
                Some(a) if packet.index() == a.index => {
                    if pts_us > run.trim_end {
                        audio_end = true;
                    }
                    let start = run.real_trim.unwrap_or(0);
                    if !audio_end && pts_us >= start {
                        packet.shift(a.time_base.from_us(start));
                        packet.set_index(1);
                        muxer.write_audio(packet)?;
                        run.audio_packets += 1;
                    }
                }
                _ if packet.index() == run.info.video_index => {
                    if pts_us > run.trim_end {
                        video_end = true;
                    } else if let Err(e) = self.decoder.decode(&packet) {
                        log::warn!("decode error at {}us: {:#?}", pts_us, e);
                    } else {
                        run.messages += 1;
                    }
                }
                _ => {}
            }

            loop {
                match self.decoder.receive_frame() {
                    Ok(Some(frame)) => self.accept_frame(run, frame).await?,
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("receive frame error: {:#?}", e);
                        break;
                    }
                }
            }
            drain_renders(run, encoder)?;
            drain_packets(run, encoder, muxer)?;

            let max_queue = self.decoder.pending().max(encoder.pending());
            if let Some(delay) = throttle_delay(
                max_queue,
                run.messages,
                started.elapsed(),
                self.pipeline.backpressure_threshold,
                self.pipeline.throttle_scale,
            ) {
                log::trace!("queues at {}, backing off {:?}", max_queue, delay);
                tokio::time::sleep(delay).await;
            }

            if audio_end && video_end {
                break;
            }
        }
        Ok(())
    }

    /// Applies the trim window and submits the frame for rendering.
    async fn accept_frame(&mut self, run: &mut EncodeRun, frame: Frame) -> BusResult<()> {
        let timestamp = frame.timestamp();
        let duration = frame.duration();
        if timestamp >= run.trim_start && run.real_trim.is_none() {
            run.real_trim = Some(timestamp);
        }
        log::debug!(
            "{:.2} / {:.2}",
            (timestamp + duration) as f64 / 1_000_000.0,
            run.info.duration_us as f64 / 1_000_000.0
        );

        let start = run.real_trim.unwrap_or(run.trim_start);
        if timestamp < start || timestamp >= run.trim_end {
            return Ok(());
        }

        let keyframe = run.clock.should_key(timestamp, duration);
        let handle = self
            .scheduler
            .submit(frame, run.config.clone(), Some(run.scale))
            .await?;
        run.queued.push_back(QueuedFrame {
            handle,
            timestamp: timestamp - start,
            duration,
            keyframe,
        });
        Ok(())
    }
}

/// Hands every render already committed at the head of the queue to the
/// encoder.
fn drain_renders(run: &mut EncodeRun, encoder: &mut dyn FrameEncoder) -> BusResult<()> {
    while let Some(queued) = run.queued.front_mut() {
        let Some(result) = (&mut queued.handle).now_or_never() else {
            break;
        };
        let (timestamp, duration, keyframe) = (queued.timestamp, queued.duration, queued.keyframe);
        run.queued.pop_front();
        encode_rendered(run, encoder, result, timestamp, duration, keyframe)?;
    }
    Ok(())
}

fn encode_rendered(
    run: &mut EncodeRun,
    encoder: &mut dyn FrameEncoder,
    result: BusResult<RenderedFrame>,
    timestamp: i64,
    duration: i64,
    keyframe: bool,
) -> BusResult<()> {
    let rendered = match result {
        Ok(rendered) => rendered,
        Err(e) if e.is_fatal() => return Err(e),
        Err(e) => {
            log::warn!("frame at {}us not rendered: {}", timestamp, e);
            return Ok(());
        }
    };
    let frame = rendered.frame.with_timing(timestamp, duration);
    match encoder.encode(frame, keyframe) {
        Ok(()) => run.frames += 1,
        Err(e) => log::error!("encode error at {}us: {:#?}", timestamp, e),
    }
    Ok(())
}

fn drain_packets(
    run: &mut EncodeRun,
    encoder: &mut dyn FrameEncoder,
    muxer: &mut LazyMuxer,
) -> BusResult<()> {
    loop {
        let packet = match encoder.receive_packet() {
            Ok(Some(packet)) => packet,
            Ok(None) => return Ok(()),
            Err(e) => {
                log::error!("receive packet error: {:#?}", e);
                return Ok(());
            }
        };
        if packet.is_key() {
            if let Some(ts) = packet.pts_us() {
                run.clock.observe_key(ts + run.real_trim.unwrap_or(0));
            }
        }
        muxer.write_video(packet)?;
        run.packets += 1;
    }
}

// the backend's muxer may still hold a clone of the handle
fn take_sink(sink: &SharedSink) -> ChunkedSink {
    let mut guard = sink.lock().unwrap_or_else(|e| e.into_inner());
    let segment_size = guard.segment_size();
    std::mem::replace(&mut *guard, ChunkedSink::with_segment_size(segment_size))
}

#[cfg(test)]
#[path = "driver_test.rs"]
mod driver_test;
