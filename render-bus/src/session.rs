//! One opened input and everything that works on it.
//!
//! A session owns the source/decoder pair, the render scheduler and the seek
//! lock. Every operation that moves the decoder's read position runs while
//! holding the lock, so a session shared between tasks serves them in arrival
//! order. Opening another input tears the previous one down first.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::calibrate::{Crop, block_size_limit, estimate_block_size, estimate_crop, estimate_orientation};
use crate::config::{PipelineConfig, RenderConfig};
use crate::driver::{EncodeDriver, EncodeOutput};
use crate::error::{BusError, BusResult};
use crate::frame::{Frame, RenderedFrame};
use crate::output::{plan_output, suggest_ring, suggest_trim_end};
use crate::reader::FrameReader;
use crate::scheduler::RenderScheduler;
use crate::seek::SeekLock;
use crate::source::{FrameDecoder, MediaBackend, MediaSource, SeekMode};
use crate::stream::StreamInfo;
use crate::worker::FrameTransform;

const END_MARGIN_US: i64 = 2_000_000;
const STEP_BACK_US: i64 = 1_000_000;
const MAX_STEP_BACKS: usize = 8;

struct OpenInput {
    path: String,
    source: Box<dyn MediaSource>,
    decoder: Box<dyn FrameDecoder>,
    info: StreamInfo,
    // last preview position
    position_us: i64,
}

/// Result of [`MediaSession::analyze`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub crop: Crop,
    pub block_size: Option<u32>,
    pub orientation: Option<usize>,
}

#[derive(Debug)]
pub struct PreviewFrame {
    pub frame: Frame,
    /// Frame time rounded to a tenth of a second.
    pub position_s: f64,
}

pub struct MediaSession {
    backend: Arc<dyn MediaBackend>,
    scheduler: RenderScheduler,
    pipeline: PipelineConfig,
    seek_lock: SeekLock,
    cancel: CancellationToken,
    info: Option<StreamInfo>,
    input: Mutex<Option<OpenInput>>,
}

impl MediaSession {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        transform: Arc<dyn FrameTransform>,
        pipeline: PipelineConfig,
    ) -> Self {
        let scheduler = RenderScheduler::from_config(transform, &pipeline);
        Self {
            backend,
            scheduler,
            pipeline,
            seek_lock: SeekLock::new(),
            cancel: CancellationToken::new(),
            info: None,
            input: Mutex::new(None),
        }
    }

    pub fn open(&mut self, path: &str) -> BusResult<&StreamInfo> {
        self.close();
        let (source, decoder) = self.backend.open(path)?;
        let info = source.info().clone();
        log::info!("opened {}\n{}", path, info);
        *self.input.get_mut() = Some(OpenInput {
            path: path.to_string(),
            source,
            decoder,
            info: info.clone(),
            position_us: 0,
        });
        Ok(self.info.insert(info))
    }

    /// Cancels whatever runs on the current input and drops it.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.info = None;
        if let Some(input) = self.input.get_mut().take() {
            log::debug!("closed {}", input.path);
        }
    }

    pub fn info(&self) -> Option<&StreamInfo> {
        self.info.as_ref()
    }

    /// Token cancelled when the input is closed or replaced.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn scheduler(&self) -> &RenderScheduler {
        &self.scheduler
    }

    fn input_mut(input: &mut Option<OpenInput>) -> BusResult<&mut OpenInput> {
        input
            .as_mut()
            .ok_or_else(|| BusError::Config("no input open".to_string()))
    }

    /// Decodes the frame nearest to `target_s`.
    ///
    /// Moving forward with more than two seconds left seeks to the keyframe
    /// at or after the target, moving back to the one at or before it, and
    /// anything else takes the cheapest nearby position. When a seek yields
    /// no frame the target steps back a second at a time.
    pub async fn seek_preview(&self, target_s: f64) -> BusResult<PreviewFrame> {
        let _guard = self.seek_lock.acquire().await;
        let mut input = self.input.lock().await;
        let input = Self::input_mut(&mut input)?;

        let target = (target_s * 1_000_000.0) as i64;
        let duration = input.info.duration_us;
        let mode = if target > input.position_us && duration - target > END_MARGIN_US {
            SeekMode::AtOrAfter
        } else if target < input.position_us {
            SeekMode::AtOrBefore
        } else {
            SeekMode::Approximate
        };
        log::debug!("preview seek to {}us ({:?})", target, mode);

        let mut reader = FrameReader::new(input.source.as_mut(), input.decoder.as_mut())
            .with_throttle(true);
        let mut seek_to = target;
        let mut seek_mode = mode;
        let mut frames = Vec::new();
        for _ in 0..=MAX_STEP_BACKS {
            reader.seek(seek_to, seek_mode)?;
            if let Some(frame) = reader.next_frame().await? {
                frames.push(frame);
                frames.extend(reader.drain()?);
                break;
            }
            if seek_to <= 0 {
                break;
            }
            seek_to = (seek_to - STEP_BACK_US).max(0);
            seek_mode = SeekMode::AtOrBefore;
        }

        let closest = frames
            .into_iter()
            .min_by_key(|f| (f.timestamp() - target).abs())
            .ok_or(BusError::NoFrames)?;
        let position_s = (closest.timestamp() as f64 / 100_000.0).round() / 10.0;
        input.position_us = closest.timestamp();
        Ok(PreviewFrame {
            frame: closest,
            position_s,
        })
    }

    /// Renders one frame with `config`, scaled to the planned output.
    pub async fn render_preview(&self, frame: Frame, config: &RenderConfig) -> BusResult<RenderedFrame> {
        let plan = plan_output(config, frame.width(), frame.height())?;
        let mut snapshot = config.clone();
        snapshot.output_dim = plan.output_dim;
        self.scheduler
            .render(frame, Arc::new(snapshot), Some(plan.scale))
            .await
    }

    /// Runs crop, block size and orientation estimation in turn and writes
    /// what they find into `config`. Unset ring geometry and trim end get the
    /// suggested defaults for the input.
    pub async fn analyze(&self, config: &mut RenderConfig) -> BusResult<Calibration> {
        let _guard = self.seek_lock.acquire().await;
        let mut input = self.input.lock().await;
        let input = Self::input_mut(&mut input)?;
        if config.trim_end_us.is_none() {
            let end = suggest_trim_end(input.info.duration_us);
            if end > config.trim_start_us {
                config.trim_end_us = Some(end);
            }
        }
        let (width, height) = (input.info.coded_width, input.info.coded_height);
        let mut reader = FrameReader::new(input.source.as_mut(), input.decoder.as_mut())
            .with_throttle(true);

        let crop = estimate_crop(&mut reader, width, height, &self.pipeline).await?;
        crop.apply(config);

        let limit = block_size_limit(width, height);
        let block_size = estimate_block_size(&mut reader, config, limit).await?;
        if block_size.is_some() {
            config.block_size = block_size;
        }

        let plan = plan_output(config, width, height)?;
        if config.ring_radius == 0 {
            if let Some((w, h)) = config.cropped_size(width, height) {
                (config.ring_radius, config.ring_stroke) = suggest_ring(w, h);
            }
        }

        let orientation = if config.block_size.is_some() {
            let mut snapshot = config.clone();
            snapshot.output_dim = plan.output_dim;
            estimate_orientation(
                &mut reader,
                &self.scheduler,
                Arc::new(snapshot),
                Some(plan.scale),
                &self.pipeline,
            )
            .await?
        } else {
            log::info!("no block size, skipping orientation");
            None
        };
        if orientation.is_some() {
            config.orientation = orientation;
        }

        Ok(Calibration {
            crop,
            block_size,
            orientation,
        })
    }

    pub async fn encode(&self, config: &RenderConfig) -> BusResult<EncodeOutput> {
        let _guard = self.seek_lock.acquire().await;
        let mut input = self.input.lock().await;
        let input = Self::input_mut(&mut input)?;
        EncodeDriver::new(
            input.source.as_mut(),
            input.decoder.as_mut(),
            self.backend.as_ref(),
            &self.scheduler,
        )
        .with_pipeline(&self.pipeline)
        .with_cancel(self.cancel.child_token())
        .run(config)
        .await
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
