//! Worker message contract and the tasks that run a [`FrameTransform`].

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RenderConfig;
use crate::error::{BusError, BusResult};
use crate::frame::{Frame, RotationCode};

/// Submission-order job number. Ids only ever increase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
pub struct RenderRequest {
    pub job_id: JobId,
    pub config: Arc<RenderConfig>,
    pub frame: Frame,
    pub scale: Option<f32>,
    /// Resolved rotation of the preceding job, when known.
    pub previous_rotation: Option<RotationCode>,
}

#[derive(Debug)]
pub enum RenderOutcome {
    Rendered {
        frame: Frame,
        /// Auxiliary block image produced alongside the frame.
        sample: Frame,
        rotation: RotationCode,
    },
    /// The rotation could not be resolved without the predecessor's value.
    /// The untouched input frame comes back with it.
    NeedsHint {
        frame: Frame,
        attempted: RotationCode,
    },
}

#[derive(Debug)]
pub struct RenderResponse {
    pub job_id: JobId,
    pub outcome: RenderOutcome,
}

/// The per-frame pixel work. Implementations run on blocking threads and must
/// echo the request's job id in the response.
pub trait FrameTransform: Send + Sync + 'static {
    fn render(&self, request: RenderRequest) -> BusResult<RenderResponse>;
}

impl<F> FrameTransform for F
where
    F: Fn(RenderRequest) -> BusResult<RenderResponse> + Send + Sync + 'static,
{
    fn render(&self, request: RenderRequest) -> BusResult<RenderResponse> {
        self(request)
    }
}

pub(crate) struct WorkerReport {
    pub worker: usize,
    /// Job the worker was handed, whatever the response claims.
    pub dispatched: JobId,
    pub result: BusResult<RenderResponse>,
}

pub(crate) struct WorkerHandle {
    tx: mpsc::UnboundedSender<RenderRequest>,
}

impl WorkerHandle {
    pub fn spawn(
        index: usize,
        transform: Arc<dyn FrameTransform>,
        inline: bool,
        reports: mpsc::UnboundedSender<WorkerReport>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            Self::inner_loop(index, transform, inline, rx, reports, cancel).await
        });
        Self { tx }
    }

    pub fn send(&self, request: RenderRequest) -> BusResult<()> {
        self.tx.send(request).map_err(|_| BusError::Closed)
    }

    async fn inner_loop(
        index: usize,
        transform: Arc<dyn FrameTransform>,
        inline: bool,
        mut rx: mpsc::UnboundedReceiver<RenderRequest>,
        reports: mpsc::UnboundedSender<WorkerReport>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                },
                Some(request) = rx.recv() => {
                    let dispatched = request.job_id;
                    let result = Self::run(&transform, inline, request).await;
                    let report = WorkerReport {
                        worker: index,
                        dispatched,
                        result,
                    };
                    if reports.send(report).is_err() {
                        break;
                    }
                },
                else => break,
            }
        }
        log::trace!("render worker {} stopped", index);
    }

    async fn run(
        transform: &Arc<dyn FrameTransform>,
        inline: bool,
        request: RenderRequest,
    ) -> BusResult<RenderResponse> {
        if inline {
            tokio::task::yield_now().await;
            return transform.render(request);
        }
        let transform = transform.clone();
        match tokio::task::spawn_blocking(move || transform.render(request)).await {
            Ok(result) => result,
            Err(e) => Err(BusError::Transform(format!("render task failed: {}", e))),
        }
    }
}
