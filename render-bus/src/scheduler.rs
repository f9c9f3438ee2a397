//! Order-preserving render pool.
//!
//! Jobs are dispatched to the first idle worker and may finish in any order,
//! but their results are committed strictly in submission order. A worker that
//! cannot resolve a frame's rotation on its own answers "needs hint"; the job
//! is re-run on the same worker once its predecessor has committed, with the
//! predecessor's rotation attached.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::{PipelineConfig, RenderConfig};
use crate::error::{BusError, BusResult};
use crate::frame::{Frame, RenderedFrame, RotationCode};
use crate::worker::{
    FrameTransform, JobId, RenderOutcome, RenderRequest, RenderResponse, WorkerHandle,
    WorkerReport,
};

pub struct RenderScheduler {
    cancel: CancellationToken,
    tx: mpsc::Sender<SchedulerCommand>,
    workers: usize,
}

impl RenderScheduler {
    /// Spawns the actor and `workers` blocking workers. Zero workers selects
    /// the inline fallback.
    pub fn new(transform: Arc<dyn FrameTransform>, workers: usize) -> Self {
        if workers == 0 {
            return Self::inline(transform);
        }
        Self::spawn(transform, workers, false)
    }

    /// Single pseudo-worker running transforms on the async runtime.
    pub fn inline(transform: Arc<dyn FrameTransform>) -> Self {
        log::warn!("parallel render workers unavailable, rendering inline; expect poor performance");
        Self::spawn(transform, 1, true)
    }

    pub fn from_config(transform: Arc<dyn FrameTransform>, config: &PipelineConfig) -> Self {
        if config.inline {
            Self::inline(transform)
        } else {
            Self::new(transform, config.effective_workers())
        }
    }

    fn spawn(transform: Arc<dyn FrameTransform>, workers: usize, inline: bool) -> Self {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1024);
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        let handles = (0..workers)
            .map(|i| {
                WorkerHandle::spawn(
                    i,
                    transform.clone(),
                    inline,
                    report_tx.clone(),
                    cancel.child_token(),
                )
            })
            .collect();
        drop(report_tx);

        let state = SchedulerState::new(handles, cancel.clone());
        let cancel_clone = cancel.clone();
        tokio::spawn(async move { Self::inner_loop(cancel_clone, state, rx, report_rx).await });
        log::debug!("render scheduler started with {} worker(s)", workers);

        Self {
            cancel,
            tx,
            workers,
        }
    }

    async fn inner_loop(
        cancel: CancellationToken,
        mut state: SchedulerState,
        mut rx: mpsc::Receiver<SchedulerCommand>,
        mut reports: mpsc::UnboundedReceiver<WorkerReport>,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                },
                Some(report) = reports.recv() => {
                    if let Err(e) = state.on_report(report) {
                        state.fail_all(e);
                    }
                },
                cmd = rx.recv() => match cmd {
                    Some(SchedulerCommand::Submit { frame, config, scale, result }) => {
                        state.on_submit(WaitingSubmit { frame, config, scale, result });
                    }
                    None => break,
                },
            }
        }
        state.shutdown();
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Waits for a worker to take the frame, then returns a handle resolving
    /// to the rendered frame once every earlier submission has committed.
    pub async fn submit(
        &self,
        frame: Frame,
        config: Arc<RenderConfig>,
        scale: Option<f32>,
    ) -> BusResult<RenderHandle> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SchedulerCommand::Submit {
                frame,
                config,
                scale,
                result: tx,
            })
            .await
            .map_err(|_| BusError::Closed)?;
        rx.await.map_err(|_| BusError::Closed)?
    }

    /// Submits and waits for the result.
    pub async fn render(
        &self,
        frame: Frame,
        config: Arc<RenderConfig>,
        scale: Option<f32>,
    ) -> BusResult<RenderedFrame> {
        self.submit(frame, config, scale).await?.await
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RenderScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resolves to the job's rendered frame, in submission order.
pub struct RenderHandle {
    job_id: JobId,
    rx: oneshot::Receiver<BusResult<RenderedFrame>>,
}

impl RenderHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

impl Future for RenderHandle {
    type Output = BusResult<RenderedFrame>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| match r {
            Ok(result) => result,
            Err(_) => Err(BusError::Closed),
        })
    }
}

enum SchedulerCommand {
    Submit {
        frame: Frame,
        config: Arc<RenderConfig>,
        scale: Option<f32>,
        result: oneshot::Sender<BusResult<RenderHandle>>,
    },
}

struct WaitingSubmit {
    frame: Frame,
    config: Arc<RenderConfig>,
    scale: Option<f32>,
    result: oneshot::Sender<BusResult<RenderHandle>>,
}

enum JobState {
    Running,
    /// Waiting to become head so it can be re-run with a hint.
    Parked(Frame),
    Done(BusResult<RenderedFrame>),
}

struct PendingJob {
    worker: usize,
    config: Arc<RenderConfig>,
    scale: Option<f32>,
    hinted: bool,
    state: JobState,
    result: oneshot::Sender<BusResult<RenderedFrame>>,
}

struct SchedulerState {
    next_id: u64,
    order: VecDeque<JobId>,
    pending: BTreeMap<JobId, PendingJob>,
    busy: Vec<bool>,
    workers: Vec<WorkerHandle>,
    waiting: VecDeque<WaitingSubmit>,
    prev_rotation: Option<RotationCode>,
    poisoned: Option<BusError>,
    cancel: CancellationToken,
}

impl SchedulerState {
    fn new(workers: Vec<WorkerHandle>, cancel: CancellationToken) -> Self {
        Self {
            next_id: 0,
            order: VecDeque::new(),
            pending: BTreeMap::new(),
            busy: vec![false; workers.len()],
            workers,
            waiting: VecDeque::new(),
            prev_rotation: None,
            poisoned: None,
            cancel,
        }
    }

    fn on_submit(&mut self, submit: WaitingSubmit) {
        if let Some(e) = &self.poisoned {
            let _ = submit.result.send(Err(e.duplicate()));
            return;
        }
        self.waiting.push_back(submit);
        if let Err(e) = self.dispatch_waiting() {
            self.fail_all(e);
        }
    }

    fn dispatch_waiting(&mut self) -> BusResult<()> {
        while !self.waiting.is_empty() {
            let Some(worker) = self.busy.iter().position(|b| !b) else {
                log::trace!("all render workers busy, {} waiting", self.waiting.len());
                return Ok(());
            };
            let Some(submit) = self.waiting.pop_front() else {
                break;
            };
            if submit.result.is_closed() {
                // caller gave up before a worker freed up
                continue;
            }
            self.dispatch(worker, submit)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, worker: usize, submit: WaitingSubmit) -> BusResult<()> {
        let job_id = JobId(self.next_id);
        self.next_id += 1;

        // the hint is only known when nothing is left uncommitted ahead
        let previous_rotation = if self.order.is_empty() {
            self.prev_rotation
        } else {
            None
        };

        let (tx, rx) = oneshot::channel();
        self.order.push_back(job_id);
        self.pending.insert(
            job_id,
            PendingJob {
                worker,
                config: submit.config.clone(),
                scale: submit.scale,
                hinted: previous_rotation.is_some(),
                state: JobState::Running,
                result: tx,
            },
        );
        self.busy[worker] = true;

        self.workers[worker].send(RenderRequest {
            job_id,
            config: submit.config,
            frame: submit.frame,
            scale: submit.scale,
            previous_rotation,
        })?;
        log::trace!("job {} dispatched to worker {}", job_id, worker);

        let _ = submit.result.send(Ok(RenderHandle { job_id, rx }));
        Ok(())
    }

    fn on_report(&mut self, report: WorkerReport) -> BusResult<()> {
        let WorkerReport {
            worker,
            dispatched,
            result,
        } = report;
        if self.poisoned.is_some() {
            return Ok(());
        }
        if !self.pending.contains_key(&dispatched) {
            return Err(BusError::invariant(
                "known-job",
                format!("worker {} reported unknown job {}", worker, dispatched),
            ));
        }

        match result {
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                log::error!("render job {} failed: {:#?}", dispatched, e);
                self.finish(dispatched, Err(e));
            }
            Ok(RenderResponse { job_id, outcome }) => {
                if job_id != dispatched {
                    return Err(BusError::invariant(
                        "known-job",
                        format!(
                            "worker {} answered for job {} while running job {}",
                            worker, job_id, dispatched
                        ),
                    ));
                }
                self.on_outcome(job_id, outcome)?;
            }
        }

        self.commit_ready()?;
        self.dispatch_waiting()
    }

    fn on_outcome(&mut self, job_id: JobId, outcome: RenderOutcome) -> BusResult<()> {
        match outcome {
            RenderOutcome::Rendered {
                frame,
                sample,
                rotation,
            } => {
                drop(sample);
                self.finish(job_id, Ok(RenderedFrame { frame, rotation }));
            }
            RenderOutcome::NeedsHint { frame, attempted } => {
                let hinted = self.pending.get(&job_id).map(|j| j.hinted).unwrap_or(false);
                if hinted {
                    log::warn!(
                        "render job {} still ambiguous with hint (attempted {})",
                        job_id,
                        attempted
                    );
                    self.finish(job_id, Err(BusError::RetryExhausted { job: job_id }));
                } else if self.order.front() == Some(&job_id) {
                    self.retry(job_id, frame)?;
                } else {
                    log::trace!("job {} parked until its predecessor commits", job_id);
                    if let Some(job) = self.pending.get_mut(&job_id) {
                        job.state = JobState::Parked(frame);
                    }
                }
            }
        }
        Ok(())
    }

    /// Records a final outcome and frees the job's worker.
    fn finish(&mut self, job_id: JobId, result: BusResult<RenderedFrame>) {
        if let Some(job) = self.pending.get_mut(&job_id) {
            self.busy[job.worker] = false;
            job.state = JobState::Done(result);
        }
    }

    fn retry(&mut self, job_id: JobId, frame: Frame) -> BusResult<()> {
        let previous_rotation = self.prev_rotation;
        let job = self.pending.get_mut(&job_id).ok_or_else(|| {
            BusError::invariant("known-job", format!("retry of unknown job {}", job_id))
        })?;
        job.hinted = true;
        job.state = JobState::Running;
        log::trace!(
            "job {} re-dispatched to worker {} with hint {:?}",
            job_id,
            job.worker,
            previous_rotation
        );
        self.workers[job.worker].send(RenderRequest {
            job_id,
            config: job.config.clone(),
            frame,
            scale: job.scale,
            previous_rotation,
        })
    }

    /// Commits every finished job at the head of the FIFO and releases the
    /// parked retry that becomes head, if any.
    fn commit_ready(&mut self) -> BusResult<()> {
        while let Some(&head) = self.order.front() {
            let state = match self.pending.get_mut(&head) {
                Some(job) => std::mem::replace(&mut job.state, JobState::Running),
                None => {
                    return Err(BusError::invariant(
                        "known-job",
                        format!("queued job {} has no pending entry", head),
                    ));
                }
            };
            match state {
                JobState::Running => return Ok(()),
                JobState::Parked(frame) => return self.retry(head, frame),
                JobState::Done(result) => self.commit(head, result)?,
            }
        }
        Ok(())
    }

    fn commit(&mut self, job_id: JobId, result: BusResult<RenderedFrame>) -> BusResult<()> {
        match self.order.pop_front() {
            Some(head) if head == job_id => {}
            head => {
                return Err(BusError::invariant(
                    "commit-order",
                    format!("committing job {} but queue head is {:?}", job_id, head),
                ));
            }
        }
        let job = self.pending.remove(&job_id).ok_or_else(|| {
            BusError::invariant("known-job", format!("committed job {} vanished", job_id))
        })?;
        if let Ok(rendered) = &result {
            self.prev_rotation = Some(rendered.rotation);
        }
        if job.result.send(result).is_err() {
            log::debug!("render handle for job {} dropped before commit", job_id);
        }
        Ok(())
    }

    /// Fails every pending and waiting job, then refuses further work.
    fn fail_all(&mut self, err: BusError) {
        log::error!("render scheduler aborted: {:#?}", err);
        for (_, job) in std::mem::take(&mut self.pending) {
            let _ = job.result.send(Err(err.duplicate()));
        }
        for submit in self.waiting.drain(..) {
            let _ = submit.result.send(Err(err.duplicate()));
        }
        self.order.clear();
        self.busy.iter_mut().for_each(|b| *b = false);
        self.cancel_workers();
        self.poisoned = Some(err);
    }

    // workers exit once their request channel closes
    fn cancel_workers(&mut self) {
        self.workers.clear();
    }

    fn shutdown(&mut self) {
        self.cancel_workers();
        self.pending.clear();
        self.waiting.clear();
        self.cancel.cancel();
        log::debug!("render scheduler stopped");
    }
}

#[cfg(test)]
#[path = "scheduler_test.rs"]
mod scheduler_test;
