//! Job Scheduler - runs a batch of render jobs
//!
//! One tokio task owns the batch. Output of every running renderer is
//! forwarded into a single queue, commands arrive on a second queue, and
//! every state change is published to subscribers and to a snapshot watch.
//! Nothing outside the task mutates job or frame state.

use super::command::RenderCommand;
use super::events::{
    BatchOutcome, BatchSummary, EngineEvent, EventHub, JobCounts, ProgressEvent, ProgressKind,
};
use super::job::{Batch, FrameStatus, JobStatus};
use super::retry::{deadline_after, RetryPolicy};
use super::skip::apply_skip_existing;
use super::supervisor::{ExitInfo, Launcher, OutputLine, ProcessControl, ProcessEvent};
use super::tracker;
use crate::config::EngineConfig;
use crate::error::{BatchResolutionError, ProcessExitError, SchedulerError};
use crate::scene::BatchSpec;
use crate::semantic::{classify, OutputEvent};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How many jobs may render at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// One renderer at a time, in batch order
    Sequential,
    Parallel { max_jobs: usize },
}

impl ConcurrencyPolicy {
    pub fn max_jobs(&self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Parallel { max_jobs } => (*max_jobs).max(1),
        }
    }
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        Self::Sequential
    }
}

/// Scheduling policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Skip frames whose output already exists
    pub skip_existing: bool,
    pub concurrency: ConcurrencyPolicy,
    /// Stop a job on its first failed frame
    pub fail_fast: bool,
    /// Cancel the rest of the batch when a job fails
    pub abort_batch_on_failure: bool,
    /// Cancelling one job cancels the rest of the batch
    pub stop_batch_on_cancel: bool,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            skip_existing: false,
            concurrency: ConcurrencyPolicy::Sequential,
            fail_fast: true,
            abort_batch_on_failure: false,
            stop_batch_on_cancel: false,
            retry: RetryPolicy::default(),
        }
    }
}

enum Command {
    SkipFrames {
        job_id: String,
        frames: Vec<i64>,
        reply: oneshot::Sender<Result<usize, SchedulerError>>,
    },
    CancelJob {
        job_id: String,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    CancelAll {
        reply: oneshot::Sender<()>,
    },
    SetSkipExisting(bool),
}

/// Cloneable command side of a running batch
#[derive(Clone)]
pub struct BatchControl {
    tx: mpsc::UnboundedSender<Command>,
}

impl BatchControl {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| SchedulerError::BatchClosed)?;
        rx.await.map_err(|_| SchedulerError::BatchClosed)
    }

    /// Skip frames of a job that has not started yet
    pub async fn skip_frames(&self, job_id: &str, frames: Vec<i64>) -> Result<usize, SchedulerError> {
        let job_id = job_id.to_string();
        self.request(|reply| Command::SkipFrames {
            job_id,
            frames,
            reply,
        })
        .await?
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<(), SchedulerError> {
        let job_id = job_id.to_string();
        self.request(|reply| Command::CancelJob { job_id, reply }).await?
    }

    pub async fn cancel_all(&self) -> Result<(), SchedulerError> {
        self.request(|reply| Command::CancelAll { reply }).await
    }

    /// Applies to jobs that have not launched yet
    pub fn set_skip_existing(&self, enabled: bool) -> Result<(), SchedulerError> {
        self.tx
            .send(Command::SetSkipExisting(enabled))
            .map_err(|_| SchedulerError::BatchClosed)
    }
}

/// A running batch
pub struct BatchHandle {
    pub id: String,
    control: BatchControl,
    snapshot: watch::Receiver<Batch>,
    task: JoinHandle<BatchSummary>,
}

impl BatchHandle {
    pub fn control(&self) -> BatchControl {
        self.control.clone()
    }

    pub async fn skip_frames(&self, job_id: &str, frames: Vec<i64>) -> Result<usize, SchedulerError> {
        self.control.skip_frames(job_id, frames).await
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.control.cancel_job(job_id).await
    }

    pub async fn cancel_all(&self) -> Result<(), SchedulerError> {
        self.control.cancel_all().await
    }

    pub fn set_skip_existing(&self, enabled: bool) -> Result<(), SchedulerError> {
        self.control.set_skip_existing(enabled)
    }

    /// Copy of the batch as last published
    pub fn snapshot(&self) -> Batch {
        self.snapshot.borrow().clone()
    }

    /// Watch that changes with every published state
    pub fn watch(&self) -> watch::Receiver<Batch> {
        self.snapshot.clone()
    }

    /// Wait for the batch to finish
    pub async fn wait(self) -> Result<BatchSummary, SchedulerError> {
        self.task.await.map_err(|e| {
            log::error!("Batch task ended abnormally: {}", e);
            SchedulerError::BatchClosed
        })
    }
}

/// Runs batches of render jobs
pub struct Scheduler {
    config: SchedulerConfig,
    command: RenderCommand,
    grace: Duration,
    launcher: Arc<dyn Launcher>,
    hub: EventHub,
}

impl Scheduler {
    pub fn new(config: &EngineConfig, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            config: config.scheduler.clone(),
            command: config.render.command.clone(),
            grace: config.render.terminate_grace(),
            launcher,
            hub: EventHub::new(),
        }
    }

    /// Receiver of every event of every later batch
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        self.hub.subscribe()
    }

    /// Build the batch without starting it
    pub fn prepare(&self, spec: &BatchSpec) -> Result<Batch, BatchResolutionError> {
        Ok(Batch::new(spec.scene.clone(), spec.jobs()?))
    }

    /// Start a prepared batch on its own task
    pub fn start(&self, batch: Batch) -> BatchHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (process_tx, process_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(batch.clone());

        let id = batch.id.clone();
        let engine = Engine {
            runs: HashMap::new(),
            skip_existing: self.config.skip_existing,
            config: self.config.clone(),
            command: self.command.clone(),
            grace: self.grace,
            launcher: self.launcher.clone(),
            hub: self.hub.clone(),
            snapshot: snapshot_tx,
            process_tx,
            stopping: false,
            cancelled: false,
            started: std::time::Instant::now(),
            started_at: Utc::now(),
            batch,
        };
        let task = tokio::spawn(engine.run(process_rx, cmd_rx));

        BatchHandle {
            id,
            control: BatchControl { tx: cmd_tx },
            snapshot: snapshot_rx,
            task,
        }
    }

    /// Resolve and start a batch
    pub fn submit(&self, spec: &BatchSpec) -> Result<BatchHandle, BatchResolutionError> {
        let batch = self.prepare(spec)?;
        Ok(self.start(batch))
    }
}

/// The renderer currently running for a job
struct Active {
    control: ProcessControl,
    frames: Vec<i64>,
}

#[derive(Default)]
struct JobRun {
    active: Option<Active>,
    retry_at: Option<Instant>,
    retries: u32,
    cancel_requested: bool,
    /// Set once a failed frame has stopped the job
    failure: Option<ProcessExitError>,
}

struct Engine {
    batch: Batch,
    config: SchedulerConfig,
    command: RenderCommand,
    grace: Duration,
    launcher: Arc<dyn Launcher>,
    hub: EventHub,
    snapshot: watch::Sender<Batch>,
    process_tx: mpsc::UnboundedSender<(String, ProcessEvent)>,
    runs: HashMap<String, JobRun>,
    skip_existing: bool,
    /// No more launches
    stopping: bool,
    /// The user cancelled something in this batch
    cancelled: bool,
    started: std::time::Instant,
    started_at: chrono::DateTime<Utc>,
}

impl Engine {
    async fn run(
        mut self,
        mut process_rx: mpsc::UnboundedReceiver<(String, ProcessEvent)>,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) -> BatchSummary {
        log::info!(
            "Batch {} started: {} job(s), {} frame(s)",
            self.batch.id,
            self.batch.jobs.len(),
            self.batch.total_frames()
        );
        self.hub.emit(EngineEvent::BatchStarted {
            batch_id: self.batch.id.clone(),
            jobs: self.batch.jobs.iter().map(|j| j.id.clone()).collect(),
            frames: self.batch.total_frames(),
        });
        let preskipped: Vec<(String, i64)> = self
            .batch
            .jobs
            .iter()
            .flat_map(|j| {
                j.frames_with(FrameStatus::Skipped)
                    .into_iter()
                    .map(move |f| (j.id.clone(), f))
            })
            .collect();
        for (job_id, frame) in preskipped {
            self.emit(&job_id, ProgressKind::FrameSkipped { frame });
        }

        let mut commands_open = true;
        loop {
            self.launch_ready().await;
            self.publish();
            if self.batch.all_terminal() {
                break;
            }

            let next_retry = self.next_retry();
            tokio::select! {
                Some((job_id, event)) = process_rx.recv() => {
                    self.on_process_event(&job_id, event).await;
                }
                command = cmd_rx.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command),
                    None => commands_open = false,
                },
                _ = tokio::time::sleep_until(next_retry.unwrap_or_else(Instant::now)), if next_retry.is_some() => {}
            }
        }

        let summary = self.summary();
        log::info!(
            "Batch {} {}: {} done, {} failed, {} skipped in {}",
            summary.batch_id,
            summary.outcome,
            summary.frames_done,
            summary.frames_failed,
            summary.frames_skipped,
            tracker::format_duration(summary.elapsed)
        );
        self.hub.emit(EngineEvent::BatchFinished(summary.clone()));
        summary
    }

    fn emit(&self, job_id: &str, kind: ProgressKind) {
        self.hub.emit(EngineEvent::Job(ProgressEvent::new(job_id, kind)));
    }

    fn emit_progress(&self, job_id: &str) {
        if let Some(job) = self.batch.job(job_id) {
            self.emit(job_id, ProgressKind::Progress(tracker::derive(job, Utc::now())));
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.batch.clone());
    }

    fn occupied(&self) -> usize {
        self.runs
            .values()
            .filter(|r| r.active.is_some() || r.retry_at.is_some())
            .count()
    }

    fn next_retry(&self) -> Option<Instant> {
        self.runs.values().filter_map(|r| r.retry_at).min()
    }

    async fn launch_ready(&mut self) {
        if self.stopping {
            return;
        }

        let now = Instant::now();
        let due: Vec<String> = self
            .runs
            .iter()
            .filter(|(_, r)| r.retry_at.map_or(false, |at| at <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            if let Some(run) = self.runs.get_mut(&id) {
                run.retry_at = None;
            }
            self.launch_next(&id).await;
        }

        let capacity = self.config.concurrency.max_jobs();
        for index in 0..self.batch.jobs.len() {
            if self.stopping || self.occupied() >= capacity {
                break;
            }
            if self.batch.jobs[index].status != JobStatus::Pending {
                continue;
            }
            let id = self.batch.jobs[index].id.clone();
            self.begin_job(&id).await;
        }
    }

    /// Apply skip policy to a Pending job and launch it
    async fn begin_job(&mut self, id: &str) {
        let skip_existing = self.skip_existing;
        let Some(job) = self.batch.job_mut(id) else {
            return;
        };
        let skipped = apply_skip_existing(job, skip_existing);
        let nothing_to_render = job.pending_frames().is_empty();
        for frame in skipped {
            self.emit(id, ProgressKind::FrameSkipped { frame });
        }

        if nothing_to_render {
            log::info!("{}: every frame already rendered", id);
            self.finish_job(id, JobStatus::Completed, None);
            return;
        }
        self.launch_next(id).await;
    }

    /// Launch the renderer for the next run of unfinished frames
    async fn launch_next(&mut self, id: &str) {
        let Some(job) = self.batch.job(id) else {
            return;
        };
        let Some(frames) = self.command.plan(job).into_iter().next() else {
            self.settle(id);
            return;
        };

        let spec = match self.command.launch_spec(&self.batch.scene, job, &frames) {
            Ok(spec) => spec,
            Err(e) => {
                self.finish_job(id, JobStatus::Failed, Some(e.to_string()));
                return;
            }
        };

        let handle = match self.launcher.launch(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("{}: launch failed: {}", id, e);
                self.finish_job(id, JobStatus::Failed, Some(e.to_string()));
                return;
            }
        };

        if let Some(job) = self.batch.job_mut(id) {
            job.attempts += 1;
            if job.status == JobStatus::Pending {
                if let Err(e) = job.set_status(JobStatus::Running) {
                    log::warn!("{}", e);
                }
                log::info!("Job {} running", id);
            }
        }
        self.emit(id, ProgressKind::Started { frames: frames.clone() });

        let (mut events, control) = handle.into_parts();
        let tx = self.process_tx.clone();
        let job_id = id.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send((job_id.clone(), event)).is_err() {
                    break;
                }
            }
        });

        let run = self.runs.entry(id.to_string()).or_default();
        run.active = Some(Active { control, frames });
    }

    async fn on_process_event(&mut self, id: &str, event: ProcessEvent) {
        let active = self
            .runs
            .get(id)
            .map_or(false, |r| r.active.is_some());
        if !active {
            log::trace!("{}: event from a finished process: {:?}", id, event);
            return;
        }

        match event {
            ProcessEvent::Line(line) => self.on_line(id, line),
            ProcessEvent::Exited(info) => self.on_exit(id, info).await,
        }
    }

    fn on_line(&mut self, id: &str, line: OutputLine) {
        let parsed = classify(&line.text);
        if parsed.is_none() {
            log::trace!("{}: unrecognized output: {}", id, line.text);
        }
        self.emit(
            id,
            ProgressKind::Log {
                stream: line.stream,
                line: line.text,
            },
        );
        if let Some(event) = parsed {
            self.apply_output(id, event);
        }
    }

    fn apply_output(&mut self, id: &str, event: OutputEvent) {
        let now = std::time::Instant::now();
        let Some(job) = self.batch.job_mut(id) else {
            return;
        };

        let mut kinds = Vec::new();
        let mut failed_frame = None;
        match event {
            OutputEvent::FrameStarted { frame } => {
                if let Some(current) = job.rendering_frame().filter(|&f| f != frame) {
                    match job.finish_frame(current, None, now) {
                        Ok(render_time) => kinds.push(ProgressKind::FrameDone {
                            frame: current,
                            render_time,
                        }),
                        Err(e) => log::debug!("{}: {}", id, e),
                    }
                }
                match job.start_frame(frame, now) {
                    Ok(()) => kinds.push(ProgressKind::FrameStarted { frame }),
                    Err(e) => log::debug!("{}: ignoring start of frame {}: {}", id, frame, e),
                }
            }
            OutputEvent::FrameDone { frame, render_time } => {
                match frame.or_else(|| job.rendering_frame()) {
                    Some(frame) => match job.finish_frame(frame, render_time, now) {
                        Ok(render_time) => kinds.push(ProgressKind::FrameDone { frame, render_time }),
                        Err(e) => log::debug!("{}: ignoring completion of frame {}: {}", id, frame, e),
                    },
                    None => log::trace!("{}: frame completion with no frame rendering", id),
                }
            }
            OutputEvent::FrameFailed { frame, message } => {
                match frame.or_else(|| job.rendering_frame()) {
                    Some(frame) => match job.fail_frame(frame, now) {
                        Ok(()) => {
                            log::warn!("{}: frame {} failed: {}", id, frame, message);
                            kinds.push(ProgressKind::FrameFailed { frame, message });
                            failed_frame = Some(frame);
                        }
                        Err(e) => log::debug!("{}: ignoring failure of frame {}: {}", id, frame, e),
                    },
                    None => log::warn!("{}: {}", id, message),
                }
            }
            OutputEvent::FrameProgress { percent } => {
                if let Some(frame) = job.rendering_frame() {
                    kinds.push(ProgressKind::FrameProgress { frame, percent });
                }
            }
            OutputEvent::OutputWritten { path } => kinds.push(ProgressKind::OutputWritten { path }),
            OutputEvent::Note { message } => log::info!("{}: {}", id, message),
        }

        let transitioned = kinds.iter().any(|k| {
            matches!(
                k,
                ProgressKind::FrameStarted { .. }
                    | ProgressKind::FrameDone { .. }
                    | ProgressKind::FrameFailed { .. }
            )
        });
        for kind in kinds {
            self.emit(id, kind);
        }
        if transitioned {
            self.emit_progress(id);
        }

        if let (Some(frame), true) = (failed_frame, self.config.fail_fast) {
            let grace = self.grace;
            if let Some(run) = self.runs.get_mut(id) {
                if run.failure.is_none() {
                    run.failure = Some(ProcessExitError::FrameFailed(frame));
                    if let Some(active) = &run.active {
                        active.control.terminate(grace);
                    }
                }
            }
        }
    }

    async fn on_exit(&mut self, id: &str, info: ExitInfo) {
        let Some(run) = self.runs.get_mut(id) else {
            return;
        };
        let Some(active) = run.active.take() else {
            return;
        };
        let cancel_requested = run.cancel_requested;
        let failure = run.failure.clone();
        log::debug!("{}: renderer exited after {:?}", id, info.elapsed);

        if cancel_requested {
            self.finish_job(id, JobStatus::Cancelled, None);
            return;
        }
        if let Some(failure) = failure {
            self.finish_job(id, JobStatus::Failed, Some(failure.to_string()));
            return;
        }

        // A clean exit closes the frame still marked Rendering
        if info.success() {
            let closed = self.batch.job_mut(id).and_then(|job| {
                let frame = job.rendering_frame()?;
                job.finish_frame(frame, None, std::time::Instant::now())
                    .ok()
                    .map(|render_time| (frame, render_time))
            });
            if let Some((frame, render_time)) = closed {
                self.emit(id, ProgressKind::FrameDone { frame, render_time });
                self.emit_progress(id);
            }
        }

        let Some(job) = self.batch.job(id) else {
            return;
        };
        let leftover = active
            .frames
            .iter()
            .filter(|&&f| job.frame(f).map_or(false, |fr| !fr.status.is_terminal()))
            .count();
        let has_unfinished = !job.unfinished_frames().is_empty();

        let error = match info.error() {
            Some(error) => Some(error),
            None if leftover > 0 => Some(ProcessExitError::Incomplete(leftover)),
            None => None,
        };

        match error {
            None if has_unfinished => self.launch_next(id).await,
            None => self.settle(id),
            Some(error) => {
                log::warn!("{}: {}", id, error);
                let retries = match self.runs.get_mut(id) {
                    Some(run) => {
                        run.retries += 1;
                        run.retries
                    }
                    None => return,
                };
                match self.config.retry.next_delay(retries) {
                    Some(delay) if has_unfinished && !self.stopping => {
                        log::info!(
                            "{}: retry {}/{} in {}",
                            id,
                            retries,
                            self.config.retry.max_retries,
                            tracker::format_duration(delay)
                        );
                        if let Some(run) = self.runs.get_mut(id) {
                            run.retry_at = Some(deadline_after(delay));
                        }
                    }
                    _ => self.finish_job(id, JobStatus::Failed, Some(error.to_string())),
                }
            }
        }
    }

    /// Every launch is done: Completed unless a frame failed
    fn settle(&mut self, id: &str) {
        let failed = self
            .batch
            .job(id)
            .map_or(0, |job| job.count(FrameStatus::Failed));
        if failed > 0 {
            self.finish_job(id, JobStatus::Failed, Some(format!("{} frame(s) failed", failed)));
        } else {
            self.finish_job(id, JobStatus::Completed, None);
        }
    }

    fn finish_job(&mut self, id: &str, status: JobStatus, error: Option<String>) {
        let Some(job) = self.batch.job_mut(id) else {
            return;
        };
        let result = match (&error, status) {
            (Some(reason), JobStatus::Failed) => job.fail(reason.clone()),
            _ => job.set_status(status),
        };
        if let Err(e) = result {
            log::warn!("{}", e);
            return;
        }
        self.runs.remove(id);

        match &error {
            Some(reason) => log::info!("Job {} {}: {}", id, status, reason),
            None => log::info!("Job {} {}", id, status),
        }
        self.emit_progress(id);
        let kind = match status {
            JobStatus::Completed => ProgressKind::Completed,
            JobStatus::Cancelled => ProgressKind::Cancelled,
            _ => ProgressKind::Failed {
                error: error.unwrap_or_else(|| "failed".to_string()),
            },
        };
        self.emit(id, kind);

        if status == JobStatus::Failed && self.config.abort_batch_on_failure && !self.stopping {
            log::warn!("Job {} failed, aborting batch", id);
            self.stop();
        }
    }

    /// Stop launching; cancel everything not yet finished
    fn stop(&mut self) {
        self.stopping = true;
        let ids: Vec<String> = self
            .batch
            .jobs
            .iter()
            .filter(|j| !j.status.is_terminal())
            .map(|j| j.id.clone())
            .collect();
        for id in ids {
            self.cancel(&id);
        }
    }

    fn cancel(&mut self, id: &str) {
        let grace = self.grace;
        let running = match self.runs.get_mut(id) {
            Some(run) if run.active.is_some() => {
                run.cancel_requested = true;
                if let Some(active) = &run.active {
                    active.control.terminate(grace);
                }
                true
            }
            _ => false,
        };
        if !running {
            self.finish_job(id, JobStatus::Cancelled, None);
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::SkipFrames {
                job_id,
                frames,
                reply,
            } => {
                let newly: Vec<i64> = self.batch.job(&job_id).map_or_else(Vec::new, |job| {
                    frames
                        .iter()
                        .copied()
                        .filter(|&f| job.frame(f).map(|fr| fr.status) == Some(FrameStatus::Pending))
                        .collect()
                });
                let result = self.batch.skip_frames(&job_id, &frames);
                if result.is_ok() {
                    for frame in newly {
                        self.emit(&job_id, ProgressKind::FrameSkipped { frame });
                    }
                }
                let _ = reply.send(result);
            }
            Command::CancelJob { job_id, reply } => {
                let result = match self.batch.job(&job_id).map(|j| j.status) {
                    None => Err(SchedulerError::UnknownJob(job_id)),
                    Some(status) if status.is_terminal() => Ok(()),
                    Some(_) => {
                        log::info!("Cancelling job {}", job_id);
                        self.cancelled = true;
                        self.cancel(&job_id);
                        if self.config.stop_batch_on_cancel {
                            self.stop();
                        }
                        Ok(())
                    }
                };
                let _ = reply.send(result);
            }
            Command::CancelAll { reply } => {
                log::info!("Cancelling batch {}", self.batch.id);
                self.cancelled = true;
                self.stop();
                let _ = reply.send(());
            }
            Command::SetSkipExisting(enabled) => {
                log::info!("Skip existing frames: {}", enabled);
                self.skip_existing = enabled;
            }
        }
    }

    fn summary(&self) -> BatchSummary {
        let mut jobs = JobCounts::default();
        for job in &self.batch.jobs {
            match job.status {
                JobStatus::Completed => jobs.completed += 1,
                JobStatus::Failed => jobs.failed += 1,
                JobStatus::Cancelled => jobs.cancelled += 1,
                _ => {}
            }
        }
        let outcome = if self.cancelled {
            BatchOutcome::Cancelled
        } else if jobs.failed > 0 {
            BatchOutcome::Failed
        } else if jobs.cancelled > 0 {
            BatchOutcome::Cancelled
        } else {
            BatchOutcome::Completed
        };

        let agg = tracker::derive_batch(&self.batch.jobs, self.started_at, Utc::now());
        BatchSummary {
            batch_id: self.batch.id.clone(),
            outcome,
            jobs,
            frames_total: agg.total,
            frames_done: agg.done_count,
            frames_failed: agg.failed_count,
            frames_skipped: agg.skipped_count,
            elapsed: self.started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::skip::OutputTemplate;
    use crate::core::supervisor::{LaunchSpec, ProcessHandle, Stream};
    use crate::error::LaunchError;
    use crate::scene::RenderTarget;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// What a fake renderer does, step by step
    #[derive(Clone)]
    enum Step {
        Line(&'static str),
        Exit(i32),
        /// Block until terminated
        Hang,
    }

    #[derive(Default)]
    struct FakeLauncher {
        scripts: Mutex<VecDeque<Vec<Step>>>,
        launches: Mutex<Vec<LaunchSpec>>,
        fail_launch: bool,
    }

    impl FakeLauncher {
        fn new(scripts: Vec<Vec<Step>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                ..Default::default()
            })
        }

        fn launches(&self) -> Vec<LaunchSpec> {
            self.launches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Launcher for FakeLauncher {
        async fn launch(&self, spec: &LaunchSpec) -> Result<ProcessHandle, LaunchError> {
            if self.fail_launch {
                return Err(LaunchError::NotFound(spec.program.clone()));
            }
            self.launches.lock().unwrap().push(spec.clone());
            let steps = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| vec![Step::Exit(0)]);

            let (tx, rx) = mpsc::unbounded_channel();
            let (handle, mut terminate) = ProcessHandle::from_channel(rx);
            tokio::spawn(async move {
                let exited = |code: Option<i32>, signal: Option<i32>| {
                    ProcessEvent::Exited(ExitInfo {
                        code,
                        signal,
                        elapsed: Duration::ZERO,
                    })
                };
                for step in steps {
                    match step {
                        Step::Line(text) => {
                            let _ = tx.send(ProcessEvent::Line(OutputLine {
                                stream: Stream::Stdout,
                                text: text.to_string(),
                            }));
                            tokio::task::yield_now().await;
                        }
                        Step::Exit(code) => {
                            let _ = tx.send(exited(Some(code), None));
                            return;
                        }
                        Step::Hang => {
                            terminate.recv().await;
                            let _ = tx.send(exited(None, Some(15)));
                            return;
                        }
                    }
                }
                let _ = tx.send(exited(Some(0), None));
            });
            Ok(handle)
        }
    }

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.render.command = RenderCommand {
            program: "fake-render".to_string(),
            args: vec!["{node}".to_string(), "{frames}".to_string()],
            ..Default::default()
        };
        config
    }

    fn spec(targets: &[(&str, i64, i64)]) -> BatchSpec {
        BatchSpec::new(
            "shot.hip",
            targets
                .iter()
                .map(|(node, start, end)| RenderTarget::new(*node, *start, *end))
                .collect(),
        )
    }

    async fn wait_for_frame_start(rx: &mut mpsc::UnboundedReceiver<EngineEvent>, job: &str) {
        while let Some(event) = rx.recv().await {
            if let EngineEvent::Job(ProgressEvent {
                job_id,
                kind: ProgressKind::FrameStarted { .. },
                ..
            }) = &event
            {
                if job_id == job {
                    return;
                }
            }
        }
        panic!("stream closed before {} started a frame", job);
    }

    #[tokio::test]
    async fn test_clean_run_completes_job() {
        let launcher = FakeLauncher::new(vec![vec![
            Step::Line("frame 1 done"),
            Step::Line("frame 2 done"),
            Step::Exit(0),
        ]]);
        let scheduler = Scheduler::new(&config(), launcher.clone());
        let handle = scheduler.submit(&spec(&[("/out/rs", 1, 2)])).unwrap();
        let watch = handle.watch();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.outcome, BatchOutcome::Completed);
        let batch = watch.borrow().clone();
        let job = &batch.jobs[0];
        assert_eq!(job.status, JobStatus::Completed);
        for frame in &job.frames {
            assert_eq!(frame.status, FrameStatus::Done);
            assert!(frame.render_time.is_some());
        }
        assert_eq!(launcher.launches()[0].args, vec!["/out/rs", "1,2"]);
    }

    #[tokio::test]
    async fn test_nonzero_exit_leaves_pending_frames() {
        let launcher = FakeLauncher::new(vec![vec![Step::Line("frame 1 done"), Step::Exit(1)]]);
        let scheduler = Scheduler::new(&config(), launcher);
        let handle = scheduler.submit(&spec(&[("/out/rs", 1, 2)])).unwrap();
        let watch = handle.watch();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.outcome, BatchOutcome::Failed);
        let job = watch.borrow().jobs[0].clone();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.frame(1).unwrap().status, FrameStatus::Done);
        assert_eq!(job.frame(2).unwrap().status, FrameStatus::Pending);
        assert_eq!(job.error.as_deref(), Some("renderer exited with code 1"));
    }

    #[tokio::test]
    async fn test_clean_exit_with_missing_frames_fails() {
        let launcher = FakeLauncher::new(vec![vec![Step::Line("frame 1 done"), Step::Exit(0)]]);
        let scheduler = Scheduler::new(&config(), launcher);
        let handle = scheduler.submit(&spec(&[("/out/rs", 1, 3)])).unwrap();
        let watch = handle.watch();
        handle.wait().await.unwrap();

        let job = watch.borrow().jobs[0].clone();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.pending_frames(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_all_skipped_never_launches() {
        let dir = tempfile::TempDir::new().unwrap();
        for frame in 1..=3 {
            std::fs::write(dir.path().join(format!("beauty.{:04}.exr", frame)), b"").unwrap();
        }
        let template = format!("{}/beauty.$F4.exr", dir.path().display());
        let mut batch_spec = spec(&[("/out/rs", 1, 3)]);
        batch_spec.targets[0].output = Some(OutputTemplate::new(template));

        let mut config = config();
        config.scheduler.skip_existing = true;
        let launcher = FakeLauncher::new(vec![]);
        let scheduler = Scheduler::new(&config, launcher.clone());
        let handle = scheduler.submit(&batch_spec).unwrap();
        let watch = handle.watch();
        let summary = handle.wait().await.unwrap();

        assert!(launcher.launches().is_empty());
        assert_eq!(summary.outcome, BatchOutcome::Completed);
        assert_eq!(summary.frames_skipped, 3);
        assert_eq!(watch.borrow().jobs[0].status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_prepared_skips_split_launches() {
        let mut config = config();
        config.render.command.args = vec!["{start}".to_string(), "{end}".to_string()];
        let launcher = FakeLauncher::new(vec![
            vec![Step::Line("frame 1 done"), Step::Line("frame 2 done"), Step::Exit(0)],
            vec![Step::Line("frame 4 done"), Step::Exit(0)],
        ]);
        let scheduler = Scheduler::new(&config, launcher.clone());
        let mut batch = scheduler.prepare(&spec(&[("/out/rs", 1, 4)])).unwrap();
        batch.skip_frames("/out/rs", &[3]).unwrap();

        let summary = scheduler.start(batch).wait().await.unwrap();
        assert_eq!(summary.outcome, BatchOutcome::Completed);
        let launches = launcher.launches();
        assert_eq!(launches.len(), 2);
        assert_eq!(launches[0].args, vec!["1", "2"]);
        assert_eq!(launches[1].frames, vec![4]);
    }

    #[tokio::test]
    async fn test_fail_fast_stops_job() {
        let launcher = FakeLauncher::new(vec![vec![
            Step::Line("rendering frame 1"),
            Step::Line("frame 1 failed: out of VRAM"),
            Step::Hang,
        ]]);
        let scheduler = Scheduler::new(&config(), launcher);
        let handle = scheduler.submit(&spec(&[("/out/rs", 1, 3)])).unwrap();
        let watch = handle.watch();
        handle.wait().await.unwrap();

        let job = watch.borrow().jobs[0].clone();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.frame(1).unwrap().status, FrameStatus::Failed);
        assert_eq!(job.pending_frames(), vec![2, 3]);
        assert_eq!(job.error.as_deref(), Some("frame 1 failed"));
    }

    #[tokio::test]
    async fn test_best_effort_keeps_rendering() {
        let mut config = config();
        config.scheduler.fail_fast = false;
        let launcher = FakeLauncher::new(vec![vec![
            Step::Line("frame 1 failed"),
            Step::Line("frame 2 done"),
            Step::Exit(0),
        ]]);
        let scheduler = Scheduler::new(&config, launcher);
        let handle = scheduler.submit(&spec(&[("/out/rs", 1, 2)])).unwrap();
        let watch = handle.watch();
        handle.wait().await.unwrap();

        let job = watch.borrow().jobs[0].clone();
        assert_eq!(job.frame(2).unwrap().status, FrameStatus::Done);
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_retry_relaunches_unfinished_frames() {
        let mut config = config();
        config.scheduler.retry = RetryPolicy::new(1, crate::core::Backoff::Fixed { delay_secs: 0.0 });
        let launcher = FakeLauncher::new(vec![
            vec![Step::Line("frame 1 done"), Step::Line("rendering frame 2"), Step::Exit(139)],
            vec![Step::Line("frame 2 done"), Step::Line("frame 3 done"), Step::Exit(0)],
        ]);
        let scheduler = Scheduler::new(&config, launcher.clone());
        let handle = scheduler.submit(&spec(&[("/out/rs", 1, 3)])).unwrap();
        let watch = handle.watch();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.outcome, BatchOutcome::Completed);
        assert_eq!(launcher.launches()[1].frames, vec![2, 3]);
        let job = watch.borrow().jobs[0].clone();
        assert_eq!(job.attempts, 2);
        assert_eq!(job.count(FrameStatus::Done), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_unreachable_backoff_still_runs() {
        let mut config = config();
        config.scheduler.retry = RetryPolicy::new(1, crate::core::Backoff::Fixed { delay_secs: 1e19 });
        let launcher = FakeLauncher::new(vec![
            vec![Step::Line("rendering frame 1"), Step::Exit(1)],
            vec![Step::Line("frame 1 done"), Step::Exit(0)],
        ]);
        let scheduler = Scheduler::new(&config, launcher.clone());
        let handle = scheduler.submit(&spec(&[("/out/rs", 1, 1)])).unwrap();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.outcome, BatchOutcome::Completed);
        assert_eq!(launcher.launches().len(), 2);
    }

    #[tokio::test]
    async fn test_absurd_reported_time_still_finishes_batch() {
        let launcher = FakeLauncher::new(vec![vec![
            Step::Line("frame 1 done in 9999999999999999999s"),
            Step::Exit(1),
        ]]);
        let scheduler = Scheduler::new(&config(), launcher);
        let mut events = scheduler.subscribe();
        let handle = scheduler.submit(&spec(&[("/out/rs", 1, 3)])).unwrap();
        let watch = handle.watch();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.outcome, BatchOutcome::Failed);
        assert_eq!(summary.frames_done, 1);
        let job = watch.borrow().jobs[0].clone();
        assert!(job.frame(1).unwrap().render_time.unwrap() > Duration::from_secs(1 << 62));

        let mut finished = false;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::Job(ProgressEvent {
                kind: ProgressKind::Progress(agg),
                ..
            }) = &event
            {
                assert_eq!(agg.estimated_remaining, None);
            }
            finished |= matches!(event, EngineEvent::BatchFinished(_));
        }
        assert!(finished);
    }

    #[tokio::test]
    async fn test_launch_error_fails_job_and_batch_continues() {
        let launcher = Arc::new(FakeLauncher {
            fail_launch: true,
            ..Default::default()
        });
        let scheduler = Scheduler::new(&config(), launcher);
        let handle = scheduler
            .submit(&spec(&[("/out/a", 1, 2), ("/out/b", 1, 2)]))
            .unwrap();
        let watch = handle.watch();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.jobs.failed, 2);
        let batch = watch.borrow().clone();
        assert!(batch.jobs.iter().all(|j| j.pending_frames().len() == 2));
    }

    #[tokio::test]
    async fn test_cancel_job_continues_batch() {
        let launcher = FakeLauncher::new(vec![
            vec![Step::Line("rendering frame 1"), Step::Hang],
            vec![Step::Line("frame 1 done"), Step::Exit(0)],
        ]);
        let scheduler = Scheduler::new(&config(), launcher);
        let mut events = scheduler.subscribe();
        let handle = scheduler
            .submit(&spec(&[("/out/a", 1, 2), ("/out/b", 1, 1)]))
            .unwrap();

        wait_for_frame_start(&mut events, "/out/a").await;
        handle.cancel_job("/out/a").await.unwrap();
        let watch = handle.watch();
        let summary = handle.wait().await.unwrap();

        let batch = watch.borrow().clone();
        assert_eq!(batch.jobs[0].status, JobStatus::Cancelled);
        // The interrupted frame keeps its in-memory status
        assert_eq!(batch.jobs[0].frame(1).unwrap().status, FrameStatus::Rendering);
        assert_eq!(batch.jobs[1].status, JobStatus::Completed);
        assert_eq!(summary.outcome, BatchOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_job_stops_batch_when_configured() {
        let mut config = config();
        config.scheduler.stop_batch_on_cancel = true;
        let launcher = FakeLauncher::new(vec![vec![Step::Line("rendering frame 1"), Step::Hang]]);
        let scheduler = Scheduler::new(&config, launcher.clone());
        let mut events = scheduler.subscribe();
        let handle = scheduler
            .submit(&spec(&[("/out/a", 1, 2), ("/out/b", 1, 1)]))
            .unwrap();

        wait_for_frame_start(&mut events, "/out/a").await;
        handle.cancel_job("/out/a").await.unwrap();
        let watch = handle.watch();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.jobs.cancelled, 2);
        assert_eq!(watch.borrow().jobs[1].status, JobStatus::Cancelled);
        assert_eq!(launcher.launches().len(), 1);
    }

    #[tokio::test]
    async fn test_abort_batch_on_failure() {
        let mut config = config();
        config.scheduler.abort_batch_on_failure = true;
        let launcher = FakeLauncher::new(vec![vec![Step::Exit(2)]]);
        let scheduler = Scheduler::new(&config, launcher.clone());
        let handle = scheduler
            .submit(&spec(&[("/out/a", 1, 1), ("/out/b", 1, 1)]))
            .unwrap();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.outcome, BatchOutcome::Failed);
        assert_eq!(summary.jobs.failed, 1);
        assert_eq!(summary.jobs.cancelled, 1);
        assert_eq!(launcher.launches().len(), 1);
    }

    #[tokio::test]
    async fn test_skip_frames_rejected_for_running_job() {
        let launcher = FakeLauncher::new(vec![
            vec![Step::Line("rendering frame 1"), Step::Hang],
            vec![Step::Line("frame 2 done"), Step::Exit(0)],
        ]);
        let scheduler = Scheduler::new(&config(), launcher.clone());
        let mut events = scheduler.subscribe();
        let handle = scheduler
            .submit(&spec(&[("/out/a", 1, 2), ("/out/b", 1, 2)]))
            .unwrap();

        wait_for_frame_start(&mut events, "/out/a").await;
        assert_eq!(
            handle.skip_frames("/out/a", vec![2]).await,
            Err(SchedulerError::JobNotPending("/out/a".to_string()))
        );
        assert_eq!(handle.skip_frames("/out/b", vec![1]).await, Ok(1));
        assert_eq!(
            handle.cancel_job("/out/x").await,
            Err(SchedulerError::UnknownJob("/out/x".to_string()))
        );
        handle.cancel_job("/out/a").await.unwrap();
        let summary = handle.wait().await.unwrap();

        assert_eq!(summary.frames_skipped, 1);
        assert_eq!(launcher.launches()[1].frames, vec![2]);
    }

    #[tokio::test]
    async fn test_event_order() {
        let launcher = FakeLauncher::new(vec![vec![
            Step::Line("[Redshift] '/out/rs' rendering frame 1"),
            Step::Line("[Redshift] Block 1/2"),
            Step::Line("[Redshift] scene extraction time 0.1 sec, total time 2.50 sec"),
            Step::Exit(0),
        ]]);
        let scheduler = Scheduler::new(&config(), launcher);
        let mut events = scheduler.subscribe();
        scheduler
            .submit(&spec(&[("/out/rs", 1, 1)]))
            .unwrap()
            .wait()
            .await
            .unwrap();

        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        assert!(matches!(received.first(), Some(EngineEvent::BatchStarted { .. })));
        assert!(matches!(received.last(), Some(EngineEvent::BatchFinished(_))));

        let kinds: Vec<&ProgressKind> = received
            .iter()
            .filter_map(|e| match e {
                EngineEvent::Job(p) if !matches!(p.kind, ProgressKind::Log { .. } | ProgressKind::Progress(_)) => {
                    Some(&p.kind)
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                &ProgressKind::Started { frames: vec![1] },
                &ProgressKind::FrameStarted { frame: 1 },
                &ProgressKind::FrameProgress { frame: 1, percent: 50 },
                &ProgressKind::FrameDone {
                    frame: 1,
                    render_time: Duration::from_secs_f64(2.5)
                },
                &ProgressKind::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn test_parallel_policy_overlaps_jobs() {
        let mut config = config();
        config.scheduler.concurrency = ConcurrencyPolicy::Parallel { max_jobs: 2 };
        let launcher = FakeLauncher::new(vec![
            vec![Step::Line("rendering frame 1"), Step::Hang],
            vec![Step::Line("rendering frame 1"), Step::Hang],
        ]);
        let scheduler = Scheduler::new(&config, launcher.clone());
        let mut events = scheduler.subscribe();
        let handle = scheduler
            .submit(&spec(&[("/out/a", 1, 1), ("/out/b", 1, 1)]))
            .unwrap();

        wait_for_frame_start(&mut events, "/out/a").await;
        wait_for_frame_start(&mut events, "/out/b").await;
        assert_eq!(launcher.launches().len(), 2);
        handle.cancel_all().await.unwrap();
        let summary = handle.wait().await.unwrap();
        assert_eq!(summary.outcome, BatchOutcome::Cancelled);
    }
}
