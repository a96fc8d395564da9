//! Batch, job and frame model
//!
//! The scheduler is the only owner of these values while a batch runs. All
//! status changes go through the checked transition methods below, which
//! keep both job and frame status monotonic.

use super::skip::OutputTemplate;
use crate::error::{FrameError, FrameRangeError, SchedulerError, TransitionError};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Largest number of frames one range may hold
pub const MAX_FRAMES: i64 = 1_000_000;

/// Inclusive frame range walked by `step`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRange {
    pub start: i64,
    pub end: i64,
    pub step: i64,
}

impl FrameRange {
    pub fn new(start: i64, end: i64, step: i64) -> Result<Self, FrameRangeError> {
        if step < 1 {
            return Err(FrameRangeError::Step(step));
        }
        if start > end {
            return Err(FrameRangeError::Reversed { start, end });
        }
        let too_long = FrameRangeError::TooLong {
            start,
            end,
            limit: MAX_FRAMES,
        };
        match end.checked_sub(start) {
            Some(span) if span / step < MAX_FRAMES => Ok(Self { start, end, step }),
            _ => Err(too_long),
        }
    }

    /// Single frame
    pub fn single(frame: i64) -> Self {
        Self {
            start: frame,
            end: frame,
            step: 1,
        }
    }

    /// Number of frames in the range
    pub fn len(&self) -> usize {
        ((self.end - self.start) / self.step + 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Frame numbers in ascending order
    pub fn frames(&self) -> impl Iterator<Item = i64> {
        let step = self.step as usize;
        (self.start..=self.end).step_by(step)
    }

    pub fn contains(&self, frame: i64) -> bool {
        frame >= self.start && frame <= self.end && (frame - self.start) % self.step == 0
    }

    /// Last frame actually reached by the step (may be below `end`)
    pub fn last(&self) -> i64 {
        self.start + (self.len() as i64 - 1) * self.step
    }

    /// Same bounds with a different step
    pub fn with_step(&self, step: i64) -> Result<Self, FrameRangeError> {
        Self::new(self.start, self.end, step)
    }
}

impl fmt::Display for FrameRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else if self.step == 1 {
            write!(f, "{}-{}", self.start, self.end)
        } else {
            write!(f, "{}-{}x{}", self.start, self.end, self.step)
        }
    }
}

fn range_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(-?\d+)(?:\s*-\s*(-?\d+))?(?:\s*[x:]\s*(\d+))?\s*$")
            .expect("frame range pattern is valid")
    })
}

/// Accepts `12`, `1-100`, `1-100x2` and `1-100:2`
impl FromStr for FrameRange {
    type Err = FrameRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = range_re()
            .captures(s)
            .ok_or_else(|| FrameRangeError::Syntax(s.to_string()))?;
        let parse = |m: regex::Match<'_>| {
            m.as_str()
                .parse::<i64>()
                .map_err(|_| FrameRangeError::Syntax(s.to_string()))
        };

        let start = parse(caps.get(1).ok_or_else(|| FrameRangeError::Syntax(s.to_string()))?)?;
        let end = match caps.get(2) {
            Some(m) => parse(m)?,
            None => start,
        };
        let step = match caps.get(3) {
            Some(m) => parse(m)?,
            None => 1,
        };
        Self::new(start, end, step)
    }
}

/// Frame status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameStatus {
    Pending,
    Rendering,
    Done,
    Failed,
    Skipped,
}

impl FrameStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }

    /// Pending -> Rendering | Skipped, Rendering -> Done | Failed
    pub fn can_transition_to(&self, next: FrameStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Rendering)
                | (Self::Pending, Self::Skipped)
                | (Self::Rendering, Self::Done)
                | (Self::Rendering, Self::Failed)
        )
    }
}

impl fmt::Display for FrameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Rendering => write!(f, "rendering"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// One renderable frame of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub number: i64,
    pub status: FrameStatus,
    /// Set only when the frame becomes Done
    pub render_time: Option<Duration>,
    #[serde(skip)]
    rendering_since: Option<Instant>,
}

impl Frame {
    fn new(number: i64) -> Self {
        Self {
            number,
            status: FrameStatus::Pending,
            render_time: None,
            rendering_since: None,
        }
    }
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One render target: a ROP node and the frames it must produce
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub frame_range: FrameRange,
    pub output: Option<OutputTemplate>,
    pub status: JobStatus,
    pub frames: Vec<Frame>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Why the job failed, when it did
    pub error: Option<String>,
    /// Number of renderer launches so far
    pub attempts: u32,
}

impl Job {
    /// Create a job with every frame of `frame_range` Pending
    pub fn new(id: impl Into<String>, frame_range: FrameRange, output: Option<OutputTemplate>) -> Self {
        Self {
            id: id.into(),
            frames: frame_range.frames().map(Frame::new).collect(),
            frame_range,
            output,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            error: None,
            attempts: 0,
        }
    }

    fn index_of(&self, number: i64) -> Option<usize> {
        if !self.frame_range.contains(number) {
            return None;
        }
        Some(((number - self.frame_range.start) / self.frame_range.step) as usize)
    }

    pub fn frame(&self, number: i64) -> Option<&Frame> {
        self.index_of(number).map(|i| &self.frames[i])
    }

    /// Frames that still need the renderer
    pub fn pending_frames(&self) -> Vec<i64> {
        self.frames_with(FrameStatus::Pending)
    }

    /// Frames the renderer still owes: Pending or interrupted while Rendering
    pub fn unfinished_frames(&self) -> Vec<i64> {
        self.frames
            .iter()
            .filter(|f| !f.status.is_terminal())
            .map(|f| f.number)
            .collect()
    }

    pub fn frames_with(&self, status: FrameStatus) -> Vec<i64> {
        self.frames
            .iter()
            .filter(|f| f.status == status)
            .map(|f| f.number)
            .collect()
    }

    pub fn count(&self, status: FrameStatus) -> usize {
        self.frames.iter().filter(|f| f.status == status).count()
    }

    /// The frame currently in the renderer, if any
    pub fn rendering_frame(&self) -> Option<i64> {
        self.frames
            .iter()
            .find(|f| f.status == FrameStatus::Rendering)
            .map(|f| f.number)
    }

    /// Move the job forward, stamping start and end times
    pub fn set_status(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                subject: format!("job {}", self.id),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        if next == JobStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Mark job failed with a reason
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        self.set_status(JobStatus::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }

    fn transition_frame(&mut self, number: i64, next: FrameStatus) -> Result<&mut Frame, FrameError> {
        let index = self.index_of(number).ok_or(FrameError::Unknown(number))?;
        let job_id = &self.id;
        let frame = &mut self.frames[index];
        if !frame.status.can_transition_to(next) {
            return Err(TransitionError {
                subject: format!("frame {} of job {}", number, job_id),
                from: frame.status.to_string(),
                to: next.to_string(),
            }
            .into());
        }
        frame.status = next;
        Ok(frame)
    }

    /// Pending -> Rendering
    ///
    /// Announcing a frame that is already Rendering restarts its clock; a
    /// relaunched renderer picks up the frame its predecessor was killed in.
    pub fn start_frame(&mut self, number: i64, at: Instant) -> Result<(), FrameError> {
        let index = self.index_of(number).ok_or(FrameError::Unknown(number))?;
        if self.frames[index].status == FrameStatus::Rendering {
            self.frames[index].rendering_since = Some(at);
            return Ok(());
        }
        let frame = self.transition_frame(number, FrameStatus::Rendering)?;
        frame.rendering_since = Some(at);
        Ok(())
    }

    /// Rendering -> Done. A Pending frame passes through Rendering at `at`.
    ///
    /// `reported` is the renderer's own timing; without it the time since
    /// the frame started rendering is used.
    pub fn finish_frame(
        &mut self,
        number: i64,
        reported: Option<Duration>,
        at: Instant,
    ) -> Result<Duration, FrameError> {
        if self.frame(number).map(|f| f.status) == Some(FrameStatus::Pending) {
            self.start_frame(number, at)?;
        }
        let frame = self.transition_frame(number, FrameStatus::Done)?;
        let measured = frame
            .rendering_since
            .map(|since| at.saturating_duration_since(since))
            .unwrap_or_default();
        let render_time = reported.unwrap_or(measured);
        frame.render_time = Some(render_time);
        Ok(render_time)
    }

    /// Rendering -> Failed. A Pending frame passes through Rendering.
    pub fn fail_frame(&mut self, number: i64, at: Instant) -> Result<(), FrameError> {
        if self.frame(number).map(|f| f.status) == Some(FrameStatus::Pending) {
            self.start_frame(number, at)?;
        }
        self.transition_frame(number, FrameStatus::Failed)?;
        Ok(())
    }

    /// Pending -> Skipped, only before the job starts
    pub fn skip_frame(&mut self, number: i64) -> Result<(), FrameError> {
        if self.status != JobStatus::Pending {
            return Err(TransitionError {
                subject: format!("frame {} of job {}", number, self.id),
                from: format!("job {}", self.status),
                to: FrameStatus::Skipped.to_string(),
            }
            .into());
        }
        self.transition_frame(number, FrameStatus::Skipped)?;
        Ok(())
    }
}

/// Ordered set of jobs built from one render command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub scene: PathBuf,
    pub jobs: Vec<Job>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(scene: PathBuf, jobs: Vec<Job>) -> Self {
        let created_at = Utc::now();
        Self {
            id: created_at.format("%Y-%m-%d-%H-%M-%S").to_string(),
            scene,
            jobs,
            created_at,
        }
    }

    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn job_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    pub fn total_frames(&self) -> usize {
        self.jobs.iter().map(|j| j.frames.len()).sum()
    }

    pub fn all_terminal(&self) -> bool {
        self.jobs.iter().all(|j| j.status.is_terminal())
    }

    /// Mark frames of a job that has not started as Skipped
    ///
    /// Returns how many frames changed. Frames that are already Skipped are
    /// left alone.
    pub fn skip_frames(&mut self, job_id: &str, frames: &[i64]) -> Result<usize, SchedulerError> {
        let job = self
            .job_mut(job_id)
            .ok_or_else(|| SchedulerError::UnknownJob(job_id.to_string()))?;
        if job.status != JobStatus::Pending {
            return Err(SchedulerError::JobNotPending(job_id.to_string()));
        }

        let mut changed = 0;
        for &frame in frames {
            match job.frame(frame).map(|f| f.status) {
                None => {
                    return Err(SchedulerError::UnknownFrame {
                        job_id: job_id.to_string(),
                        frame,
                    })
                }
                Some(FrameStatus::Pending) => {
                    if job.skip_frame(frame).is_ok() {
                        changed += 1;
                    }
                }
                Some(_) => {}
            }
        }
        Ok(changed)
    }
}
