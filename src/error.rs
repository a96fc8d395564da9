//! Error taxonomy for the render engine
//!
//! Every failure a batch can run into has its own type here. None of them
//! abort the process: job-level errors end up in the event stream, delivery
//! and shutdown errors are logged.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Scene introspection failed, so no batch was created
#[derive(Debug, Error)]
pub enum BatchResolutionError {
    #[error("scene introspection failed for {scene}: {message}")]
    Introspection { scene: PathBuf, message: String },

    #[error("scene introspection timed out after {0:?}")]
    Timeout(Duration),

    #[error("scene {0} has no render targets")]
    NoTargets(PathBuf),

    #[error("invalid frame range for {node}: {reason}")]
    InvalidRange { node: String, reason: String },

    #[error("render node {0} not found in scene")]
    UnknownNode(String),

    #[error("render node {0} listed more than once")]
    DuplicateNode(String),
}

/// The render executable could not be started
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("render executable not found: {0}")]
    NotFound(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid render arguments: {0}")]
    InvalidArguments(String),
}

/// The render process ended without rendering everything it was given
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessExitError {
    #[error("renderer exited with code {0}")]
    NonZero(i32),

    #[error("renderer terminated by signal {0}")]
    Signaled(i32),

    #[error("renderer exited without an exit status")]
    Unknown,

    #[error("renderer exited cleanly but left {0} frame(s) unrendered")]
    Incomplete(usize),

    #[error("frame {0} failed")]
    FrameFailed(i64),
}

/// The push transport refused or could not deliver a message
#[derive(Debug, Error)]
pub enum NotificationDeliveryError {
    #[error("notification request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("notification service returned HTTP {0}")]
    Status(u16),

    #[error("notification transport not configured: {0}")]
    NotConfigured(&'static str),

    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// The OS shutdown request failed
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("shutdown command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("shutdown is not supported on this platform")]
    Unsupported,
}

/// A command sent to a running batch was rejected
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("job {0} not found in batch")]
    UnknownJob(String),

    #[error("job {0} already started")]
    JobNotPending(String),

    #[error("frame {frame} is not part of job {job_id}")]
    UnknownFrame { job_id: String, frame: i64 },

    #[error("batch is no longer running")]
    BatchClosed,
}

/// An illegal job or frame state change was attempted
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("illegal transition of {subject} from {from} to {to}")]
pub struct TransitionError {
    pub subject: String,
    pub from: String,
    pub to: String,
}

/// A frame update could not be applied to a job
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame {0} is not part of this job")]
    Unknown(i64),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// A frame range that cannot describe any frames
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameRangeError {
    #[error("frame step must be at least 1, got {0}")]
    Step(i64),

    #[error("start frame {start} is after end frame {end}")]
    Reversed { start: i64, end: i64 },

    #[error("cannot parse frame range `{0}`")]
    Syntax(String),

    #[error("frame range {start}-{end} has more than {limit} frames")]
    TooLong { start: i64, end: i64, limit: i64 },
}
