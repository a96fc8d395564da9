//! Engine event stream
//!
//! JSON-serializable events published by the scheduler. Every subscriber
//! owns its own unbounded channel, so a slow consumer never blocks the
//! scheduler and events of one job always arrive in order.

use super::supervisor::Stream;
use super::tracker::Aggregates;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What happened to a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressKind {
    /// Renderer launched for these frames
    Started { frames: Vec<i64> },
    FrameStarted { frame: i64 },
    FrameDone { frame: i64, render_time: Duration },
    FrameFailed { frame: i64, message: String },
    FrameSkipped { frame: i64 },
    FrameProgress { frame: i64, percent: u8 },
    OutputWritten { path: PathBuf },
    Log { stream: Stream, line: String },
    Progress(Aggregates),
    Completed,
    Failed { error: String },
    Cancelled,
}

/// One job-level event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    #[serde(flatten)]
    pub kind: ProgressKind,
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(job_id: impl Into<String>, kind: ProgressKind) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            at: Utc::now(),
        }
    }
}

/// Final state of a whole batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for BatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub outcome: BatchOutcome,
    pub jobs: JobCounts,
    pub frames_total: usize,
    pub frames_done: usize,
    pub frames_failed: usize,
    pub frames_skipped: usize,
    pub elapsed: Duration,
}

/// Everything a subscriber can observe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    BatchStarted {
        batch_id: String,
        jobs: Vec<String>,
        frames: usize,
    },
    Job(ProgressEvent),
    BatchFinished(BatchSummary),
}

impl EngineEvent {
    /// Serialize to JSON line
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::Job(event) => Some(&event.job_id),
            _ => None,
        }
    }
}

/// Fan-out of engine events to any number of subscribers
#[derive(Clone, Default)]
pub struct EventHub {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// New single-consumer receiver of all later events
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Emit an event to all subscribers, dropping the ones that went away
    pub fn emit(&self, event: EngineEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Anything that reacts to engine events
#[async_trait]
pub trait Subscriber: Send + 'static {
    async fn on_event(&mut self, event: &EngineEvent);
}

/// Drive a subscriber until the stream closes, then hand it back
pub fn spawn_subscriber<S: Subscriber>(
    mut rx: mpsc::UnboundedReceiver<EngineEvent>,
    mut subscriber: S,
) -> JoinHandle<S> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            subscriber.on_event(&event).await;
        }
        subscriber
    })
}
