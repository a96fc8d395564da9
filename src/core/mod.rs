//! Core engine - jobs, renderer processes, scheduling

pub mod command;
pub mod events;
pub mod job;
pub mod retry;
pub mod scheduler;
pub mod skip;
pub mod supervisor;
pub mod tracker;

pub use command::RenderCommand;
pub use events::{
    spawn_subscriber, BatchOutcome, BatchSummary, EngineEvent, EventHub, JobCounts,
    ProgressEvent, ProgressKind, Subscriber,
};
pub use job::{Batch, Frame, FrameRange, FrameStatus, Job, JobStatus};
pub use retry::{deadline_after, Backoff, RetryPolicy};
pub use scheduler::{BatchControl, BatchHandle, ConcurrencyPolicy, Scheduler, SchedulerConfig};
pub use skip::OutputTemplate;
pub use supervisor::{
    ExitInfo, LaunchSpec, Launcher, OutputLine, ProcessControl, ProcessEvent, ProcessHandle,
    ProcessLauncher, Stream,
};
pub use tracker::{format_duration, Aggregates};
