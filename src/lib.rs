//! Hardeen - render orchestration for Houdini ROPs
//!
//! Resolves render nodes of a scene into jobs, runs the renderer for each
//! job under supervision, tracks every frame from the renderer's output and
//! fans progress out to notifications and an optional shutdown.

pub mod config;
pub mod core;
pub mod error;
pub mod notifications;
pub mod scene;
pub mod semantic;
pub mod shutdown;

// Re-exports
pub use config::EngineConfig;
pub use core::{
    Batch, BatchHandle, BatchOutcome, BatchSummary, EngineEvent, Frame, FrameRange, FrameStatus,
    Job, JobStatus, ProcessLauncher, Scheduler,
};
pub use scene::{BatchSpec, RenderTarget, SceneIntrospector};

/// Result type alias
pub type Result<T> = anyhow::Result<T>;
