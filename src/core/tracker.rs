//! Frame Tracker - progress aggregates and ETA
//!
//! Pure functions over a job snapshot. The scheduler calls `derive` after
//! every frame transition and publishes the result as a `Progress` event.

use super::job::{FrameStatus, Job};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Derived progress of a job (or a whole batch)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregates {
    pub total: usize,
    pub done_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub rendering_count: usize,
    pub pending_count: usize,
    /// Terminal frames over total, 0-100
    pub percent_complete: f64,
    pub elapsed: Duration,
    pub average_frame_time: Option<Duration>,
    /// `None` until at least one frame is Done
    pub estimated_remaining: Option<Duration>,
}

impl Aggregates {
    pub fn terminal_count(&self) -> usize {
        self.done_count + self.failed_count + self.skipped_count
    }

    pub fn eta_display(&self) -> String {
        self.estimated_remaining
            .map(format_duration)
            .unwrap_or_else(|| "unknown".to_string())
    }
}

struct Sums {
    done_time: Duration,
}

fn count_job(job: &Job, agg: &mut Aggregates, sums: &mut Sums) {
    agg.total += job.frames.len();
    for frame in &job.frames {
        match frame.status {
            FrameStatus::Pending => agg.pending_count += 1,
            FrameStatus::Rendering => agg.rendering_count += 1,
            FrameStatus::Done => {
                agg.done_count += 1;
                sums.done_time = sums
                    .done_time
                    .saturating_add(frame.render_time.unwrap_or_default());
            }
            FrameStatus::Failed => agg.failed_count += 1,
            FrameStatus::Skipped => agg.skipped_count += 1,
        }
    }
}

fn finish(mut agg: Aggregates, sums: Sums, elapsed: Duration) -> Aggregates {
    agg.elapsed = elapsed;
    agg.percent_complete = if agg.total == 0 {
        100.0
    } else {
        agg.terminal_count() as f64 * 100.0 / agg.total as f64
    };

    // Reported render times are untrusted; an ETA that overflows is unknown
    if let Ok(done) = u32::try_from(agg.done_count) {
        if done > 0 {
            let average = sums.done_time / done;
            agg.average_frame_time = Some(average);
            agg.estimated_remaining = u32::try_from(agg.pending_count + agg.rendering_count)
                .ok()
                .and_then(|remaining| average.checked_mul(remaining));
        }
    }
    agg
}

fn since(start: Option<DateTime<Utc>>, end: DateTime<Utc>) -> Duration {
    start
        .and_then(|s| (end - s).to_std().ok())
        .unwrap_or_default()
}

/// Aggregates of one job at time `now`
pub fn derive(job: &Job, now: DateTime<Utc>) -> Aggregates {
    let mut agg = Aggregates::default();
    let mut sums = Sums {
        done_time: Duration::ZERO,
    };
    count_job(job, &mut agg, &mut sums);

    let end = job.ended_at.unwrap_or(now);
    finish(agg, sums, since(job.started_at, end))
}

/// Aggregates summed over several jobs, elapsed measured from `started`
pub fn derive_batch<'a>(
    jobs: impl IntoIterator<Item = &'a Job>,
    started: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Aggregates {
    let mut agg = Aggregates::default();
    let mut sums = Sums {
        done_time: Duration::ZERO,
    };
    for job in jobs {
        count_job(job, &mut agg, &mut sums);
    }
    finish(agg, sums, since(Some(started), now))
}

/// Format duration as human-readable string
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
