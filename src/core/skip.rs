//! Frame-skip policy
//!
//! A frame is skipped when its output file is already on disk. Output paths
//! come from the render node's output parameter, which may carry a frame
//! token in any of the usual spellings: `$F`, `$F4`, `${F4}`, `%04d` or a run
//! of `#` characters.

use super::job::{FrameStatus, Job, JobStatus};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Output path with a frame token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputTemplate(String);

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{F(\d*)\}|\$F(\d*)([A-Za-z_]?)|%0?(\d*)d|(#+)")
            .expect("frame token pattern is valid")
    })
}

/// `$FPS`, `$FSTART` and friends share the `$F` prefix
fn is_other_variable(caps: &Captures<'_>) -> bool {
    let digits = caps.get(2).map_or("", |m| m.as_str());
    let tail = caps.get(3).map_or("", |m| m.as_str());
    digits.is_empty() && !tail.is_empty()
}

/// Widest zero padding honored in a frame token
const MAX_PAD: usize = 32;

fn pad(frame: i64, width: usize) -> String {
    format!("{:0width$}", frame, width = width.min(MAX_PAD))
}

/// `digits` is empty or all ASCII digits; too many of them means the widest pad
fn pad_digits(frame: i64, digits: &str) -> String {
    let width = if digits.is_empty() {
        0
    } else {
        digits.parse::<usize>().unwrap_or(MAX_PAD)
    };
    pad(frame, width)
}

impl OutputTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the path changes per frame
    pub fn has_frame_token(&self) -> bool {
        token_re().captures_iter(&self.0).any(|caps| !is_other_variable(&caps))
    }

    /// Path of one frame's output
    pub fn expand(&self, frame: i64) -> PathBuf {
        let expanded = token_re().replace_all(&self.0, |caps: &Captures<'_>| {
            if let Some(width) = caps.get(1) {
                return pad_digits(frame, width.as_str());
            }
            if let Some(width) = caps.get(2) {
                if is_other_variable(caps) {
                    return caps[0].to_string();
                }
                let tail = caps.get(3).map_or("", |m| m.as_str());
                return format!("{}{}", pad_digits(frame, width.as_str()), tail);
            }
            if let Some(width) = caps.get(4) {
                return pad_digits(frame, width.as_str());
            }
            pad(frame, caps.get(5).map_or(0, |m| m.as_str().len()))
        });
        PathBuf::from(expanded.into_owned())
    }
}

impl fmt::Display for OutputTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OutputTemplate {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Pending frames of `job` whose output already exists
pub fn existing_outputs(job: &Job) -> Vec<i64> {
    let Some(output) = &job.output else {
        return Vec::new();
    };
    if !output.has_frame_token() && job.frames.len() > 1 {
        log::debug!(
            "Output {} of {} has no frame token, not probing",
            output,
            job.id
        );
        return Vec::new();
    }

    job.frames
        .iter()
        .filter(|f| f.status == FrameStatus::Pending)
        .filter(|f| output.expand(f.number).exists())
        .map(|f| f.number)
        .collect()
}

/// Apply skip-existing to a job about to launch
///
/// Returns the frames that were moved to Skipped. Does nothing when the
/// policy is off or the job has already started.
pub fn apply_skip_existing(job: &mut Job, enabled: bool) -> Vec<i64> {
    if !enabled || job.status != JobStatus::Pending {
        return Vec::new();
    }

    let mut skipped = Vec::new();
    for frame in existing_outputs(job) {
        match job.skip_frame(frame) {
            Ok(()) => skipped.push(frame),
            Err(e) => log::warn!("Could not skip frame {} of {}: {}", frame, job.id, e),
        }
    }
    if !skipped.is_empty() {
        log::info!("{}: {} frame(s) already rendered, skipping", job.id, skipped.len());
    }
    skipped
}

/// Group frames into runs that a single renderer launch can cover
///
/// `frames` must be ascending. A run continues while consecutive frames are
/// exactly `step` apart.
pub fn contiguous_spans(frames: &[i64], step: i64) -> Vec<(i64, i64)> {
    let mut spans: Vec<(i64, i64)> = Vec::new();
    for &frame in frames {
        match spans.last_mut() {
            Some((_, end)) if frame - *end == step => *end = frame,
            _ => spans.push((frame, frame)),
        }
    }
    spans
}
