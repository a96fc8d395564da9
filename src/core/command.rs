//! Renderer invocation
//!
//! Arguments are a template with `{script}`, `{scene}`, `{node}`, `{start}`,
//! `{end}`, `{step}` and `{frames}` placeholders. A template that takes
//! `{frames}` gets every pending frame in one launch; any other template is
//! launched once per contiguous run of frames.

use super::job::Job;
use super::skip::contiguous_spans;
use super::supervisor::LaunchSpec;
use crate::error::LaunchError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Wrapper run inside hython; prints `hardeen_*` markers per frame
pub const WRAPPER_SCRIPT: &str = include_str!("../../assets/hython_render.py");

const WRAPPER_NAME: &str = "hardeen_render.py";

const PLACEHOLDERS: [&str; 7] = [
    "{script}", "{scene}", "{node}", "{start}", "{end}", "{step}", "{frames}",
];

/// How to start the renderer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Where `{script}` is written; temp dir when unset
    pub script_dir: Option<PathBuf>,
}

impl Default for RenderCommand {
    fn default() -> Self {
        Self {
            program: "hython".to_string(),
            args: ["{script}", "-i", "{scene}", "-o", "{node}", "-f", "{frames}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            env: BTreeMap::new(),
            working_dir: None,
            script_dir: None,
        }
    }
}

impl RenderCommand {
    /// True when one launch can take an arbitrary frame list
    pub fn accepts_frame_list(&self) -> bool {
        self.args.iter().any(|a| a.contains("{frames}"))
    }

    fn uses_script(&self) -> bool {
        self.args.iter().any(|a| a.contains("{script}"))
    }

    /// Frame groups for the job's unfinished frames, one per launch
    pub fn plan(&self, job: &Job) -> Vec<Vec<i64>> {
        let unfinished = job.unfinished_frames();
        if unfinished.is_empty() {
            return Vec::new();
        }
        if self.accepts_frame_list() {
            return vec![unfinished];
        }
        let step = job.frame_range.step;
        contiguous_spans(&unfinished, step)
            .into_iter()
            .map(|(start, end)| (start..=end).step_by(step as usize).collect())
            .collect()
    }

    /// Write the wrapper script if missing or stale
    pub fn ensure_script(&self) -> Result<PathBuf, LaunchError> {
        let dir = self
            .script_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("hardeen"));
        let path = dir.join(WRAPPER_NAME);

        let current = std::fs::read_to_string(&path).ok();
        if current.as_deref() != Some(WRAPPER_SCRIPT) {
            let write = std::fs::create_dir_all(&dir)
                .and_then(|_| std::fs::write(&path, WRAPPER_SCRIPT));
            if let Err(source) = write {
                return Err(LaunchError::Spawn {
                    program: path.display().to_string(),
                    source,
                });
            }
            log::debug!("Wrote render wrapper to {}", path.display());
        }
        Ok(path)
    }

    /// Launch spec rendering `frames` of `job`
    ///
    /// `frames` must be non-empty, ascending and part of the job.
    pub fn launch_spec(&self, scene: &Path, job: &Job, frames: &[i64]) -> Result<LaunchSpec, LaunchError> {
        let (Some(&start), Some(&end)) = (frames.first(), frames.last()) else {
            return Err(LaunchError::InvalidArguments(format!(
                "no frames to render for {}",
                job.id
            )));
        };

        let script = if self.uses_script() {
            self.ensure_script()?.display().to_string()
        } else {
            String::new()
        };
        let frame_list = frames
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let values = [
            script,
            scene.display().to_string(),
            job.id.clone(),
            start.to_string(),
            end.to_string(),
            job.frame_range.step.to_string(),
            frame_list,
        ];

        let args = self
            .args
            .iter()
            .map(|arg| {
                PLACEHOLDERS
                    .iter()
                    .zip(values.iter())
                    .fold(arg.clone(), |acc, (key, value)| acc.replace(key, value))
            })
            .collect();

        Ok(LaunchSpec {
            job_id: job.id.clone(),
            program: self.program.clone(),
            args,
            env: self.env.clone(),
            working_dir: self.working_dir.clone(),
            frames: frames.to_vec(),
        })
    }
}
