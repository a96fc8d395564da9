//! Scene introspection - which render nodes a scene has
//!
//! The engine only needs a list of targets with frame ranges. Two sources
//! ship with the crate: a YAML manifest next to the scene, and a `hython`
//! run that walks `/out` of the hip file.

use crate::core::{FrameRange, Job, OutputTemplate};
use crate::error::BatchResolutionError;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Script listing render nodes inside hython
pub const LIST_SCRIPT: &str = include_str!("../assets/hython_list.py");

/// ROP node types the hython lister reports
pub const ROP_TYPES: [&str; 3] = ["Redshift_ROP", "rop_geometry", "opengl"];

/// A render node and its frame range as stored in the scene
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderTarget {
    pub node: String,
    pub start: i64,
    pub end: i64,
    #[serde(default = "default_step")]
    pub step: i64,
    #[serde(default)]
    pub output: Option<OutputTemplate>,
    #[serde(default, rename = "type")]
    pub rop_type: Option<String>,
}

fn default_step() -> i64 {
    1
}

impl RenderTarget {
    pub fn new(node: impl Into<String>, start: i64, end: i64) -> Self {
        Self {
            node: node.into(),
            start,
            end,
            step: 1,
            output: None,
            rop_type: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(OutputTemplate::new(output));
        self
    }
}

/// What to render: a scene, its targets and optional frame overrides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSpec {
    pub scene: PathBuf,
    pub targets: Vec<RenderTarget>,
    /// Replaces every target's range
    pub range: Option<FrameRange>,
    /// Replaces every target's step
    pub step: Option<i64>,
}

impl BatchSpec {
    pub fn new(scene: impl Into<PathBuf>, targets: Vec<RenderTarget>) -> Self {
        Self {
            scene: scene.into(),
            targets,
            range: None,
            step: None,
        }
    }

    pub fn with_range(mut self, range: FrameRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    /// Keep only `nodes`, in the order given; empty keeps everything
    pub fn select(mut self, nodes: &[String]) -> Result<Self, BatchResolutionError> {
        if nodes.is_empty() {
            return Ok(self);
        }
        let mut selected = Vec::with_capacity(nodes.len());
        for node in nodes {
            let target = self
                .targets
                .iter()
                .find(|t| &t.node == node)
                .ok_or_else(|| BatchResolutionError::UnknownNode(node.clone()))?;
            selected.push(target.clone());
        }
        self.targets = selected;
        Ok(self)
    }

    fn range_for(&self, target: &RenderTarget) -> Result<FrameRange, BatchResolutionError> {
        let (start, end, step) = match self.range {
            Some(range) => (range.start, range.end, self.step.unwrap_or(range.step)),
            None => (target.start, target.end, self.step.unwrap_or(target.step)),
        };
        FrameRange::new(start, end, step).map_err(|e| BatchResolutionError::InvalidRange {
            node: target.node.clone(),
            reason: e.to_string(),
        })
    }

    /// Jobs for every target, frames all Pending
    pub fn jobs(&self) -> Result<Vec<Job>, BatchResolutionError> {
        if self.targets.is_empty() {
            return Err(BatchResolutionError::NoTargets(self.scene.clone()));
        }

        let mut seen = HashSet::new();
        self.targets
            .iter()
            .map(|target| {
                if !seen.insert(target.node.as_str()) {
                    return Err(BatchResolutionError::DuplicateNode(target.node.clone()));
                }
                let range = self.range_for(target)?;
                Ok(Job::new(target.node.clone(), range, target.output.clone()))
            })
            .collect()
    }
}

/// Lists the render targets of a scene
#[async_trait]
pub trait SceneIntrospector: Send + Sync {
    async fn list_targets(&self, scene: &Path) -> Result<Vec<RenderTarget>, BatchResolutionError>;
}

/// Query `introspector`, giving up after `timeout`
pub async fn resolve_targets(
    introspector: &dyn SceneIntrospector,
    scene: &Path,
    timeout: Duration,
) -> Result<Vec<RenderTarget>, BatchResolutionError> {
    let targets = tokio::time::timeout(timeout, introspector.list_targets(scene))
        .await
        .map_err(|_| BatchResolutionError::Timeout(timeout))??;
    if targets.is_empty() {
        return Err(BatchResolutionError::NoTargets(scene.to_path_buf()));
    }
    log::info!("Found {} render target(s) in {}", targets.len(), scene.display());
    Ok(targets)
}

#[derive(Debug, Deserialize)]
struct Manifest {
    targets: Vec<RenderTarget>,
}

/// Reads targets from a YAML manifest
///
/// ```yaml
/// targets:
///   - node: /out/beauty
///     start: 1001
///     end: 1100
///     output: $HIP/render/beauty.$F4.exr
/// ```
#[derive(Debug, Clone)]
pub struct ManifestIntrospector {
    path: Option<PathBuf>,
}

impl ManifestIntrospector {
    /// Read `path` regardless of the scene
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Read `<scene>.targets.yml` next to each scene
    pub fn sidecar() -> Self {
        Self { path: None }
    }

    pub fn sidecar_path(scene: &Path) -> PathBuf {
        let mut name = scene.as_os_str().to_owned();
        name.push(".targets.yml");
        PathBuf::from(name)
    }

    fn load(path: &Path) -> anyhow::Result<Vec<RenderTarget>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        let manifest: Manifest = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse manifest {}", path.display()))?;
        Ok(manifest.targets)
    }
}

#[async_trait]
impl SceneIntrospector for ManifestIntrospector {
    async fn list_targets(&self, scene: &Path) -> Result<Vec<RenderTarget>, BatchResolutionError> {
        let path = self
            .path
            .clone()
            .unwrap_or_else(|| Self::sidecar_path(scene));
        Self::load(&path).map_err(|e| BatchResolutionError::Introspection {
            scene: scene.to_path_buf(),
            message: format!("{:#}", e),
        })
    }
}

/// Lists `/out` render nodes by running hython
#[derive(Debug, Clone)]
pub struct HythonIntrospector {
    program: String,
}

impl HythonIntrospector {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for HythonIntrospector {
    fn default() -> Self {
        Self::new("hython")
    }
}

#[derive(Debug, Deserialize)]
struct NodeSettings {
    f1: i64,
    f2: i64,
    #[serde(default = "default_step")]
    f3: i64,
    #[serde(default, rename = "type")]
    rop_type: Option<String>,
    #[serde(default)]
    output: Option<String>,
}

/// Parse the lister's `NODE:` / `SETTINGS:` lines
///
/// A node without a settings line renders frame 1 only, as Houdini does
/// for nodes without a frame range.
pub fn parse_listing(stdout: &str) -> Vec<RenderTarget> {
    let mut targets: Vec<RenderTarget> = Vec::new();
    for line in stdout.lines().map(str::trim) {
        if let Some(node) = line.strip_prefix("NODE:") {
            targets.push(RenderTarget::new(node.trim(), 1, 1));
        } else if let Some(json) = line.strip_prefix("SETTINGS:") {
            let Some(target) = targets.last_mut() else {
                continue;
            };
            match serde_json::from_str::<NodeSettings>(json) {
                Ok(settings) => {
                    target.start = settings.f1;
                    target.end = settings.f2;
                    target.step = settings.f3;
                    target.rop_type = settings.rop_type;
                    target.output = settings
                        .output
                        .filter(|o| !o.is_empty())
                        .map(OutputTemplate::new);
                }
                Err(e) => log::warn!("Bad settings for {}: {}", target.node, e),
            }
        }
    }
    targets.retain(|t| {
        t.rop_type
            .as_deref()
            .map_or(true, |kind| ROP_TYPES.contains(&kind))
    });
    targets
}

#[async_trait]
impl SceneIntrospector for HythonIntrospector {
    async fn list_targets(&self, scene: &Path) -> Result<Vec<RenderTarget>, BatchResolutionError> {
        let failed = |message: String| BatchResolutionError::Introspection {
            scene: scene.to_path_buf(),
            message,
        };

        log::debug!("Listing render nodes of {} with {}", scene.display(), self.program);
        let output = Command::new(&self.program)
            .arg("-c")
            .arg(LIST_SCRIPT)
            .arg(scene)
            .env("HOU_VERBOSITY", "0")
            .env("RS_VERBOSITY_LEVEL", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| failed(format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(parse_listing(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Slow;

    #[async_trait]
    impl SceneIntrospector for Slow {
        async fn list_targets(&self, _scene: &Path) -> Result<Vec<RenderTarget>, BatchResolutionError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_parse_listing() {
        let stdout = "\
some hython banner
NODE:/out/Redshift_ROP1
SETTINGS:{\"f1\": 1001, \"f2\": 1100, \"f3\": 2, \"type\": \"Redshift_ROP\", \"output\": \"/r/beauty.$F4.exr\", \"skip_rendered\": 0}
NODE:/out/geo
SETTINGS:{\"f1\": 1, \"f2\": 24, \"type\": \"rop_geometry\", \"output\": \"\"}
NODE:/out/karma
SETTINGS:{\"f1\": 1, \"f2\": 5, \"type\": \"karma\"}
";
        let targets = parse_listing(stdout);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].node, "/out/Redshift_ROP1");
        assert_eq!((targets[0].start, targets[0].end, targets[0].step), (1001, 1100, 2));
        assert_eq!(targets[0].output, Some(OutputTemplate::new("/r/beauty.$F4.exr")));
        assert_eq!(targets[1].output, None);
        assert_eq!(targets[1].step, 1);
    }

    #[test]
    fn test_jobs_apply_overrides() {
        let spec = BatchSpec::new(
            "shot.hip",
            vec![RenderTarget::new("/out/a", 1, 10), RenderTarget::new("/out/b", 5, 8)],
        )
        .with_step(2);
        let jobs = spec.jobs().unwrap();
        assert_eq!(jobs[0].pending_frames(), vec![1, 3, 5, 7, 9]);
        assert_eq!(jobs[1].pending_frames(), vec![5, 7]);

        let spec = spec.with_range(FrameRange::new(20, 22, 1).unwrap());
        let jobs = spec.jobs().unwrap();
        assert_eq!(jobs[0].pending_frames(), vec![20, 22]);
    }

    #[test]
    fn test_jobs_reject_bad_targets() {
        let empty = BatchSpec::new("shot.hip", vec![]);
        assert!(matches!(empty.jobs(), Err(BatchResolutionError::NoTargets(_))));

        let dup = BatchSpec::new(
            "shot.hip",
            vec![RenderTarget::new("/out/a", 1, 2), RenderTarget::new("/out/a", 1, 2)],
        );
        assert!(matches!(dup.jobs(), Err(BatchResolutionError::DuplicateNode(_))));

        let reversed = BatchSpec::new("shot.hip", vec![RenderTarget::new("/out/a", 10, 1)]);
        assert!(matches!(
            reversed.jobs(),
            Err(BatchResolutionError::InvalidRange { .. })
        ));

        let endless = BatchSpec::new(
            "shot.hip",
            vec![RenderTarget::new("/out/a", i64::MIN, i64::MAX)],
        );
        assert!(matches!(
            endless.jobs(),
            Err(BatchResolutionError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_select_nodes() {
        let spec = BatchSpec::new(
            "shot.hip",
            vec![RenderTarget::new("/out/a", 1, 2), RenderTarget::new("/out/b", 1, 2)],
        );
        let selected = spec.clone().select(&["/out/b".to_string()]).unwrap();
        assert_eq!(selected.targets.len(), 1);
        assert_eq!(selected.targets[0].node, "/out/b");
        assert!(matches!(
            spec.select(&["/out/c".to_string()]),
            Err(BatchResolutionError::UnknownNode(_))
        ));
    }

    #[tokio::test]
    async fn test_manifest_introspector() {
        let dir = TempDir::new().unwrap();
        let scene = dir.path().join("shot.hip");
        std::fs::write(
            ManifestIntrospector::sidecar_path(&scene),
            "targets:\n  - node: /out/beauty\n    start: 1\n    end: 3\n    output: render/beauty.$F4.exr\n",
        )
        .unwrap();

        let targets = resolve_targets(&ManifestIntrospector::sidecar(), &scene, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(targets, vec![RenderTarget::new("/out/beauty", 1, 3).with_output("render/beauty.$F4.exr")]);

        let missing = ManifestIntrospector::new(dir.path().join("nope.yml"));
        assert!(matches!(
            resolve_targets(&missing, &scene, Duration::from_secs(5)).await,
            Err(BatchResolutionError::Introspection { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_times_out() {
        let result = resolve_targets(&Slow, Path::new("shot.hip"), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(BatchResolutionError::Timeout(_))));
    }
}
