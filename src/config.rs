//! Engine configuration
//!
//! One YAML file with a section per component. Every field has a default,
//! so an empty or missing file is a valid configuration.

use crate::core::{RenderCommand, SchedulerConfig};
use crate::notifications::NotificationConfig;
use crate::shutdown::ShutdownConfig;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How renderers are started and stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    #[serde(flatten)]
    pub command: RenderCommand,
    /// Time between SIGTERM and SIGKILL on cancel
    pub terminate_grace_secs: f64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            command: RenderCommand::default(),
            terminate_grace_secs: 10.0,
        }
    }
}

impl RenderConfig {
    pub fn terminate_grace(&self) -> Duration {
        Duration::try_from_secs_f64(self.terminate_grace_secs.max(0.0)).unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntrospectionConfig {
    pub timeout_secs: u64,
    /// Executable used to list render nodes
    pub hython: String,
}

impl Default for IntrospectionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            hython: "hython".to_string(),
        }
    }
}

impl IntrospectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub render: RenderConfig,
    pub scheduler: SchedulerConfig,
    pub introspection: IntrospectionConfig,
    pub notifications: NotificationConfig,
    pub shutdown: ShutdownConfig,
}

impl EngineConfig {
    /// `$XDG_CONFIG_HOME/hardeen/config.yml` or the platform equivalent
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hardeen").join("config.yml"))
    }

    /// Load from `path`, else the default location, else defaults
    ///
    /// Environment overrides are applied and the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::load_from(&path)?,
                None => {
                    log::debug!("No config file, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file as is
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `PUSHOVER_*` variables through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let pushover = &mut self.notifications.pushover;
        if let Some(token) = lookup("PUSHOVER_API_TOKEN") {
            pushover.api_token = token;
        }
        if let Some(user) = lookup("PUSHOVER_USER_KEY") {
            pushover.user_key = user;
        }
        if let Some(device) = lookup("PUSHOVER_DEVICE") {
            pushover.device = Some(device);
        }
        if let Some(priority) = lookup("PUSHOVER_PRIORITY") {
            match priority.trim().parse() {
                Ok(value) => pushover.priority = value,
                Err(_) => log::warn!("Ignoring PUSHOVER_PRIORITY={}", priority),
            }
        }
        if let Some(sound) = lookup("PUSHOVER_SOUND") {
            pushover.sound = Some(sound);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.render.command.program.trim().is_empty() {
            bail!("render.program must not be empty");
        }
        if !self.render.terminate_grace_secs.is_finite() || self.render.terminate_grace_secs < 0.0 {
            bail!("render.terminate_grace_secs must be a non-negative number");
        }
        if let crate::core::ConcurrencyPolicy::Parallel { max_jobs: 0 } = self.scheduler.concurrency {
            bail!("scheduler.concurrency.max_jobs must be at least 1");
        }
        if let Err(e) = self.scheduler.retry.backoff.check() {
            bail!("scheduler.retry.backoff.{}", e);
        }
        if self.notifications.interval == 0 {
            bail!("notifications.interval must be at least 1");
        }
        if !(-2..=2).contains(&self.notifications.pushover.priority) {
            bail!("notifications.pushover.priority must be between -2 and 2");
        }
        Ok(())
    }
}
