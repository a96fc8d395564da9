//! Push Notifications - render progress on your phone
//!
//! Sends notifications when:
//! - a batch starts
//! - every Nth frame finishes
//! - a batch completes, fails or is interrupted
//!
//! Messages go through a [`NotificationTransport`]; Pushover is the real one.
//! Delivery failures are retried, then dropped with a warning. They never
//! touch render state.

use crate::core::{
    format_duration, Backoff, BatchOutcome, BatchSummary, EngineEvent, ProgressKind, RetryPolicy,
    Subscriber,
};
use crate::error::NotificationDeliveryError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const PUSHOVER_API_URL: &str = "https://api.pushover.net/1/messages.json";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const TITLE: &str = "Hardeen Render Manager";

/// Pushover credentials and delivery options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushoverConfig {
    pub api_token: String,
    pub user_key: String,
    pub device: Option<String>,
    /// -2 (silent) to 2 (emergency)
    pub priority: i8,
    pub sound: Option<String>,
}

impl PushoverConfig {
    pub fn is_configured(&self) -> bool {
        !self.api_token.is_empty() && !self.user_key.is_empty()
    }
}

/// Notification configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    /// Notify on every Nth finished frame
    pub interval: u32,
    pub on_start: bool,
    pub on_frames: bool,
    pub on_complete: bool,
    pub on_failure: bool,
    pub on_cancel: bool,
    /// Attempts after the first failed one
    pub max_retries: u32,
    pub pushover: PushoverConfig,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: 10,
            on_start: true,
            on_frames: true,
            on_complete: true,
            on_failure: true,
            on_cancel: true,
            max_retries: 3,
            pushover: PushoverConfig::default(),
        }
    }
}

/// Somewhere to send a message
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(&self, message: &str) -> Result<(), NotificationDeliveryError>;
}

/// Pushover messages API
pub struct PushoverTransport {
    client: reqwest::Client,
    config: PushoverConfig,
    url: String,
}

impl PushoverTransport {
    pub fn new(config: PushoverConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            config,
            url: PUSHOVER_API_URL.to_string(),
        }
    }

    /// Post to another endpoint
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    fn form(&self, message: &str) -> Vec<(&'static str, String)> {
        let mut form = vec![
            ("token", self.config.api_token.clone()),
            ("user", self.config.user_key.clone()),
            ("title", TITLE.to_string()),
            ("message", message.to_string()),
            ("priority", self.config.priority.to_string()),
        ];
        if let Some(device) = &self.config.device {
            form.push(("device", device.clone()));
        }
        if let Some(sound) = &self.config.sound {
            form.push(("sound", sound.clone()));
        }
        // Emergency priority is rejected without retry/expire
        if self.config.priority == 2 {
            form.push(("retry", "60".to_string()));
            form.push(("expire", "3600".to_string()));
        }
        form
    }
}

#[derive(Deserialize)]
struct PushoverResponse {
    status: i64,
    #[serde(default)]
    errors: Vec<String>,
}

#[async_trait]
impl NotificationTransport for PushoverTransport {
    async fn send(&self, message: &str) -> Result<(), NotificationDeliveryError> {
        if !self.config.is_configured() {
            return Err(NotificationDeliveryError::NotConfigured(
                "missing Pushover API token or user key",
            ));
        }

        let response = self.client.post(&self.url).form(&self.form(message)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotificationDeliveryError::Status(status.as_u16()));
        }
        let body: PushoverResponse = response.json().await?;
        if body.status != 1 {
            return Err(NotificationDeliveryError::Rejected(body.errors.join(", ")));
        }
        Ok(())
    }
}

/// Writes messages to the log instead of sending them
#[derive(Debug, Default, Clone)]
pub struct LogTransport;

#[async_trait]
impl NotificationTransport for LogTransport {
    async fn send(&self, message: &str) -> Result<(), NotificationDeliveryError> {
        log::info!("Notification: {}", message.replace('\n', " | "));
        Ok(())
    }
}

/// Send with bounded retries; failure is logged and dropped
pub async fn deliver(transport: &dyn NotificationTransport, message: &str, retry: &RetryPolicy) -> bool {
    let mut attempt = 0;
    loop {
        match transport.send(message).await {
            Ok(()) => return true,
            Err(NotificationDeliveryError::NotConfigured(reason)) => {
                log::warn!("Notification dropped: {}", reason);
                return false;
            }
            Err(e) => {
                attempt += 1;
                match retry.next_delay(attempt) {
                    Some(delay) => {
                        log::warn!("Notification attempt {} failed: {}, retrying", attempt, e);
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        log::warn!("Notification dropped after {} attempt(s): {}", attempt, e);
                        return false;
                    }
                }
            }
        }
    }
}

/// Turns engine events into notifications
pub struct NotificationTrigger {
    config: NotificationConfig,
    transport: Box<dyn NotificationTransport>,
    retry: RetryPolicy,
    /// Shown in every message, usually the scene name
    name: String,
    total_frames: usize,
    frames_done: usize,
    sent: usize,
}

impl NotificationTrigger {
    pub fn new(
        config: NotificationConfig,
        transport: Box<dyn NotificationTransport>,
        name: impl Into<String>,
    ) -> Self {
        let retry = RetryPolicy::new(config.max_retries, Backoff::default());
        Self {
            config,
            transport,
            retry,
            name: name.into(),
            total_frames: 0,
            frames_done: 0,
            sent: 0,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Messages delivered so far
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// The message for an event, if it warrants one
    pub fn message_for(&mut self, event: &EngineEvent) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        match event {
            EngineEvent::BatchStarted { jobs, frames, .. } => {
                self.total_frames = *frames;
                self.frames_done = 0;
                self.config.on_start.then(|| {
                    format!(
                        "🚀 Render Started: {}\nNodes: {}\nTotal frames: {}",
                        self.name,
                        jobs.join(", "),
                        frames
                    )
                })
            }
            EngineEvent::Job(progress) => match &progress.kind {
                ProgressKind::FrameDone { frame, render_time } => {
                    self.frames_done += 1;
                    let interval = self.config.interval.max(1) as usize;
                    (self.config.on_frames && self.frames_done % interval == 0).then(|| {
                        format!(
                            "🎬 Frame {}/{} completed\nRender time: {}\nJob: {} (frame {})",
                            self.frames_done,
                            self.total_frames,
                            format_duration(*render_time),
                            progress.job_id,
                            frame
                        )
                    })
                }
                _ => None,
            },
            EngineEvent::BatchFinished(summary) => self.summary_message(summary),
        }
    }

    fn summary_message(&self, summary: &BatchSummary) -> Option<String> {
        let elapsed = format_duration(summary.elapsed);
        match summary.outcome {
            BatchOutcome::Completed if self.config.on_complete => Some(format!(
                "✅ Render Complete: {}\nTotal frames: {}\nTotal time: {}",
                self.name, summary.frames_total, elapsed
            )),
            BatchOutcome::Failed if self.config.on_failure => Some(format!(
                "❌ Render Failed: {}\nFrames done: {}/{} ({} failed)\nTotal time: {}",
                self.name, summary.frames_done, summary.frames_total, summary.frames_failed, elapsed
            )),
            BatchOutcome::Cancelled if self.config.on_cancel => Some(format!(
                "⚠️ Render Interrupted: {}\nStopped after frame: {}/{}\nTotal time: {}",
                self.name, summary.frames_done, summary.frames_total, elapsed
            )),
            _ => None,
        }
    }
}

#[async_trait]
impl Subscriber for NotificationTrigger {
    async fn on_event(&mut self, event: &EngineEvent) {
        let Some(message) = self.message_for(event) else {
            return;
        };
        if deliver(self.transport.as_ref(), &message, &self.retry).await {
            self.sent += 1;
        }
    }
}
