//! Shutdown Sequencer - power off the machine after the batch
//!
//! Listens for `BatchFinished`. A qualifying outcome starts a countdown that
//! can still be aborted through [`ShutdownHandle::cancel`].

use crate::core::{deadline_after, format_duration, BatchOutcome, EngineEvent, Subscriber};
use crate::error::ShutdownError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub enabled: bool,
    /// Countdown before powering off
    pub delay_secs: u64,
    /// Also shut down after a failed batch
    pub on_failure: bool,
    /// Log instead of powering off
    pub dry_run: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_secs: 60,
            on_failure: false,
            dry_run: false,
        }
    }
}

impl ShutdownConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    /// Cancelled batches never qualify
    pub fn qualifies(&self, outcome: BatchOutcome) -> bool {
        match outcome {
            BatchOutcome::Completed => true,
            BatchOutcome::Failed => self.on_failure,
            BatchOutcome::Cancelled => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownState {
    Idle,
    Counting { deadline: Instant },
    Cancelled,
    Executed,
    Failed,
}

/// Turns the machine off
#[async_trait]
pub trait PowerControl: Send + Sync {
    async fn power_off(&self) -> Result<(), ShutdownError>;
}

/// The host's own shutdown command
#[derive(Debug, Default, Clone)]
pub struct SystemPower;

async fn run(program: &str, args: &[&str]) -> Result<(), ShutdownError> {
    let command = format!("{} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| ShutdownError::Command {
            command: command.clone(),
            message: e.to_string(),
        })?;
    if output.status.success() {
        Ok(())
    } else {
        Err(ShutdownError::Command {
            command,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl PowerControl for SystemPower {
    async fn power_off(&self) -> Result<(), ShutdownError> {
        if cfg!(target_os = "windows") {
            run("shutdown", &["/s", "/t", "1"]).await
        } else if cfg!(target_os = "macos") {
            run("osascript", &["-e", "tell app \"System Events\" to shut down"]).await
        } else if cfg!(target_os = "linux") {
            match run("systemctl", &["poweroff"]).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    log::warn!("{}, trying shutdown -h", e);
                    run("shutdown", &["-h", "now"]).await
                }
            }
        } else {
            Err(ShutdownError::Unsupported)
        }
    }
}

/// Observe and abort a pending shutdown
#[derive(Clone)]
pub struct ShutdownHandle {
    state: watch::Receiver<ShutdownState>,
    cancel: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Abort the countdown, or prevent one from starting
    ///
    /// Returns false when the shutdown was already carried out.
    pub fn cancel(&self) -> bool {
        if matches!(*self.state.borrow(), ShutdownState::Executed) {
            return false;
        }
        self.cancel.send_replace(true);
        true
    }

    pub fn state(&self) -> ShutdownState {
        self.state.borrow().clone()
    }

    pub fn is_counting(&self) -> bool {
        matches!(self.state(), ShutdownState::Counting { .. })
    }

    pub fn watch(&self) -> watch::Receiver<ShutdownState> {
        self.state.clone()
    }
}

pub struct ShutdownSequencer {
    config: ShutdownConfig,
    power: Arc<dyn PowerControl>,
    state: watch::Sender<ShutdownState>,
    cancelled: watch::Receiver<bool>,
}

impl ShutdownSequencer {
    pub fn new(config: ShutdownConfig, power: Arc<dyn PowerControl>) -> (Self, ShutdownHandle) {
        let (state_tx, state_rx) = watch::channel(ShutdownState::Idle);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let sequencer = Self {
            config,
            power,
            state: state_tx,
            cancelled: cancel_rx,
        };
        let handle = ShutdownHandle {
            state: state_rx,
            cancel: Arc::new(cancel_tx),
        };
        (sequencer, handle)
    }

    fn set(&self, state: ShutdownState) {
        self.state.send_replace(state);
    }

    async fn countdown(&mut self) {
        if *self.cancelled.borrow() {
            log::info!("Shutdown was cancelled before the batch finished");
            self.set(ShutdownState::Cancelled);
            return;
        }

        let deadline = deadline_after(self.config.delay());
        self.set(ShutdownState::Counting { deadline });
        log::warn!(
            "Shutting down in {} unless cancelled",
            format_duration(self.config.delay())
        );

        let mut cancelled = self.cancelled.clone();
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            Ok(()) = wait_cancelled(&mut cancelled) => {
                log::info!("Shutdown cancelled");
                self.set(ShutdownState::Cancelled);
                return;
            }
        }

        if self.config.dry_run {
            log::warn!("Dry run: the computer would shut down now");
            self.set(ShutdownState::Executed);
            return;
        }

        log::warn!("Shutting down");
        match self.power.power_off().await {
            Ok(()) => self.set(ShutdownState::Executed),
            Err(e) => {
                log::error!("Shutdown failed: {}", e);
                self.set(ShutdownState::Failed);
            }
        }
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) -> Result<(), watch::error::RecvError> {
    rx.wait_for(|c| *c).await.map(|_| ())
}

#[async_trait]
impl Subscriber for ShutdownSequencer {
    async fn on_event(&mut self, event: &EngineEvent) {
        let EngineEvent::BatchFinished(summary) = event else {
            return;
        };
        if !self.config.enabled {
            return;
        }
        if !self.config.qualifies(summary.outcome) {
            log::info!("Batch {}, not shutting down", summary.outcome);
            return;
        }
        self.countdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{spawn_subscriber, BatchSummary, JobCounts};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct FakePower {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl PowerControl for FakePower {
        async fn power_off(&self) -> Result<(), ShutdownError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ShutdownError::Unsupported)
            } else {
                Ok(())
            }
        }
    }

    fn finished(outcome: BatchOutcome) -> EngineEvent {
        EngineEvent::BatchFinished(BatchSummary {
            batch_id: "b".to_string(),
            outcome,
            jobs: JobCounts::default(),
            frames_total: 1,
            frames_done: 1,
            frames_failed: 0,
            frames_skipped: 0,
            elapsed: Duration::from_secs(1),
        })
    }

    fn enabled() -> ShutdownConfig {
        ShutdownConfig {
            enabled: true,
            ..Default::default()
        }
    }

    async fn run(config: ShutdownConfig, power: Arc<FakePower>, outcome: BatchOutcome) -> ShutdownState {
        let (sequencer, handle) = ShutdownSequencer::new(config, power);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = spawn_subscriber(rx, sequencer);
        tx.send(finished(outcome)).unwrap();
        drop(tx);
        task.await.unwrap();
        handle.state()
    }

    #[test]
    fn test_qualifying_outcomes() {
        let config = enabled();
        assert!(config.qualifies(BatchOutcome::Completed));
        assert!(!config.qualifies(BatchOutcome::Failed));
        assert!(!config.qualifies(BatchOutcome::Cancelled));

        let config = ShutdownConfig {
            on_failure: true,
            ..enabled()
        };
        assert!(config.qualifies(BatchOutcome::Failed));
        assert!(!config.qualifies(BatchOutcome::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_batch_powers_off_after_delay() {
        let power = Arc::new(FakePower::default());
        let started = Instant::now();
        let state = run(enabled(), power.clone(), BatchOutcome::Completed).await;
        assert_eq!(state, ShutdownState::Executed);
        assert_eq!(power.calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_batch_never_shuts_down() {
        let power = Arc::new(FakePower::default());
        let config = ShutdownConfig {
            on_failure: true,
            ..enabled()
        };
        let state = run(config, power.clone(), BatchOutcome::Cancelled).await;
        assert_eq!(state, ShutdownState::Idle);
        assert_eq!(power.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_and_dry_run() {
        let power = Arc::new(FakePower::default());
        let state = run(ShutdownConfig::default(), power.clone(), BatchOutcome::Completed).await;
        assert_eq!(state, ShutdownState::Idle);

        let config = ShutdownConfig {
            dry_run: true,
            ..enabled()
        };
        let state = run(config, power.clone(), BatchOutcome::Completed).await;
        assert_eq!(state, ShutdownState::Executed);
        assert_eq!(power.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_countdown() {
        let power = Arc::new(FakePower::default());
        let (sequencer, handle) = ShutdownSequencer::new(enabled(), power.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let task = spawn_subscriber(rx, sequencer);
        tx.send(finished(BatchOutcome::Completed)).unwrap();

        let mut state = handle.watch();
        state
            .wait_for(|s| matches!(s, ShutdownState::Counting { .. }))
            .await
            .unwrap();
        assert!(handle.is_counting());
        assert!(handle.cancel());

        drop(tx);
        task.await.unwrap();
        assert_eq!(handle.state(), ShutdownState::Cancelled);
        assert_eq!(power.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_batch_finishes() {
        let power = Arc::new(FakePower::default());
        let (sequencer, handle) = ShutdownSequencer::new(enabled(), power.clone());
        handle.cancel();
        let (tx, rx) = mpsc::unbounded_channel();
        let task = spawn_subscriber(rx, sequencer);
        tx.send(finished(BatchOutcome::Completed)).unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(handle.state(), ShutdownState::Cancelled);
        assert_eq!(power.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_failure_is_reported() {
        let power = Arc::new(FakePower {
            fail: true,
            ..Default::default()
        });
        let state = run(enabled(), power, BatchOutcome::Completed).await;
        assert_eq!(state, ShutdownState::Failed);
    }
}
