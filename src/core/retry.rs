//! Retry policy shared by job relaunches and notification delivery

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Stand-in for a deadline that does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + delay`, saturating at roughly thirty years out
pub fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_secs: f64 },
    Exponential { initial_secs: f64, max_secs: f64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            initial_secs: 1.0,
            max_secs: 30.0,
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

impl Backoff {
    /// Every field must be a finite, non-negative number of seconds
    pub fn check(&self) -> Result<(), String> {
        let fields = match *self {
            Self::Fixed { delay_secs } => vec![("delay_secs", delay_secs)],
            Self::Exponential {
                initial_secs,
                max_secs,
            } => vec![("initial_secs", initial_secs), ("max_secs", max_secs)],
        };
        for (name, value) in fields {
            if !value.is_finite() || value < 0.0 || Duration::try_from_secs_f64(value).is_err() {
                return Err(format!("{} must be a non-negative number of seconds", name));
            }
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Self::Fixed { delay_secs } => secs(delay_secs),
            Self::Exponential {
                initial_secs,
                max_secs,
            } => {
                let exponent = retry.saturating_sub(1).min(32) as i32;
                secs((initial_secs * 2f64.powi(exponent)).min(max_secs))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// Delay before retry `retry`, `None` once retries are used up
    pub fn next_delay(&self, retry: u32) -> Option<Duration> {
        (retry <= self.max_retries).then(|| self.backoff.delay(retry))
    }
}
