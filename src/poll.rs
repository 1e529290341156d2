//! Submit-then-poll completion for providers whose generation is itself an
//! asynchronous job.
//!
//! The driver never spawns: the poll loop lives inside the caller's future, so
//! cancelling the token or dropping the future ends it at the next suspension
//! point.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{DEFAULT_POLL_DEADLINE_SECS, DEFAULT_POLL_INTERVAL_SECS};
use crate::{ImagegenError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Polling,
    Ready,
    Errored,
    TimedOut,
    Cancelled,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Submitted => "submitted",
            Self::Polling => "polling",
            Self::Ready => "ready",
            Self::Errored => "errored",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A submitted job. Scoped to one adapter invocation.
#[derive(Debug, Clone)]
pub struct AsyncJobHandle {
    pub polling_url: String,
    pub submitted_at: Instant,
    pub deadline: Instant,
}

/// What one status request reported.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus {
    Pending(String),
    Ready(Value),
    Failed(Value),
}

#[async_trait]
pub trait PollSource: Send + Sync {
    async fn poll(&self, handle: &AsyncJobHandle) -> Result<PollStatus>;
}

/// Floor for the pause between status requests.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollDriver {
    interval: Duration,
    deadline: Duration,
}

impl Default for PollDriver {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            Duration::from_secs(DEFAULT_POLL_DEADLINE_SECS),
        )
    }
}

impl PollDriver {
    pub fn new(interval: Duration, deadline: Duration) -> Self {
        Self {
            interval: interval.max(MIN_POLL_INTERVAL),
            deadline,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// `Submitted -> Polling`. A submit response without a polling handle is a
    /// protocol error.
    pub fn submitted(&self, polling_url: Option<&str>) -> Result<AsyncJobHandle> {
        let polling_url = polling_url
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                ImagegenError::Protocol("submit response did not include a polling url".to_string())
            })?;
        let submitted_at = Instant::now();
        tracing::debug!(polling_url, state = %JobState::Submitted, "async job submitted");
        Ok(AsyncJobHandle {
            polling_url: polling_url.to_string(),
            submitted_at,
            deadline: submitted_at + self.deadline,
        })
    }

    pub async fn drive(
        &self,
        source: &dyn PollSource,
        handle: &AsyncJobHandle,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let mut attempts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(self.finish(handle, JobState::Cancelled, attempts));
            }
            if Instant::now() >= handle.deadline {
                return Err(self.finish(handle, JobState::TimedOut, attempts));
            }

            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(self.finish(handle, JobState::Cancelled, attempts));
                }
                polled = tokio::time::timeout_at(handle.deadline, source.poll(handle)) => match polled {
                    Ok(status) => status?,
                    Err(_) => return Err(self.finish(handle, JobState::TimedOut, attempts)),
                },
            };
            attempts += 1;

            match status {
                PollStatus::Ready(result) => {
                    tracing::debug!(attempts, state = %JobState::Ready, "async job finished");
                    return Ok(result);
                }
                PollStatus::Failed(payload) => {
                    tracing::debug!(attempts, state = %JobState::Errored, "async job failed");
                    return Err(ImagegenError::GenerationFailed(payload.to_string()));
                }
                PollStatus::Pending(status) => {
                    tracing::debug!(attempts, status, state = %JobState::Polling, "async job pending");
                }
            }

            let wake = (Instant::now() + self.interval).min(handle.deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(self.finish(handle, JobState::Cancelled, attempts));
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    fn finish(&self, handle: &AsyncJobHandle, state: JobState, attempts: u32) -> ImagegenError {
        tracing::debug!(
            attempts,
            polling_url = %handle.polling_url,
            state = %state,
            "async job stopped"
        );
        match state {
            JobState::Cancelled => ImagegenError::Cancelled,
            _ => ImagegenError::Timeout(format!(
                "generation did not complete within {}s",
                self.deadline.as_secs()
            )),
        }
    }
}
