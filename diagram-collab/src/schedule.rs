//! Cancelable delayed task.
//!
//! Debounce windows, cursor flushes, heartbeats and reconnect backoff are all
//! "fire once after a delay unless cancelled or pushed back". [`ScheduledTask`]
//! holds only the deadline; the owner awaits [`ScheduledTask::fired`] inside its
//! `tokio::select!` loop and does the work itself.
//!
//! ```text
//!  start/reset ──► armed(deadline) ──fired()──► idle
//!                       │
//!                    cancel()
//!                       ▼
//!                     idle
//! ```

use std::future;
use std::time::Duration;
use tokio::time::{self, Instant};

#[derive(Debug, Default)]
pub struct ScheduledTask {
    deadline: Option<Instant>,
}

impl ScheduledTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the task unless it is already armed.
    ///
    /// Returns `true` if a new deadline was set.
    pub fn start(&mut self, after: Duration) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(Instant::now() + after);
        true
    }

    /// Arm the task, replacing any pending deadline.
    pub fn reset(&mut self, after: Duration) {
        self.deadline = Some(Instant::now() + after);
    }

    /// Disarm the task. Returns `true` if a deadline was pending.
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolve once the deadline passes, disarming the task.
    ///
    /// Never resolves while idle. Cancel-safe: dropping the future keeps the
    /// deadline, so the next call picks it up again.
    pub async fn fired(&mut self) {
        match self.deadline {
            Some(deadline) => {
                time::sleep_until(deadline).await;
                self.deadline = None;
            }
            None => future::pending().await,
        }
    }
}
