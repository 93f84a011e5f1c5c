//! Ephemeral pointer positions.
//!
//! Two halves:
//!
//! - [`CursorBoard`] holds the latest remote cursor per collaborator. Entries
//!   are pruned by the presence tracker when their owner leaves.
//! - [`CursorBroadcaster`] rate-limits the local pointer. The first move in a
//!   quiet period goes out at once; moves inside the interval collapse into a
//!   single trailing send carrying the last position.
//!
//! ```text
//! moves:   x  x x x x      x
//! sends:   x ─────── x     x
//!          └interval┘
//! ```
//!
//! Nothing here is persisted or ever part of a diagram snapshot.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::protocol::{Collaborator, CursorPosition};
use crate::schedule::ScheduledTask;

/// Default minimum gap between outbound cursor sends (~20 Hz).
pub const DEFAULT_CURSOR_INTERVAL: Duration = Duration::from_millis(50);

/// A remote collaborator's pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorEntry {
    pub user_id: String,
    pub user: Collaborator,
    pub position: CursorPosition,
    /// Sender's Unix milliseconds.
    pub timestamp: i64,
}

/// Latest cursor per remote collaborator.
#[derive(Debug, Default)]
pub struct CursorBoard {
    entries: HashMap<String, CursorEntry>,
}

impl CursorBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a cursor unless we already hold a newer one for that user.
    ///
    /// Returns `true` if the board changed.
    pub fn update(&mut self, entry: CursorEntry) -> bool {
        if let Some(existing) = self.entries.get(&entry.user_id) {
            if entry.timestamp < existing.timestamp {
                log::trace!("Dropping out-of-order cursor for {}", entry.user_id);
                return false;
            }
            if existing.position == entry.position && existing.user == entry.user {
                return false;
            }
        }
        self.entries.insert(entry.user_id.clone(), entry);
        true
    }

    pub fn remove(&mut self, user_id: &str) -> bool {
        self.entries.remove(user_id).is_some()
    }

    pub fn get(&self, user_id: &str) -> Option<&CursorEntry> {
        self.entries.get(user_id)
    }

    /// All cursors, ordered by user id for stable rendering.
    pub fn entries(&self) -> Vec<CursorEntry> {
        let mut entries: Vec<CursorEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Throttle for the local pointer with a trailing flush.
#[derive(Debug)]
pub struct CursorBroadcaster {
    interval: Duration,
    last_sent: Option<Instant>,
    pending: Option<CursorPosition>,
    flush: ScheduledTask,
}

impl Default for CursorBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CURSOR_INTERVAL)
    }
}

impl CursorBroadcaster {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
            pending: None,
            flush: ScheduledTask::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record a local pointer move.
    ///
    /// Returns the position to send right now, or `None` if it was parked for
    /// the trailing flush.
    pub fn move_to(&mut self, position: CursorPosition) -> Option<CursorPosition> {
        let now = Instant::now();
        if let Some(last) = self.last_sent {
            let elapsed = now.duration_since(last);
            if elapsed < self.interval {
                self.pending = Some(position);
                self.flush.start(self.interval - elapsed);
                return None;
            }
        }
        self.last_sent = Some(now);
        self.pending = None;
        self.flush.cancel();
        Some(position)
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Resolve with the parked position once the interval elapses.
    ///
    /// Never resolves while nothing is parked. Cancel-safe.
    pub async fn next_flush(&mut self) -> CursorPosition {
        loop {
            self.flush.fired().await;
            if let Some(position) = self.pending.take() {
                self.last_sent = Some(Instant::now());
                return position;
            }
        }
    }

    /// Drop any parked position and forget the last send.
    pub fn cancel(&mut self) {
        self.pending = None;
        self.last_sent = None;
        self.flush.cancel();
    }
}
