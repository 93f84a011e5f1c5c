//! Roster of online collaborators.
//!
//! ```text
//! inbound Envelope
//!       │
//!       ▼
//! PresenceTracker::handle_envelope()
//!       │
//!       ├── join / heartbeat ──► roster (idempotent by id)
//!       ├── leave ─────────────► roster − id, cursors − id
//!       └── cursor-position ───► CursorBoard (members only)
//!
//! sweep (every few seconds)
//!       └── evict_stale() ─────► roster − silent ids, cursors − silent ids
//! ```
//!
//! The local user is never part of its own roster. The collaborator count is
//! derived from the roster on every read.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::cursor::{CursorBoard, CursorEntry};
use crate::protocol::{Collaborator, CursorPosition, Envelope, EnvelopeBody};

/// Default silence after which a collaborator is considered gone.
pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(30);

/// What an inbound envelope changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceChange {
    pub roster_changed: bool,
    pub cursors_changed: bool,
    /// A remote join arrived; the joiner has not heard from us yet.
    pub greet: bool,
}

#[derive(Debug, Clone)]
struct RosterEntry {
    collaborator: Collaborator,
    last_seen: Instant,
}

pub struct PresenceTracker {
    local_id: String,
    roster: HashMap<String, RosterEntry>,
    cursors: CursorBoard,
    /// `None` disables timeout-based eviction.
    presence_timeout: Option<Duration>,
}

impl PresenceTracker {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            roster: HashMap::new(),
            cursors: CursorBoard::new(),
            presence_timeout: Some(DEFAULT_PRESENCE_TIMEOUT),
        }
    }

    pub fn with_timeout(mut self, presence_timeout: Option<Duration>) -> Self {
        self.presence_timeout = presence_timeout;
        self
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Apply an inbound envelope to the roster and cursor set.
    pub fn handle_envelope(&mut self, envelope: &Envelope) -> PresenceChange {
        if envelope.sender_id == self.local_id {
            return PresenceChange::default();
        }
        self.touch(&envelope.sender_id);

        let mut change = PresenceChange::default();
        match &envelope.body {
            EnvelopeBody::Join(who) => {
                change.roster_changed = self.join(who.clone());
                change.greet = who.id != self.local_id;
            }
            EnvelopeBody::Heartbeat(who) => {
                if !self.contains(&who.id) {
                    log::debug!("Heartbeat from unknown collaborator {}; adding", who.id);
                    change.roster_changed = self.join(who.clone());
                }
            }
            EnvelopeBody::Leave(who) => {
                change.cursors_changed = self.cursors.get(&who.id).is_some();
                change.roster_changed = self.leave(&who.id);
            }
            EnvelopeBody::CursorPosition(position) => {
                change.cursors_changed =
                    self.update_cursor(&envelope.sender_id, *position, envelope.timestamp);
            }
            EnvelopeBody::DiagramUpdate(_) | EnvelopeBody::Error(_) => {}
        }
        change
    }

    /// Add or refresh a collaborator. Returns `true` if the roster changed.
    pub fn join(&mut self, collaborator: Collaborator) -> bool {
        if collaborator.id == self.local_id {
            return false;
        }
        let now = Instant::now();
        match self.roster.get_mut(&collaborator.id) {
            Some(entry) => {
                entry.last_seen = now;
                if entry.collaborator == collaborator {
                    return false;
                }
                entry.collaborator = collaborator;
                true
            }
            None => {
                log::info!("{} ({}) joined", collaborator.name, collaborator.id);
                self.roster.insert(
                    collaborator.id.clone(),
                    RosterEntry {
                        collaborator,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Remove a collaborator and their cursor. Returns `true` if they were present.
    pub fn leave(&mut self, user_id: &str) -> bool {
        self.cursors.remove(user_id);
        match self.roster.remove(user_id) {
            Some(entry) => {
                log::info!("{} ({}) left", entry.collaborator.name, user_id);
                true
            }
            None => false,
        }
    }

    /// Refresh a member's liveness.
    pub fn touch(&mut self, user_id: &str) {
        if let Some(entry) = self.roster.get_mut(user_id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Record a cursor for a roster member. Cursors from unknown senders are
    /// dropped; their join (or next heartbeat) has to arrive first.
    pub fn update_cursor(&mut self, user_id: &str, position: CursorPosition, timestamp: i64) -> bool {
        let Some(entry) = self.roster.get(user_id) else {
            log::trace!("Dropping cursor from non-member {user_id}");
            return false;
        };
        self.cursors.update(CursorEntry {
            user_id: user_id.to_string(),
            user: entry.collaborator.clone(),
            position,
            timestamp,
        })
    }

    /// Evict members silent for longer than the presence timeout.
    ///
    /// Returns the evicted ids.
    pub fn evict_stale(&mut self) -> Vec<String> {
        let Some(timeout) = self.presence_timeout else {
            return Vec::new();
        };
        let now = Instant::now();
        let stale: Vec<String> = self
            .roster
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            log::info!("Evicting {id}: silent for more than {timeout:?}");
            self.roster.remove(id);
            self.cursors.remove(id);
        }
        stale
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.roster.contains_key(user_id)
    }

    /// Roster ordered by id.
    pub fn collaborators(&self) -> Vec<Collaborator> {
        let mut list: Vec<Collaborator> =
            self.roster.values().map(|e| e.collaborator.clone()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn count(&self) -> usize {
        self.roster.len()
    }

    pub fn cursors(&self) -> &CursorBoard {
        &self.cursors
    }

    /// Forget everyone. Used when the connection drops.
    pub fn clear(&mut self) -> bool {
        let had_any = !self.roster.is_empty() || !self.cursors.is_empty();
        self.roster.clear();
        self.cursors.clear();
        had_any
    }
}
