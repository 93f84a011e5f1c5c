//! Debounced outbound diagram updates and echo-free remote apply.
//!
//! ```text
//! local_change ──► merge into document ──► (re)start debounce ──► next_flush() ──► send
//!                          ▲
//! apply_remote ────────────┘  replaces document, arms the echo guard
//! ```
//!
//! The echo guard remembers the last applied remote snapshot. When the canvas
//! re-renders it and reports the same state back through `local_change`, the
//! change is swallowed instead of being broadcast again.
//!
//! Under [`PendingPolicy::Rebase`] unsent edits are carried across a remote
//! snapshot element by element: whatever the canvas added, changed or removed
//! since the last flushed base is replayed on top of the remote state, and
//! everything else comes from the remote side.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde_json::Value;

use crate::crdt::element_key;
use crate::protocol::{DiagramSnapshot, SnapshotPatch};
use crate::schedule::ScheduledTask;

/// Default quiet period before a burst of local edits is sent.
pub const DEFAULT_UPDATE_DEBOUNCE: Duration = Duration::from_millis(300);

/// What happens to a pending local update when a remote snapshot arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingPolicy {
    /// Drop it; the remote snapshot wins (relay, last-applied-wins).
    Discard,
    /// Replay its per-element changes on top of the remote snapshot (CRDT).
    Rebase,
}

pub struct UpdateChannel {
    local_id: String,
    window: Duration,
    policy: PendingPolicy,
    debounce: ScheduledTask,
    document: DiagramSnapshot,
    /// The document before the first unsent local edit.
    base: Option<DiagramSnapshot>,
    echo_guard: Option<DiagramSnapshot>,
}

impl UpdateChannel {
    pub fn new(local_id: impl Into<String>, window: Duration) -> Self {
        Self {
            local_id: local_id.into(),
            window,
            policy: PendingPolicy::Discard,
            debounce: ScheduledTask::new(),
            document: DiagramSnapshot::default(),
            base: None,
            echo_guard: None,
        }
    }

    pub fn with_policy(mut self, policy: PendingPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Current local view of the diagram.
    pub fn document(&self) -> &DiagramSnapshot {
        &self.document
    }

    pub fn is_pending(&self) -> bool {
        self.base.is_some()
    }

    /// Record a local edit and push the debounce deadline back.
    ///
    /// Returns `false` if the edit was recognised as the echo of the remote
    /// snapshot just applied.
    pub fn local_change(&mut self, patch: SnapshotPatch) -> bool {
        let mut next = self.document.clone();
        next.apply_patch(patch);

        if let Some(guard) = self.echo_guard.take() {
            if guard == next {
                log::debug!("Suppressing echo of remote snapshot");
                return false;
            }
        }

        let previous = std::mem::replace(&mut self.document, next);
        self.base.get_or_insert(previous);
        self.debounce.reset(self.window);
        true
    }

    /// Resolve with the latest document once the debounce window closes.
    ///
    /// Never resolves while nothing is pending. Cancel-safe.
    pub async fn next_flush(&mut self) -> DiagramSnapshot {
        loop {
            self.debounce.fired().await;
            if self.base.take().is_some() {
                return self.document.clone();
            }
        }
    }

    /// Apply a snapshot received from the network.
    ///
    /// Returns the snapshot the canvas should render, or `None` if it came
    /// from us or failed validation (the local document is kept as is).
    pub fn apply_remote(
        &mut self,
        sender_id: &str,
        snapshot: DiagramSnapshot,
    ) -> Option<DiagramSnapshot> {
        if sender_id == self.local_id {
            return None;
        }
        self.apply_replica(sender_id, snapshot)
    }

    /// Apply the merged state of a replicated document.
    ///
    /// Unlike [`apply_remote`](Self::apply_remote) the sender is not compared
    /// with the local id: local edits never come back through the document,
    /// so the state is foreign whoever relayed it.
    pub fn apply_replica(
        &mut self,
        sender_id: &str,
        snapshot: DiagramSnapshot,
    ) -> Option<DiagramSnapshot> {
        if let Err(e) = snapshot.validate() {
            log::warn!("Rejecting snapshot from {sender_id}: {e}");
            return None;
        }

        let mut next = snapshot;
        if let Some(base) = self.base.take() {
            match self.policy {
                PendingPolicy::Discard => {
                    log::debug!("Snapshot from {sender_id} supersedes pending local update");
                    self.debounce.cancel();
                }
                PendingPolicy::Rebase => {
                    let remote = next.clone();
                    next = rebase(&base, &self.document, remote.clone());
                    self.base = Some(remote);
                }
            }
        }

        self.echo_guard = Some(next.clone());
        self.document = next.clone();
        Some(next)
    }

    /// Drop pending edits and stop the debounce timer.
    pub fn cancel(&mut self) {
        self.base = None;
        self.echo_guard = None;
        self.debounce.cancel();
    }
}

/// Replay the changes from `base` to `local` on top of `remote`.
fn rebase(base: &DiagramSnapshot, local: &DiagramSnapshot, remote: DiagramSnapshot) -> DiagramSnapshot {
    let title = if local.title != base.title {
        local.title.clone()
    } else {
        remote.title
    };
    DiagramSnapshot {
        nodes: rebase_elements(&base.nodes, &local.nodes, remote.nodes),
        edges: rebase_elements(&base.edges, &local.edges, remote.edges),
        title,
    }
}

/// Remote order is kept; elements added locally go at the end.
fn rebase_elements(base: &[Value], local: &[Value], remote: Vec<Value>) -> Vec<Value> {
    let before: HashMap<String, &Value> = keyed(base).collect();
    let after: HashMap<String, &Value> = keyed(local).collect();

    let removed: HashSet<&String> = before.keys().filter(|k| !after.contains_key(*k)).collect();
    let touched: HashMap<&String, &Value> = after
        .iter()
        .filter(|(key, value)| before.get(*key) != Some(*value))
        .map(|(key, value)| (key, *value))
        .collect();

    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(remote.len() + touched.len());
    for (index, value) in remote.into_iter().enumerate() {
        let key = element_key(&value, index);
        if removed.contains(&key) {
            continue;
        }
        match touched.get(&key) {
            Some(mine) => merged.push((*mine).clone()),
            None => merged.push(value),
        }
        seen.insert(key);
    }
    for (key, value) in keyed(local) {
        if touched.contains_key(&key) && !seen.contains(&key) {
            merged.push(value.clone());
        }
    }
    merged
}

fn keyed(elements: &[Value]) -> impl Iterator<Item = (String, &Value)> {
    elements
        .iter()
        .enumerate()
        .map(|(index, value)| (element_key(value, index), value))
}
