//! The synchronization session consumed by the UI.
//!
//! ## Architecture
//!
//! ```text
//!   UI thread                       session driver (one tokio task)
//! ┌──────────────┐   Command    ┌────────────────────────────────────┐
//! │ CollabSession│─────────────►│ select! (biased)                   │
//! │  send_update │   (mpsc)     │  1. commands                       │
//! │  send_cursor │              │  2. backend events ◄── Backend ◄── network
//! │  disconnect  │              │  3. update debounce  ──► Backend ──► network
//! │  reconnect   │              │  4. cursor flush                   │
//! │              │◄─────────────│  5. heartbeat                      │
//! │  state()     │ watch        │  6. presence sweep                 │
//! │  subscribe() │ broadcast    └────────────────────────────────────┘
//! └──────────────┘
//! ```
//!
//! The driver exclusively owns the socket, the roster and the cursor set.
//! The handle only reads published copies and sends intents. Commands are
//! polled first, so a `disconnect()` is handled before any timer that comes
//! due at the same moment.
//!
//! Nothing here returns an error to the caller. Failures show up as
//! [`SyncState::error`] or as [`SyncEvent::Warning`] / [`SyncEvent::RemoteError`].

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};

use crate::backend::{Backend, BackendConfig, BackendEvent, BackendKind};
use crate::cursor::{CursorBroadcaster, CursorEntry, DEFAULT_CURSOR_INTERVAL};
use crate::presence::{PresenceTracker, DEFAULT_PRESENCE_TIMEOUT};
use crate::protocol::{
    Collaborator, CursorPosition, DiagramSnapshot, Envelope, EnvelopeBody, SnapshotPatch,
};
use crate::schedule::ScheduledTask;
use crate::transport::{ConnectionState, ReconnectPolicy};
use crate::update::{PendingPolicy, UpdateChannel, DEFAULT_UPDATE_DEBOUNCE};

/// Backoff settings for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectSettings {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub max_jitter: Duration,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl ReconnectSettings {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.base_delay, self.max_delay, self.max_attempts)
            .with_jitter(self.max_jitter)
    }
}

/// Session configuration, passed explicitly to [`CollabSession::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Hub base URL for the relay strategy.
    pub relay_url: String,
    /// Feature flag for the CRDT strategy.
    pub crdt_enabled: bool,
    /// Hub base URL for the CRDT strategy.
    pub crdt_url: Option<String>,
    /// Shared diagram identifier.
    pub room: String,
    pub update_debounce: Duration,
    pub cursor_interval: Duration,
    pub reconnect: ReconnectSettings,
    /// `None` disables heartbeats.
    pub heartbeat_interval: Option<Duration>,
    /// `None` disables timeout-based presence eviction.
    pub presence_timeout: Option<Duration>,
    /// Capacity of the [`SyncEvent`] broadcast channel.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:9090".to_string(),
            crdt_enabled: false,
            crdt_url: None,
            room: "default".to_string(),
            update_debounce: DEFAULT_UPDATE_DEBOUNCE,
            cursor_interval: DEFAULT_CURSOR_INTERVAL,
            reconnect: ReconnectSettings::default(),
            heartbeat_interval: Some(Duration::from_secs(10)),
            presence_timeout: Some(DEFAULT_PRESENCE_TIMEOUT),
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn new(relay_url: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            room: room.into(),
            ..Self::default()
        }
    }

    /// Enable the CRDT strategy against `crdt_url`.
    pub fn with_crdt(mut self, crdt_url: impl Into<String>) -> Self {
        self.crdt_enabled = true;
        self.crdt_url = Some(crdt_url.into());
        self
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            crdt_enabled: self.crdt_enabled,
            crdt_endpoint: self.crdt_url.clone(),
            relay_endpoint: self.relay_url.clone(),
            room: self.room.clone(),
        }
    }
}

/// Connection and presence status as the UI shows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    pub is_connected: bool,
    /// Connecting for the first time or reconnecting.
    pub is_connecting: bool,
    /// Replication confirmed. Under the relay this equals `is_connected`.
    pub is_synced: bool,
    pub collaborator_count: usize,
    /// Terminal failure, e.g. reconnect attempts exhausted.
    pub error: Option<String>,
    pub connection: ConnectionState,
    pub reconnect_attempt: u32,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            is_connected: false,
            is_connecting: false,
            is_synced: false,
            collaborator_count: 0,
            error: None,
            connection: ConnectionState::Disconnected,
            reconnect_attempt: 0,
        }
    }
}

/// Notifications for subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged(SyncState),
    RosterChanged(Vec<Collaborator>),
    /// A remote diagram state to render.
    SnapshotReceived {
        sender_id: String,
        snapshot: DiagramSnapshot,
    },
    CursorsChanged(Vec<CursorEntry>),
    /// Something was dropped; the session carries on.
    Warning(String),
    /// An `error` envelope from a peer or the hub.
    RemoteError { sender_id: String, message: String },
}

#[derive(Debug)]
enum Command {
    Update(SnapshotPatch),
    Cursor(CursorPosition),
    Disconnect,
    Reconnect,
}

/// Handle to a running session. Dropping it disconnects the session.
pub struct CollabSession {
    local_user: Collaborator,
    backend: BackendKind,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SyncState>,
    roster: watch::Receiver<Vec<Collaborator>>,
    cursors: watch::Receiver<Vec<CursorEntry>>,
    events: broadcast::Sender<SyncEvent>,
}

impl CollabSession {
    /// Select the backend, spawn the driver and start connecting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: SyncConfig, local_user: Collaborator) -> Self {
        let backend = Backend::from_config(
            &config.backend_config(),
            local_user.id.clone(),
            config.reconnect.policy(),
        );
        let kind = backend.kind();
        let pending_policy = match kind {
            BackendKind::Crdt => PendingPolicy::Rebase,
            BackendKind::Relay => PendingPolicy::Discard,
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SyncState::default());
        let (roster_tx, roster_rx) = watch::channel(Vec::new());
        let (cursors_tx, cursors_rx) = watch::channel(Vec::new());
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let driver = SessionDriver {
            presence: PresenceTracker::new(local_user.id.clone())
                .with_timeout(config.presence_timeout),
            updates: UpdateChannel::new(local_user.id.clone(), config.update_debounce)
                .with_policy(pending_policy),
            cursor: CursorBroadcaster::new(config.cursor_interval),
            heartbeat: ScheduledTask::new(),
            sweep: ScheduledTask::new(),
            heartbeat_interval: config.heartbeat_interval,
            sweep_interval: config.presence_timeout.map(sweep_interval),
            local: local_user.clone(),
            backend,
            commands: commands_rx,
            state_tx,
            roster_tx,
            cursors_tx,
            events: events_tx.clone(),
            error: None,
        };
        tokio::spawn(driver.run());

        Self {
            local_user,
            backend: kind,
            commands: commands_tx,
            state: state_rx,
            roster: roster_rx,
            cursors: cursors_rx,
            events: events_tx,
        }
    }

    pub fn local_user(&self) -> &Collaborator {
        &self.local_user
    }

    /// Strategy chosen at start.
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    /// Remote collaborators, ordered by id. Never includes the local user.
    pub fn collaborators(&self) -> Vec<Collaborator> {
        self.roster.borrow().clone()
    }

    pub fn cursors(&self) -> Vec<CursorEntry> {
        self.cursors.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.clone()
    }

    /// Queue a local diagram change for the debounced broadcast.
    pub fn send_update(&self, patch: SnapshotPatch) {
        self.command(Command::Update(patch));
    }

    pub fn send_cursor_position(&self, position: CursorPosition) {
        self.command(Command::Cursor(position));
    }

    /// Leave the room and stop reconnecting.
    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    /// Resync (CRDT) or, after a disconnect or give-up, start over.
    pub fn reconnect(&self) {
        self.command(Command::Reconnect);
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::debug!("Session driver has stopped; command dropped");
        }
    }
}

fn sweep_interval(presence_timeout: Duration) -> Duration {
    (presence_timeout / 3).max(Duration::from_millis(10))
}

struct SessionDriver {
    local: Collaborator,
    backend: Backend,
    presence: PresenceTracker,
    updates: UpdateChannel,
    cursor: CursorBroadcaster,
    heartbeat: ScheduledTask,
    sweep: ScheduledTask,
    heartbeat_interval: Option<Duration>,
    sweep_interval: Option<Duration>,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<SyncState>,
    roster_tx: watch::Sender<Vec<Collaborator>>,
    cursors_tx: watch::Sender<Vec<CursorEntry>>,
    events: broadcast::Sender<SyncEvent>,
    error: Option<String>,
}

impl SessionDriver {
    async fn run(mut self) {
        self.backend.connect();
        self.publish_state();

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        log::debug!("Session handle dropped; shutting down");
                        self.stop();
                        break;
                    }
                },
                event = self.backend.next_event() => self.handle_backend_event(event),
                snapshot = self.updates.next_flush() => self.flush_update(snapshot),
                position = self.cursor.next_flush() => self.send_cursor(position),
                _ = self.heartbeat.fired() => self.send_heartbeat(),
                _ = self.sweep.fired() => self.sweep_presence(),
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Update(patch) => {
                self.updates.local_change(patch);
            }
            Command::Cursor(position) => {
                if let Some(position) = self.cursor.move_to(position) {
                    self.send_cursor(position);
                }
            }
            Command::Disconnect => self.stop(),
            Command::Reconnect => {
                if self.backend.state() == ConnectionState::Disconnected {
                    self.error = None;
                    self.backend.connect();
                } else if self.backend.kind() == BackendKind::Crdt {
                    self.go_offline();
                    self.backend.reconnect();
                } else {
                    self.backend.reconnect();
                }
                self.publish_state();
            }
        }
    }

    fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Opened => {
                self.error = None;
                self.publish(&Envelope::join(&self.local));
                if let Some(interval) = self.heartbeat_interval {
                    self.heartbeat.reset(interval);
                }
                if let Some(interval) = self.sweep_interval {
                    self.sweep.reset(interval);
                }
                self.publish_state();
            }
            BackendEvent::Envelope(envelope) => self.handle_envelope(envelope),
            BackendEvent::Snapshot { sender_id, snapshot } => {
                self.presence.touch(&sender_id);
                let merged = self.updates.apply_replica(&sender_id, snapshot);
                self.render(sender_id, merged);
            }
            BackendEvent::Synced => self.publish_state(),
            BackendEvent::Retrying { .. } => {
                self.go_offline();
                self.publish_state();
            }
            BackendEvent::GaveUp { attempts } => {
                self.go_offline();
                self.updates.cancel();
                self.error = Some(format!("Disconnected after {attempts} failed reconnect attempts"));
                self.publish_state();
            }
        }
    }

    fn handle_envelope(&mut self, envelope: Envelope) {
        if envelope.sender_id == self.local.id {
            return;
        }
        log::trace!("{} from {}", envelope.kind(), envelope.sender_id);

        let change = self.presence.handle_envelope(&envelope);
        if change.greet {
            // a heartbeat adds us on their side and is never answered
            self.publish(&Envelope::heartbeat(&self.local));
        }
        if change.roster_changed {
            self.notify_roster();
            self.publish_state();
        }
        if change.cursors_changed || change.roster_changed {
            self.notify_cursors();
        }

        match envelope.body {
            EnvelopeBody::DiagramUpdate(snapshot) => self.apply_snapshot(envelope.sender_id, snapshot),
            EnvelopeBody::Error(message) => {
                log::warn!("Error from {}: {message}", envelope.sender_id);
                self.emit(SyncEvent::RemoteError {
                    sender_id: envelope.sender_id,
                    message,
                });
            }
            _ => {}
        }
    }

    fn apply_snapshot(&mut self, sender_id: String, snapshot: DiagramSnapshot) {
        let applied = self.updates.apply_remote(&sender_id, snapshot);
        self.render(sender_id, applied);
    }

    fn render(&mut self, sender_id: String, snapshot: Option<DiagramSnapshot>) {
        if let Some(snapshot) = snapshot {
            self.emit(SyncEvent::SnapshotReceived { sender_id, snapshot });
        }
    }

    fn flush_update(&mut self, snapshot: DiagramSnapshot) {
        log::debug!(
            "Publishing diagram update ({} nodes, {} edges)",
            snapshot.nodes.len(),
            snapshot.edges.len()
        );
        if let Err(e) = self.backend.publish_snapshot(snapshot) {
            self.emit(SyncEvent::Warning(format!("Diagram update dropped: {e}")));
        }
    }

    fn send_cursor(&mut self, position: CursorPosition) {
        if self.backend.state() != ConnectionState::Connected {
            log::warn!("Not connected; cursor move dropped");
            self.emit(SyncEvent::Warning("cursor-position dropped: not connected".to_string()));
            return;
        }
        self.publish(&Envelope::cursor(self.local.id.clone(), position));
    }

    fn send_heartbeat(&mut self) {
        if self.backend.state() != ConnectionState::Connected {
            return;
        }
        self.publish(&Envelope::heartbeat(&self.local));
        if let Some(interval) = self.heartbeat_interval {
            self.heartbeat.reset(interval);
        }
    }

    fn sweep_presence(&mut self) {
        let evicted = self.presence.evict_stale();
        if !evicted.is_empty() {
            self.notify_roster();
            self.notify_cursors();
            self.publish_state();
        }
        if let Some(interval) = self.sweep_interval {
            self.sweep.reset(interval);
        }
    }

    fn publish(&mut self, envelope: &Envelope) {
        if let Err(e) = self.backend.publish(envelope) {
            let message = format!("{} dropped: {e}", envelope.kind());
            self.emit(SyncEvent::Warning(message));
        }
    }

    /// Stop liveness timers and forget everyone; rebuilt after the next join.
    fn go_offline(&mut self) {
        self.heartbeat.cancel();
        self.sweep.cancel();
        self.cursor.cancel();
        if self.presence.clear() {
            self.notify_roster();
            self.notify_cursors();
        }
    }

    fn stop(&mut self) {
        if self.backend.state() == ConnectionState::Connected {
            self.publish(&Envelope::leave(&self.local));
        }
        self.updates.cancel();
        self.go_offline();
        self.backend.disconnect();
        self.error = None;
        self.publish_state();
    }

    fn publish_state(&mut self) {
        let connection = self.backend.state();
        let next = SyncState {
            is_connected: connection == ConnectionState::Connected,
            is_connecting: connection.is_pending(),
            is_synced: self.backend.is_synced(),
            collaborator_count: self.presence.count(),
            error: self.error.clone(),
            connection,
            reconnect_attempt: self.backend.attempt(),
        };
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next.clone();
            true
        });
        if changed {
            self.emit(SyncEvent::StateChanged(next));
        }
    }

    fn notify_roster(&mut self) {
        let roster = self.presence.collaborators();
        self.roster_tx.send_replace(roster.clone());
        self.emit(SyncEvent::RosterChanged(roster));
    }

    fn notify_cursors(&mut self) {
        let cursors = self.presence.cursors().entries();
        self.cursors_tx.send_replace(cursors.clone());
        self.emit(SyncEvent::CursorsChanged(cursors));
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config(max_attempts: u32) -> SyncConfig {
        SyncConfig {
            reconnect: ReconnectSettings {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                max_attempts,
                max_jitter: Duration::ZERO,
            },
            ..SyncConfig::new("ws://127.0.0.1:1", "demo")
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.update_debounce, Duration::from_millis(300));
        assert_eq!(config.cursor_interval, Duration::from_millis(50));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(10)));
        assert_eq!(config.presence_timeout, Some(Duration::from_secs(30)));
        assert!(!config.crdt_enabled);
    }

    #[test]
    fn test_backend_config_mapping() {
        let config = SyncConfig::new("ws://relay", "r1").with_crdt("ws://crdt");
        let backend = config.backend_config();
        assert!(backend.crdt_enabled);
        assert_eq!(backend.crdt_endpoint.as_deref(), Some("ws://crdt"));
        assert_eq!(backend.relay_endpoint, "ws://relay");
        assert_eq!(backend.room, "r1");
    }

    #[test]
    fn test_sweep_interval_floor() {
        assert_eq!(sweep_interval(Duration::from_secs(30)), Duration::from_secs(10));
        assert_eq!(sweep_interval(Duration::from_millis(3)), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_gave_up_surfaces_as_error() {
        let session = CollabSession::start(unreachable_config(2), Collaborator::new("me", "Me"));
        assert_eq!(session.backend(), BackendKind::Relay);

        let mut state = session.watch_state();
        let terminal = tokio::time::timeout(
            Duration::from_secs(10),
            state.wait_for(|s| s.error.is_some()),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();

        assert!(!terminal.is_connected);
        assert!(!terminal.is_connecting);
        assert_eq!(terminal.connection, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting() {
        let session = CollabSession::start(unreachable_config(5), Collaborator::new("me", "Me"));
        session.disconnect();

        let mut state = session.watch_state();
        let settled = tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| s.connection == ConnectionState::Disconnected && !s.is_connecting),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert!(settled.error.is_none());

        // no retries after an explicit disconnect
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.state().connection, ConnectionState::Disconnected);
        assert_eq!(session.state().reconnect_attempt, 0);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_warns() {
        let config = SyncConfig {
            update_debounce: Duration::from_millis(5),
            ..unreachable_config(5)
        };
        let session = CollabSession::start(config, Collaborator::new("me", "Me"));
        let mut events = session.subscribe();
        session.disconnect();
        session.send_update(SnapshotPatch::default().with_title("offline"));

        let warning = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SyncEvent::Warning(message)) = events.recv().await {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert!(warning.contains("dropped"));
    }

    #[tokio::test]
    async fn test_cursor_while_disconnected_warns() {
        let session = CollabSession::start(unreachable_config(5), Collaborator::new("me", "Me"));
        let mut events = session.subscribe();
        session.disconnect();
        session.send_cursor_position(CursorPosition::new(3.0, 4.0));

        let warning = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(SyncEvent::Warning(message)) = events.recv().await {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert!(warning.starts_with("cursor-position dropped"));
    }
}
