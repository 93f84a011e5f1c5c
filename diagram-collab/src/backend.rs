//! Strategy selection and the two synchronization strategies.
//!
//! [`select_backend`] is the only place the CRDT/relay decision is made. It
//! is a pure function of [`BackendConfig`], evaluated once when a session
//! starts. Everything after that talks to a [`Backend`], a tagged union that
//! exposes the same operations for both strategies:
//!
//! | | Relay | CRDT |
//! |---|---|---|
//! | Wire | JSON text envelopes | bincode [`SyncFrame`]s |
//! | Local edit | full snapshot broadcast | minimal yrs update |
//! | Conflicts | last applied wins | per-element merge |
//! | Offline edits | dropped | kept in the doc, sent on next sync |
//! | `is_synced` | same as connected | after the handshake completes |
//! | `reconnect()` | no-op | new socket + handshake |

use std::collections::VecDeque;
use std::time::Duration;

use crate::codec::{EnvelopeCodec, FrameCodec};
use crate::crdt::{CollabError, DiagramDoc};
use crate::protocol::{DiagramSnapshot, Envelope, EnvelopeBody, FrameType, SyncFrame};
use crate::transport::{
    ConnectionState, Connector, ReconnectPolicy, TransportError, TransportEvent,
};

/// Inputs to the strategy decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendConfig {
    /// Feature flag for the CRDT strategy.
    pub crdt_enabled: bool,
    /// CRDT endpoint. Absent or blank forces the relay.
    pub crdt_endpoint: Option<String>,
    pub relay_endpoint: String,
    pub room: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Crdt,
    Relay,
}

/// CRDT only when the flag is on and an endpoint is configured.
pub fn select_backend(config: &BackendConfig) -> BackendKind {
    let has_endpoint = config
        .crdt_endpoint
        .as_deref()
        .is_some_and(|url| !url.trim().is_empty());
    if config.crdt_enabled && has_endpoint {
        BackendKind::Crdt
    } else {
        BackendKind::Relay
    }
}

/// `{base}/{channel}/{room}`.
pub fn room_url(base: &str, channel: &str, room: &str) -> String {
    format!("{}/{channel}/{room}", base.trim_end_matches('/'))
}

/// What a strategy reports to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Opened,
    /// Presence, cursor, heartbeat or error traffic.
    Envelope(Envelope),
    /// A diagram state to render.
    Snapshot {
        sender_id: String,
        snapshot: DiagramSnapshot,
    },
    /// Document replication confirmed (CRDT only).
    Synced,
    Retrying { attempt: u32, delay: Duration },
    GaveUp { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    Transport(TransportError),
    Document(CollabError),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{e}"),
            Self::Document(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<TransportError> for BackendError {
    fn from(e: TransportError) -> Self {
        BackendError::Transport(e)
    }
}

impl From<CollabError> for BackendError {
    fn from(e: CollabError) -> Self {
        BackendError::Document(e)
    }
}

// ───────────────────────────────────────────────────────────────────
// Relay strategy
// ───────────────────────────────────────────────────────────────────

pub struct RelayBackend {
    local_id: String,
    connector: Connector<EnvelopeCodec>,
}

impl RelayBackend {
    pub fn new(url: impl Into<String>, local_id: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            local_id: local_id.into(),
            connector: Connector::new(url, EnvelopeCodec, policy),
        }
    }

    /// Broadcast the flattened snapshot. Dropped if not connected.
    pub fn publish_snapshot(&mut self, snapshot: DiagramSnapshot) -> Result<(), BackendError> {
        let envelope = Envelope::diagram_update(self.local_id.clone(), snapshot);
        Ok(self.connector.send(&envelope)?)
    }

    pub fn publish(&mut self, envelope: &Envelope) -> Result<(), BackendError> {
        Ok(self.connector.send(envelope)?)
    }

    pub async fn next_event(&mut self) -> BackendEvent {
        match self.connector.next_event().await {
            TransportEvent::Opened => BackendEvent::Opened,
            TransportEvent::Frame(envelope) => match envelope.body {
                EnvelopeBody::DiagramUpdate(snapshot) => BackendEvent::Snapshot {
                    sender_id: envelope.sender_id,
                    snapshot,
                },
                _ => BackendEvent::Envelope(envelope),
            },
            TransportEvent::Retrying { attempt, delay } => BackendEvent::Retrying { attempt, delay },
            TransportEvent::GaveUp { attempts } => BackendEvent::GaveUp { attempts },
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// CRDT strategy
// ───────────────────────────────────────────────────────────────────

/// Replicated document plus the sync handshake.
///
/// ```text
/// client                          hub
///   │── SyncStep1(sv_c) ─────────►│
///   │◄──────── SyncStep2(diff_h) ─│   client applies → synced
///   │◄──────── SyncStep1(sv_h) ───│
///   │── SyncStep2(diff_c) ───────►│   offline edits delivered
///   │◄──────► Update / Awareness ►│
/// ```
pub struct CrdtBackend {
    local_id: String,
    connector: Connector<FrameCodec>,
    doc: DiagramDoc,
    synced: bool,
    queued: VecDeque<BackendEvent>,
}

impl CrdtBackend {
    pub fn new(url: impl Into<String>, local_id: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            local_id: local_id.into(),
            connector: Connector::new(url, FrameCodec, policy),
            doc: DiagramDoc::new(),
            synced: false,
            queued: VecDeque::new(),
        }
    }

    pub fn document(&self) -> &DiagramDoc {
        &self.doc
    }

    /// Write the snapshot into the document and ship the resulting update.
    ///
    /// While offline the change stays in the document and goes out with the
    /// next handshake.
    pub fn publish_snapshot(&mut self, snapshot: DiagramSnapshot) -> Result<(), BackendError> {
        let Some(update) = self.doc.apply_snapshot(&snapshot)? else {
            return Ok(());
        };
        if self.connector.state() != ConnectionState::Connected {
            log::debug!("Offline edit kept for next sync ({} bytes)", update.len());
            return Ok(());
        }
        Ok(self.connector.send(&SyncFrame::update(self.local_id.clone(), update))?)
    }

    pub fn publish(&mut self, envelope: &Envelope) -> Result<(), BackendError> {
        let frame = SyncFrame::awareness(envelope).map_err(TransportError::Protocol)?;
        Ok(self.connector.send(&frame)?)
    }

    pub fn reconnect(&mut self) {
        log::info!("Resyncing {}", self.connector.url());
        self.synced = false;
        self.queued.clear();
        self.connector.restart();
    }

    pub async fn next_event(&mut self) -> BackendEvent {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return event;
            }
            match self.connector.next_event().await {
                TransportEvent::Opened => {
                    self.synced = false;
                    let step1 = SyncFrame::sync_step1(self.local_id.clone(), self.doc.state_vector());
                    if let Err(e) = self.connector.send(&step1) {
                        log::warn!("Failed to start sync: {e}");
                    }
                    return BackendEvent::Opened;
                }
                TransportEvent::Frame(frame) => self.handle_frame(frame),
                TransportEvent::Retrying { attempt, delay } => {
                    self.synced = false;
                    return BackendEvent::Retrying { attempt, delay };
                }
                TransportEvent::GaveUp { attempts } => {
                    self.synced = false;
                    return BackendEvent::GaveUp { attempts };
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: SyncFrame) {
        match frame.frame_type {
            FrameType::SyncStep1 => {
                let reply = match self.doc.diff_since(&frame.payload) {
                    Ok(diff) => SyncFrame::sync_step2(self.local_id.clone(), diff),
                    Err(e) => {
                        log::warn!("Bad state vector from {}: {e}", frame.sender_id);
                        return;
                    }
                };
                if let Err(e) = self.connector.send(&reply) {
                    log::warn!("Failed to answer sync request: {e}");
                }
            }
            FrameType::SyncStep2 | FrameType::Update => {
                if let Err(e) = self.doc.apply_remote_update(&frame.payload) {
                    log::warn!("Dropping update from {}: {e}", frame.sender_id);
                    return;
                }
                if frame.frame_type == FrameType::SyncStep2 && !self.synced {
                    log::info!("Document synced with {}", self.connector.url());
                    self.synced = true;
                    self.queued.push_back(BackendEvent::Synced);
                }
                self.queued.push_back(BackendEvent::Snapshot {
                    sender_id: frame.sender_id,
                    snapshot: self.doc.snapshot(),
                });
            }
            FrameType::Awareness => match frame.envelope() {
                Ok(Some(envelope)) => self.queued.push_back(BackendEvent::Envelope(envelope)),
                Ok(None) => {}
                Err(e) => log::warn!("Dropping awareness frame from {}: {e}", frame.sender_id),
            },
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Tagged union
// ───────────────────────────────────────────────────────────────────

pub enum Backend {
    Crdt(CrdtBackend),
    Relay(RelayBackend),
}

impl Backend {
    /// Pick and build the strategy for this session.
    pub fn from_config(
        config: &BackendConfig,
        local_id: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> Self {
        let kind = select_backend(config);
        log::info!("Using {kind:?} backend for room {}", config.room);
        match (kind, config.crdt_endpoint.as_deref()) {
            (BackendKind::Crdt, Some(endpoint)) => Backend::Crdt(CrdtBackend::new(
                room_url(endpoint, "crdt", &config.room),
                local_id,
                policy,
            )),
            _ => Backend::Relay(RelayBackend::new(
                room_url(&config.relay_endpoint, "relay", &config.room),
                local_id,
                policy,
            )),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Crdt(_) => BackendKind::Crdt,
            Backend::Relay(_) => BackendKind::Relay,
        }
    }

    fn connector_state(&self) -> (ConnectionState, u32) {
        match self {
            Backend::Crdt(b) => (b.connector.state(), b.connector.policy().attempt()),
            Backend::Relay(b) => (b.connector.state(), b.connector.policy().attempt()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.connector_state().0
    }

    /// Retries scheduled in the current backoff episode.
    pub fn attempt(&self) -> u32 {
        self.connector_state().1
    }

    pub fn is_synced(&self) -> bool {
        match self {
            Backend::Crdt(b) => b.synced && b.connector.state() == ConnectionState::Connected,
            Backend::Relay(b) => b.connector.state() == ConnectionState::Connected,
        }
    }

    pub fn connect(&mut self) {
        match self {
            Backend::Crdt(b) => b.connector.connect(),
            Backend::Relay(b) => b.connector.connect(),
        }
    }

    pub fn disconnect(&mut self) {
        match self {
            Backend::Crdt(b) => {
                b.synced = false;
                b.queued.clear();
                b.connector.disconnect();
            }
            Backend::Relay(b) => b.connector.disconnect(),
        }
    }

    /// Meaningful only for CRDT; the relay relies on auto-reconnect.
    pub fn reconnect(&mut self) {
        match self {
            Backend::Crdt(b) => b.reconnect(),
            Backend::Relay(_) => log::debug!("reconnect() is a no-op for the relay backend"),
        }
    }

    pub fn publish_snapshot(&mut self, snapshot: DiagramSnapshot) -> Result<(), BackendError> {
        match self {
            Backend::Crdt(b) => b.publish_snapshot(snapshot),
            Backend::Relay(b) => b.publish_snapshot(snapshot),
        }
    }

    pub fn publish(&mut self, envelope: &Envelope) -> Result<(), BackendError> {
        match self {
            Backend::Crdt(b) => b.publish(envelope),
            Backend::Relay(b) => b.publish(envelope),
        }
    }

    /// Cancel-safe.
    pub async fn next_event(&mut self) -> BackendEvent {
        match self {
            Backend::Crdt(b) => b.next_event().await,
            Backend::Relay(b) => b.next_event().await,
        }
    }
}
