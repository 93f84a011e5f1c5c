//! # diagram-collab: real-time collaboration layer for the diagram editor
//!
//! Keeps several clients' view of a shared diagram consistent over an
//! unreliable network, tracks who is present, and degrades gracefully when
//! the connection drops.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   intents    ┌──────────────────┐   WebSocket   ┌──────────┐
//! │ UI / canvas  │─────────────►│  CollabSession   │◄─────────────►│   Hub    │
//! │              │◄─────────────│  (driver task)   │  JSON or      │ (server) │
//! └──────────────┘ state/events └────────┬─────────┘  binary frames└────┬─────┘
//!                                        │                              │
//!                  ┌─────────────┬───────┼───────────┬─────────┐        │
//!                  ▼             ▼       ▼           ▼         ▼        ▼
//!              Presence      Cursor    Update     Backend   Connector  BroadcastGroup
//!              Tracker       Board     Channel   (CRDT|relay)          (+ yrs Doc)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: envelopes, snapshots, CRDT sync frames
//! - [`codec`]: frame codecs for the transport
//! - [`schedule`]: cancelable delayed task
//! - [`transport`]: connector with bounded, jittered reconnect
//! - [`presence`]: roster with liveness eviction
//! - [`cursor`]: remote cursor board and local cursor throttle
//! - [`update`]: debounced outbound updates, echo-free remote apply
//! - [`crdt`]: yrs-backed diagram document
//! - [`backend`]: strategy selection and the two strategies
//! - [`session`]: the API the UI consumes
//! - [`broadcast`]: hub-side room fan-out
//! - [`server`]: the hub

pub mod protocol;
pub mod codec;
pub mod schedule;
pub mod transport;
pub mod presence;
pub mod cursor;
pub mod update;
pub mod crdt;
pub mod backend;
pub mod session;
pub mod broadcast;
pub mod server;

// Re-exports for convenience
pub use protocol::{
    Collaborator, CursorPosition, DiagramSnapshot, Envelope, EnvelopeBody, FrameType,
    ProtocolError, SnapshotPatch, SyncFrame,
};
pub use codec::{Codec, EnvelopeCodec, FrameCodec};
pub use schedule::ScheduledTask;
pub use transport::{ConnectionState, Connector, ReconnectPolicy, TransportError, TransportEvent};
pub use presence::{PresenceChange, PresenceTracker};
pub use cursor::{CursorBoard, CursorBroadcaster, CursorEntry};
pub use update::{PendingPolicy, UpdateChannel};
pub use crdt::{CollabError, DiagramDoc};
pub use backend::{
    room_url, select_backend, Backend, BackendConfig, BackendError, BackendEvent, BackendKind,
};
pub use session::{CollabSession, ReconnectSettings, SyncConfig, SyncEvent, SyncState};
pub use broadcast::{BroadcastGroup, BroadcastStats, HubFrame, PeerInfo, RoomManager};
pub use server::{Hub, HubConfig, HubStats, RoomRoute};
