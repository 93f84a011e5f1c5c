//! WebSocket collaboration hub.
//!
//! Architecture:
//! ```text
//! Client A ──┐  /relay/<room>
//!             ├── BroadcastGroup ──► every other client in the room
//! Client B ──┘
//!
//! Client C ──┐  /crdt/<room>
//!             ├── DiagramDoc (authoritative, in memory) + BroadcastGroup
//! Client D ──┘
//! ```
//!
//! The request path picks the protocol and the room; anything else is
//! refused during the handshake with a 404.
//!
//! - Relay rooms forward every text frame untouched.
//! - CRDT rooms answer the sync handshake from their document, apply
//!   incoming updates, and forward them to the other clients.
//!
//! Each connection that announced a `join` and then dropped without a
//! `leave` gets a `leave` broadcast on its behalf, so other rosters do not
//! keep a ghost. Rooms disappear with their last connection; nothing is
//! persisted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{BroadcastGroup, RoomManager};
use crate::crdt::DiagramDoc;
use crate::protocol::{DiagramSnapshot, Envelope, EnvelopeBody, FrameType, SyncFrame};

/// Sender id the hub uses for frames it produces itself.
pub const HUB_ID: &str = "hub";

type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Hub configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    pub bind_addr: String,
    /// Frames buffered per connection before a slow reader starts skipping.
    pub broadcast_capacity: usize,
    pub max_peers_per_room: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            max_peers_per_room: 100,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub active_rooms: usize,
}

/// Protocol and room selected by the request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomRoute {
    Relay(String),
    Crdt(String),
}

impl RoomRoute {
    /// `/relay/<room>` or `/crdt/<room>`.
    pub fn parse(path: &str) -> Option<Self> {
        let (channel, room) = path.trim_start_matches('/').split_once('/')?;
        if room.is_empty() || room.contains('/') {
            return None;
        }
        match channel {
            "relay" => Some(RoomRoute::Relay(room.to_string())),
            "crdt" => Some(RoomRoute::Crdt(room.to_string())),
            _ => None,
        }
    }

    /// Room key; relay and CRDT rooms of the same name are separate.
    pub fn key(&self) -> String {
        match self {
            RoomRoute::Relay(room) => format!("relay/{room}"),
            RoomRoute::Crdt(room) => format!("crdt/{room}"),
        }
    }

    fn is_crdt(&self) -> bool {
        matches!(self, RoomRoute::Crdt(_))
    }

    /// Wrap an envelope in this route's framing.
    fn frame(&self, envelope: &Envelope) -> Result<Message, crate::protocol::ProtocolError> {
        match self {
            RoomRoute::Relay(_) => Ok(Message::Text(envelope.to_json()?.into())),
            RoomRoute::Crdt(_) => Ok(Message::Binary(SyncFrame::awareness(envelope)?.encode()?.into())),
        }
    }
}

struct HubShared {
    config: HubConfig,
    rooms: RoomManager,
    /// CRDT room documents, keyed like `rooms`.
    docs: RwLock<HashMap<String, Arc<Mutex<DiagramDoc>>>>,
    stats: RwLock<HubStats>,
}

impl HubShared {
    async fn doc_for(&self, key: &str) -> Arc<Mutex<DiagramDoc>> {
        let mut docs = self.docs.write().await;
        docs.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DiagramDoc::new())))
            .clone()
    }
}

/// The collaboration hub.
pub struct Hub {
    shared: Arc<HubShared>,
    next_connection_id: AtomicU64,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        let rooms = RoomManager::new(config.broadcast_capacity);
        Self {
            shared: Arc::new(HubShared {
                config,
                rooms,
                docs: RwLock::new(HashMap::new()),
                stats: RwLock::new(HubStats::default()),
            }),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Collaboration hub listening on {}", self.shared.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, connection_id, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> HubStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    /// Keys of the rooms with at least one connection.
    pub async fn active_rooms(&self) -> Vec<String> {
        self.shared.rooms.active_rooms().await
    }

    /// Current content of a CRDT room's document.
    pub async fn room_snapshot(&self, room: &str) -> Option<DiagramSnapshot> {
        let key = RoomRoute::Crdt(room.to_string()).key();
        let doc = self.shared.docs.read().await.get(&key).cloned()?;
        let snapshot = doc.lock().await.snapshot();
        Some(snapshot)
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    connection_id: u64,
    shared: Arc<HubShared>,
) -> ConnectionResult {
    let mut route = None;
    let callback = |request: &Request, response: Response| match RoomRoute::parse(request.uri().path()) {
        Some(parsed) => {
            route = Some(parsed);
            Ok(response)
        }
        None => {
            let mut error = ErrorResponse::new(Some("unknown room route".to_string()));
            *error.status_mut() = StatusCode::NOT_FOUND;
            Err(error)
        }
    };
    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            log::warn!("Handshake with {addr} refused: {e}");
            return Ok(());
        }
    };
    let Some(route) = route else {
        return Ok(());
    };
    let key = route.key();
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    {
        let mut s = shared.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let room = shared.rooms.get_or_create(&key).await;
    let Some(mut broadcast_rx) = room
        .try_add_peer(connection_id, shared.config.max_peers_per_room)
        .await
    else {
        log::warn!("Room {key} is full; closing connection from {addr}");
        let full = Envelope::error(HUB_ID, "room is full");
        let _ = ws_sender.send(route.frame(&full)?).await;
        let _ = ws_sender.close().await;
        shared.stats.write().await.active_connections -= 1;
        return Ok(());
    };

    let doc = if route.is_crdt() {
        Some(shared.doc_for(&key).await)
    } else {
        None
    };
    {
        let mut s = shared.stats.write().await;
        s.active_rooms = shared.rooms.room_count().await;
    }
    log::info!("Connection #{connection_id} from {addr} entered room {key}");

    let result = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection #{connection_id} closed");
                            break;
                        }
                        Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                            shared.stats.write().await.total_messages += 1;
                            match &doc {
                                Some(doc) => {
                                    let replies = handle_crdt_message(connection_id, &room, doc, message).await?;
                                    for reply in replies {
                                        ws_sender.send(reply).await?;
                                    }
                                }
                                None => handle_relay_message(connection_id, &room, message).await,
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::error!("WebSocket error on connection #{connection_id}: {e}");
                            break;
                        }
                    }
                }

                frame = broadcast_rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            if frame.origin == connection_id {
                                continue;
                            }
                            ws_sender.send(frame.message.clone()).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection #{connection_id} lagged by {n} frames");
                            room.record_dropped(n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    }
    .await;

    // Cleanup: leave on behalf of a vanished collaborator, drop empty rooms
    if let Some(peer) = room.remove_peer(connection_id).await {
        // A reconnect may already have rejoined under the same id
        let rejoined = match &peer.collaborator {
            Some(who) => room.has_collaborator(&who.id).await,
            None => false,
        };
        if let Some(who) = peer.collaborator.filter(|_| !rejoined) {
            log::info!("{} ({}) dropped without leaving {key}", who.name, who.id);
            match route.frame(&Envelope::leave(&who)) {
                Ok(message) => {
                    room.broadcast(0, message);
                }
                Err(e) => log::error!("Failed to encode leave for {}: {e}", who.id),
            }
        }
    }
    if shared.rooms.remove_if_empty(&key).await {
        shared.docs.write().await.remove(&key);
        log::info!("Room {key} removed (empty)");
    }
    {
        let mut s = shared.stats.write().await;
        s.active_connections -= 1;
        s.active_rooms = shared.rooms.room_count().await;
    }

    result
}

/// Track join/leave so a dropped connection can be announced.
async fn track_presence(connection_id: u64, room: &BroadcastGroup, envelope: &Envelope) {
    match &envelope.body {
        EnvelopeBody::Join(who) => {
            log::info!("Presence: {} joined", who.name);
            room.set_collaborator(connection_id, Some(who.clone())).await;
        }
        EnvelopeBody::Leave(who) => {
            log::info!("Presence: {} left", who.name);
            room.set_collaborator(connection_id, None).await;
        }
        _ => log::trace!("Presence: {} from {}", envelope.kind(), envelope.sender_id),
    }
}

async fn handle_relay_message(connection_id: u64, room: &BroadcastGroup, message: Message) {
    let Message::Text(text) = &message else {
        log::debug!("Ignoring binary frame on relay connection #{connection_id}");
        return;
    };
    match Envelope::from_json(text.as_str()) {
        Ok(Some(envelope)) => track_presence(connection_id, room, &envelope).await,
        Ok(None) => {}
        Err(e) => log::debug!("Relaying unparsed frame from #{connection_id}: {e}"),
    }
    room.broadcast(connection_id, message);
}

/// Returns frames to send back on this connection only.
async fn handle_crdt_message(
    connection_id: u64,
    room: &BroadcastGroup,
    doc: &Mutex<DiagramDoc>,
    message: Message,
) -> Result<Vec<Message>, Box<dyn std::error::Error + Send + Sync>> {
    let Message::Binary(data) = message else {
        log::debug!("Ignoring text frame on CRDT connection #{connection_id}");
        return Ok(Vec::new());
    };
    let frame = match SyncFrame::decode(&data) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Failed to decode frame from #{connection_id}: {e}");
            return Ok(Vec::new());
        }
    };

    match frame.frame_type {
        FrameType::SyncStep1 => {
            let (diff, state_vector) = {
                let doc = doc.lock().await;
                match doc.diff_since(&frame.payload) {
                    Ok(diff) => (diff, doc.state_vector()),
                    Err(e) => {
                        log::warn!("Bad state vector from #{connection_id}: {e}");
                        return Ok(Vec::new());
                    }
                }
            };
            Ok(vec![
                Message::Binary(SyncFrame::sync_step2(HUB_ID, diff).encode()?.into()),
                Message::Binary(SyncFrame::sync_step1(HUB_ID, state_vector).encode()?.into()),
            ])
        }
        FrameType::SyncStep2 | FrameType::Update => {
            if let Err(e) = doc.lock().await.apply_remote_update(&frame.payload) {
                log::warn!("Dropping update from #{connection_id}: {e}");
                return Ok(Vec::new());
            }
            let forward = SyncFrame::update(frame.sender_id, frame.payload).encode()?;
            room.broadcast(connection_id, Message::Binary(forward.into()));
            Ok(Vec::new())
        }
        FrameType::Awareness => {
            match frame.envelope() {
                Ok(Some(envelope)) => track_presence(connection_id, room, &envelope).await,
                Ok(None) => {}
                Err(e) => log::debug!("Forwarding unparsed awareness from #{connection_id}: {e}"),
            }
            room.broadcast(connection_id, Message::Binary(data));
            Ok(Vec::new())
        }
    }
}
