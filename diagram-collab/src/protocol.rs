//! Wire types for diagram collaboration.
//!
//! Two framings carry the same logical messages:
//!
//! ```text
//! Relay strategy (JSON text frame):
//! { "type": "diagram-update", "senderId": "u-42", "payload": { ... }, "timestamp": 1718000000000 }
//!
//! CRDT strategy (bincode binary frame):
//! ┌────────────┬─────────────┬──────────┐
//! │ frame_type │ sender_id   │ payload  │
//! │ 1 byte     │ len + utf-8 │ variable │
//! └────────────┴─────────────┴──────────┘
//! ```
//!
//! Presence, cursor and heartbeat traffic is always an [`Envelope`]; under the
//! CRDT strategy it rides inside an `Awareness` frame as JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Current wall-clock time as Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ───────────────────────────────────────────────────────────────────
// Domain payloads
// ───────────────────────────────────────────────────────────────────

/// A participant in a shared diagram session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture_url: Option<String>,
}

impl Collaborator {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: None,
            picture_url: None,
        }
    }

    /// Create a collaborator with a random id (guests, tests).
    pub fn anonymous(name: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), name)
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_picture_url(mut self, url: impl Into<String>) -> Self {
        self.picture_url = Some(url.into());
        self
    }
}

/// Pointer position in diagram coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Diagram content as the canvas sees it.
///
/// Nodes and edges are opaque JSON objects owned by the canvas; this layer
/// only moves them around. Elements carrying an `"id"` field get per-element
/// merging under the CRDT strategy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DiagramSnapshot {
    #[serde(default)]
    pub nodes: Vec<Value>,
    #[serde(default)]
    pub edges: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl DiagramSnapshot {
    pub fn new(nodes: Vec<Value>, edges: Vec<Value>) -> Self {
        Self {
            nodes,
            edges,
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Overwrite the fields present in `patch`.
    pub fn apply_patch(&mut self, patch: SnapshotPatch) {
        if let Some(nodes) = patch.nodes {
            self.nodes = nodes;
        }
        if let Some(edges) = patch.edges {
            self.edges = edges;
        }
        if let Some(title) = patch.title {
            self.title = Some(title);
        }
    }

    /// Every node and edge must be a JSON object.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        for (kind, items) in [("node", &self.nodes), ("edge", &self.edges)] {
            if let Some(index) = items.iter().position(|v| !v.is_object()) {
                return Err(ProtocolError::InvalidSnapshot(format!(
                    "{kind} #{index} is not an object"
                )));
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty() && self.title.is_none()
    }
}

/// Partial diagram change coming from the canvas.
///
/// Absent fields keep their current value when merged with
/// [`DiagramSnapshot::apply_patch`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SnapshotPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edges: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl SnapshotPatch {
    pub fn with_nodes(mut self, nodes: Vec<Value>) -> Self {
        self.nodes = Some(nodes);
        self
    }

    pub fn with_edges(mut self, edges: Vec<Value>) -> Self {
        self.edges = Some(edges);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

impl From<DiagramSnapshot> for SnapshotPatch {
    fn from(snapshot: DiagramSnapshot) -> Self {
        Self {
            nodes: Some(snapshot.nodes),
            edges: Some(snapshot.edges),
            title: snapshot.title,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Envelope (relay framing, also the awareness payload under CRDT)
// ───────────────────────────────────────────────────────────────────

/// Typed envelope payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeBody {
    Join(Collaborator),
    Leave(Collaborator),
    DiagramUpdate(DiagramSnapshot),
    CursorPosition(CursorPosition),
    /// Human-readable error relayed by a peer or the hub.
    Error(String),
    /// Liveness ping; doubles as a presence repair for missed joins.
    Heartbeat(Collaborator),
}

impl EnvelopeBody {
    /// Wire value of the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            EnvelopeBody::Join(_) => "join",
            EnvelopeBody::Leave(_) => "leave",
            EnvelopeBody::DiagramUpdate(_) => "diagram-update",
            EnvelopeBody::CursorPosition(_) => "cursor-position",
            EnvelopeBody::Error(_) => "error",
            EnvelopeBody::Heartbeat(_) => "heartbeat",
        }
    }
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sender_id: String,
    /// Unix milliseconds at the sender.
    pub timestamp: i64,
    pub body: EnvelopeBody,
}

/// Outer JSON shape; the payload is decoded in a second pass by `type`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    sender_id: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    timestamp: i64,
}

impl Envelope {
    pub fn new(sender_id: impl Into<String>, body: EnvelopeBody) -> Self {
        Self {
            sender_id: sender_id.into(),
            timestamp: now_millis(),
            body,
        }
    }

    pub fn join(who: &Collaborator) -> Self {
        Self::new(who.id.clone(), EnvelopeBody::Join(who.clone()))
    }

    pub fn leave(who: &Collaborator) -> Self {
        Self::new(who.id.clone(), EnvelopeBody::Leave(who.clone()))
    }

    pub fn heartbeat(who: &Collaborator) -> Self {
        Self::new(who.id.clone(), EnvelopeBody::Heartbeat(who.clone()))
    }

    pub fn diagram_update(sender_id: impl Into<String>, snapshot: DiagramSnapshot) -> Self {
        Self::new(sender_id, EnvelopeBody::DiagramUpdate(snapshot))
    }

    pub fn cursor(sender_id: impl Into<String>, position: CursorPosition) -> Self {
        Self::new(sender_id, EnvelopeBody::CursorPosition(position))
    }

    pub fn error(sender_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(sender_id, EnvelopeBody::Error(message.into()))
    }

    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    /// Serialize to the JSON wire format.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        let payload = match &self.body {
            EnvelopeBody::Join(c) | EnvelopeBody::Leave(c) | EnvelopeBody::Heartbeat(c) => {
                serde_json::to_value(c)
            }
            EnvelopeBody::DiagramUpdate(s) => serde_json::to_value(s),
            EnvelopeBody::CursorPosition(p) => serde_json::to_value(p),
            EnvelopeBody::Error(m) => Ok(Value::String(m.clone())),
        }
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;

        let raw = RawEnvelope {
            kind: self.kind().to_string(),
            sender_id: self.sender_id.clone(),
            payload,
            timestamp: self.timestamp,
        };
        serde_json::to_string(&raw).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Parse the JSON wire format.
    ///
    /// Returns `Ok(None)` for a well-formed envelope of a type this build does
    /// not know; callers drop those.
    pub fn from_json(text: &str) -> Result<Option<Self>, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(text)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;

        let body = match raw.kind.as_str() {
            "join" => EnvelopeBody::Join(payload(raw.payload)?),
            "leave" => EnvelopeBody::Leave(payload(raw.payload)?),
            "heartbeat" => EnvelopeBody::Heartbeat(payload(raw.payload)?),
            "diagram-update" => EnvelopeBody::DiagramUpdate(payload(raw.payload)?),
            "cursor-position" => EnvelopeBody::CursorPosition(payload(raw.payload)?),
            "error" => EnvelopeBody::Error(payload(raw.payload)?),
            other => {
                log::debug!("Ignoring envelope of unknown type {other:?}");
                return Ok(None);
            }
        };

        Ok(Some(Self {
            sender_id: raw.sender_id,
            timestamp: raw.timestamp,
            body,
        }))
    }
}

fn payload<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
}

// ───────────────────────────────────────────────────────────────────
// CRDT frames
// ───────────────────────────────────────────────────────────────────

/// Frame types of the CRDT replication protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Yrs state vector; the receiver answers with `SyncStep2`.
    SyncStep1 = 1,
    /// Yrs diff against the requested state vector.
    SyncStep2 = 2,
    /// Incremental update produced by a local edit.
    Update = 3,
    /// JSON envelope for presence, cursors and heartbeats.
    Awareness = 4,
}

/// One binary frame of the CRDT protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFrame {
    pub frame_type: FrameType,
    pub sender_id: String,
    pub payload: Vec<u8>,
}

impl SyncFrame {
    pub fn sync_step1(sender_id: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::SyncStep1,
            sender_id: sender_id.into(),
            payload: state_vector,
        }
    }

    pub fn sync_step2(sender_id: impl Into<String>, diff: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::SyncStep2,
            sender_id: sender_id.into(),
            payload: diff,
        }
    }

    pub fn update(sender_id: impl Into<String>, update: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Update,
            sender_id: sender_id.into(),
            payload: update,
        }
    }

    pub fn awareness(envelope: &Envelope) -> Result<Self, ProtocolError> {
        Ok(Self {
            frame_type: FrameType::Awareness,
            sender_id: envelope.sender_id.clone(),
            payload: envelope.to_json()?.into_bytes(),
        })
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(frame)
    }

    /// Parse the envelope carried by an `Awareness` frame.
    pub fn envelope(&self) -> Result<Option<Envelope>, ProtocolError> {
        if self.frame_type != FrameType::Awareness {
            return Err(ProtocolError::InvalidFrameType);
        }
        let text = std::str::from_utf8(&self.payload)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Envelope::from_json(text)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidSnapshot(String),
    InvalidFrameType,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidSnapshot(e) => write!(f, "Invalid snapshot: {e}"),
            Self::InvalidFrameType => write!(f, "Invalid frame type"),
        }
    }
}

impl std::error::Error for ProtocolError {}
