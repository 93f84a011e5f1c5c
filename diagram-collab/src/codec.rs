//! Message codecs between WebSocket frames and typed messages.
//!
//! The transport is generic over a [`Codec`] so the same connector drives
//! both strategies:
//!
//! - [`EnvelopeCodec`] for JSON text frames ([`Envelope`]), relay strategy
//! - [`FrameCodec`] for bincode binary frames ([`SyncFrame`]), CRDT strategy
//!
//! `decode` returns `Ok(None)` for frames that are valid but not for us
//! (control frames, the other framing, unknown envelope types).

use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{Envelope, ProtocolError, SyncFrame};

pub trait Codec: Send + 'static {
    type Frame: Send + 'static;

    fn encode(&self, frame: &Self::Frame) -> Result<Message, ProtocolError>;

    fn decode(&self, message: Message) -> Result<Option<Self::Frame>, ProtocolError>;
}

/// JSON envelopes in text frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec;

impl Codec for EnvelopeCodec {
    type Frame = Envelope;

    fn encode(&self, frame: &Envelope) -> Result<Message, ProtocolError> {
        Ok(Message::Text(frame.to_json()?.into()))
    }

    fn decode(&self, message: Message) -> Result<Option<Envelope>, ProtocolError> {
        match message {
            Message::Text(text) => Envelope::from_json(text.as_str()),
            _ => Ok(None),
        }
    }
}

/// Bincode sync frames in binary frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Codec for FrameCodec {
    type Frame = SyncFrame;

    fn encode(&self, frame: &SyncFrame) -> Result<Message, ProtocolError> {
        Ok(Message::Binary(frame.encode()?.into()))
    }

    fn decode(&self, message: Message) -> Result<Option<SyncFrame>, ProtocolError> {
        match message {
            Message::Binary(data) => SyncFrame::decode(&data).map(Some),
            _ => Ok(None),
        }
    }
}
