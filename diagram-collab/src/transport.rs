//! WebSocket transport connector with bounded reconnection.
//!
//! Owns one logical connection. Each physical socket lives in its own link
//! task; the connector talks to it over channels and tags every report with
//! a generation so reports from a superseded socket are ignored.
//!
//! ```text
//!            connect()
//! Disconnected ───────► Connecting ──open──► Connected
//!      ▲                    │                   │
//!      │ give up            │ close/error       │ close/error
//!      │                    ▼                   ▼
//!      └───────────── Reconnecting ◄────────────┘
//!                      (backoff timer, then redial)
//!
//! disconnect() from any state ──► Disconnected (no auto-retry)
//! ```
//!
//! Backoff: `delay = min(base × 2^attempt + jitter, max)`, jitter drawn from
//! `[0, max_jitter]` so clients that lost the same server do not redial in
//! lockstep.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::codec::Codec;
use crate::protocol::ProtocolError;
use crate::schedule::ScheduledTask;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// Connecting for the first time or redialing after a loss.
    pub fn is_pending(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Reconnecting)
    }
}

/// Exponential backoff with jitter and a hard attempt limit.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    attempt: u32,
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    max_jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 5)
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            base_delay,
            max_delay,
            max_attempts,
            max_jitter: Duration::from_secs(1),
        }
    }

    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Retries scheduled in the current backoff episode.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// `min(base × 2^attempt + jitter, max)`, saturating instead of overflowing.
    pub fn delay_for(&self, attempt: u32, jitter: Duration) -> Duration {
        let exponential = 2u32
            .checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(self.max_delay);
        exponential.saturating_add(jitter).min(self.max_delay)
    }

    /// Delay before the next retry, or `None` once the attempt limit is hit.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.delay_for(self.attempt, self.sample_jitter());
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn sample_jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

/// What the connector reports to its owner.
#[derive(Debug)]
pub enum TransportEvent<F> {
    /// Socket open; the backoff episode is over.
    Opened,
    /// A decoded inbound frame.
    Frame(F),
    /// Socket lost; a redial is scheduled after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Attempt limit reached; the connector stays disconnected.
    GaveUp { attempts: u32 },
}

/// Outbound send failures. All are fire-and-forget drops for the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    NotConnected(ConnectionState),
    ConnectionClosed,
    Protocol(ProtocolError),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected(state) => write!(f, "Not connected (state: {state:?})"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        TransportError::Protocol(e)
    }
}

/// Report from a link task to the connector.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    Opened,
    Inbound(Message),
    Closed(String),
}

/// Handle to the live link task. Dropping it closes the socket after the
/// queued frames are written.
struct Link {
    outgoing: mpsc::UnboundedSender<Message>,
}

/// The transport connector.
pub struct Connector<C: Codec> {
    url: String,
    codec: C,
    state: ConnectionState,
    policy: ReconnectPolicy,
    /// Cleared only by `disconnect()` or give-up.
    should_reconnect: bool,
    generation: u64,
    link: Option<Link>,
    retry: ScheduledTask,
    link_tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
    link_rx: mpsc::UnboundedReceiver<(u64, LinkEvent)>,
}

impl<C: Codec> Connector<C> {
    pub fn new(url: impl Into<String>, codec: C, policy: ReconnectPolicy) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        Self {
            url: url.into(),
            codec,
            state: ConnectionState::Disconnected,
            policy,
            should_reconnect: false,
            generation: 0,
            link: None,
            retry: ScheduledTask::new(),
            link_tx,
            link_rx,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn is_retry_pending(&self) -> bool {
        self.retry.is_armed()
    }

    /// Open the connection. No-op while connecting or connected.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&mut self) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => return,
            ConnectionState::Reconnecting => {
                if self.link.is_some() {
                    return; // redial already in flight
                }
                self.retry.cancel();
            }
            ConnectionState::Disconnected => {
                self.policy.reset();
                self.state = ConnectionState::Connecting;
            }
        }
        self.should_reconnect = true;
        log::info!("Connecting to {}", self.url);
        self.open_link();
    }

    /// Close the connection for good: no backoff, no auto-retry.
    pub fn disconnect(&mut self) {
        self.should_reconnect = false;
        self.retry.cancel();
        self.generation += 1;
        self.link = None;
        self.policy.reset();
        if self.state != ConnectionState::Disconnected {
            log::info!("Disconnected from {}", self.url);
        }
        self.state = ConnectionState::Disconnected;
    }

    /// Drop the current socket and dial a fresh one.
    pub fn restart(&mut self) {
        self.disconnect();
        self.connect();
    }

    /// Queue a frame on the open socket. At-most-once, no acknowledgement.
    pub fn send(&mut self, frame: &C::Frame) -> Result<(), TransportError> {
        if self.state != ConnectionState::Connected {
            log::warn!("Dropping outbound frame for {}: {:?}", self.url, self.state);
            return Err(TransportError::NotConnected(self.state));
        }
        let message = self.codec.encode(frame)?;
        let link = self.link.as_ref().ok_or(TransportError::ConnectionClosed)?;
        link.outgoing
            .send(message)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Wait for the next lifecycle event or inbound frame.
    ///
    /// Also drives the backoff timer. Cancel-safe.
    pub async fn next_event(&mut self) -> TransportEvent<C::Frame> {
        loop {
            tokio::select! {
                Some((generation, event)) = self.link_rx.recv() => {
                    if let Some(out) = self.handle_link_event(generation, event) {
                        return out;
                    }
                }
                _ = self.retry.fired() => self.redial(),
            }
        }
    }

    pub(crate) fn handle_link_event(
        &mut self,
        generation: u64,
        event: LinkEvent,
    ) -> Option<TransportEvent<C::Frame>> {
        if generation != self.generation {
            log::trace!("Ignoring event from superseded socket #{generation}");
            return None;
        }

        match event {
            LinkEvent::Opened => {
                log::info!("Connected to {}", self.url);
                self.state = ConnectionState::Connected;
                self.policy.reset();
                Some(TransportEvent::Opened)
            }
            LinkEvent::Inbound(message) => match self.codec.decode(message) {
                Ok(frame) => frame.map(TransportEvent::Frame),
                Err(e) => {
                    log::warn!("Dropping malformed frame from {}: {e}", self.url);
                    None
                }
            },
            LinkEvent::Closed(reason) => {
                self.link = None;
                if !self.should_reconnect {
                    self.state = ConnectionState::Disconnected;
                    return None;
                }
                log::warn!("Connection to {} lost: {reason}", self.url);
                self.schedule_retry()
            }
        }
    }

    fn schedule_retry(&mut self) -> Option<TransportEvent<C::Frame>> {
        match self.policy.next_delay() {
            Some(delay) => {
                let attempt = self.policy.attempt();
                log::info!(
                    "Retrying {} in {delay:?} (attempt {attempt}/{})",
                    self.url,
                    self.policy.max_attempts()
                );
                self.state = ConnectionState::Reconnecting;
                self.retry.reset(delay);
                Some(TransportEvent::Retrying { attempt, delay })
            }
            None => {
                let attempts = self.policy.attempt();
                log::warn!("Giving up on {} after {attempts} reconnect attempts", self.url);
                self.state = ConnectionState::Disconnected;
                self.should_reconnect = false;
                Some(TransportEvent::GaveUp { attempts })
            }
        }
    }

    fn redial(&mut self) {
        if !self.should_reconnect {
            return;
        }
        log::debug!("Redialing {}", self.url);
        self.open_link();
    }

    fn open_link(&mut self) {
        self.generation += 1;
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        self.link = Some(Link { outgoing });
        tokio::spawn(run_link(
            self.url.clone(),
            self.generation,
            self.link_tx.clone(),
            outgoing_rx,
        ));
    }
}

/// Own one socket from dial to close, reporting back to the connector.
async fn run_link(
    url: String,
    generation: u64,
    events: mpsc::UnboundedSender<(u64, LinkEvent)>,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
) {
    let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws_stream, _)) => ws_stream,
        Err(e) => {
            let _ = events.send((generation, LinkEvent::Closed(e.to_string())));
            return;
        }
    };
    if events.send((generation, LinkEvent::Opened)).is_err() {
        return;
    }

    let (mut writer, mut reader) = ws_stream.split();

    let reason = loop {
        tokio::select! {
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| f.reason.as_str().to_string())
                        .unwrap_or_else(|| "closed by peer".to_string());
                }
                Some(Ok(message)) => {
                    if events.send((generation, LinkEvent::Inbound(message))).is_err() {
                        return;
                    }
                }
                Some(Err(e)) => break e.to_string(),
                None => break "stream ended".to_string(),
            },
            outbound = outgoing.recv() => match outbound {
                Some(message) => {
                    if let Err(e) = writer.send(message).await {
                        break e.to_string();
                    }
                }
                None => {
                    // Connector let go of the link; everything queued is written.
                    let _ = writer.send(Message::Close(None)).await;
                    let _ = writer.close().await;
                    return;
                }
            },
        }
    };

    let _ = events.send((generation, LinkEvent::Closed(reason)));
}
