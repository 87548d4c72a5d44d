//! Per-connection session state.
//!
//! A `Session` is created by the connection driver when a socket is accepted and
//! shared (behind `Arc`) with the routing table once it owns an address. Other
//! sessions never write to its socket directly: they push onto its outbound
//! queue, which the owning driver drains in order. That queue is the single
//! serialization point for everything written to the peer, and it is bounded:
//! a peer that stops reading is closed with `policy-violation` once the queue
//! fills up.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::error::{StreamError, StreamErrorCondition, XmppError};
use super::jid::Jid;
use super::stanza::Stanza;

/// Length of generated stream identifiers.
const STREAM_ID_LEN: usize = 16;

/// Stanzas a session may have queued before it is considered stuck.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Current time as milliseconds since UNIX epoch (for activity tracking).
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Random alphanumeric token (stream ids, generated resources, nonces).
pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Connection class a session was accepted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Client,
    Server,
    Component,
    Multiplexer,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Server => "server",
            Self::Component => "component",
            Self::Multiplexer => "multiplexer",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Initializing,
    Negotiating,
    Authenticated,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionState {
    None,
    Handshaking,
    Active { protocol: String, cipher: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionState {
    None,
    Active,
}

/// Items queued for the connection driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A complete element to write as-is.
    Stanza(String),
    /// Close the stream, optionally with a stream error first.
    Close(Option<StreamError>),
}

#[derive(Debug, Clone)]
struct CloseRequest {
    error: Option<StreamError>,
}

/// Receiving end of a session's outbound queue, owned by its driver.
///
/// A close request is ordered after every stanza queued before it.
pub struct OutboundQueue {
    stanzas: mpsc::Receiver<String>,
    close: watch::Receiver<Option<CloseRequest>>,
    pending: VecDeque<Outbound>,
    close_seen: bool,
}

impl OutboundQueue {
    /// Next item for the peer. Cancel safe.
    pub async fn recv(&mut self) -> Option<Outbound> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if self.take_close_request() {
                continue;
            }
            tokio::select! {
                biased;
                changed = self.close.changed(), if !self.close_seen => {
                    if changed.is_err() && !self.take_close_request() {
                        self.close_seen = true;
                    }
                }
                stanza = self.stanzas.recv() => return stanza.map(Outbound::Stanza),
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<Outbound, TryRecvError> {
        if let Some(item) = self.pending.pop_front() {
            return Ok(item);
        }
        if self.take_close_request() {
            if let Some(item) = self.pending.pop_front() {
                return Ok(item);
            }
        }
        self.stanzas.try_recv().map(Outbound::Stanza)
    }

    /// Stop accepting stanzas; already queued ones stay readable.
    pub fn close(&mut self) {
        self.stanzas.close();
    }

    fn take_close_request(&mut self) -> bool {
        if self.close_seen {
            return false;
        }
        let Some(request) = self.close.borrow_and_update().clone() else {
            return false;
        };
        self.close_seen = true;
        while let Ok(raw) = self.stanzas.try_recv() {
            self.pending.push_back(Outbound::Stanza(raw));
        }
        self.pending.push_back(Outbound::Close(request.error));
        true
    }
}

/// Secondary delivery target used when the session can no longer take
/// traffic (e.g. offline storage).
pub trait PacketDeliverer: Send + Sync {
    fn deliver(&self, stanza: &Stanza) -> Result<(), XmppError>;
}

#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    stream_id: String,
    version: (u32, u32),
    language: String,
    encryption: EncryptionState,
    compression: CompressionState,
    address: Option<Jid>,
    anonymous: bool,
}

pub struct Session {
    conn_id: u64,
    kind: ConnectionKind,
    peer_addr: Option<SocketAddr>,
    state: Mutex<SessionState>,
    outbound: mpsc::Sender<String>,
    close: watch::Sender<Option<CloseRequest>>,
    capacity: usize,
    fallback: Option<Arc<dyn PacketDeliverer>>,
    stanzas_received: AtomicU64,
    stanzas_sent: AtomicU64,
    last_activity: AtomicU64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Session")
            .field("conn_id", &self.conn_id)
            .field("kind", &self.kind)
            .field("stream_id", &state.stream_id)
            .field("status", &state.status)
            .field("address", &state.address)
            .finish()
    }
}

impl Session {
    /// Create a session and the receiving end of its outbound queue.
    pub fn new(
        conn_id: u64,
        kind: ConnectionKind,
        peer_addr: Option<SocketAddr>,
        fallback: Option<Arc<dyn PacketDeliverer>>,
    ) -> (Arc<Session>, OutboundQueue) {
        Self::with_capacity(conn_id, kind, peer_addr, fallback, DEFAULT_OUTBOUND_CAPACITY)
    }

    pub fn with_capacity(
        conn_id: u64,
        kind: ConnectionKind,
        peer_addr: Option<SocketAddr>,
        fallback: Option<Arc<dyn PacketDeliverer>>,
        capacity: usize,
    ) -> (Arc<Session>, OutboundQueue) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (close_tx, close_rx) = watch::channel(None);
        let session = Session {
            conn_id,
            kind,
            peer_addr,
            state: Mutex::new(SessionState {
                status: SessionStatus::Initializing,
                stream_id: random_token(STREAM_ID_LEN),
                version: (0, 0),
                language: String::from("en"),
                encryption: EncryptionState::None,
                compression: CompressionState::None,
                address: None,
                anonymous: false,
            }),
            outbound: tx,
            close: close_tx,
            capacity,
            fallback,
            stanzas_received: AtomicU64::new(0),
            stanzas_sent: AtomicU64::new(0),
            last_activity: AtomicU64::new(now_millis()),
        };
        let queue = OutboundQueue {
            stanzas: rx,
            close: close_rx,
            pending: VecDeque::new(),
            close_seen: false,
        };
        (Arc::new(session), queue)
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn stream_id(&self) -> String {
        self.state.lock().stream_id.clone()
    }

    /// Issue a fresh stream id; called on every stream (re)start.
    pub fn regenerate_stream_id(&self) -> String {
        let id = random_token(STREAM_ID_LEN);
        self.state.lock().stream_id = id.clone();
        id
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn set_status(&self, status: SessionStatus) {
        self.state.lock().status = status;
    }

    pub fn is_closed(&self) -> bool {
        self.status() == SessionStatus::Closed
    }

    pub fn version(&self) -> (u32, u32) {
        self.state.lock().version
    }

    pub fn set_version(&self, version: (u32, u32)) {
        self.state.lock().version = version;
    }

    pub fn language(&self) -> String {
        self.state.lock().language.clone()
    }

    pub fn set_language(&self, lang: &str) {
        self.state.lock().language = lang.to_string();
    }

    pub fn encryption(&self) -> EncryptionState {
        self.state.lock().encryption.clone()
    }

    pub fn set_encryption(&self, encryption: EncryptionState) {
        self.state.lock().encryption = encryption;
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.state.lock().encryption, EncryptionState::Active { .. })
    }

    pub fn compression(&self) -> CompressionState {
        self.state.lock().compression
    }

    pub fn set_compression(&self, compression: CompressionState) {
        self.state.lock().compression = compression;
    }

    pub fn is_compressed(&self) -> bool {
        self.compression() == CompressionState::Active
    }

    pub fn address(&self) -> Option<Jid> {
        self.state.lock().address.clone()
    }

    pub fn set_address(&self, address: Jid) {
        self.state.lock().address = Some(address);
    }

    pub fn is_anonymous(&self) -> bool {
        self.state.lock().anonymous
    }

    pub fn set_anonymous(&self, anonymous: bool) {
        self.state.lock().anonymous = anonymous;
    }

    pub fn stanzas_received(&self) -> u64 {
        self.stanzas_received.load(Ordering::Relaxed)
    }

    pub fn stanzas_sent(&self) -> u64 {
        self.stanzas_sent.load(Ordering::Relaxed)
    }

    pub fn record_received(&self) {
        self.stanzas_received.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_sent(&self) {
        self.stanzas_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    pub fn idle_millis(&self) -> u64 {
        now_millis().saturating_sub(self.last_activity.load(Ordering::Relaxed))
    }

    /// Queue a stanza for the peer.
    ///
    /// When the session is closed (or its driver is gone) the stanza is handed
    /// once to the fallback deliverer; failures there are logged, not returned.
    /// A full queue closes the session with `policy-violation` and the stanza
    /// takes the same fallback path.
    /// Returns whether the stanza was accepted by either path.
    pub fn deliver(&self, stanza: &Stanza) -> bool {
        if !self.is_closed() {
            match self.outbound.try_send(stanza.as_str().to_string()) {
                Ok(()) => return true,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        conn_id = self.conn_id,
                        capacity = self.capacity,
                        "Outbound queue full, closing session"
                    );
                    self.close(Some(
                        StreamError::new(StreamErrorCondition::PolicyViolation)
                            .with_text("too many stanzas waiting for delivery"),
                    ));
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }

        let Some(fallback) = &self.fallback else {
            debug!(conn_id = self.conn_id, "Session closed and no fallback deliverer, stanza dropped");
            return false;
        };
        match fallback.deliver(stanza) {
            Ok(()) => {
                debug!(conn_id = self.conn_id, "Stanza handed to fallback deliverer");
                true
            }
            Err(e) => {
                warn!(conn_id = self.conn_id, error = %e, "Fallback delivery failed");
                false
            }
        }
    }

    /// Ask the driver to close the stream, with an optional stream error.
    /// Only the first request counts.
    pub fn close(&self, error: Option<StreamError>) {
        if self.is_closed() {
            return;
        }
        self.close.send_if_modified(|request| {
            if request.is_some() {
                return false;
            }
            *request = Some(CloseRequest { error });
            true
        });
    }
}
