//! Peer Networking
//!
//! Peer message types, the frame codec, and the [`Transport`] seam the
//! engine talks through. Two transports ship with the crate:
//! [`memory::MemoryNetwork`] for in-process clusters and, with the `net`
//! feature, [`tcp::TcpTransport`].

use crate::raft::{Entry, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod codec;
#[cfg(feature = "net")]
pub mod tcp;

pub use codec::{PeerCodec, WireError, MAX_FRAME_SIZE};

/// Initial backoff between reconnect attempts
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Maximum backoff between reconnect attempts
pub const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Configuration for network transport
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Size of the per-connection read buffer in bytes
    pub read_buffer_size: usize,
    /// Largest frame a peer may send
    pub max_frame_size: u64,
    /// Initial reconnect backoff
    pub initial_backoff: Duration,
    /// Maximum reconnect backoff
    pub max_backoff: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 64 * 1024,
            max_frame_size: MAX_FRAME_SIZE,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        }
    }
}

/// Host and port of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ============================================================================
// MESSAGES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRequest {
    pub term: Term,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteResponse {
    pub term: Term,
    pub granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub term: Term,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub leader_commit: LogIndex,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResponse {
    pub term: Term,
    pub success: bool,
    /// Highest index known to match the leader (valid on success).
    pub match_index: LogIndex,
    /// Receiver's last index, used by the leader to back off on failure.
    pub last_index: LogIndex,
}

/// Protocol messages exchanged between group members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Announces the sender's listening port.
    Handshake { port: u16 },
    /// `success` when the receiver leads the group; otherwise the leader
    /// it knows of, if any.
    HandshakeResponse { success: bool, leader: Option<PeerAddr> },
    Leave,
    LeaveResponse,
    Vote(VoteRequest),
    VoteResponse(VoteResponse),
    AppendEntries(AppendRequest),
    AppendEntriesResponse(AppendResponse),
}

/// A message addressed to one group, tagged with its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub identity: String,
    pub from: NodeId,
    pub message: PeerMessage,
}

// ============================================================================
// TRANSPORT
// ============================================================================

/// Opaque connection handle issued by a transport.
pub type ConnectionId = u64;

/// Errors raised by transports.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Failed to bind: {0}")]
    Bind(String),
    #[error("Unknown connection {0}")]
    Unknown(ConnectionId),
    #[error("Connection {0} is not usable")]
    NotConnected(ConnectionId),
    #[error("Transport closed")]
    Closed,
    #[error("Failed to frame message: {0}")]
    Wire(#[from] WireError),
}

/// Callbacks a transport raises towards the engine.
pub trait TransportEvents: Send + Sync {
    /// An outbound connection became usable.
    fn on_connected(&self, conn: ConnectionId);
    /// A peer connected to us.
    fn on_accepted(&self, conn: ConnectionId);
    fn on_disconnected(&self, conn: ConnectionId);
    /// One decoded message.
    fn on_received(&self, conn: ConnectionId, envelope: Envelope);
}

/// Connection-oriented message transport.
pub trait Transport: Send + Sync {
    /// Begins accepting connections and delivering events.
    fn start(&self, events: Arc<dyn TransportEvents>) -> Result<(), NetworkError>;

    /// Returns the connection to `host:port`, dialing it if needed.
    fn find_or_create(&self, host: &str, port: u16) -> ConnectionId;

    fn is_usable(&self, conn: ConnectionId) -> bool;

    /// Frames `envelope` with [`PeerCodec`] and queues it on `conn`.
    fn send(&self, conn: ConnectionId, envelope: Envelope) -> Result<(), NetworkError>;

    fn connection_info(&self, conn: ConnectionId) -> Option<PeerAddr>;

    /// Port this transport listens on.
    fn local_port(&self) -> u16;

    fn shutdown(&self);
}

// ============================================================================
// IN-PROCESS TRANSPORT
// ============================================================================

pub mod memory {
    //! Transport connecting engines inside one process, keyed by port.

    use super::*;
    use crate::wake::lock;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Mutex, OnceLock};

    /// Inbound connection ids carry this bit; the low bits are the sender port.
    const INBOUND: ConnectionId = 1 << 63;

    #[derive(Default)]
    struct Hub {
        endpoints: HashMap<u16, Arc<dyn TransportEvents>>,
        isolated: HashSet<u16>,
    }

    /// Shared switchboard for [`MemoryTransport`] endpoints.
    #[derive(Clone, Default)]
    pub struct MemoryNetwork {
        hub: Arc<Mutex<Hub>>,
    }

    impl fmt::Debug for MemoryNetwork {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let hub = lock(&self.hub);
            f.debug_struct("MemoryNetwork")
                .field("endpoints", &hub.endpoints.keys().collect::<Vec<_>>())
                .field("isolated", &hub.isolated)
                .finish()
        }
    }

    impl MemoryNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        /// Creates the endpoint listening on `port`.
        pub fn endpoint(&self, port: u16) -> MemoryTransport {
            MemoryTransport {
                network: self.clone(),
                port,
                outbound: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                started: OnceLock::new(),
            }
        }

        /// Cuts `port` off from every other endpoint.
        pub fn isolate(&self, port: u16) {
            lock(&self.hub).isolated.insert(port);
        }

        /// Reconnects a previously isolated `port`.
        pub fn heal(&self, port: u16) {
            lock(&self.hub).isolated.remove(&port);
        }

        fn reachable(&self, from: u16, to: u16) -> Option<Arc<dyn TransportEvents>> {
            let hub = lock(&self.hub);
            if hub.isolated.contains(&from) || hub.isolated.contains(&to) {
                return None;
            }
            hub.endpoints.get(&to).cloned()
        }
    }

    /// One endpoint on a [`MemoryNetwork`].
    pub struct MemoryTransport {
        network: MemoryNetwork,
        port: u16,
        outbound: Mutex<HashMap<ConnectionId, PeerAddr>>,
        next_id: AtomicU64,
        started: OnceLock<Arc<dyn TransportEvents>>,
    }

    impl fmt::Debug for MemoryTransport {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("MemoryTransport")
                .field("port", &self.port)
                .finish_non_exhaustive()
        }
    }

    impl MemoryTransport {
        fn target_port(&self, conn: ConnectionId) -> Option<u16> {
            if conn & INBOUND != 0 {
                return Some((conn & !INBOUND) as u16);
            }
            lock(&self.outbound).get(&conn).map(|addr| addr.port)
        }
    }

    impl Transport for MemoryTransport {
        fn start(&self, events: Arc<dyn TransportEvents>) -> Result<(), NetworkError> {
            let mut hub = lock(&self.network.hub);
            if hub.endpoints.contains_key(&self.port) {
                return Err(NetworkError::Bind(format!("port {} already in use", self.port)));
            }
            hub.endpoints.insert(self.port, Arc::clone(&events));
            let _ = self.started.set(events);
            Ok(())
        }

        fn find_or_create(&self, host: &str, port: u16) -> ConnectionId {
            let addr = PeerAddr::new(host, port);
            let conn = {
                let mut outbound = lock(&self.outbound);
                if let Some((&conn, _)) = outbound.iter().find(|(_, known)| **known == addr) {
                    return conn;
                }
                let conn = self.next_id.fetch_add(1, Ordering::Relaxed);
                outbound.insert(conn, addr);
                conn
            };

            if let Some(target) = self.network.reachable(self.port, port) {
                target.on_accepted(INBOUND | ConnectionId::from(self.port));
                if let Some(events) = self.started.get() {
                    events.on_connected(conn);
                }
            }
            conn
        }

        fn is_usable(&self, conn: ConnectionId) -> bool {
            self.target_port(conn)
                .and_then(|port| self.network.reachable(self.port, port))
                .is_some()
        }

        fn send(&self, conn: ConnectionId, envelope: Envelope) -> Result<(), NetworkError> {
            let port = self.target_port(conn).ok_or(NetworkError::Unknown(conn))?;
            let target = self
                .network
                .reachable(self.port, port)
                .ok_or(NetworkError::NotConnected(conn))?;
            // Whole frames through the wire codec, as a stream transport would.
            let mut codec = PeerCodec::default();
            let frame = codec.encode_frame(envelope)?;
            let envelope = codec.decode_frame(frame)?;
            target.on_received(INBOUND | ConnectionId::from(self.port), envelope);
            Ok(())
        }

        fn connection_info(&self, conn: ConnectionId) -> Option<PeerAddr> {
            if conn & INBOUND != 0 {
                return Some(PeerAddr::new("127.0.0.1", (conn & !INBOUND) as u16));
            }
            lock(&self.outbound).get(&conn).cloned()
        }

        fn local_port(&self) -> u16 {
            self.port
        }

        fn shutdown(&self) {
            lock(&self.network.hub).endpoints.remove(&self.port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryNetwork;
    use super::*;
    use crate::wake::lock;
    use std::sync::Mutex;

    fn envelope(message: PeerMessage) -> Envelope {
        Envelope {
            identity: "127.0.0.1:7000,127.0.0.1:7001".to_string(),
            from: 1,
            message,
        }
    }

    #[test]
    fn test_network_config_default() {
        let config = NetworkConfig::default();
        assert_eq!(config.max_frame_size, MAX_FRAME_SIZE);
        assert!(config.initial_backoff < config.max_backoff);
    }

    #[derive(Default)]
    struct Inbox {
        received: Mutex<Vec<(ConnectionId, Envelope)>>,
        connected: Mutex<Vec<ConnectionId>>,
    }

    impl TransportEvents for Inbox {
        fn on_connected(&self, conn: ConnectionId) {
            lock(&self.connected).push(conn);
        }
        fn on_accepted(&self, _conn: ConnectionId) {}
        fn on_disconnected(&self, _conn: ConnectionId) {}
        fn on_received(&self, conn: ConnectionId, envelope: Envelope) {
            lock(&self.received).push((conn, envelope));
        }
    }

    #[test]
    fn test_memory_network_delivers_and_isolates() {
        let network = MemoryNetwork::new();
        let a = network.endpoint(7000);
        let b = network.endpoint(7001);
        let a_events = Arc::new(Inbox::default());
        let b_events = Arc::new(Inbox::default());
        a.start(a_events.clone()).unwrap();
        b.start(b_events.clone()).unwrap();

        let conn = a.find_or_create("127.0.0.1", 7001);
        assert_eq!(a.find_or_create("127.0.0.1", 7001), conn);
        assert_eq!(lock(&a_events.connected).as_slice(), &[conn]);
        assert!(a.is_usable(conn));
        assert_eq!(a.connection_info(conn), Some(PeerAddr::new("127.0.0.1", 7001)));

        let sent = envelope(PeerMessage::AppendEntries(AppendRequest {
            term: 2,
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit: 0,
            entries: vec![Entry::blank(2), Entry::new(2, "x")],
        }));
        a.send(conn, sent.clone()).unwrap();
        let received = lock(&b_events.received).clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, sent);
        assert_eq!(b.connection_info(received[0].0).map(|addr| addr.port), Some(7000));

        network.isolate(7001);
        assert!(!a.is_usable(conn));
        assert_eq!(
            a.send(conn, envelope(PeerMessage::Leave)),
            Err(NetworkError::NotConnected(conn))
        );
        network.heal(7001);
        assert!(a.is_usable(conn));
    }

    #[test]
    fn test_memory_send_rejects_unframeable_message() {
        let network = MemoryNetwork::new();
        let a = network.endpoint(7010);
        let b = network.endpoint(7011);
        let b_events = Arc::new(Inbox::default());
        a.start(Arc::new(Inbox::default())).unwrap();
        b.start(b_events.clone()).unwrap();
        let conn = a.find_or_create("127.0.0.1", 7011);

        let oversized = Envelope {
            identity: "g".repeat(codec::MAX_STRING_LEN + 1),
            from: 0,
            message: PeerMessage::Leave,
        };
        let err = a.send(conn, oversized).unwrap_err();
        assert!(matches!(err, NetworkError::Wire(WireError::FieldTooLong { .. })), "got {err:?}");
        assert!(lock(&b_events.received).is_empty());
    }
}
