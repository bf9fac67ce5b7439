//! TCP Transport
//!
//! Peer connections over TCP, driven by a private tokio runtime so the
//! engine and its workers stay plain threads. Each connection gets a
//! `FramedRead` task decoding envelopes and a `FramedWrite` task fed by an
//! unbounded channel, both speaking [`PeerCodec`]. Outbound connections
//! redial with exponential backoff.

use super::{
    ConnectionId, Envelope, NetworkConfig, NetworkError, PeerAddr, PeerCodec, Transport, TransportEvents, WireError,
};
use crate::wake::lock;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

struct Connection {
    addr: PeerAddr,
    outbound: bool,
    dialing: bool,
    writer: Option<mpsc::UnboundedSender<Envelope>>,
}

struct Shared {
    config: NetworkConfig,
    port: u16,
    handle: Handle,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    next_id: AtomicU64,
    events: OnceLock<Arc<dyn TransportEvents>>,
    closed: AtomicBool,
}

/// TCP implementation of [`Transport`].
pub struct TcpTransport {
    shared: Arc<Shared>,
    listener: Mutex<Option<std::net::TcpListener>>,
    runtime: Mutex<Option<Runtime>>,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("port", &self.shared.port)
            .field("connections", &lock(&self.shared.connections).len())
            .finish()
    }
}

impl TcpTransport {
    /// Binds `0.0.0.0:port` with default settings. Port 0 picks a free port.
    pub fn bind(port: u16) -> Result<Self, NetworkError> {
        Self::with_config(port, NetworkConfig::default())
    }

    pub fn with_config(port: u16, config: NetworkConfig) -> Result<Self, NetworkError> {
        let listener =
            std::net::TcpListener::bind(("0.0.0.0", port)).map_err(|e| NetworkError::Bind(e.to_string()))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| NetworkError::Bind(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| NetworkError::Bind(e.to_string()))?
            .port();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("multiraft-net")
            .enable_all()
            .build()
            .map_err(|e| NetworkError::Bind(e.to_string()))?;

        tracing::info!(port, "TCP transport bound");

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                port,
                handle: runtime.handle().clone(),
                connections: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                events: OnceLock::new(),
                closed: AtomicBool::new(false),
            }),
            listener: Mutex::new(Some(listener)),
            runtime: Mutex::new(Some(runtime)),
        })
    }
}

impl Shared {
    fn events(&self) -> Option<Arc<dyn TransportEvents>> {
        self.events.get().cloned()
    }

    /// Splits `stream` into reader and writer tasks bound to `id`.
    fn attach(self: &Arc<Self>, id: ConnectionId, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(conn = id, error = %e, "Failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

        if let Some(conn) = lock(&self.connections).get_mut(&id) {
            conn.writer = Some(tx);
            conn.dialing = false;
        }

        let shared = Arc::clone(self);
        let codec = PeerCodec::new(self.config.max_frame_size);
        self.handle.spawn(async move {
            let mut sink = FramedWrite::new(writer, codec);
            while let Some(envelope) = rx.recv().await {
                match sink.send(envelope).await {
                    Ok(()) => {}
                    Err(WireError::Io(e)) => {
                        tracing::debug!(conn = id, error = %e, "Write failed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(conn = id, error = %e, "Dropping unframeable message");
                    }
                }
            }
            shared.detach(id);
        });

        let shared = Arc::clone(self);
        let codec = PeerCodec::new(self.config.max_frame_size);
        let capacity = self.config.read_buffer_size.max(1024);
        self.handle.spawn(async move {
            let mut frames = FramedRead::with_capacity(reader, codec, capacity);
            while let Some(next) = frames.next().await {
                match next {
                    Ok(envelope) => {
                        if let Some(events) = shared.events() {
                            events.on_received(id, envelope);
                        }
                    }
                    Err(WireError::Io(e)) => {
                        tracing::debug!(conn = id, error = %e, "Read failed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(conn = id, error = %e, "Dropping connection after bad frame");
                        break;
                    }
                }
            }
            shared.detach(id);
        });
    }

    /// Marks `id` unusable. Inbound connections are forgotten entirely.
    fn detach(&self, id: ConnectionId) {
        let was_live = {
            let mut connections = lock(&self.connections);
            match connections.get_mut(&id) {
                Some(conn) if conn.outbound => conn.writer.take().is_some(),
                Some(_) => connections.remove(&id).is_some(),
                None => false,
            }
        };
        if was_live && !self.closed.load(Ordering::Acquire) {
            tracing::debug!(conn = id, "Connection closed");
            if let Some(events) = self.events() {
                events.on_disconnected(id);
            }
        }
    }

    /// Dials `addr` until it answers, backing off exponentially.
    fn dial(self: &Arc<Self>, id: ConnectionId, addr: PeerAddr) {
        let shared = Arc::clone(self);
        self.handle.spawn(async move {
            let mut backoff = shared.config.initial_backoff;
            loop {
                if shared.closed.load(Ordering::Acquire) {
                    return;
                }
                match TcpStream::connect((addr.host.as_str(), addr.port)).await {
                    Ok(stream) => {
                        tracing::debug!(conn = id, peer = %addr, "Connected");
                        shared.attach(id, stream);
                        if let Some(events) = shared.events() {
                            events.on_connected(id);
                        }
                        return;
                    }
                    Err(e) => {
                        tracing::trace!(
                            conn = id,
                            peer = %addr,
                            error = %e,
                            backoff_ms = backoff.as_millis() as u64,
                            "Connect failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff, shared.config.max_backoff);
                    }
                }
            }
        });
    }
}

/// Doubles `current`, capped at `max`.
fn next_backoff(current: Duration, max: Duration) -> Duration {
    std::cmp::min(max, current.saturating_mul(2))
}

impl Transport for TcpTransport {
    fn start(&self, events: Arc<dyn TransportEvents>) -> Result<(), NetworkError> {
        let listener = lock(&self.listener)
            .take()
            .ok_or_else(|| NetworkError::Bind("transport already started".to_string()))?;
        let _ = self.shared.events.set(events);

        let _guard = self.shared.handle.enter();
        let listener = TcpListener::from_std(listener).map_err(|e| NetworkError::Bind(e.to_string()))?;
        let shared = Arc::clone(&self.shared);
        self.shared.handle.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
                        lock(&shared.connections).insert(
                            id,
                            Connection {
                                addr: PeerAddr::new(remote.ip().to_string(), remote.port()),
                                outbound: false,
                                dialing: false,
                                writer: None,
                            },
                        );
                        shared.attach(id, stream);
                        if let Some(events) = shared.events() {
                            events.on_accepted(id);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(shared.config.initial_backoff).await;
                    }
                }
            }
        });
        Ok(())
    }

    fn find_or_create(&self, host: &str, port: u16) -> ConnectionId {
        let addr = PeerAddr::new(host, port);
        let mut connections = lock(&self.shared.connections);
        let existing = connections
            .iter_mut()
            .find(|(_, conn)| conn.outbound && conn.addr == addr);
        if let Some((&id, conn)) = existing {
            if conn.writer.is_none() && !conn.dialing {
                conn.dialing = true;
                drop(connections);
                self.shared.dial(id, addr);
            }
            return id;
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        connections.insert(
            id,
            Connection {
                addr: addr.clone(),
                outbound: true,
                dialing: true,
                writer: None,
            },
        );
        drop(connections);
        self.shared.dial(id, addr);
        id
    }

    fn is_usable(&self, conn: ConnectionId) -> bool {
        lock(&self.shared.connections)
            .get(&conn)
            .is_some_and(|conn| conn.writer.is_some())
    }

    fn send(&self, conn: ConnectionId, envelope: Envelope) -> Result<(), NetworkError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(NetworkError::Closed);
        }
        let connections = lock(&self.shared.connections);
        let entry = connections.get(&conn).ok_or(NetworkError::Unknown(conn))?;
        let writer = entry.writer.as_ref().ok_or(NetworkError::NotConnected(conn))?;
        writer.send(envelope).map_err(|_| NetworkError::NotConnected(conn))
    }

    fn connection_info(&self, conn: ConnectionId) -> Option<PeerAddr> {
        lock(&self.shared.connections).get(&conn).map(|conn| conn.addr.clone())
    }

    fn local_port(&self) -> u16 {
        self.shared.port
    }

    fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.shared.connections).clear();
        if let Some(runtime) = lock(&self.runtime).take() {
            runtime.shutdown_background();
        }
        tracing::info!(port = self.shared.port, "TCP transport stopped");
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
