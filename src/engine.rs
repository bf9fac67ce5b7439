//! Engine
//!
//! The public handle of the runtime. An engine owns one transport, one
//! engine thread that makes every consensus call, and two worker pools
//! (journal and apply). Caller threads never touch a consensus core: they
//! enqueue a task and block on a private reply until the engine answers.

use crate::dispatch::Dispatcher;
use crate::group::{ConfigError, Group, GroupOptions, GroupStatus};
use crate::journal::JournalError;
use crate::metrics::EngineMetrics;
use crate::multi::GroupRegistry;
use crate::network::{self, NetworkError, PeerAddr, PeerMessage, Transport, TransportEvents};
use crate::pipeline::{ReadRequest, WriteRequest};
use crate::raft::{LogIndex, RaftConfig};
use crate::state_machine::StateMachine;
use crate::task::{reply_pair, ReplyError, Task, TaskKind};
use crate::tasker::OnceTasker;
use crate::waiter::{entry_key, WaitOutcome};
use crate::wake::{lock, Wake};
use crate::worker::{abort_on_panic, WorkerPool};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Runtime sizing and timeouts.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Threads persisting log batches
    pub journal_workers: usize,
    /// Threads running state machine callbacks
    pub apply_workers: usize,
    /// Upper bound between two consensus ticks
    pub tick_interval: Duration,
    /// How long a write waits for its entry to be applied
    pub commit_timeout: Duration,
    /// How long a read barrier may stay unconfirmed
    pub read_timeout: Duration,
    /// Consensus timing handed to every group
    pub raft: RaftConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            journal_workers: 32,
            apply_workers: 32,
            tick_interval: Duration::from_millis(10),
            commit_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            raft: RaftConfig::default(),
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors returned by the public API.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Not leader (leader: {leader:?})")]
    NotLeader { leader: Option<PeerAddr> },
    #[error("Timed out waiting for index {index}")]
    TimedOut { index: LogIndex },
    #[error("Snapshot in progress")]
    SnapshotInProgress,
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),
    #[error("Group not found: {0}")]
    GroupNotFound(String),
    #[error("Group already exists: {0}")]
    GroupExists(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Journal error: {0}")]
    Journal(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Engine is shut down")]
    Shutdown,
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        EngineError::InvalidConfig(e.to_string())
    }
}

impl From<JournalError> for EngineError {
    fn from(e: JournalError) -> Self {
        EngineError::Journal(e.to_string())
    }
}

impl From<NetworkError> for EngineError {
    fn from(e: NetworkError) -> Self {
        EngineError::Network(e.to_string())
    }
}

// ============================================================================
// SHARED STATE
// ============================================================================

/// State shared by the handle, the engine thread and transport callbacks.
pub(crate) struct EngineShared {
    pub config: EngineConfig,
    pub bell: Arc<Wake>,
    pub queue: Arc<OnceTasker>,
    pub registry: Arc<GroupRegistry>,
    pub transport: Arc<dyn Transport>,
    pub metrics: EngineMetrics,
    pub running: AtomicBool,
}

impl EngineShared {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Transport callbacks. Holds only the queues, so the transport never keeps
/// the engine alive.
struct EngineEvents {
    queue: Arc<OnceTasker>,
    registry: Arc<GroupRegistry>,
}

impl TransportEvents for EngineEvents {
    fn on_connected(&self, conn: network::ConnectionId) {
        self.queue.give(Task::engine(TaskKind::PeerConnected { conn }));
    }

    fn on_accepted(&self, conn: network::ConnectionId) {
        self.queue.give(Task::engine(TaskKind::PeerConnected { conn }));
    }

    fn on_disconnected(&self, conn: network::ConnectionId) {
        tracing::debug!(conn, "Peer connection lost");
    }

    fn on_received(&self, _conn: network::ConnectionId, envelope: network::Envelope) {
        let network::Envelope {
            identity,
            from,
            message,
        } = envelope;

        let kind = match message {
            PeerMessage::AppendEntries(request) => {
                // Appends are paced per group while a follower batch persists.
                match self.registry.get(&identity) {
                    Some(group) => group
                        .peer_inbox()
                        .give(Task::new(identity, TaskKind::NetAppend { from, request })),
                    None => tracing::debug!(group = %identity, from, "Append for unknown group"),
                }
                return;
            }
            PeerMessage::AppendEntriesResponse(response) => TaskKind::NetAppendResponse { from, response },
            PeerMessage::Vote(request) => TaskKind::NetVote { from, request },
            PeerMessage::VoteResponse(response) => TaskKind::NetVoteResponse { from, response },
            message => TaskKind::NetControl { from, message },
        };
        self.queue.give(Task::new(identity, kind));
    }
}

// ============================================================================
// ENGINE
// ============================================================================

/// Handle to a running engine.
pub struct Engine {
    shared: Arc<EngineShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("port", &self.shared.transport.local_port())
            .field("groups", &self.shared.registry.len())
            .field("running", &self.shared.is_running())
            .finish()
    }
}

impl Engine {
    /// Starts an engine on `transport`: begins accepting peers, spawns the
    /// worker pools and the engine thread.
    pub fn start(config: EngineConfig, transport: Arc<dyn Transport>) -> Result<Self, EngineError> {
        if config.tick_interval.is_zero() {
            return Err(EngineError::InvalidConfig("tick interval must be positive".to_string()));
        }

        let bell = Arc::new(Wake::new());
        let queue = Arc::new(OnceTasker::new(Arc::clone(&bell)));
        let registry = Arc::new(GroupRegistry::new());
        let metrics = EngineMetrics::new(transport.local_port().to_string());

        transport.start(Arc::new(EngineEvents {
            queue: Arc::clone(&queue),
            registry: Arc::clone(&registry),
        }))?;

        let shared = Arc::new(EngineShared {
            config,
            bell,
            queue,
            registry,
            transport,
            metrics,
            running: AtomicBool::new(true),
        });

        let spawned = Self::spawn_pools(&shared).and_then(|(journal_pool, apply_pool)| {
            let mut dispatcher = Dispatcher::new(Arc::clone(&shared), journal_pool, apply_pool);
            thread::Builder::new()
                .name("multiraft-engine".to_string())
                .spawn(move || abort_on_panic(|| dispatcher.run()))
                .map_err(|e| EngineError::InvalidConfig(format!("failed to spawn engine thread: {e}")))
        });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                shared.running.store(false, Ordering::Release);
                shared.transport.shutdown();
                return Err(e);
            }
        };

        tracing::info!(
            port = shared.transport.local_port(),
            journal_workers = shared.config.journal_workers,
            apply_workers = shared.config.apply_workers,
            "Engine started"
        );

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Starts an engine with default settings on a TCP transport.
    #[cfg(feature = "net")]
    pub fn bind(port: u16) -> Result<Self, EngineError> {
        let transport = network::tcp::TcpTransport::bind(port)?;
        Self::start(EngineConfig::default(), Arc::new(transport))
    }

    fn spawn_pools(shared: &Arc<EngineShared>) -> Result<(WorkerPool, WorkerPool), EngineError> {
        let spawn_error = |e: std::io::Error| EngineError::InvalidConfig(format!("failed to spawn workers: {e}"));
        let journal_pool = WorkerPool::new("multiraft-journal", shared.config.journal_workers, |_| {
            Dispatcher::journal_handler(shared)
        })
        .map_err(spawn_error)?;
        let apply_pool = WorkerPool::new("multiraft-apply", shared.config.apply_workers, |_| {
            Dispatcher::apply_handler(shared)
        })
        .map_err(spawn_error)?;
        Ok((journal_pool, apply_pool))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.shared.metrics
    }

    /// Port the transport listens on.
    pub fn local_port(&self) -> u16 {
        self.shared.transport.local_port()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    // ========================================================================
    // GROUPS
    // ========================================================================

    /// Opens and registers a group. The journal is recovered on the calling
    /// thread; the group starts taking part in consensus on the next tick.
    pub fn add_group(&self, options: GroupOptions, machine: Arc<dyn StateMachine>) -> Result<Arc<Group>, EngineError> {
        self.ensure_running()?;
        let identity = options.identity()?;
        if self.shared.registry.contains(&identity) {
            return Err(EngineError::GroupExists(identity));
        }

        let group = Arc::new(Group::open(
            options,
            machine,
            Arc::clone(&self.shared.bell),
            &self.shared.config.raft,
        )?);

        let (reply, pending) = reply_pair();
        self.give(Task::new(
            identity.clone(),
            TaskKind::GroupAdd {
                group: Arc::clone(&group),
                reply,
            },
        ));
        match pending.wait() {
            Ok(Ok(())) => Ok(group),
            Ok(Err(e)) => {
                if let Err(close) = group.journal().close() {
                    tracing::warn!(group = %identity, error = %close, "Failed to close journal");
                }
                Err(e)
            }
            Err(_) => Err(EngineError::Shutdown),
        }
    }

    /// Removes a group. Requests still in flight fail with
    /// [`EngineError::GroupNotFound`].
    pub fn del_group(&self, identity: &str) -> Result<(), EngineError> {
        self.ensure_running()?;
        let (reply, pending) = reply_pair();
        self.give(Task::new(identity, TaskKind::GroupDel { reply }));
        pending.wait().unwrap_or(Err(EngineError::Shutdown))
    }

    pub fn group(&self, identity: &str) -> Option<Arc<Group>> {
        self.shared.registry.get(identity)
    }

    /// Identities of the hosted groups, sorted.
    pub fn groups(&self) -> Vec<String> {
        self.shared.registry.identities()
    }

    pub fn group_status(&self, identity: &str) -> Result<GroupStatus, EngineError> {
        self.lookup(identity).map(|group| group.status())
    }

    // ========================================================================
    // REQUESTS
    // ========================================================================

    /// Replicates `payload` through `identity` and blocks until it has been
    /// applied locally. Returns the entry's log index.
    pub fn submit_write(&self, identity: &str, payload: impl Into<Vec<u8>>) -> Result<LogIndex, EngineError> {
        let group = self.lookup(identity)?;
        let (reply, pending) = reply_pair();
        self.enqueue(
            &group,
            TaskKind::RequestWrite(WriteRequest {
                payload: payload.into(),
                reply,
            }),
        );

        let accepted = pending.wait().map_err(|e| self.reply_error(&group, e))??;
        let key = entry_key(accepted.index, accepted.term);
        match group
            .waiters()
            .await_and_remove(&key, &accepted.waiter, self.shared.config.commit_timeout)
        {
            WaitOutcome::Committed => Ok(accepted.index),
            WaitOutcome::Closed => Err(self.reply_error(&group, ReplyError::Closed)),
            WaitOutcome::TimedOut => {
                self.shared.metrics.inc_commit_timeouts();
                tracing::warn!(group = %identity, index = accepted.index, "Commit wait timed out");
                Err(EngineError::TimedOut { index: accepted.index })
            }
        }
    }

    /// Runs a linearizable read through `identity`'s state machine.
    pub fn submit_read(&self, identity: &str, payload: impl Into<Vec<u8>>) -> Result<Vec<u8>, EngineError> {
        let group = self.lookup(identity)?;
        let (reply, pending) = reply_pair();
        self.enqueue(
            &group,
            TaskKind::RequestRead(ReadRequest {
                payload: payload.into(),
                reply,
            }),
        );
        pending.wait().map_err(|e| self.reply_error(&group, e))?
    }

    fn lookup(&self, identity: &str) -> Result<Arc<Group>, EngineError> {
        self.ensure_running()?;
        self.shared
            .registry
            .get(identity)
            .ok_or_else(|| EngineError::GroupNotFound(identity.to_string()))
    }

    /// Queues a client request on the group's merge queue.
    fn enqueue(&self, group: &Group, kind: TaskKind) {
        group.requests().give(Task::mergeable(group.identity(), kind));
        if group.is_closed() {
            // Raced with removal: drop what teardown may have missed so the
            // responders report it.
            drop(group.requests().drain());
        }
    }

    /// Queues an engine-level task.
    fn give(&self, task: Task) {
        self.shared.queue.give(task);
        if !self.shared.is_running() {
            drop(self.shared.queue.take_all());
        }
    }

    fn reply_error(&self, group: &Group, error: ReplyError) -> EngineError {
        match error {
            ReplyError::Closed if group.is_closed() && self.shared.is_running() => {
                EngineError::GroupNotFound(group.identity().to_string())
            }
            ReplyError::Closed | ReplyError::TimedOut => EngineError::Shutdown,
        }
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.shared.is_running() {
            Ok(())
        } else {
            Err(EngineError::Shutdown)
        }
    }

    // ========================================================================
    // SHUTDOWN
    // ========================================================================

    /// Stops the engine thread, fails every pending request with
    /// [`EngineError::Shutdown`], closes all journals and the transport.
    /// Idempotent.
    pub fn shutdown(&self) {
        let Some(handle) = lock(&self.handle).take() else {
            return;
        };
        let started = Instant::now();
        self.shared.running.store(false, Ordering::Release);
        self.shared.bell.signal();
        if handle.join().is_err() {
            tracing::error!("Engine thread panicked");
        }
        self.shared.transport.shutdown();
        drop(self.shared.queue.take_all());
        tracing::info!(
            port = self.shared.transport.local_port(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Engine stopped"
        );
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
