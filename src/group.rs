//! Groups
//!
//! A group is one replicated log: its membership, consensus core, journal,
//! state machine, request and peer-pacing queues, and the batching
//! pipeline. The group identity is its canonical cluster string
//! (`host:port,host:port,...`); a member's node id is its position in it.

use crate::consensus::{Consensus, ConsensusError};
use crate::engine::EngineError;
use crate::journal::{self, FileJournal, Journal, MemoryJournal};
use crate::network::{codec::MAX_STRING_LEN, PeerAddr};
use crate::pipeline::Pipeline;
use crate::raft::{Entry, HardState, LogIndex, NodeId, RaftConfig, RaftCore, Role, Term};
use crate::state_machine::StateMachine;
use crate::tasker::EachTasker;
use crate::waiter::IndexWaiters;
use crate::wake::{lock, Wake};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

// ============================================================================
// CLUSTER CONFIGURATION
// ============================================================================

/// Errors parsing a cluster spec.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Cluster spec lists no peers")]
    Empty,
    #[error("Invalid peer {0:?}, expected host:port")]
    InvalidPeer(String),
    #[error("Self index {index} out of range for {peers} peers")]
    SelfIndexOutOfRange { index: usize, peers: usize },
    #[error("Cluster identity of {len} bytes exceeds {max}")]
    IdentityTooLong { len: usize, max: usize },
}

/// One member of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Peer {
    pub id: NodeId,
    pub addr: PeerAddr,
}

/// Ordered group membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    peers: Vec<Peer>,
}

impl ClusterConfig {
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        spec.parse()
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peer(&self, id: NodeId) -> Option<&Peer> {
        usize::try_from(id).ok().and_then(|i| self.peers.get(i))
    }

    /// Node id of the member listening on `addr`.
    pub fn find(&self, addr: &PeerAddr) -> Option<NodeId> {
        self.peers.iter().find(|peer| peer.addr == *addr).map(|peer| peer.id)
    }

    pub fn member_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|peer| peer.id).collect()
    }

    /// Canonical spec string, used as the group identity.
    pub fn identity(&self) -> String {
        self.peers
            .iter()
            .map(|peer| peer.addr.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromStr for ClusterConfig {
    type Err = ConfigError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let peers = spec
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .enumerate()
            .map(|(position, part)| {
                let (host, port) = part
                    .rsplit_once(':')
                    .ok_or_else(|| ConfigError::InvalidPeer(part.to_string()))?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| ConfigError::InvalidPeer(part.to_string()))?;
                if host.is_empty() {
                    return Err(ConfigError::InvalidPeer(part.to_string()));
                }
                Ok(Peer {
                    id: position as NodeId,
                    addr: PeerAddr::new(host, port),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if peers.is_empty() {
            return Err(ConfigError::Empty);
        }
        let config = Self { peers };
        // The identity travels in every frame behind a u16 length.
        let len = config.identity().len();
        if len > MAX_STRING_LEN {
            return Err(ConfigError::IdentityTooLong {
                len,
                max: MAX_STRING_LEN,
            });
        }
        Ok(config)
    }
}

// ============================================================================
// GROUP OPTIONS
// ============================================================================

/// Journal backend selected for a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JournalKind {
    #[default]
    Memory,
    File,
    Sled,
}

/// Inputs a custom consensus factory receives.
#[derive(Debug, Clone)]
pub struct ConsensusSetup {
    pub node_id: NodeId,
    pub members: Vec<NodeId>,
    pub config: RaftConfig,
    pub hard_state: HardState,
    pub log: Vec<Entry>,
}

/// Builds the consensus core for a group.
pub type ConsensusFactory = Box<dyn FnOnce(ConsensusSetup) -> Box<dyn Consensus> + Send>;

/// Per-group arguments of [`crate::Engine::add_group`].
pub struct GroupOptions {
    cluster: String,
    self_index: usize,
    journal_path: Option<PathBuf>,
    journal_size_hint: u64,
    journal_kind: JournalKind,
    journal: Option<Arc<dyn Journal>>,
    consensus: Option<ConsensusFactory>,
}

impl fmt::Debug for GroupOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupOptions")
            .field("cluster", &self.cluster)
            .field("self_index", &self.self_index)
            .field("journal_path", &self.journal_path)
            .field("journal_kind", &self.journal_kind)
            .field("custom_journal", &self.journal.is_some())
            .field("custom_consensus", &self.consensus.is_some())
            .finish()
    }
}

impl GroupOptions {
    /// Options for membership `cluster`, running as member `self_index`.
    pub fn new(cluster: impl Into<String>, self_index: usize) -> Self {
        Self {
            cluster: cluster.into(),
            self_index,
            journal_path: None,
            journal_size_hint: 0,
            journal_kind: JournalKind::Memory,
            journal: None,
            consensus: None,
        }
    }

    /// Stores the journal at `path` with the given backend.
    pub fn journal_path(mut self, kind: JournalKind, path: impl Into<PathBuf>) -> Self {
        self.journal_kind = kind;
        self.journal_path = Some(path.into());
        self
    }

    /// Backend sizing hint in bytes (sled cache capacity).
    pub fn journal_size_hint(mut self, bytes: u64) -> Self {
        self.journal_size_hint = bytes;
        self
    }

    /// Uses a preconstructed journal instead of building one.
    pub fn journal(mut self, journal: Arc<dyn Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Replaces the bundled [`RaftCore`].
    pub fn consensus<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(ConsensusSetup) -> Box<dyn Consensus> + Send + 'static,
    {
        self.consensus = Some(Box::new(factory));
        self
    }

    /// Identity of the group these options describe.
    pub fn identity(&self) -> Result<String, ConfigError> {
        ClusterConfig::parse(&self.cluster).map(|config| config.identity())
    }

    fn build_journal(&mut self) -> Result<Arc<dyn Journal>, EngineError> {
        if let Some(journal) = self.journal.take() {
            return Ok(journal);
        }
        let path = || {
            self.journal_path
                .clone()
                .ok_or_else(|| EngineError::InvalidConfig(format!("{:?} journal needs a path", self.journal_kind)))
        };
        match self.journal_kind {
            JournalKind::Memory => Ok(Arc::new(MemoryJournal::new())),
            JournalKind::File => Ok(Arc::new(FileJournal::new(path()?))),
            #[cfg(feature = "sled")]
            JournalKind::Sled => {
                let mut journal = journal::SledJournal::new(path()?);
                if self.journal_size_hint > 0 {
                    journal = journal.with_cache_capacity(self.journal_size_hint);
                }
                Ok(Arc::new(journal))
            }
            #[cfg(not(feature = "sled"))]
            JournalKind::Sled => Err(EngineError::InvalidConfig(
                "sled journal requires the `sled` feature".to_string(),
            )),
        }
    }
}

// ============================================================================
// GROUP
// ============================================================================

/// Point-in-time view of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStatus {
    pub identity: String,
    pub node_id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub leader_addr: Option<PeerAddr>,
    pub commit_index: LogIndex,
    pub applied_index: LogIndex,
    pub last_index: LogIndex,
}

/// Mutable group state, touched only on the engine thread.
pub(crate) struct GroupState {
    pub consensus: Box<dyn Consensus>,
    pub pipeline: Pipeline,
}

/// One hosted replicated log.
pub struct Group {
    identity: String,
    node_id: NodeId,
    config: ClusterConfig,
    journal: Arc<dyn Journal>,
    machine: Arc<dyn StateMachine>,
    requests: EachTasker,
    peer_inbox: EachTasker,
    waiters: IndexWaiters,
    closed: AtomicBool,
    state: Mutex<GroupState>,
    status: Mutex<GroupStatus>,
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("identity", &self.identity)
            .field("node_id", &self.node_id)
            .field("journal", &self.journal.name())
            .field("machine", &self.machine.name())
            .finish_non_exhaustive()
    }
}

impl Group {
    /// Opens the journal, recovers the log and builds the consensus core.
    /// Queues ring `bell`, the engine loop's doorbell.
    pub fn open(
        mut options: GroupOptions,
        machine: Arc<dyn StateMachine>,
        bell: Arc<Wake>,
        raft: &RaftConfig,
    ) -> Result<Self, EngineError> {
        let config = ClusterConfig::parse(&options.cluster)?;
        if options.self_index >= config.len() {
            return Err(ConfigError::SelfIndexOutOfRange {
                index: options.self_index,
                peers: config.len(),
            }
            .into());
        }
        let node_id = options.self_index as NodeId;
        let identity = config.identity();

        let journal = options.build_journal()?;
        journal.open()?;
        let hard_state = journal::load_hard_state(journal.as_ref())?;
        let log = journal::load_log(journal.as_ref())?;

        tracing::info!(
            group = %identity,
            node_id,
            journal = journal.name(),
            entries = log.len(),
            term = hard_state.term,
            "Opening group"
        );

        let consensus: Box<dyn Consensus> = match options.consensus.take() {
            Some(factory) => factory(ConsensusSetup {
                node_id,
                members: config.member_ids(),
                config: raft.clone(),
                hard_state,
                log,
            }),
            None => {
                let mut core = RaftCore::new(node_id, config.member_ids(), raft.clone());
                core.restore(hard_state, log);
                Box::new(core)
            }
        };

        let status = GroupStatus {
            identity: identity.clone(),
            node_id,
            role: consensus.role(),
            term: consensus.term(),
            leader: consensus.leader(),
            leader_addr: None,
            commit_index: consensus.commit_index(),
            applied_index: consensus.applied_index(),
            last_index: consensus.last_index(),
        };

        Ok(Self {
            identity,
            node_id,
            config,
            journal,
            machine,
            requests: EachTasker::new(Arc::clone(&bell)),
            peer_inbox: EachTasker::new(bell),
            waiters: IndexWaiters::new(),
            closed: AtomicBool::new(false),
            state: Mutex::new(GroupState {
                consensus,
                pipeline: Pipeline::new(),
            }),
            status: Mutex::new(status),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    pub fn machine(&self) -> &Arc<dyn StateMachine> {
        &self.machine
    }

    /// Client request queue, coalescing adjacent requests of one kind.
    pub fn requests(&self) -> &EachTasker {
        &self.requests
    }

    /// Incoming appends, paused while a follower batch is being persisted.
    pub fn peer_inbox(&self) -> &EachTasker {
        &self.peer_inbox
    }

    pub fn waiters(&self) -> &IndexWaiters {
        &self.waiters
    }

    pub fn status(&self) -> GroupStatus {
        lock(&self.status).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, GroupState> {
        lock(&self.state)
    }

    /// Address of member `id`.
    pub fn peer_addr(&self, id: NodeId) -> Option<PeerAddr> {
        self.config.peer(id).map(|peer| peer.addr.clone())
    }

    /// Translates a consensus error for the public API.
    pub fn map_error(&self, error: ConsensusError) -> EngineError {
        match error {
            ConsensusError::NotLeader { leader } => EngineError::NotLeader {
                leader: leader.and_then(|id| self.peer_addr(id)),
            },
            ConsensusError::SnapshotInProgress => EngineError::SnapshotInProgress,
            ConsensusError::Persistence(reason) => EngineError::PersistenceFailure(reason),
        }
    }

    pub(crate) fn refresh_status(&self, consensus: &dyn Consensus) {
        let leader = consensus.leader();
        let mut status = lock(&self.status);
        status.role = consensus.role();
        status.term = consensus.term();
        status.leader = leader;
        status.leader_addr = leader.and_then(|id| self.peer_addr(id));
        status.commit_index = consensus.commit_index();
        status.applied_index = consensus.applied_index();
        status.last_index = consensus.last_index();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::NoOpStateMachine;

    fn open(options: GroupOptions) -> Result<Group, EngineError> {
        Group::open(
            options,
            Arc::new(NoOpStateMachine),
            Arc::new(Wake::new()),
            &RaftConfig::default(),
        )
    }

    #[test]
    fn test_parse_cluster_spec() {
        let config = ClusterConfig::parse("10.0.0.1:7000, 10.0.0.2:7001,10.0.0.3:7002").unwrap();
        assert_eq!(config.len(), 3);
        assert_eq!(config.peer(1).unwrap().addr, PeerAddr::new("10.0.0.2", 7001));
        assert_eq!(config.find(&PeerAddr::new("10.0.0.3", 7002)), Some(2));
        assert_eq!(config.identity(), "10.0.0.1:7000,10.0.0.2:7001,10.0.0.3:7002");
        assert_eq!(config.member_ids(), vec![0, 1, 2]);
    }

    #[test]
    fn test_parse_rejects_bad_specs() {
        assert_eq!(ClusterConfig::parse(" , "), Err(ConfigError::Empty));
        assert_eq!(
            ClusterConfig::parse("10.0.0.1"),
            Err(ConfigError::InvalidPeer("10.0.0.1".to_string()))
        );
        assert!(matches!(
            ClusterConfig::parse("10.0.0.1:http"),
            Err(ConfigError::InvalidPeer(_))
        ));
        assert!(matches!(ClusterConfig::parse(":7000"), Err(ConfigError::InvalidPeer(_))));
    }

    #[test]
    fn test_parse_rejects_identity_too_long_for_frames() {
        let spec = (0..5000)
            .map(|n| format!("node-{n}.example.internal:7000"))
            .collect::<Vec<_>>()
            .join(",");
        match ClusterConfig::parse(&spec) {
            Err(ConfigError::IdentityTooLong { len, max }) => {
                assert!(len > max);
                assert_eq!(max, u16::MAX as usize);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let err = open(GroupOptions::new(spec, 0)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)), "got {err:?}");
    }

    #[test]
    fn test_open_rejects_self_index() {
        let err = open(GroupOptions::new("127.0.0.1:7000", 1)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[test]
    fn test_file_journal_needs_path() {
        let mut options = GroupOptions::new("127.0.0.1:7000", 0);
        options.journal_kind = JournalKind::File;
        assert!(matches!(open(options), Err(EngineError::InvalidConfig(_))));
    }

    #[test]
    fn test_open_recovers_journal() {
        let journal = Arc::new(MemoryJournal::new());
        journal.open().unwrap();
        journal::persist_batch(journal.as_ref(), 1, &[Entry::new(2, "a"), Entry::new(2, "b")]).unwrap();
        journal::persist_hard_state(journal.as_ref(), 2, Some(0)).unwrap();

        let group = open(GroupOptions::new("127.0.0.1:7000", 0).journal(journal)).unwrap();
        let status = group.status();
        assert_eq!(status.term, 2);
        assert_eq!(status.last_index, 2);
        assert_eq!(status.role, Role::Follower);
        assert_eq!(group.identity(), "127.0.0.1:7000");
    }

    #[test]
    fn test_map_error_resolves_leader_address() {
        let group = open(GroupOptions::new("127.0.0.1:7000,127.0.0.1:7001", 0)).unwrap();
        assert_eq!(
            group.map_error(ConsensusError::NotLeader { leader: Some(1) }),
            EngineError::NotLeader {
                leader: Some(PeerAddr::new("127.0.0.1", 7001))
            }
        );
        assert_eq!(
            group.map_error(ConsensusError::Persistence("disk".into())),
            EngineError::PersistenceFailure("disk".into())
        );
    }
}
