//! Consensus Contract
//!
//! The runtime drives a consensus core through [`Consensus`] and receives
//! every side effect back through [`ConsensusIo`]. A core never blocks and
//! never does I/O itself: disk writes and state machine application happen
//! on worker threads and are reported back through the `*_finished` calls.
//!
//! All calls for one group happen on the engine thread.

use crate::journal::JournalError;
use crate::network::{AppendRequest, AppendResponse, PeerMessage, VoteRequest, VoteResponse};
use crate::raft::{Entry, LogIndex, NodeId, Role, Term};
use std::time::Duration;

/// Identifies one client write round.
pub type RoundId = u64;

/// Identifies one read barrier.
pub type BarrierId = u64;

/// Follower-side bookkeeping for entries being persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendContext {
    /// Leader that sent the entries.
    pub leader: NodeId,
    /// Term of the request.
    pub term: Term,
    /// Leader commit index carried by the request.
    pub leader_commit: LogIndex,
    /// First index being written.
    pub start: LogIndex,
    /// Last index covered by the request.
    pub last_index: LogIndex,
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors a consensus core reports to the runtime.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Not leader (known leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },
    #[error("Snapshot in progress")]
    SnapshotInProgress,
    #[error("Persistence failure: {0}")]
    Persistence(String),
}

impl From<JournalError> for ConsensusError {
    fn from(e: JournalError) -> Self {
        ConsensusError::Persistence(e.to_string())
    }
}

// ============================================================================
// HOST INTERFACE
// ============================================================================

/// Side effects requested by a consensus core.
pub trait ConsensusIo {
    /// Sends `message` to peer `to`. Delivery is best effort.
    fn send(&mut self, to: NodeId, message: PeerMessage);

    /// Durably records term and vote before returning.
    fn persist_hard_state(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<(), ConsensusError>;

    /// Persists leader entries starting at `start`. Completion arrives
    /// through [`Consensus::retain_finished`].
    fn retain(&mut self, round: Option<RoundId>, start: LogIndex, entries: Vec<Entry>);

    /// Persists follower entries. Completion arrives through
    /// [`Consensus::append_finished`].
    fn append(&mut self, ctx: AppendContext, entries: Vec<Entry>);

    /// Applies committed entries starting at `start`. Completion arrives
    /// through [`Consensus::apply_finished`].
    fn apply(&mut self, start: LogIndex, entries: Vec<Entry>);

    /// Resolves a read barrier with the index reads must observe.
    fn read_ready(&mut self, barrier: BarrierId, outcome: Result<LogIndex, ConsensusError>);

    /// Notified after every role or term change.
    fn role_changed(&mut self, _role: Role, _term: Term, _leader: Option<NodeId>) {}
}

// ============================================================================
// CONSENSUS TRAIT
// ============================================================================

/// A single-threaded replicated log core.
pub trait Consensus: Send {
    fn node_id(&self) -> NodeId;
    fn role(&self) -> Role;
    fn term(&self) -> Term;
    fn leader(&self) -> Option<NodeId>;
    fn commit_index(&self) -> LogIndex;
    fn applied_index(&self) -> LogIndex;
    fn last_index(&self) -> LogIndex;

    fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// Advances timers by `elapsed`.
    fn tick(&mut self, io: &mut dyn ConsensusIo, elapsed: Duration) -> Result<(), ConsensusError>;

    /// Appends one entry per payload, in order, and starts persisting them.
    /// Returns the index assigned to the first payload.
    fn retain_entries(
        &mut self,
        io: &mut dyn ConsensusIo,
        round: RoundId,
        payloads: Vec<Vec<u8>>,
    ) -> Result<LogIndex, ConsensusError>;

    /// Reports the outcome of an [`ConsensusIo::retain`] request.
    fn retain_finished(
        &mut self,
        io: &mut dyn ConsensusIo,
        start: LogIndex,
        count: usize,
        term: Term,
        result: Result<(), JournalError>,
    ) -> Result<(), ConsensusError>;

    /// Reports the outcome of an [`ConsensusIo::append`] request.
    fn append_finished(
        &mut self,
        io: &mut dyn ConsensusIo,
        ctx: AppendContext,
        result: Result<(), JournalError>,
    ) -> Result<(), ConsensusError>;

    /// Reports that `count` entries starting at `start` were applied.
    fn apply_finished(&mut self, io: &mut dyn ConsensusIo, start: LogIndex, count: usize);

    /// Starts confirming leadership for a linearizable read. The outcome is
    /// delivered through [`ConsensusIo::read_ready`].
    fn read_barrier(&mut self, io: &mut dyn ConsensusIo, barrier: BarrierId) -> Result<(), ConsensusError>;

    fn recv_vote(&mut self, io: &mut dyn ConsensusIo, from: NodeId, request: VoteRequest) -> Result<(), ConsensusError>;

    fn recv_vote_response(
        &mut self,
        io: &mut dyn ConsensusIo,
        from: NodeId,
        response: VoteResponse,
    ) -> Result<(), ConsensusError>;

    fn recv_append(&mut self, io: &mut dyn ConsensusIo, from: NodeId, request: AppendRequest) -> Result<(), ConsensusError>;

    fn recv_append_response(
        &mut self,
        io: &mut dyn ConsensusIo,
        from: NodeId,
        response: AppendResponse,
    ) -> Result<(), ConsensusError>;
}
