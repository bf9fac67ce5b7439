//! Tasks
//!
//! Every hand-off between threads is a [`Task`]: produced on one thread,
//! owned by exactly one queue while in flight, and consumed by the thread
//! that dispatches it. Moving a task into `give` is what enforces the
//! single-owner rule.

use crate::consensus::{AppendContext, RoundId};
use crate::engine::EngineError;
use crate::group::Group;
use crate::journal::{Journal, JournalError};
use crate::network::{AppendRequest, AppendResponse, ConnectionId, PeerMessage, VoteRequest, VoteResponse};
use crate::pipeline::{ReadRequest, WriteRequest};
use crate::raft::{Entry, LogIndex, NodeId, Term};
use crate::state_machine::StateMachine;
use crate::wake::{lock, Wake};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// TASK KINDS
// ============================================================================

/// Discriminant of a [`TaskKind`], used for merging and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    GroupAdd,
    GroupDel,
    RequestWrite,
    RequestRead,
    LogRetain,
    LogRetainDone,
    LogAppend,
    LogAppendDone,
    LogApply,
    LogApplyDone,
    NetAppend,
    NetAppendResponse,
    NetVote,
    NetVoteResponse,
    NetControl,
    PeerConnected,
}

/// Payload of a task.
pub enum TaskKind {
    GroupAdd {
        group: Arc<Group>,
        reply: Responder<Result<(), EngineError>>,
    },
    GroupDel {
        reply: Responder<Result<(), EngineError>>,
    },
    RequestWrite(WriteRequest),
    RequestRead(ReadRequest),
    LogRetain(RetainJob),
    LogRetainDone(RetainDone),
    LogAppend(AppendJob),
    LogAppendDone(AppendDone),
    LogApply(ApplyJob),
    LogApplyDone(ApplyDone),
    NetAppend {
        from: NodeId,
        request: AppendRequest,
    },
    NetAppendResponse {
        from: NodeId,
        response: AppendResponse,
    },
    NetVote {
        from: NodeId,
        request: VoteRequest,
    },
    NetVoteResponse {
        from: NodeId,
        response: VoteResponse,
    },
    /// Handshake and leave traffic.
    NetControl {
        from: NodeId,
        message: PeerMessage,
    },
    PeerConnected {
        conn: ConnectionId,
    },
}

impl TaskKind {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskKind::GroupAdd { .. } => TaskType::GroupAdd,
            TaskKind::GroupDel { .. } => TaskType::GroupDel,
            TaskKind::RequestWrite(_) => TaskType::RequestWrite,
            TaskKind::RequestRead(_) => TaskType::RequestRead,
            TaskKind::LogRetain(_) => TaskType::LogRetain,
            TaskKind::LogRetainDone(_) => TaskType::LogRetainDone,
            TaskKind::LogAppend(_) => TaskType::LogAppend,
            TaskKind::LogAppendDone(_) => TaskType::LogAppendDone,
            TaskKind::LogApply(_) => TaskType::LogApply,
            TaskKind::LogApplyDone(_) => TaskType::LogApplyDone,
            TaskKind::NetAppend { .. } => TaskType::NetAppend,
            TaskKind::NetAppendResponse { .. } => TaskType::NetAppendResponse,
            TaskKind::NetVote { .. } => TaskType::NetVote,
            TaskKind::NetVoteResponse { .. } => TaskType::NetVoteResponse,
            TaskKind::NetControl { .. } => TaskType::NetControl,
            TaskKind::PeerConnected { .. } => TaskType::PeerConnected,
        }
    }
}

/// Persist a leader-side batch (journal worker).
pub struct RetainJob {
    pub journal: Arc<dyn Journal>,
    pub round: Option<RoundId>,
    pub start: LogIndex,
    pub entries: Vec<Entry>,
}

/// Outcome of a [`RetainJob`] (engine thread).
#[derive(Debug)]
pub struct RetainDone {
    pub round: Option<RoundId>,
    pub start: LogIndex,
    pub count: usize,
    pub term: Term,
    pub result: Result<(), JournalError>,
}

/// Persist entries received from the leader (journal worker).
pub struct AppendJob {
    pub journal: Arc<dyn Journal>,
    pub ctx: AppendContext,
    pub start: LogIndex,
    pub entries: Vec<Entry>,
}

/// Outcome of an [`AppendJob`] (engine thread).
#[derive(Debug)]
pub struct AppendDone {
    pub ctx: AppendContext,
    pub result: Result<(), JournalError>,
}

/// Work for an apply worker.
pub enum ApplyJob {
    Writes {
        machine: Arc<dyn StateMachine>,
        journal: Arc<dyn Journal>,
        start: LogIndex,
        entries: Vec<Entry>,
    },
    Reads {
        machine: Arc<dyn StateMachine>,
        deferred: Vec<ReadRequest>,
        fresh: Vec<ReadRequest>,
    },
}

/// Committed entries from `start` were applied; `terms` holds one term per
/// entry, in index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyDone {
    pub start: LogIndex,
    pub terms: Vec<Term>,
}

// ============================================================================
// TASK
// ============================================================================

/// A unit of work owned by one queue at a time.
pub struct Task {
    identity: String,
    mergeable: bool,
    kind: TaskKind,
    merged: Vec<Task>,
}

impl Task {
    /// Creates a task bound to the group `identity`.
    pub fn new(identity: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            identity: identity.into(),
            mergeable: false,
            kind,
            merged: Vec::new(),
        }
    }

    /// Creates a task that an each-queue may coalesce with its neighbours.
    pub fn mergeable(identity: impl Into<String>, kind: TaskKind) -> Self {
        Self {
            mergeable: true,
            ..Self::new(identity, kind)
        }
    }

    /// Creates a task that belongs to the engine rather than to a group.
    pub fn engine(kind: TaskKind) -> Self {
        Self::new(String::new(), kind)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_mergeable(&self) -> bool {
        self.mergeable
    }

    pub fn task_type(&self) -> TaskType {
        self.kind.task_type()
    }

    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    /// Tasks coalesced behind this one, in queue order.
    pub fn merged(&self) -> &[Task] {
        &self.merged
    }

    /// Whether `other` may be coalesced behind this task.
    pub(crate) fn can_absorb(&self, other: &Task) -> bool {
        self.mergeable
            && other.mergeable
            && self.task_type() == other.task_type()
            && self.identity == other.identity
    }

    pub(crate) fn absorb(&mut self, other: Task) {
        debug_assert!(other.merged.is_empty());
        self.merged.push(other);
    }

    /// Splits the task into its identity, payload and coalesced followers.
    pub fn into_parts(self) -> (String, TaskKind, Vec<Task>) {
        (self.identity, self.kind, self.merged)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("identity", &self.identity)
            .field("type", &self.task_type())
            .field("mergeable", &self.mergeable)
            .field("merged", &self.merged.len())
            .finish()
    }
}

// ============================================================================
// ONE-SHOT REPLY
// ============================================================================

/// Why a [`Pending`] reply produced no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
    /// The responder was dropped without answering.
    Closed,
    TimedOut,
}

struct ReplySlot<T> {
    value: Mutex<Option<T>>,
    wake: Wake,
}

/// Sending half of a one-shot reply, carried inside a task.
///
/// Dropping it unanswered wakes the receiver with [`ReplyError::Closed`].
pub struct Responder<T> {
    slot: Option<Arc<ReplySlot<T>>>,
}

/// Receiving half of a one-shot reply, held by the blocked caller.
pub struct Pending<T> {
    slot: Arc<ReplySlot<T>>,
}

/// Creates a connected responder/pending pair.
pub fn reply_pair<T>() -> (Responder<T>, Pending<T>) {
    let slot = Arc::new(ReplySlot {
        value: Mutex::new(None),
        wake: Wake::new(),
    });
    (
        Responder {
            slot: Some(Arc::clone(&slot)),
        },
        Pending { slot },
    )
}

impl<T> Responder<T> {
    /// Stores the value and wakes the receiver.
    pub fn send(mut self, value: T) {
        if let Some(slot) = self.slot.take() {
            *lock(&slot.value) = Some(value);
            slot.wake.signal();
        }
    }
}

impl<T> Drop for Responder<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.wake.signal();
        }
    }
}

impl<T> fmt::Debug for Responder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("answered", &self.slot.is_none())
            .finish()
    }
}

impl<T> Pending<T> {
    /// Blocks until the responder answers or is dropped.
    pub fn wait(self) -> Result<T, ReplyError> {
        self.slot.wake.wait();
        lock(&self.slot.value).take().ok_or(ReplyError::Closed)
    }

    /// Like [`Pending::wait`], bounded by `timeout`.
    pub fn wait_timeout(self, timeout: Duration) -> Result<T, ReplyError> {
        if !self.slot.wake.wait_timeout(timeout) {
            return Err(ReplyError::TimedOut);
        }
        lock(&self.slot.value).take().ok_or(ReplyError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn connected(conn: ConnectionId) -> Task {
        Task::engine(TaskKind::PeerConnected { conn })
    }

    #[test]
    fn test_task_type_and_identity() {
        let task = connected(4);
        assert_eq!(task.task_type(), TaskType::PeerConnected);
        assert_eq!(task.identity(), "");
        assert!(!task.is_mergeable());
    }

    #[test]
    fn test_absorb_requires_same_type_and_group() {
        let head = Task::mergeable("g1", TaskKind::PeerConnected { conn: 1 });
        let same = Task::mergeable("g1", TaskKind::PeerConnected { conn: 2 });
        let other_group = Task::mergeable("g2", TaskKind::PeerConnected { conn: 3 });
        let plain = Task::new("g1", TaskKind::PeerConnected { conn: 4 });

        assert!(head.can_absorb(&same));
        assert!(!head.can_absorb(&other_group));
        assert!(!head.can_absorb(&plain));
    }

    #[test]
    fn test_reply_roundtrip_across_threads() {
        let (responder, pending) = reply_pair::<u64>();
        thread::spawn(move || responder.send(42));
        assert_eq!(pending.wait(), Ok(42));
    }

    #[test]
    fn test_dropped_responder_closes_reply() {
        let (responder, pending) = reply_pair::<u64>();
        drop(responder);
        assert_eq!(pending.wait(), Err(ReplyError::Closed));
    }

    #[test]
    fn test_reply_timeout() {
        let (_responder, pending) = reply_pair::<u64>();
        assert_eq!(
            pending.wait_timeout(Duration::from_millis(10)),
            Err(ReplyError::TimedOut)
        );
    }
}
