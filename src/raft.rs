//! Raft Core
//!
//! Log types shared by the whole crate and [`RaftCore`], the default
//! [`Consensus`] implementation. The core keeps the log in memory and hands
//! every durable write to the host, so it only ever replicates entries the
//! local journal has confirmed.

use crate::consensus::{AppendContext, BarrierId, Consensus, ConsensusError, ConsensusIo, RoundId};
use crate::journal::JournalError;
use crate::metrics::{trace_commit_advanced, trace_role_changed};
use crate::network::{AppendRequest, AppendResponse, PeerMessage, VoteRequest, VoteResponse};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

pub type Term = u64;
pub type NodeId = u64;
pub type LogIndex = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// What a log record carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// An application write.
    #[default]
    Normal,
    /// Written by a new leader at the start of its term. Never applied.
    Blank,
}

impl EntryKind {
    pub fn to_byte(self) -> u8 {
        match self {
            EntryKind::Normal => 0,
            EntryKind::Blank => 1,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(EntryKind::Normal),
            1 => Some(EntryKind::Blank),
            _ => None,
        }
    }
}

/// One replicated log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub term: Term,
    #[serde(default)]
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn new(term: Term, data: impl Into<Vec<u8>>) -> Self {
        Self {
            term,
            kind: EntryKind::Normal,
            data: data.into(),
        }
    }

    pub fn blank(term: Term) -> Self {
        Self {
            term,
            kind: EntryKind::Blank,
            data: Vec::new(),
        }
    }

    pub fn with_kind(term: Term, kind: EntryKind, data: impl Into<Vec<u8>>) -> Self {
        Self {
            term,
            kind,
            data: data.into(),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.kind == EntryKind::Blank
    }
}

/// State that must survive a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub commit_index: LogIndex,
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Raft timing configuration
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Minimum election timeout (randomized between min and max)
    pub election_timeout_min: Duration,
    /// Maximum election timeout
    pub election_timeout_max: Duration,
    /// Heartbeat interval (must be << election timeout)
    pub heartbeat_interval: Duration,
    /// Max entries per AppendEntries message
    pub max_entries_per_rpc: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            max_entries_per_rpc: 100,
        }
    }
}

impl RaftConfig {
    /// Returns a randomized election timeout
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = (self.election_timeout_max.as_millis() as u64).max(min);
        let timeout_ms = rand::rng().random_range(min..=max);
        Duration::from_millis(timeout_ms)
    }
}

// ============================================================================
// RAFT CORE
// ============================================================================

/// Leader view of one follower.
#[derive(Debug, Clone, Copy)]
struct Progress {
    next: LogIndex,
    matched: LogIndex,
}

#[derive(Debug)]
struct ReadBarrier {
    id: BarrierId,
    read_index: LogIndex,
    acks: HashSet<NodeId>,
}

/// Default consensus core.
pub struct RaftCore {
    id: NodeId,
    peers: Vec<NodeId>,
    config: RaftConfig,

    // Persistent state (mirrored to the journal through the host)
    term: Term,
    voted_for: Option<NodeId>,
    log: Vec<Entry>,

    // Volatile state
    role: Role,
    leader: Option<NodeId>,
    /// Highest index confirmed durable by the local journal.
    persisted: LogIndex,
    commit: LogIndex,
    /// Highest index handed to the host for application.
    handed: LogIndex,
    applied: LogIndex,

    elapsed: Duration,
    election_timeout: Duration,
    votes: HashSet<NodeId>,
    progress: HashMap<NodeId, Progress>,
    barriers: Vec<ReadBarrier>,
    /// Reads received before this term's first commit.
    held_reads: Vec<BarrierId>,
}

impl fmt::Debug for RaftCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftCore")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("term", &self.term)
            .field("last_index", &self.last_index())
            .field("commit", &self.commit)
            .finish_non_exhaustive()
    }
}

impl RaftCore {
    /// Creates a core for node `id`; `members` may include `id` itself.
    pub fn new(id: NodeId, members: impl IntoIterator<Item = NodeId>, config: RaftConfig) -> Self {
        let peers: Vec<NodeId> = members.into_iter().filter(|&peer| peer != id).collect();
        let election_timeout = config.random_election_timeout();

        tracing::info!(node_id = id, peers = ?peers, "Creating Raft core");

        Self {
            id,
            peers,
            config,
            term: 0,
            voted_for: None,
            log: Vec::new(),
            role: Role::Follower,
            leader: None,
            persisted: 0,
            commit: 0,
            handed: 0,
            applied: 0,
            elapsed: Duration::ZERO,
            election_timeout,
            votes: HashSet::new(),
            progress: HashMap::new(),
            barriers: Vec::new(),
            held_reads: Vec::new(),
        }
    }

    /// Loads state recovered from the journal. Entries up to the recovered
    /// commit index are handed out for application on the next tick.
    pub fn restore(&mut self, hard: HardState, log: Vec<Entry>) {
        self.term = hard.term;
        self.voted_for = hard.voted_for;
        self.persisted = log.len() as LogIndex;
        self.commit = hard.commit_index.min(self.persisted);
        self.handed = 0;
        self.applied = 0;
        self.log = log;

        tracing::info!(
            node_id = self.id,
            term = self.term,
            last_index = self.persisted,
            commit_index = self.commit,
            "Restored Raft state"
        );
    }

    /// Returns the majority quorum size
    fn quorum_size(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn last_term(&self) -> Term {
        self.log.last().map_or(0, |entry| entry.term)
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.log.get((index - 1) as usize).map(|entry| entry.term)
    }

    /// Entries in `[from, to]`.
    fn entries_between(&self, from: LogIndex, to: LogIndex) -> Vec<Entry> {
        if from == 0 || to < from || from as usize > self.log.len() {
            return Vec::new();
        }
        let end = (to as usize).min(self.log.len());
        self.log[(from - 1) as usize..end].to_vec()
    }

    fn truncate_from(&mut self, index: LogIndex) {
        assert!(
            index > self.commit,
            "refusing to truncate committed entry {index} (commit index {})",
            self.commit
        );
        self.log.truncate((index - 1) as usize);
        self.persisted = self.persisted.min(index - 1);
    }

    /// True once the commit index covers an entry of the current term.
    fn committed_in_term(&self) -> bool {
        self.term_at(self.commit) == Some(self.term)
    }

    fn persist(&self, io: &mut dyn ConsensusIo) -> Result<(), ConsensusError> {
        io.persist_hard_state(self.term, self.voted_for)
    }

    // ========================================================================
    // ROLE TRANSITIONS
    // ========================================================================

    fn become_follower(
        &mut self,
        io: &mut dyn ConsensusIo,
        term: Term,
        leader: Option<NodeId>,
    ) -> Result<(), ConsensusError> {
        let old_role = self.role;
        let term_changed = term > self.term;
        if term_changed {
            self.term = term;
            self.voted_for = None;
            self.persist(io)?;
        }

        self.role = Role::Follower;
        self.leader = leader;
        self.votes.clear();
        self.progress.clear();
        self.elapsed = Duration::ZERO;
        self.election_timeout = self.config.random_election_timeout();
        self.fail_barriers(io);

        if old_role != Role::Follower || term_changed {
            if old_role != Role::Follower {
                trace_role_changed(self.id, old_role, Role::Follower, self.term);
            }
            io.role_changed(self.role, self.term, self.leader);
        }
        Ok(())
    }

    fn become_candidate(&mut self, io: &mut dyn ConsensusIo) -> Result<(), ConsensusError> {
        let old_role = self.role;
        self.term += 1;
        self.voted_for = Some(self.id);
        self.persist(io)?;

        self.role = Role::Candidate;
        self.leader = None;
        self.votes.clear();
        self.votes.insert(self.id);
        self.progress.clear();
        self.elapsed = Duration::ZERO;
        self.election_timeout = self.config.random_election_timeout();

        trace_role_changed(self.id, old_role, Role::Candidate, self.term);
        io.role_changed(self.role, self.term, self.leader);

        if self.votes.len() >= self.quorum_size() {
            return self.become_leader(io);
        }

        let request = VoteRequest {
            term: self.term,
            last_log_index: self.last_index(),
            last_log_term: self.last_term(),
        };
        for &peer in &self.peers {
            io.send(peer, PeerMessage::Vote(request.clone()));
        }
        Ok(())
    }

    fn become_leader(&mut self, io: &mut dyn ConsensusIo) -> Result<(), ConsensusError> {
        let old_role = self.role;
        let next = self.last_index() + 1;

        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.votes.clear();
        self.elapsed = Duration::ZERO;
        self.progress = self
            .peers
            .iter()
            .map(|&peer| (peer, Progress { next, matched: 0 }))
            .collect();

        trace_role_changed(self.id, old_role, Role::Leader, self.term);
        io.role_changed(self.role, self.term, self.leader);

        // Earlier terms commit only behind an entry of this term.
        let blank = Entry::blank(self.term);
        self.log.push(blank.clone());
        io.retain(None, next, vec![blank]);

        self.broadcast_append(io);
        self.advance_commit_index(io);
        Ok(())
    }

    // ========================================================================
    // REPLICATION
    // ========================================================================

    fn broadcast_append(&mut self, io: &mut dyn ConsensusIo) {
        for peer in self.peers.clone() {
            self.send_append(io, peer);
        }
    }

    fn send_append(&mut self, io: &mut dyn ConsensusIo, peer: NodeId) {
        let Some(progress) = self.progress.get(&peer).copied() else {
            return;
        };
        let prev_log_index = progress.next.saturating_sub(1).min(self.last_index());
        let prev_log_term = self.term_at(prev_log_index).unwrap_or(0);
        let last = self
            .persisted
            .min(prev_log_index + self.config.max_entries_per_rpc as LogIndex);

        io.send(
            peer,
            PeerMessage::AppendEntries(AppendRequest {
                term: self.term,
                prev_log_index,
                prev_log_term,
                leader_commit: self.commit,
                entries: self.entries_between(prev_log_index + 1, last),
            }),
        );
    }

    fn advance_commit_index(&mut self, io: &mut dyn ConsensusIo) {
        if self.role != Role::Leader {
            return;
        }

        // Highest N with a majority of match_index >= N and log[N].term == term.
        let quorum = self.quorum_size();
        let mut new_commit = self.commit;
        for n in (self.commit + 1..=self.persisted).rev() {
            match self.term_at(n) {
                Some(term) if term == self.term => {}
                Some(term) if term < self.term => break,
                _ => continue,
            }
            let replicas = 1 + self.progress.values().filter(|p| p.matched >= n).count();
            if replicas >= quorum {
                new_commit = n;
                break;
            }
        }

        if new_commit > self.commit {
            trace_commit_advanced(self.id, self.commit, new_commit);
            self.commit = new_commit;
            self.hand_apply(io);
            self.release_held_reads(io);
        }
    }

    fn follow_commit(&mut self, io: &mut dyn ConsensusIo, leader_commit: LogIndex, verified: LogIndex) {
        let commit = leader_commit.min(verified).min(self.persisted);
        if commit > self.commit {
            trace_commit_advanced(self.id, self.commit, commit);
            self.commit = commit;
            self.hand_apply(io);
        }
    }

    fn hand_apply(&mut self, io: &mut dyn ConsensusIo) {
        if self.commit > self.handed {
            let start = self.handed + 1;
            let entries = self.entries_between(start, self.commit);
            self.handed = self.commit;
            io.apply(start, entries);
        }
    }

    fn respond_append(&self, io: &mut dyn ConsensusIo, to: NodeId, success: bool, match_index: LogIndex) {
        io.send(
            to,
            PeerMessage::AppendEntriesResponse(AppendResponse {
                term: self.term,
                success,
                match_index,
                last_index: if success { self.last_index() } else { self.persisted },
            }),
        );
    }

    // ========================================================================
    // READ BARRIERS
    // ========================================================================

    fn ack_barriers(&mut self, io: &mut dyn ConsensusIo, from: NodeId) {
        if self.barriers.is_empty() {
            return;
        }
        let quorum = self.quorum_size();
        let mut ready = Vec::new();
        self.barriers.retain_mut(|barrier| {
            barrier.acks.insert(from);
            if barrier.acks.len() >= quorum {
                ready.push((barrier.id, barrier.read_index));
                false
            } else {
                true
            }
        });
        for (id, read_index) in ready {
            io.read_ready(id, Ok(read_index));
        }
    }

    fn fail_barriers(&mut self, io: &mut dyn ConsensusIo) {
        let held = std::mem::take(&mut self.held_reads);
        let pending = std::mem::take(&mut self.barriers).into_iter().map(|barrier| barrier.id);
        for id in pending.chain(held) {
            io.read_ready(id, Err(ConsensusError::NotLeader { leader: self.leader }));
        }
    }

    fn start_barrier(&mut self, io: &mut dyn ConsensusIo, id: BarrierId) {
        if self.peers.is_empty() {
            io.read_ready(id, Ok(self.commit));
            return;
        }
        self.barriers.push(ReadBarrier {
            id,
            read_index: self.commit,
            acks: HashSet::from([self.id]),
        });
    }

    /// Starts the barriers held back until the term's first commit.
    fn release_held_reads(&mut self, io: &mut dyn ConsensusIo) {
        if self.held_reads.is_empty() || !self.committed_in_term() {
            return;
        }
        for id in std::mem::take(&mut self.held_reads) {
            self.start_barrier(io, id);
        }
        if !self.barriers.is_empty() {
            self.broadcast_append(io);
        }
    }
}

// ============================================================================
// CONSENSUS IMPLEMENTATION
// ============================================================================

impl Consensus for RaftCore {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn role(&self) -> Role {
        self.role
    }

    fn term(&self) -> Term {
        self.term
    }

    fn leader(&self) -> Option<NodeId> {
        self.leader
    }

    fn commit_index(&self) -> LogIndex {
        self.commit
    }

    fn applied_index(&self) -> LogIndex {
        self.applied
    }

    fn last_index(&self) -> LogIndex {
        self.log.len() as LogIndex
    }

    fn tick(&mut self, io: &mut dyn ConsensusIo, elapsed: Duration) -> Result<(), ConsensusError> {
        self.elapsed += elapsed;
        match self.role {
            Role::Leader => {
                if self.elapsed >= self.config.heartbeat_interval {
                    self.elapsed = Duration::ZERO;
                    self.broadcast_append(io);
                }
            }
            Role::Follower | Role::Candidate => {
                if self.elapsed >= self.election_timeout {
                    tracing::debug!(
                        node_id = self.id,
                        timeout_ms = self.election_timeout.as_millis() as u64,
                        "Election timeout, becoming candidate"
                    );
                    self.become_candidate(io)?;
                }
            }
        }
        self.hand_apply(io);
        Ok(())
    }

    fn retain_entries(
        &mut self,
        io: &mut dyn ConsensusIo,
        round: RoundId,
        payloads: Vec<Vec<u8>>,
    ) -> Result<LogIndex, ConsensusError> {
        if self.role != Role::Leader {
            return Err(ConsensusError::NotLeader { leader: self.leader });
        }
        let start = self.last_index() + 1;
        let entries: Vec<Entry> = payloads
            .into_iter()
            .map(|data| Entry::new(self.term, data))
            .collect();
        self.log.extend(entries.iter().cloned());

        tracing::trace!(node_id = self.id, start, count = entries.len(), "Retaining entries");
        io.retain(Some(round), start, entries);
        Ok(start)
    }

    fn retain_finished(
        &mut self,
        io: &mut dyn ConsensusIo,
        start: LogIndex,
        count: usize,
        term: Term,
        result: Result<(), JournalError>,
    ) -> Result<(), ConsensusError> {
        if count == 0 {
            return result.map_err(ConsensusError::from);
        }
        let end = start + count as LogIndex - 1;
        let intact = self.term_at(start) == Some(term) && self.term_at(end) == Some(term);

        if let Err(e) = result {
            tracing::error!(node_id = self.id, start, count, error = %e, "Failed to persist entries");
            if intact && start > self.commit {
                self.truncate_from(start);
            }
            return Err(e.into());
        }
        if !intact {
            // Overwritten by a newer leader while the write was in flight.
            return Err(ConsensusError::NotLeader { leader: self.leader });
        }

        self.persisted = self.persisted.max(end);
        if self.role == Role::Leader && self.term == term {
            self.broadcast_append(io);
            self.advance_commit_index(io);
        }
        Ok(())
    }

    fn append_finished(
        &mut self,
        io: &mut dyn ConsensusIo,
        ctx: AppendContext,
        result: Result<(), JournalError>,
    ) -> Result<(), ConsensusError> {
        if let Err(e) = result {
            tracing::error!(node_id = self.id, start = ctx.start, error = %e, "Failed to persist appended entries");
            if ctx.start > self.commit && ctx.start <= self.last_index() {
                self.truncate_from(ctx.start);
            }
            self.respond_append(io, ctx.leader, false, 0);
            return Err(e.into());
        }

        self.persisted = self.persisted.max(ctx.last_index).min(self.last_index());
        self.follow_commit(io, ctx.leader_commit, ctx.last_index);
        self.respond_append(io, ctx.leader, true, ctx.last_index);
        Ok(())
    }

    fn apply_finished(&mut self, _io: &mut dyn ConsensusIo, start: LogIndex, count: usize) {
        if count > 0 {
            self.applied = self.applied.max(start + count as LogIndex - 1);
        }
    }

    fn read_barrier(&mut self, io: &mut dyn ConsensusIo, barrier: BarrierId) -> Result<(), ConsensusError> {
        if self.role != Role::Leader {
            return Err(ConsensusError::NotLeader { leader: self.leader });
        }
        if !self.committed_in_term() {
            tracing::trace!(node_id = self.id, barrier, commit_index = self.commit, "Holding read until term commit");
            self.held_reads.push(barrier);
            return Ok(());
        }
        self.start_barrier(io, barrier);
        if !self.peers.is_empty() {
            self.broadcast_append(io);
        }
        Ok(())
    }

    fn recv_vote(&mut self, io: &mut dyn ConsensusIo, from: NodeId, request: VoteRequest) -> Result<(), ConsensusError> {
        if request.term > self.term {
            self.become_follower(io, request.term, None)?;
        }

        // Candidate's log must be at least as up-to-date as ours (§5.4.1)
        let up_to_date = request.last_log_term > self.last_term()
            || (request.last_log_term == self.last_term() && request.last_log_index >= self.last_index());
        let granted = request.term == self.term
            && self.voted_for.map_or(true, |vote| vote == from)
            && up_to_date;

        if granted {
            self.voted_for = Some(from);
            self.persist(io)?;
            self.elapsed = Duration::ZERO;
            tracing::debug!(node_id = self.id, candidate = from, term = self.term, "Granted vote");
        }

        io.send(
            from,
            PeerMessage::VoteResponse(VoteResponse {
                term: self.term,
                granted,
            }),
        );
        Ok(())
    }

    fn recv_vote_response(
        &mut self,
        io: &mut dyn ConsensusIo,
        from: NodeId,
        response: VoteResponse,
    ) -> Result<(), ConsensusError> {
        if response.term > self.term {
            return self.become_follower(io, response.term, None);
        }
        if self.role != Role::Candidate || response.term != self.term || !response.granted {
            return Ok(());
        }

        self.votes.insert(from);
        tracing::debug!(
            node_id = self.id,
            from,
            votes = self.votes.len(),
            needed = self.quorum_size(),
            "Received vote"
        );
        if self.votes.len() >= self.quorum_size() {
            self.become_leader(io)?;
        }
        Ok(())
    }

    fn recv_append(&mut self, io: &mut dyn ConsensusIo, from: NodeId, request: AppendRequest) -> Result<(), ConsensusError> {
        if request.term < self.term {
            self.respond_append(io, from, false, 0);
            return Ok(());
        }
        if request.term > self.term || self.role != Role::Follower {
            self.become_follower(io, request.term, Some(from))?;
        } else if self.leader != Some(from) {
            self.leader = Some(from);
            io.role_changed(self.role, self.term, self.leader);
        }
        self.elapsed = Duration::ZERO;

        if self.term_at(request.prev_log_index) != Some(request.prev_log_term) {
            self.respond_append(io, from, false, 0);
            return Ok(());
        }

        let last_new = request.prev_log_index + request.entries.len() as LogIndex;
        let mut first_new = None;
        for (offset, entry) in request.entries.into_iter().enumerate() {
            let index = request.prev_log_index + 1 + offset as LogIndex;
            match self.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(index);
                    self.log.push(entry);
                }
                None => self.log.push(entry),
            }
            first_new.get_or_insert(index);
        }

        match first_new {
            Some(start) => {
                let entries = self.entries_between(start, last_new);
                io.append(
                    AppendContext {
                        leader: from,
                        term: self.term,
                        leader_commit: request.leader_commit,
                        start,
                        last_index: last_new,
                    },
                    entries,
                );
            }
            None if last_new <= self.persisted => {
                self.follow_commit(io, request.leader_commit, last_new);
                self.respond_append(io, from, true, last_new);
            }
            None => {
                // Present but not yet durable; the leader retries.
                self.respond_append(io, from, false, 0);
            }
        }
        Ok(())
    }

    fn recv_append_response(
        &mut self,
        io: &mut dyn ConsensusIo,
        from: NodeId,
        response: AppendResponse,
    ) -> Result<(), ConsensusError> {
        if response.term > self.term {
            return self.become_follower(io, response.term, None);
        }
        if self.role != Role::Leader || response.term != self.term {
            return Ok(());
        }

        self.ack_barriers(io, from);

        let Some(progress) = self.progress.get_mut(&from) else {
            return Ok(());
        };
        if response.success {
            progress.matched = progress.matched.max(response.match_index);
            progress.next = progress.matched + 1;
            let behind = progress.next <= self.persisted;
            self.advance_commit_index(io);
            if behind {
                self.send_append(io, from);
            }
        } else {
            progress.next = progress
                .next
                .saturating_sub(1)
                .min(response.last_index + 1)
                .max(1);
            self.send_append(io, from);
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
