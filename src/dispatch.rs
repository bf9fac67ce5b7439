//! Engine Thread
//!
//! [`Dispatcher`] owns the engine loop: it drains the engine queue, polls
//! every group's request and peer queues once per pass, and ticks the
//! consensus cores. It is the only caller of [`Consensus`] methods and the
//! host behind [`ConsensusIo`], turning requested side effects into worker
//! tasks and peer messages.
//!
//! Journal and apply workers run [`JournalHandler`] and [`ApplyHandler`] and
//! report back through the engine queue.
//!
//! [`Consensus`]: crate::consensus::Consensus

use crate::consensus::{AppendContext, BarrierId, ConsensusError, ConsensusIo, RoundId};
use crate::engine::{EngineError, EngineShared};
use crate::group::{Group, GroupState};
use crate::journal::{self, COMMIT_INDEX_KEY};
use crate::metrics::{trace_round_started, EngineMetrics};
use crate::network::{self, Envelope, PeerMessage, Transport};
use crate::pipeline::{Accepted, ReadRequest, WriteRequest};
use crate::raft::{Entry, LogIndex, NodeId, Role, Term};
use crate::state_machine::StateMachine;
use crate::task::{AppendDone, AppendJob, ApplyDone, ApplyJob, RetainDone, RetainJob, Task, TaskKind};
use crate::tasker::{Dispatch, OnceTasker};
use crate::waiter::entry_key;
use crate::worker::WorkerPool;
use std::sync::Arc;
use std::time::Instant;

// ============================================================================
// CONSENSUS HOST
// ============================================================================

/// Side-effect sink for one consensus step of one group.
struct GroupIo<'a> {
    group: &'a Group,
    transport: &'a dyn Transport,
    journal_pool: &'a WorkerPool,
    apply_pool: &'a WorkerPool,
    metrics: &'a EngineMetrics,
    /// Barriers resolved during the step, handled once it returns.
    ready: Vec<(BarrierId, Result<LogIndex, ConsensusError>)>,
    /// Set when a follower batch went to the journal.
    appending: bool,
}

impl ConsensusIo for GroupIo<'_> {
    fn send(&mut self, to: NodeId, message: PeerMessage) {
        let Some(addr) = self.group.peer_addr(to) else {
            tracing::warn!(group = %self.group.identity(), to, "Dropping message to unknown member");
            return;
        };
        let conn = self.transport.find_or_create(&addr.host, addr.port);
        if !self.transport.is_usable(conn) {
            tracing::trace!(group = %self.group.identity(), to, peer = %addr, "Peer not connected, dropping message");
            return;
        }
        let envelope = Envelope {
            identity: self.group.identity().to_string(),
            from: self.group.node_id(),
            message,
        };
        if let Err(e) = self.transport.send(conn, envelope) {
            tracing::debug!(group = %self.group.identity(), to, error = %e, "Failed to send message");
        }
    }

    fn persist_hard_state(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<(), ConsensusError> {
        journal::persist_hard_state(self.group.journal().as_ref(), term, voted_for).map_err(|e| {
            self.metrics.inc_persistence_failures();
            tracing::error!(group = %self.group.identity(), term, error = %e, "Failed to persist hard state");
            ConsensusError::from(e)
        })
    }

    fn retain(&mut self, round: Option<RoundId>, start: LogIndex, entries: Vec<Entry>) {
        self.journal_pool.give(Task::new(
            self.group.identity(),
            TaskKind::LogRetain(RetainJob {
                journal: Arc::clone(self.group.journal()),
                round,
                start,
                entries,
            }),
        ));
    }

    fn append(&mut self, ctx: AppendContext, entries: Vec<Entry>) {
        self.appending = true;
        self.journal_pool.give(Task::new(
            self.group.identity(),
            TaskKind::LogAppend(AppendJob {
                journal: Arc::clone(self.group.journal()),
                ctx,
                start: ctx.start,
                entries,
            }),
        ));
    }

    fn apply(&mut self, start: LogIndex, entries: Vec<Entry>) {
        if entries.is_empty() {
            return;
        }
        self.apply_pool.give(Task::new(
            self.group.identity(),
            TaskKind::LogApply(ApplyJob::Writes {
                machine: Arc::clone(self.group.machine()),
                journal: Arc::clone(self.group.journal()),
                start,
                entries,
            }),
        ));
    }

    fn read_ready(&mut self, barrier: BarrierId, outcome: Result<LogIndex, ConsensusError>) {
        self.ready.push((barrier, outcome));
    }

    fn role_changed(&mut self, role: Role, term: Term, leader: Option<NodeId>) {
        self.metrics.inc_role_changes();
        tracing::info!(
            group = %self.group.identity(),
            node_id = self.group.node_id(),
            role = %role,
            term,
            leader = ?leader,
            "Group role changed"
        );
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Engine-thread state: the worker pools and the tick clock.
pub(crate) struct Dispatcher {
    shared: Arc<EngineShared>,
    journal_pool: WorkerPool,
    apply_pool: WorkerPool,
    last_tick: Instant,
}

impl Dispatcher {
    pub fn new(shared: Arc<EngineShared>, journal_pool: WorkerPool, apply_pool: WorkerPool) -> Self {
        Self {
            shared,
            journal_pool,
            apply_pool,
            last_tick: Instant::now(),
        }
    }

    pub fn journal_handler(shared: &Arc<EngineShared>) -> Box<dyn Dispatch + Send> {
        Box::new(JournalHandler {
            queue: Arc::clone(&shared.queue),
            metrics: shared.metrics.clone(),
        })
    }

    pub fn apply_handler(shared: &Arc<EngineShared>) -> Box<dyn Dispatch + Send> {
        Box::new(ApplyHandler {
            queue: Arc::clone(&shared.queue),
            metrics: shared.metrics.clone(),
        })
    }

    /// The engine loop. Returns after shutdown, once every group is closed.
    pub fn run(&mut self) {
        let shared = Arc::clone(&self.shared);
        let tick_interval = shared.config.tick_interval;
        loop {
            shared
                .bell
                .wait_timeout(tick_interval.saturating_sub(self.last_tick.elapsed()));
            if !shared.is_running() {
                break;
            }

            shared.queue.run(self);
            for group in shared.registry.snapshot() {
                if let Some(task) = group.requests().poll() {
                    self.dispatch(task);
                }
                if let Some(task) = group.peer_inbox().poll() {
                    self.dispatch(task);
                }
            }

            if self.last_tick.elapsed() >= tick_interval {
                self.tick();
            }
        }
        self.teardown();
    }

    fn io<'a>(&'a self, group: &'a Group) -> GroupIo<'a> {
        GroupIo {
            group,
            transport: self.shared.transport.as_ref(),
            journal_pool: &self.journal_pool,
            apply_pool: &self.apply_pool,
            metrics: &self.shared.metrics,
            ready: Vec::new(),
            appending: false,
        }
    }

    fn group(&self, identity: &str) -> Option<Arc<Group>> {
        let group = self.shared.registry.get(identity);
        if group.is_none() {
            tracing::debug!(group = %identity, "Dropping task for unknown group");
        }
        group
    }

    /// Runs one consensus step on `group`, then starts whatever rounds the
    /// step unblocked and publishes the new status.
    fn drive<R>(&self, group: &Group, step: impl FnOnce(&mut GroupState, &mut GroupIo<'_>) -> R) -> R {
        let mut state = group.state();
        let mut io = self.io(group);
        let output = step(&mut *state, &mut io);
        self.pump(group, &mut *state, &mut io);
        if io.appending {
            group.peer_inbox().stop();
        }
        group.refresh_status(&*state.consensus);
        output
    }

    /// Like [`Dispatcher::drive`] for steps whose error is only logged.
    fn step(
        &self,
        identity: &str,
        what: &'static str,
        step: impl FnOnce(&mut GroupState, &mut GroupIo<'_>) -> Result<(), ConsensusError>,
    ) {
        let Some(group) = self.group(identity) else {
            return;
        };
        if let Err(e) = self.drive(&group, step) {
            tracing::warn!(group = %identity, step = what, error = %e, "Consensus step failed");
        }
    }

    fn pump(&self, group: &Group, state: &mut GroupState, io: &mut GroupIo<'_>) {
        loop {
            let mut progressed = false;
            if let Some((round, requests)) = state.pipeline.take_write_round() {
                self.start_write_round(group, state, io, round, requests);
                progressed = true;
            }
            if let Some((barrier, reads)) = state.pipeline.take_read_round() {
                self.start_read_round(group, state, io, barrier, reads);
                progressed = true;
            }
            for (barrier, outcome) in std::mem::take(&mut io.ready) {
                self.resolve_reads(group, state, barrier, outcome);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    // ========================================================================
    // WRITE PATH
    // ========================================================================

    fn start_write_round(
        &self,
        group: &Group,
        state: &mut GroupState,
        io: &mut GroupIo<'_>,
        round: RoundId,
        mut requests: Vec<WriteRequest>,
    ) {
        let count = requests.len();
        self.shared.metrics.record_write_round(count);
        trace_round_started(group.identity(), "write", round, count);

        let payloads = requests
            .iter_mut()
            .map(|request| std::mem::take(&mut request.payload))
            .collect();
        match state.consensus.retain_entries(io, round, payloads) {
            Ok(start) => {
                tracing::debug!(group = %group.identity(), round, start, count, "Write round retained");
                state.pipeline.hold_round(round, requests);
            }
            Err(e) => {
                state.pipeline.abort_write_round();
                self.fail_writes(group, requests, &e);
            }
        }
    }

    fn on_retain_done(&self, identity: &str, done: RetainDone) {
        let Some(group) = self.group(identity) else {
            return;
        };
        let RetainDone {
            round,
            start,
            count,
            term,
            result,
        } = done;

        self.drive(&group, |state, io| {
            let outcome = state.consensus.retain_finished(io, start, count, term, result);
            let requests = round.and_then(|round| state.pipeline.finish_write_round(round));
            match (requests, outcome) {
                (Some(requests), Ok(())) => self.accept_writes(&group, requests, start, term),
                (Some(requests), Err(e)) => self.fail_writes(&group, requests, &e),
                (None, Err(e)) => {
                    tracing::warn!(group = %identity, start, count, error = %e, "Retained batch failed");
                }
                (None, Ok(())) => {}
            }
        });
    }

    /// Registers a commit waiter per entry, then hands each caller its
    /// index. Registration precedes any wake: both happen on this thread.
    fn accept_writes(&self, group: &Group, requests: Vec<WriteRequest>, start: LogIndex, term: Term) {
        tracing::debug!(group = %group.identity(), start, count = requests.len(), term, "Write round persisted");
        for (offset, request) in requests.into_iter().enumerate() {
            let index = start + offset as LogIndex;
            let waiter = group.waiters().register(&entry_key(index, term));
            request.reply.send(Ok(Accepted { index, term, waiter }));
        }
    }

    fn fail_writes(&self, group: &Group, requests: Vec<WriteRequest>, error: &ConsensusError) {
        self.count_failure(requests.len(), error);
        let mapped = group.map_error(error.clone());
        tracing::debug!(group = %group.identity(), count = requests.len(), error = %mapped, "Failing write round");
        for request in requests {
            request.reply.send(Err(mapped.clone()));
        }
    }

    fn count_failure(&self, count: usize, error: &ConsensusError) {
        match error {
            ConsensusError::NotLeader { .. } => self.shared.metrics.inc_not_leader(count),
            ConsensusError::Persistence(_) => self.shared.metrics.inc_persistence_failures(),
            ConsensusError::SnapshotInProgress => {}
        }
    }

    // ========================================================================
    // READ PATH
    // ========================================================================

    fn start_read_round(
        &self,
        group: &Group,
        state: &mut GroupState,
        io: &mut GroupIo<'_>,
        barrier: BarrierId,
        reads: Vec<ReadRequest>,
    ) {
        let count = reads.len();
        self.shared.metrics.record_read_round(count);
        trace_round_started(group.identity(), "read", barrier, count);

        match state.consensus.read_barrier(io, barrier) {
            Ok(()) => state.pipeline.hold_barrier(barrier, reads, Instant::now()),
            Err(e) => {
                state.pipeline.abort_read_round();
                self.fail_reads(group, reads, &e);
            }
        }
    }

    fn resolve_reads(
        &self,
        group: &Group,
        state: &mut GroupState,
        barrier: BarrierId,
        outcome: Result<LogIndex, ConsensusError>,
    ) {
        let Some(reads) = state.pipeline.resolve_barrier(barrier) else {
            tracing::trace!(group = %group.identity(), barrier, "Barrier already expired");
            return;
        };
        match outcome {
            Ok(read_index) if state.pipeline.is_readable(read_index) => {
                self.apply_reads(group, Vec::new(), reads);
            }
            Ok(read_index) => {
                tracing::debug!(
                    group = %group.identity(),
                    barrier,
                    read_index,
                    applied = state.pipeline.applied(),
                    "Parking reads behind apply"
                );
                state.pipeline.park(read_index, reads);
            }
            Err(e) => self.fail_reads(group, reads, &e),
        }
    }

    fn apply_reads(&self, group: &Group, deferred: Vec<ReadRequest>, fresh: Vec<ReadRequest>) {
        self.apply_pool.give(Task::new(
            group.identity(),
            TaskKind::LogApply(ApplyJob::Reads {
                machine: Arc::clone(group.machine()),
                deferred,
                fresh,
            }),
        ));
    }

    fn fail_reads(&self, group: &Group, reads: Vec<ReadRequest>, error: &ConsensusError) {
        self.count_failure(reads.len(), error);
        let mapped = group.map_error(error.clone());
        tracing::debug!(group = %group.identity(), count = reads.len(), error = %mapped, "Failing read round");
        for read in reads {
            read.reply.send(Err(mapped.clone()));
        }
    }

    // ========================================================================
    // APPLY AND FOLLOWER PROGRESS
    // ========================================================================

    fn on_append_done(&self, identity: &str, done: AppendDone) {
        if done.result.is_err() {
            self.shared.metrics.inc_persistence_failures();
        }
        self.step(identity, "append_finished", |state, io| {
            // Set again by `drive` if the step appends another batch.
            if let Some(group) = self.shared.registry.get(identity) {
                group.peer_inbox().resume();
            }
            state.consensus.append_finished(io, done.ctx, done.result)
        });
    }

    fn on_apply_done(&self, identity: &str, done: ApplyDone) {
        let Some(group) = self.group(identity) else {
            return;
        };
        let ApplyDone { start, terms } = done;
        let count = terms.len();

        self.drive(&group, |state, io| {
            state.consensus.apply_finished(io, start, count);
            for (offset, term) in terms.iter().enumerate() {
                group.waiters().wake(&entry_key(start + offset as LogIndex, *term));
            }
            self.shared.metrics.inc_entries_applied(count);

            if count > 0 {
                let released = state.pipeline.set_applied(start + count as LogIndex - 1);
                if !released.is_empty() {
                    tracing::debug!(group = %identity, count = released.len(), "Releasing deferred reads");
                    self.apply_reads(&group, released, Vec::new());
                }
            }
        });
    }

    // ========================================================================
    // TICK
    // ========================================================================

    fn tick(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        let read_timeout = self.shared.config.read_timeout;

        for group in self.shared.registry.snapshot() {
            self.drive(&group, |state, io| {
                if let Err(e) = state.consensus.tick(io, elapsed) {
                    tracing::warn!(group = %group.identity(), error = %e, "Tick failed");
                }

                let expired = state.pipeline.expire_barriers(now, read_timeout);
                if !expired.is_empty() {
                    let index = state.consensus.commit_index();
                    self.shared.metrics.inc_read_timeouts(expired.len());
                    tracing::warn!(group = %group.identity(), count = expired.len(), index, "Read barrier timed out");
                    for read in expired {
                        read.reply.send(Err(EngineError::TimedOut { index }));
                    }
                }
            });
        }
    }

    // ========================================================================
    // MEMBERSHIP AND PEERS
    // ========================================================================

    fn add_group(&self, group: Arc<Group>) -> Result<(), EngineError> {
        self.shared.registry.add(Arc::clone(&group))?;
        self.shared.metrics.set_groups(self.shared.registry.len());
        tracing::info!(
            group = %group.identity(),
            node_id = group.node_id(),
            members = group.config().len(),
            "Group added"
        );

        let port = self.shared.transport.local_port();
        self.drive(&group, |_, io| {
            for peer in group.config().peers() {
                if peer.id != group.node_id() {
                    io.send(peer.id, PeerMessage::Handshake { port });
                }
            }
        });
        Ok(())
    }

    fn del_group(&self, identity: &str) -> Result<(), EngineError> {
        let group = self
            .shared
            .registry
            .remove(identity)
            .ok_or_else(|| EngineError::GroupNotFound(identity.to_string()))?;
        self.shared.metrics.set_groups(self.shared.registry.len());

        let mut io = self.io(&group);
        for peer in group.config().peers() {
            if peer.id != group.node_id() {
                io.send(peer.id, PeerMessage::Leave);
            }
        }

        self.close_group(&group, &EngineError::GroupNotFound(identity.to_string()));
        tracing::info!(group = %identity, "Group removed");
        Ok(())
    }

    /// Fails everything the group still holds with `error` and closes its
    /// journal.
    fn close_group(&self, group: &Group, error: &EngineError) {
        group.mark_closed();
        group.waiters().close();
        for task in group.requests().drain() {
            fail_request(task, error);
        }
        let dropped = group.peer_inbox().drain().len();

        let (writes, reads) = group.state().pipeline.drain();
        tracing::debug!(
            group = %group.identity(),
            writes = writes.len(),
            reads = reads.len(),
            dropped,
            "Failing pending requests"
        );
        for write in writes {
            write.reply.send(Err(error.clone()));
        }
        for read in reads {
            read.reply.send(Err(error.clone()));
        }

        if let Err(e) = group.journal().close() {
            tracing::warn!(group = %group.identity(), error = %e, "Failed to close journal");
        }
    }

    fn on_peer_connected(&self, conn: network::ConnectionId) {
        let Some(addr) = self.shared.transport.connection_info(conn) else {
            return;
        };
        tracing::debug!(conn, peer = %addr, "Peer connected");

        let port = self.shared.transport.local_port();
        for group in self.shared.registry.snapshot() {
            let Some(id) = group.config().find(&addr).filter(|&id| id != group.node_id()) else {
                continue;
            };
            self.drive(&group, |_, io| io.send(id, PeerMessage::Handshake { port }));
        }
    }

    fn on_control(&self, identity: &str, from: NodeId, message: PeerMessage) {
        let Some(group) = self.group(identity) else {
            return;
        };
        match message {
            PeerMessage::Handshake { port } => {
                tracing::debug!(group = %identity, from, port, "Handshake received");
                self.drive(&group, |state, io| {
                    let leader = state.consensus.leader().and_then(|id| group.peer_addr(id));
                    let success = state.consensus.is_leader();
                    io.send(from, PeerMessage::HandshakeResponse { success, leader });
                });
            }
            PeerMessage::HandshakeResponse { success, leader } => {
                tracing::debug!(group = %identity, from, success, leader = ?leader, "Handshake answered");
            }
            PeerMessage::Leave => {
                tracing::info!(group = %identity, from, "Peer left group");
                self.drive(&group, |_, io| io.send(from, PeerMessage::LeaveResponse));
            }
            PeerMessage::LeaveResponse => {
                tracing::debug!(group = %identity, from, "Leave acknowledged");
            }
            other => {
                tracing::warn!(group = %identity, from, message = ?other, "Unexpected control message");
            }
        }
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    fn teardown(&mut self) {
        self.journal_pool.shutdown();
        self.apply_pool.shutdown();

        let dropped = self.shared.queue.take_all().len();
        let groups = self.shared.registry.drain();
        tracing::debug!(groups = groups.len(), dropped, "Tearing down engine");
        for group in groups {
            self.close_group(&group, &EngineError::Shutdown);
        }
        self.shared.metrics.set_groups(0);
    }
}

/// Answers a queued client request, and everything merged behind it.
fn fail_request(task: Task, error: &EngineError) {
    let (_, kind, merged) = task.into_parts();
    match kind {
        TaskKind::RequestWrite(request) => request.reply.send(Err(error.clone())),
        TaskKind::RequestRead(request) => request.reply.send(Err(error.clone())),
        _ => {}
    }
    for task in merged {
        fail_request(task, error);
    }
}

impl Dispatch for Dispatcher {
    fn dispatch(&mut self, task: Task) {
        let task_type = task.task_type();
        let (identity, kind, merged) = task.into_parts();
        tracing::trace!(group = %identity, task = ?task_type, merged = merged.len(), "Dispatching task");

        match kind {
            TaskKind::GroupAdd { group, reply } => reply.send(self.add_group(group)),
            TaskKind::GroupDel { reply } => reply.send(self.del_group(&identity)),
            TaskKind::RequestWrite(head) => {
                let Some(group) = self.group(&identity) else {
                    return;
                };
                let tail = merged.into_iter().filter_map(|task| match task.into_parts().1 {
                    TaskKind::RequestWrite(request) => Some(request),
                    _ => None,
                });
                self.drive(&group, |state, _| {
                    for request in std::iter::once(head).chain(tail) {
                        state.pipeline.push_write(request);
                    }
                });
            }
            TaskKind::RequestRead(head) => {
                let Some(group) = self.group(&identity) else {
                    return;
                };
                let tail = merged.into_iter().filter_map(|task| match task.into_parts().1 {
                    TaskKind::RequestRead(request) => Some(request),
                    _ => None,
                });
                self.drive(&group, |state, _| {
                    for request in std::iter::once(head).chain(tail) {
                        state.pipeline.push_read(request);
                    }
                });
            }
            TaskKind::LogRetainDone(done) => self.on_retain_done(&identity, done),
            TaskKind::LogAppendDone(done) => self.on_append_done(&identity, done),
            TaskKind::LogApplyDone(done) => self.on_apply_done(&identity, done),
            TaskKind::NetAppend { from, request } => self.step(&identity, "recv_append", |state, io| {
                state.consensus.recv_append(io, from, request)
            }),
            TaskKind::NetAppendResponse { from, response } => {
                self.step(&identity, "recv_append_response", |state, io| {
                    state.consensus.recv_append_response(io, from, response)
                })
            }
            TaskKind::NetVote { from, request } => self.step(&identity, "recv_vote", |state, io| {
                state.consensus.recv_vote(io, from, request)
            }),
            TaskKind::NetVoteResponse { from, response } => {
                self.step(&identity, "recv_vote_response", |state, io| {
                    state.consensus.recv_vote_response(io, from, response)
                })
            }
            TaskKind::NetControl { from, message } => self.on_control(&identity, from, message),
            TaskKind::PeerConnected { conn } => self.on_peer_connected(conn),
            TaskKind::LogRetain(_) | TaskKind::LogAppend(_) | TaskKind::LogApply(_) => {
                panic!("{task_type:?} task dispatched on the engine thread")
            }
        }
    }
}

// ============================================================================
// WORKER HANDLERS
// ============================================================================

/// Persists batches on a journal worker.
struct JournalHandler {
    queue: Arc<OnceTasker>,
    metrics: EngineMetrics,
}

impl Dispatch for JournalHandler {
    fn dispatch(&mut self, task: Task) {
        let task_type = task.task_type();
        let (identity, kind, _) = task.into_parts();
        match kind {
            TaskKind::LogRetain(job) => {
                let started = Instant::now();
                let result = journal::persist_batch(job.journal.as_ref(), job.start, &job.entries);
                self.metrics.observe_journal_write(started.elapsed());
                if let Err(e) = &result {
                    tracing::error!(group = %identity, start = job.start, count = job.entries.len(), error = %e, "Failed to persist batch");
                }
                let done = RetainDone {
                    round: job.round,
                    start: job.start,
                    count: job.entries.len(),
                    term: job.entries.first().map_or(0, |entry| entry.term),
                    result,
                };
                self.queue.give(Task::new(identity, TaskKind::LogRetainDone(done)));
            }
            TaskKind::LogAppend(job) => {
                let started = Instant::now();
                let result = journal::persist_batch(job.journal.as_ref(), job.start, &job.entries);
                self.metrics.observe_journal_write(started.elapsed());
                if let Err(e) = &result {
                    tracing::error!(group = %identity, start = job.start, count = job.entries.len(), error = %e, "Failed to persist follower batch");
                }
                self.queue.give(Task::new(
                    identity,
                    TaskKind::LogAppendDone(AppendDone { ctx: job.ctx, result }),
                ));
            }
            _ => panic!("{task_type:?} task dispatched on a journal worker"),
        }
    }
}

/// Applies the committed run starting at `start`, skipping blank entries.
fn apply_committed(machine: &dyn StateMachine, start: LogIndex, entries: &[Entry]) {
    let mut offset = 0;
    while offset < entries.len() {
        let normal = entries[offset..]
            .iter()
            .take_while(|entry| !entry.is_blank())
            .count();
        if normal > 0 {
            machine.apply_writes(start + offset as LogIndex, &entries[offset..offset + normal]);
        }
        offset += normal.max(1);
    }
}

/// Runs state machine callbacks on an apply worker.
struct ApplyHandler {
    queue: Arc<OnceTasker>,
    metrics: EngineMetrics,
}

impl Dispatch for ApplyHandler {
    fn dispatch(&mut self, task: Task) {
        let task_type = task.task_type();
        let (identity, kind, _) = task.into_parts();
        match kind {
            TaskKind::LogApply(ApplyJob::Writes {
                machine,
                journal,
                start,
                entries,
            }) => {
                let span = crate::group_span!("apply", identity, start, count = entries.len());
                let _entered = span.enter();

                let started = Instant::now();
                apply_committed(machine.as_ref(), start, &entries);
                self.metrics.observe_apply(started.elapsed());

                let last = start + entries.len().saturating_sub(1) as LogIndex;
                if let Err(e) = journal.set_state(COMMIT_INDEX_KEY, &last.to_string()) {
                    tracing::warn!(index = last, error = %e, "Failed to record applied index");
                }
                let terms = entries.iter().map(|entry| entry.term).collect();
                self.queue
                    .give(Task::new(identity, TaskKind::LogApplyDone(ApplyDone { start, terms })));
            }
            TaskKind::LogApply(ApplyJob::Reads {
                machine,
                mut deferred,
                mut fresh,
            }) => {
                let take = |reads: &mut Vec<ReadRequest>| -> Vec<Vec<u8>> {
                    reads.iter_mut().map(|read| std::mem::take(&mut read.payload)).collect()
                };
                let deferred_payloads = take(&mut deferred);
                let fresh_payloads = take(&mut fresh);

                let expected = deferred.len() + fresh.len();
                let results = machine.apply_reads(&deferred_payloads, &fresh_payloads);
                if results.len() != expected {
                    tracing::warn!(group = %identity, expected, returned = results.len(), "Read callback returned wrong number of results");
                }

                let mut results = results.into_iter();
                for read in deferred.into_iter().chain(fresh) {
                    read.reply.send(Ok(results.next().unwrap_or_default()));
                }
            }
            _ => panic!("{task_type:?} task dispatched on an apply worker"),
        }
    }
}
