//! Request Pipeline
//!
//! Per-group batching of client requests. Each request kind has a merge
//! buffer with a two-state flag: while [`MergeState::Working`] the next
//! request starts a round with everything buffered; while
//! [`MergeState::Paused`] requests only accumulate until the round in flight
//! reports back.
//!
//! Writes wait in `rounds` for their journal outcome. Reads wait in
//! `barriers` for the leadership check, then in `parked` until the state
//! machine has caught up to their read index.

use crate::consensus::{BarrierId, RoundId};
use crate::engine::EngineError;
use crate::raft::{LogIndex, Term};
use crate::task::Responder;
use crate::wake::Wake;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A client write waiting for its log index.
pub struct WriteRequest {
    pub payload: Vec<u8>,
    pub reply: Responder<Result<Accepted, EngineError>>,
}

/// Reply to a write that reached the local journal.
#[derive(Debug)]
pub struct Accepted {
    pub index: LogIndex,
    pub term: Term,
    /// Registered under the index; signalled once the entry is applied.
    pub waiter: Arc<Wake>,
}

/// A client read waiting for its result.
pub struct ReadRequest {
    pub payload: Vec<u8>,
    pub reply: Responder<Result<Vec<u8>, EngineError>>,
}

impl fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRequest")
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl fmt::Debug for ReadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadRequest")
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

// ============================================================================
// MERGE BUFFER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    /// No round in flight; the next request may start one.
    Working,
    /// A round is in flight; requests accumulate.
    Paused,
}

/// Buffer of same-kind requests plus the round flag.
#[derive(Debug)]
pub struct Merger<T> {
    buffer: Vec<T>,
    state: MergeState,
}

impl<T> Default for Merger<T> {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            state: MergeState::Working,
        }
    }
}

impl<T> Merger<T> {
    pub fn push(&mut self, item: T) {
        self.buffer.push(item);
    }

    pub fn state(&self) -> MergeState {
        self.state
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Takes the whole buffer and pauses, if a round may start.
    pub fn start_round(&mut self) -> Option<Vec<T>> {
        if self.state == MergeState::Paused || self.buffer.is_empty() {
            return None;
        }
        self.state = MergeState::Paused;
        Some(std::mem::take(&mut self.buffer))
    }

    /// Marks the round in flight as finished.
    pub fn finish_round(&mut self) {
        self.state = MergeState::Working;
    }

    fn drain(&mut self) -> Vec<T> {
        std::mem::take(&mut self.buffer)
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

#[derive(Debug)]
struct PendingReads {
    started: Instant,
    reads: Vec<ReadRequest>,
}

/// Batching and round bookkeeping for one group. Engine thread only.
#[derive(Debug, Default)]
pub struct Pipeline {
    writes: Merger<WriteRequest>,
    reads: Merger<ReadRequest>,
    next_ticket: u64,
    rounds: HashMap<RoundId, Vec<WriteRequest>>,
    barriers: HashMap<BarrierId, PendingReads>,
    parked: Vec<(LogIndex, Vec<ReadRequest>)>,
    applied: LogIndex,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_write(&mut self, request: WriteRequest) {
        self.writes.push(request);
    }

    pub fn push_read(&mut self, request: ReadRequest) {
        self.reads.push(request);
    }

    pub fn write_state(&self) -> MergeState {
        self.writes.state()
    }

    pub fn read_state(&self) -> MergeState {
        self.reads.state()
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.pending()
    }

    pub fn pending_reads(&self) -> usize {
        self.reads.pending()
    }

    pub fn applied(&self) -> LogIndex {
        self.applied
    }

    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Starts a write round with every buffered write, if none is in flight.
    pub fn take_write_round(&mut self) -> Option<(RoundId, Vec<WriteRequest>)> {
        let batch = self.writes.start_round()?;
        Some((self.ticket(), batch))
    }

    /// Keeps `requests` until the journal reports on `round`.
    pub fn hold_round(&mut self, round: RoundId, requests: Vec<WriteRequest>) {
        let previous = self.rounds.insert(round, requests);
        assert!(previous.is_none(), "write round {round} started twice");
    }

    /// Ends `round`, returning its requests. Unknown rounds leave the merge
    /// state untouched.
    pub fn finish_write_round(&mut self, round: RoundId) -> Option<Vec<WriteRequest>> {
        let requests = self.rounds.remove(&round)?;
        self.writes.finish_round();
        Some(requests)
    }

    /// Ends a round that never reached the journal.
    pub fn abort_write_round(&mut self) {
        self.writes.finish_round();
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Starts a read round with every buffered read, if none is in flight.
    pub fn take_read_round(&mut self) -> Option<(BarrierId, Vec<ReadRequest>)> {
        let batch = self.reads.start_round()?;
        Some((self.ticket(), batch))
    }

    /// Keeps `reads` until barrier `id` resolves.
    pub fn hold_barrier(&mut self, id: BarrierId, reads: Vec<ReadRequest>, now: Instant) {
        self.barriers.insert(id, PendingReads { started: now, reads });
    }

    /// Ends the read round behind barrier `id`, returning its reads.
    pub fn resolve_barrier(&mut self, id: BarrierId) -> Option<Vec<ReadRequest>> {
        let pending = self.barriers.remove(&id)?;
        self.reads.finish_round();
        Some(pending.reads)
    }

    /// Ends a read round that never got a barrier.
    pub fn abort_read_round(&mut self) {
        self.reads.finish_round();
    }

    /// Whether reads at `read_index` can run right away.
    pub fn is_readable(&self, read_index: LogIndex) -> bool {
        self.applied >= read_index
    }

    /// Holds `reads` until entries up to `read_index` are applied.
    pub fn park(&mut self, read_index: LogIndex, reads: Vec<ReadRequest>) {
        self.parked.push((read_index, reads));
    }

    /// Records application progress and releases parked reads it unblocks,
    /// in parking order.
    pub fn set_applied(&mut self, applied: LogIndex) -> Vec<ReadRequest> {
        self.applied = self.applied.max(applied);
        let applied = self.applied;
        let mut released = Vec::new();
        self.parked.retain_mut(|(read_index, reads)| {
            if *read_index <= applied {
                released.append(reads);
                false
            } else {
                true
            }
        });
        released
    }

    /// Removes barriers older than `timeout`, returning their reads.
    pub fn expire_barriers(&mut self, now: Instant, timeout: Duration) -> Vec<ReadRequest> {
        let expired: Vec<BarrierId> = self
            .barriers
            .iter()
            .filter(|(_, pending)| now.saturating_duration_since(pending.started) >= timeout)
            .map(|(&id, _)| id)
            .collect();
        let mut reads = Vec::new();
        for id in expired {
            if let Some(mut batch) = self.resolve_barrier(id) {
                reads.append(&mut batch);
            }
        }
        reads
    }

    /// Removes every request still held, for group teardown.
    pub fn drain(&mut self) -> (Vec<WriteRequest>, Vec<ReadRequest>) {
        let mut writes = self.writes.drain();
        let mut rounds: Vec<_> = self.rounds.drain().collect();
        rounds.sort_by_key(|(round, _)| *round);
        for (_, mut batch) in rounds {
            writes.append(&mut batch);
        }

        let mut reads = self.reads.drain();
        for (_, mut pending) in self.barriers.drain() {
            reads.append(&mut pending.reads);
        }
        for (_, mut batch) in self.parked.drain(..) {
            reads.append(&mut batch);
        }
        self.writes.finish_round();
        self.reads.finish_round();
        (writes, reads)
    }
}
