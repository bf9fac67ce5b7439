use multiraft::consensus::{AppendContext, BarrierId, RoundId};
use multiraft::network::{AppendResponse, PeerMessage, VoteResponse};
use multiraft::raft::HardState;
use multiraft::{Consensus, ConsensusError, ConsensusIo, Entry, LogIndex, NodeId, RaftConfig, RaftCore, Role, Term};
use std::time::Duration;

/// Host that records every side effect instead of performing it.
#[derive(Default)]
struct MockIo {
    outbox: Vec<(NodeId, PeerMessage)>,
    hard_state: Option<(Term, Option<NodeId>)>,
    retained: Vec<(LogIndex, Vec<Entry>)>,
    appended: Vec<(AppendContext, Vec<Entry>)>,
    to_apply: Vec<(LogIndex, Vec<Entry>)>,
    reads: Vec<(BarrierId, Result<LogIndex, ConsensusError>)>,
    applied: Vec<(LogIndex, Vec<u8>)>,
}

impl ConsensusIo for MockIo {
    fn send(&mut self, to: NodeId, message: PeerMessage) {
        self.outbox.push((to, message));
    }

    fn persist_hard_state(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<(), ConsensusError> {
        self.hard_state = Some((term, voted_for));
        Ok(())
    }

    fn retain(&mut self, _round: Option<RoundId>, start: LogIndex, entries: Vec<Entry>) {
        self.retained.push((start, entries));
    }

    fn append(&mut self, ctx: AppendContext, entries: Vec<Entry>) {
        self.appended.push((ctx, entries));
    }

    fn apply(&mut self, start: LogIndex, entries: Vec<Entry>) {
        self.to_apply.push((start, entries));
    }

    fn read_ready(&mut self, barrier: BarrierId, outcome: Result<LogIndex, ConsensusError>) {
        self.reads.push((barrier, outcome));
    }
}

fn config() -> RaftConfig {
    RaftConfig {
        election_timeout_min: Duration::from_millis(100),
        election_timeout_max: Duration::from_millis(200),
        heartbeat_interval: Duration::from_millis(20),
        max_entries_per_rpc: 100,
    }
}

/// Three cores wired together in-process. Journal and apply work completes
/// instantly and messages are delivered in send order.
struct Cluster {
    cores: Vec<RaftCore>,
    ios: Vec<MockIo>,
}

impl Cluster {
    fn new(size: u64) -> Self {
        let members: Vec<NodeId> = (0..size).collect();
        Self {
            cores: members
                .iter()
                .map(|&id| RaftCore::new(id, members.clone(), config()))
                .collect(),
            ios: members.iter().map(|_| MockIo::default()).collect(),
        }
    }

    /// Runs until no node has pending work.
    fn settle(&mut self) {
        loop {
            let mut progressed = false;
            for id in 0..self.cores.len() {
                progressed |= self.finish_io(id);
                let outbox = std::mem::take(&mut self.ios[id].outbox);
                for (to, message) in outbox {
                    progressed = true;
                    self.deliver(id as NodeId, to as usize, message);
                }
            }
            if !progressed {
                return;
            }
        }
    }

    fn finish_io(&mut self, id: usize) -> bool {
        let core = &mut self.cores[id];
        let io = &mut self.ios[id];
        let retained = std::mem::take(&mut io.retained);
        let appended = std::mem::take(&mut io.appended);
        let to_apply = std::mem::take(&mut io.to_apply);
        let progressed = !(retained.is_empty() && appended.is_empty() && to_apply.is_empty());

        for (start, entries) in retained {
            let term = entries[0].term;
            let _ = core.retain_finished(io, start, entries.len(), term, Ok(()));
        }
        for (ctx, _) in appended {
            let _ = core.append_finished(io, ctx, Ok(()));
        }
        for (start, entries) in to_apply {
            for (offset, entry) in entries.iter().enumerate() {
                if !entry.is_blank() {
                    io.applied.push((start + offset as LogIndex, entry.data.clone()));
                }
            }
            core.apply_finished(io, start, entries.len());
        }
        progressed
    }

    fn deliver(&mut self, from: NodeId, to: usize, message: PeerMessage) {
        let core = &mut self.cores[to];
        let io = &mut self.ios[to];
        let _ = match message {
            PeerMessage::Vote(request) => core.recv_vote(io, from, request),
            PeerMessage::VoteResponse(response) => core.recv_vote_response(io, from, response),
            PeerMessage::AppendEntries(request) => core.recv_append(io, from, request),
            PeerMessage::AppendEntriesResponse(response) => core.recv_append_response(io, from, response),
            _ => Ok(()),
        };
    }

    fn elect(&mut self, id: usize) {
        let io = &mut self.ios[id];
        self.cores[id].tick(io, Duration::from_millis(250)).unwrap();
        self.settle();
        assert_eq!(self.cores[id].role(), Role::Leader);
    }

    fn heartbeat(&mut self, leader: usize) {
        let io = &mut self.ios[leader];
        self.cores[leader].tick(io, Duration::from_millis(20)).unwrap();
        self.settle();
        for id in 0..self.cores.len() {
            let io = &mut self.ios[id];
            self.cores[id].tick(io, Duration::ZERO).unwrap();
        }
        self.settle();
    }
}

#[test]
fn test_leader_election_start() {
    let mut cluster = Cluster::new(3);
    assert_eq!(cluster.cores[0].term(), 0);
    assert_eq!(cluster.cores[0].role(), Role::Follower);

    let io = &mut cluster.ios[0];
    cluster.cores[0].tick(io, Duration::from_millis(250)).unwrap();

    assert_eq!(cluster.cores[0].term(), 1);
    assert_eq!(cluster.cores[0].role(), Role::Candidate);
    assert_eq!(cluster.ios[0].hard_state, Some((1, Some(0))));
    let targets: Vec<NodeId> = cluster.ios[0].outbox.iter().map(|(to, _)| *to).collect();
    assert_eq!(targets, vec![1, 2]);
}

#[test]
fn test_vote_handling() {
    let mut cluster = Cluster::new(3);
    let request = |term| multiraft::network::VoteRequest {
        term,
        last_log_index: 0,
        last_log_term: 0,
    };

    let io = &mut cluster.ios[1];
    cluster.cores[1].recv_vote(io, 2, request(1)).unwrap();
    cluster.cores[1].recv_vote(io, 0, request(1)).unwrap();

    let granted: Vec<(NodeId, bool)> = cluster.ios[1]
        .outbox
        .iter()
        .map(|(to, message)| match message {
            PeerMessage::VoteResponse(response) => (*to, response.granted),
            other => panic!("unexpected message {other:?}"),
        })
        .collect();
    assert_eq!(granted, vec![(2, true), (0, false)]);
    assert_eq!(cluster.ios[1].hard_state, Some((1, Some(2))));
}

#[test]
fn test_entries_replicate_and_apply_everywhere() {
    let mut cluster = Cluster::new(3);
    cluster.elect(0);

    let io = &mut cluster.ios[0];
    let start = cluster.cores[0]
        .retain_entries(io, 1, vec![b"a".to_vec(), b"b".to_vec()])
        .unwrap();
    // Index 1 holds the leader's blank entry.
    assert_eq!(start, 2);
    cluster.settle();
    assert_eq!(cluster.cores[0].commit_index(), 3);

    // Followers learn the commit index from the next heartbeat.
    cluster.heartbeat(0);
    for id in 0..3 {
        assert_eq!(cluster.cores[id].commit_index(), 3, "node {id}");
        assert_eq!(cluster.cores[id].applied_index(), 3, "node {id}");
        assert_eq!(
            cluster.ios[id].applied,
            vec![(2, b"a".to_vec()), (3, b"b".to_vec())],
            "node {id}"
        );
    }
    assert_eq!(cluster.cores[1].leader(), Some(0));
}

#[test]
fn test_follower_rejects_writes_and_reads() {
    let mut cluster = Cluster::new(3);
    cluster.elect(0);

    let io = &mut cluster.ios[2];
    assert_eq!(
        cluster.cores[2].retain_entries(io, 1, vec![b"x".to_vec()]),
        Err(ConsensusError::NotLeader { leader: Some(0) })
    );
    assert_eq!(
        cluster.cores[2].read_barrier(io, 1),
        Err(ConsensusError::NotLeader { leader: Some(0) })
    );
    assert!(cluster.ios[2].retained.is_empty());
}

#[test]
fn test_read_barrier_waits_for_quorum() {
    let mut cluster = Cluster::new(3);
    cluster.elect(0);
    let io = &mut cluster.ios[0];
    cluster.cores[0].retain_entries(io, 1, vec![b"a".to_vec()]).unwrap();
    cluster.settle();

    let io = &mut cluster.ios[0];
    cluster.cores[0].read_barrier(io, 7).unwrap();
    assert!(cluster.ios[0].reads.is_empty());

    cluster.settle();
    assert_eq!(cluster.ios[0].reads, vec![(7, Ok(2))]);
}

#[test]
fn test_new_leader_takes_over() {
    let mut cluster = Cluster::new(3);
    cluster.elect(0);
    let io = &mut cluster.ios[0];
    cluster.cores[0].retain_entries(io, 1, vec![b"a".to_vec()]).unwrap();
    cluster.settle();
    cluster.heartbeat(0);

    cluster.elect(1);
    assert_eq!(cluster.cores[1].term(), 2);
    assert_eq!(cluster.cores[0].role(), Role::Follower);
    assert_eq!(cluster.cores[0].leader(), Some(1));

    let io = &mut cluster.ios[1];
    assert_eq!(cluster.cores[1].retain_entries(io, 2, vec![b"b".to_vec()]), Ok(4));
    cluster.settle();
    cluster.heartbeat(1);
    assert_eq!(cluster.ios[0].applied, vec![(2, b"a".to_vec()), (4, b"b".to_vec())]);
}

#[test]
fn test_new_leader_holds_reads_until_own_term_commits() {
    let mut core = RaftCore::new(1, [0, 1, 2], config());
    core.restore(
        HardState {
            term: 1,
            voted_for: None,
            commit_index: 1,
        },
        vec![Entry::new(1, "a"), Entry::new(1, "b")],
    );
    let mut io = MockIo::default();
    core.tick(&mut io, Duration::from_millis(250)).unwrap();
    core.recv_vote_response(&mut io, 0, VoteResponse { term: 2, granted: true })
        .unwrap();
    assert_eq!(core.role(), Role::Leader);
    assert_eq!(io.retained, vec![(3, vec![Entry::blank(2)])]);

    core.read_barrier(&mut io, 7).unwrap();
    let ack = |match_index| AppendResponse {
        term: 2,
        success: true,
        match_index,
        last_index: match_index,
    };

    // A quorum on the old entries neither commits them nor answers the read.
    core.recv_append_response(&mut io, 0, ack(2)).unwrap();
    assert_eq!(core.commit_index(), 1);
    assert!(io.reads.is_empty());

    core.retain_finished(&mut io, 3, 1, 2, Ok(())).unwrap();
    core.recv_append_response(&mut io, 0, ack(3)).unwrap();
    assert_eq!(core.commit_index(), 3);
    assert!(io.reads.is_empty());

    // The held read now needs a fresh round of acknowledgements.
    core.recv_append_response(&mut io, 2, ack(3)).unwrap();
    assert_eq!(io.reads, vec![(7, Ok(3))]);
}

#[test]
fn test_new_leader_commits_leftover_entries() {
    let mut cluster = Cluster::new(3);
    cluster.elect(0);
    let io = &mut cluster.ios[0];
    cluster.cores[0].retain_entries(io, 1, vec![b"a".to_vec()]).unwrap();

    // Persisted locally and on node 1, but node 0 loses leadership before
    // learning of the quorum.
    let io = &mut cluster.ios[0];
    let (start, entries) = io.retained.remove(0);
    cluster.cores[0]
        .retain_finished(io, start, entries.len(), 1, Ok(()))
        .unwrap();
    let outbox = std::mem::take(&mut cluster.ios[0].outbox);
    for (to, message) in outbox {
        if to == 1 {
            cluster.deliver(0, 1, message);
        }
    }
    cluster.finish_io(1);
    cluster.ios[1].outbox.clear();
    assert_eq!(cluster.cores[1].last_index(), 2);
    assert_eq!(cluster.cores[0].commit_index(), 1);

    cluster.elect(1);
    cluster.heartbeat(1);
    for id in 0..3 {
        assert_eq!(cluster.cores[id].commit_index(), 3, "node {id}");
        assert_eq!(cluster.ios[id].applied, vec![(2, b"a".to_vec())], "node {id}");
    }
}
