use multiraft::journal::{Journal, JournalError, MemoryJournal, Transaction};
use multiraft::network::memory::MemoryNetwork;
use multiraft::consensus::{AppendContext, BarrierId, RoundId};
use multiraft::network::{AppendRequest, AppendResponse, VoteRequest, VoteResponse};
use multiraft::{
    Consensus, ConsensusError, ConsensusIo, Engine, EngineBuilder, EngineError, Entry, Group, GroupOptions,
    KeyValueStateMachine, KvCommand, LogIndex, NodeId, Role, StateMachine, Term,
};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn engine(network: &MemoryNetwork, port: u16) -> Engine {
    EngineBuilder::new()
        .journal_workers(4)
        .apply_workers(4)
        .configure(|config| {
            config.tick_interval = Duration::from_millis(5);
            config.commit_timeout = Duration::from_secs(5);
            config.raft.election_timeout_min = Duration::from_millis(30);
            config.raft.election_timeout_max = Duration::from_millis(60);
            config.raft.heartbeat_interval = Duration::from_millis(10);
        })
        .transport(network.endpoint(port))
        .build()
        .unwrap()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn wait_for_leader(group: &Group) {
    assert!(
        wait_until(Duration::from_secs(5), || group.status().role == Role::Leader),
        "group {} never elected itself",
        group.identity()
    );
}

/// Memory journal that remembers the payloads of every write batch.
#[derive(Debug, Default)]
struct RecordingJournal {
    inner: MemoryJournal,
    batches: Mutex<Vec<Vec<Vec<u8>>>>,
}

impl RecordingJournal {
    fn batches(&self) -> Vec<Vec<Vec<u8>>> {
        self.batches.lock().unwrap().clone()
    }
}

impl Journal for RecordingJournal {
    fn name(&self) -> &str {
        "recording"
    }

    fn open(&self) -> Result<(), JournalError> {
        self.inner.open()
    }

    fn close(&self) -> Result<(), JournalError> {
        self.inner.close()
    }

    fn commit_tx(&self, tx: Transaction) -> Result<(), JournalError> {
        let payloads: Vec<Vec<u8>> = tx
            .records()
            .iter()
            .filter(|(_, entry)| !entry.is_blank())
            .map(|(_, entry)| entry.data.clone())
            .collect();
        if !payloads.is_empty() {
            self.batches.lock().unwrap().push(payloads);
        }
        self.inner.commit_tx(tx)
    }

    fn get_record(&self, index: LogIndex) -> Result<Option<Entry>, JournalError> {
        self.inner.get_record(index)
    }

    fn get_state(&self, key: &str) -> Result<Option<String>, JournalError> {
        self.inner.get_state(key)
    }
}

/// Journal whose record writes always fail.
#[derive(Debug, Default)]
struct BrokenDisk {
    inner: MemoryJournal,
}

impl Journal for BrokenDisk {
    fn name(&self) -> &str {
        "broken"
    }

    fn open(&self) -> Result<(), JournalError> {
        self.inner.open()
    }

    fn close(&self) -> Result<(), JournalError> {
        self.inner.close()
    }

    fn commit_tx(&self, tx: Transaction) -> Result<(), JournalError> {
        if !tx.records().is_empty() {
            return Err(JournalError::Io("disk full".to_string()));
        }
        self.inner.commit_tx(tx)
    }

    fn get_record(&self, index: LogIndex) -> Result<Option<Entry>, JournalError> {
        self.inner.get_record(index)
    }

    fn get_state(&self, key: &str) -> Result<Option<String>, JournalError> {
        self.inner.get_state(key)
    }
}

/// Records every write and read callback.
#[derive(Default)]
struct RecordingMachine {
    writes: Mutex<Vec<(LogIndex, Vec<u8>)>>,
    reads: Mutex<Vec<(Vec<Vec<u8>>, Vec<Vec<u8>>)>>,
}

impl StateMachine for RecordingMachine {
    fn apply_write(&self, index: LogIndex, payload: &[u8]) {
        self.writes.lock().unwrap().push((index, payload.to_vec()));
    }

    fn apply_reads(&self, deferred: &[Vec<u8>], fresh: &[Vec<u8>]) -> Vec<Vec<u8>> {
        self.reads.lock().unwrap().push((deferred.to_vec(), fresh.to_vec()));
        deferred.iter().chain(fresh).map(|payload| payload.repeat(2)).collect()
    }
}

/// Blocks every applied write until the test releases it.
struct GatedMachine {
    gate: Mutex<Receiver<()>>,
    applied: AtomicU64,
    rounds: Mutex<Vec<(usize, usize)>>,
}

impl StateMachine for GatedMachine {
    fn apply_write(&self, index: LogIndex, _payload: &[u8]) {
        let _ = self.gate.lock().unwrap().recv_timeout(Duration::from_secs(10));
        self.applied.store(index, Ordering::SeqCst);
    }

    fn apply_reads(&self, deferred: &[Vec<u8>], fresh: &[Vec<u8>]) -> Vec<Vec<u8>> {
        self.rounds.lock().unwrap().push((deferred.len(), fresh.len()));
        let applied = self.applied.load(Ordering::SeqCst).to_string().into_bytes();
        vec![applied; deferred.len() + fresh.len()]
    }
}

#[test]
fn test_concurrent_writes_form_one_round() {
    let network = MemoryNetwork::new();
    let engine = Arc::new(engine(&network, 7400));
    let journal = Arc::new(RecordingJournal::default());
    let machine = Arc::new(RecordingMachine::default());
    let group = engine
        .add_group(GroupOptions::new("127.0.0.1:7400", 0).journal(journal.clone()), machine.clone())
        .unwrap();
    wait_for_leader(&group);

    // Hold the request queue so all three land before the engine looks.
    group.requests().stop();
    let mut handles = Vec::new();
    for (queued, payload) in ["a", "b", "c"].into_iter().enumerate() {
        let engine = Arc::clone(&engine);
        let identity = group.identity().to_string();
        handles.push(thread::spawn(move || engine.submit_write(&identity, payload)));
        assert!(wait_until(Duration::from_secs(5), || group.requests().len() == queued + 1));
    }
    group.requests().resume();

    let indices: Vec<LogIndex> = handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect();
    assert!(indices[0] < indices[1] && indices[1] < indices[2]);

    assert_eq!(journal.batches(), vec![vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]]);
    assert_eq!(
        *machine.writes.lock().unwrap(),
        vec![
            (indices[0], b"a".to_vec()),
            (indices[1], b"b".to_vec()),
            (indices[2], b"c".to_vec()),
        ]
    );
    assert_eq!(engine.metrics().write_rounds(), 1);
    assert_eq!(engine.metrics().largest_batch(), 3);
    assert!(group.waiters().is_empty());
}

#[test]
fn test_write_during_round_goes_to_next_round() {
    let network = MemoryNetwork::new();
    let engine = engine(&network, 7401);
    let journal = Arc::new(RecordingJournal::default());
    let group = engine
        .add_group(
            GroupOptions::new("127.0.0.1:7401", 0).journal(journal.clone()),
            Arc::new(RecordingMachine::default()),
        )
        .unwrap();
    wait_for_leader(&group);

    let first = engine.submit_write(group.identity(), "one").unwrap();
    let second = engine.submit_write(group.identity(), "two").unwrap();

    assert_eq!(second, first + 1);
    assert_eq!(journal.batches(), vec![vec![b"one".to_vec()], vec![b"two".to_vec()]]);
    assert_eq!(engine.metrics().write_rounds(), 2);
    assert_eq!(group.status().applied_index, second);
}

#[test]
fn test_reads_observe_writes() {
    let network = MemoryNetwork::new();
    let engine = engine(&network, 7402);
    let machine = Arc::new(KeyValueStateMachine::new());
    let group = engine
        .add_group(GroupOptions::new("127.0.0.1:7402", 0), machine.clone())
        .unwrap();
    wait_for_leader(&group);

    let index = engine
        .submit_write(group.identity(), KvCommand::set("color", "blue").encode())
        .unwrap();
    assert_eq!(machine.last_applied(), index);

    assert_eq!(engine.submit_read(group.identity(), "color").unwrap(), b"blue".to_vec());
    assert_eq!(engine.submit_read(group.identity(), "size").unwrap(), Vec::<u8>::new());
    assert_eq!(engine.metrics().read_rounds(), 2);
}

#[test]
fn test_read_waits_for_apply_and_runs_deferred() {
    let network = MemoryNetwork::new();
    let engine = Arc::new(engine(&network, 7403));
    let (release, gate) = mpsc::channel();
    let machine = Arc::new(GatedMachine {
        gate: Mutex::new(gate),
        applied: AtomicU64::new(0),
        rounds: Mutex::new(Vec::new()),
    });
    let group = engine
        .add_group(GroupOptions::new("127.0.0.1:7403", 0), machine.clone())
        .unwrap();
    wait_for_leader(&group);
    let identity = group.identity().to_string();

    let writer = {
        let engine = Arc::clone(&engine);
        let identity = identity.clone();
        thread::spawn(move || engine.submit_write(&identity, "x"))
    };
    // Committed, but the apply worker is stuck behind the gate.
    assert!(wait_until(Duration::from_secs(5), || group.status().commit_index >= 2));

    let reader = {
        let engine = Arc::clone(&engine);
        let identity = identity.clone();
        thread::spawn(move || engine.submit_read(&identity, "q"))
    };
    assert!(wait_until(Duration::from_secs(5), || engine.metrics().read_rounds() == 1));

    release.send(()).unwrap();
    let index = writer.join().unwrap().unwrap();
    assert_eq!(reader.join().unwrap().unwrap(), index.to_string().into_bytes());
    assert_eq!(*machine.rounds.lock().unwrap(), vec![(1, 0)]);

    // Nothing left to wait for: the next read runs fresh.
    assert_eq!(engine.submit_read(&identity, "q").unwrap(), index.to_string().into_bytes());
    assert_eq!(*machine.rounds.lock().unwrap(), vec![(1, 0), (0, 1)]);
}

#[test]
fn test_merged_reads_answer_in_order() {
    let network = MemoryNetwork::new();
    let engine = Arc::new(engine(&network, 7404));
    let machine = Arc::new(RecordingMachine::default());
    let group = engine
        .add_group(GroupOptions::new("127.0.0.1:7404", 0), machine.clone())
        .unwrap();
    wait_for_leader(&group);

    group.requests().stop();
    let mut handles = Vec::new();
    for (queued, payload) in ["x", "y", "z"].into_iter().enumerate() {
        let engine = Arc::clone(&engine);
        let identity = group.identity().to_string();
        handles.push(thread::spawn(move || engine.submit_read(&identity, payload)));
        assert!(wait_until(Duration::from_secs(5), || group.requests().len() == queued + 1));
    }
    group.requests().resume();

    let results: Vec<Vec<u8>> = handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect();
    assert_eq!(results, vec![b"xx".to_vec(), b"yy".to_vec(), b"zz".to_vec()]);
    assert_eq!(
        *machine.reads.lock().unwrap(),
        vec![(Vec::new(), vec![b"x".to_vec(), b"y".to_vec(), b"z".to_vec()])]
    );
}

#[test]
fn test_not_leader_creates_no_waiter() {
    let network = MemoryNetwork::new();
    let engine = engine(&network, 7410);
    let group = engine
        .add_group(
            GroupOptions::new("127.0.0.1:7410,127.0.0.1:7411,127.0.0.1:7412", 0),
            Arc::new(KeyValueStateMachine::new()),
        )
        .unwrap();

    // Peers never start, so no leader can be elected.
    assert_eq!(
        engine.submit_write(group.identity(), "x"),
        Err(EngineError::NotLeader { leader: None })
    );
    assert_eq!(
        engine.submit_read(group.identity(), "x"),
        Err(EngineError::NotLeader { leader: None })
    );
    assert!(group.waiters().is_empty());
    assert_eq!(engine.metrics().not_leader(), 2);
    assert_ne!(group.status().role, Role::Leader);
}

#[test]
fn test_persistence_failure_reaches_caller() {
    let network = MemoryNetwork::new();
    let engine = engine(&network, 7420);
    let group = engine
        .add_group(
            GroupOptions::new("127.0.0.1:7420", 0).journal(Arc::new(BrokenDisk::default())),
            Arc::new(KeyValueStateMachine::new()),
        )
        .unwrap();
    wait_for_leader(&group);

    let err = engine.submit_write(group.identity(), "x").unwrap_err();
    assert!(matches!(err, EngineError::PersistenceFailure(_)), "got {err:?}");
    assert!(group.waiters().is_empty());
    assert!(engine.metrics().persistence_failures() >= 1);

    // The failed entries are gone; the group keeps serving.
    assert_eq!(group.status().last_index, 0);
}

#[test]
fn test_del_group_fails_queued_requests() {
    let network = MemoryNetwork::new();
    let engine = Arc::new(engine(&network, 7430));
    let group = engine
        .add_group(GroupOptions::new("127.0.0.1:7430", 0), Arc::new(KeyValueStateMachine::new()))
        .unwrap();
    wait_for_leader(&group);
    let identity = group.identity().to_string();

    group.requests().stop();
    let pending = {
        let engine = Arc::clone(&engine);
        let identity = identity.clone();
        thread::spawn(move || engine.submit_write(&identity, "late"))
    };
    assert!(wait_until(Duration::from_secs(5), || group.requests().len() == 1));

    engine.del_group(&identity).unwrap();
    assert_eq!(pending.join().unwrap(), Err(EngineError::GroupNotFound(identity.clone())));
    assert_eq!(engine.submit_write(&identity, "x"), Err(EngineError::GroupNotFound(identity)));
    assert_eq!(engine.metrics().groups(), 0);
}

#[test]
fn test_shutdown_fails_queued_requests() {
    let network = MemoryNetwork::new();
    let engine = Arc::new(engine(&network, 7440));
    let group = engine
        .add_group(GroupOptions::new("127.0.0.1:7440", 0), Arc::new(KeyValueStateMachine::new()))
        .unwrap();
    wait_for_leader(&group);

    group.requests().stop();
    let pending = {
        let engine = Arc::clone(&engine);
        let identity = group.identity().to_string();
        thread::spawn(move || engine.submit_read(&identity, "k"))
    };
    assert!(wait_until(Duration::from_secs(5), || group.requests().len() == 1));

    engine.shutdown();
    assert_eq!(pending.join().unwrap(), Err(EngineError::Shutdown));
    assert!(group.is_closed());
    assert!(engine.groups().is_empty());
}

#[test]
fn test_status_and_metrics_export() {
    let network = MemoryNetwork::new();
    let engine = engine(&network, 7450);
    let group = engine
        .add_group(GroupOptions::new("127.0.0.1:7450", 0), Arc::new(KeyValueStateMachine::new()))
        .unwrap();
    wait_for_leader(&group);
    let index = engine.submit_write(group.identity(), KvCommand::set("a", "1").encode()).unwrap();

    let status = engine.group_status(group.identity()).unwrap();
    assert_eq!(status.role, Role::Leader);
    assert_eq!(status.leader, Some(0));
    assert_eq!(status.commit_index, index);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["identity"], "127.0.0.1:7450");
    assert_eq!(json["leader_addr"]["port"], 7450);

    let text = engine.metrics().to_prometheus_text();
    assert!(text.contains("multiraft_groups{instance=\"7450\"} 1"));
    assert!(text.contains("multiraft_write_rounds_total{instance=\"7450\"} 1"));
    assert!(engine.metrics().role_changes() >= 1);
}

/// Leader that never commits and assigns index 1 to every round.
struct FixedIndexLeader {
    term: Term,
}

impl Consensus for FixedIndexLeader {
    fn node_id(&self) -> NodeId {
        0
    }
    fn role(&self) -> Role {
        Role::Leader
    }
    fn term(&self) -> Term {
        self.term
    }
    fn leader(&self) -> Option<NodeId> {
        Some(0)
    }
    fn commit_index(&self) -> LogIndex {
        0
    }
    fn applied_index(&self) -> LogIndex {
        0
    }
    fn last_index(&self) -> LogIndex {
        1
    }

    fn tick(&mut self, _io: &mut dyn ConsensusIo, _elapsed: Duration) -> Result<(), ConsensusError> {
        Ok(())
    }

    fn retain_entries(
        &mut self,
        io: &mut dyn ConsensusIo,
        round: RoundId,
        payloads: Vec<Vec<u8>>,
    ) -> Result<LogIndex, ConsensusError> {
        let entries = payloads.into_iter().map(|data| Entry::new(self.term, data)).collect();
        io.retain(Some(round), 1, entries);
        Ok(1)
    }

    fn retain_finished(
        &mut self,
        _io: &mut dyn ConsensusIo,
        _start: LogIndex,
        _count: usize,
        _term: Term,
        _result: Result<(), JournalError>,
    ) -> Result<(), ConsensusError> {
        Ok(())
    }

    fn append_finished(
        &mut self,
        _io: &mut dyn ConsensusIo,
        _ctx: AppendContext,
        _result: Result<(), JournalError>,
    ) -> Result<(), ConsensusError> {
        Ok(())
    }

    fn apply_finished(&mut self, _io: &mut dyn ConsensusIo, _start: LogIndex, _count: usize) {}

    fn read_barrier(&mut self, io: &mut dyn ConsensusIo, barrier: BarrierId) -> Result<(), ConsensusError> {
        io.read_ready(barrier, Ok(0));
        Ok(())
    }

    fn recv_vote(&mut self, _io: &mut dyn ConsensusIo, _from: NodeId, _request: VoteRequest) -> Result<(), ConsensusError> {
        Ok(())
    }

    fn recv_vote_response(
        &mut self,
        _io: &mut dyn ConsensusIo,
        _from: NodeId,
        _response: VoteResponse,
    ) -> Result<(), ConsensusError> {
        Ok(())
    }

    fn recv_append(
        &mut self,
        _io: &mut dyn ConsensusIo,
        _from: NodeId,
        _request: AppendRequest,
    ) -> Result<(), ConsensusError> {
        Ok(())
    }

    fn recv_append_response(
        &mut self,
        _io: &mut dyn ConsensusIo,
        _from: NodeId,
        _response: AppendResponse,
    ) -> Result<(), ConsensusError> {
        Ok(())
    }
}

const ABORT_CHILD_ENV: &str = "MULTIRAFT_ABORT_CHILD";

/// Two rounds handed the same index collide in the waiter registry and
/// panic the engine thread.
fn write_twice_at_fixed_index() {
    let network = MemoryNetwork::new();
    let engine = engine(&network, 7460);
    let group = engine
        .add_group(
            GroupOptions::new("127.0.0.1:7460", 0)
                .consensus(|setup| Box::new(FixedIndexLeader { term: setup.hard_state.term.max(1) }) as Box<dyn Consensus>),
            Arc::new(KeyValueStateMachine::new()),
        )
        .unwrap();
    let identity = group.identity().to_string();

    thread::scope(|scope| {
        scope.spawn(|| engine.submit_write(&identity, KvCommand::set("a", "1").encode()));
        assert!(wait_until(Duration::from_secs(5), || group.waiters().len() == 1));
        let _ = engine.submit_write(&identity, KvCommand::set("b", "2").encode());
    });
}

#[test]
fn test_engine_thread_panic_aborts_process() {
    if std::env::var_os(ABORT_CHILD_ENV).is_some() {
        write_twice_at_fixed_index();
        return;
    }

    let output = Command::new(std::env::current_exe().unwrap())
        .args(["--exact", "test_engine_thread_panic_aborts_process", "--nocapture", "--test-threads=1"])
        .env(ABORT_CHILD_ENV, "1")
        .output()
        .unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success(), "child survived the panic: {stderr}");
    assert!(stderr.contains("waiter already registered"), "unexpected child output: {stderr}");
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(output.status.signal(), Some(6), "child was not aborted: {stderr}");
    }
}
