//! Multi-Group Replicated Log Runtime
//!
//! Hosts many independent consensus groups in one process. Client writes
//! and reads are batched per group, persisted and applied on hashed worker
//! pools, and answered once committed, while a single engine thread drives
//! every consensus core.

pub mod builder;
pub mod consensus;
mod dispatch;
pub mod engine;
pub mod group;
pub mod journal;
pub mod metrics;
pub mod multi;
pub mod network;
pub mod pipeline;
pub mod raft;
pub mod state_machine;
pub mod task;
pub mod tasker;
pub mod waiter;
pub mod wake;
pub mod worker;

pub use builder::EngineBuilder;
pub use consensus::{Consensus, ConsensusError, ConsensusIo};
pub use engine::{Engine, EngineConfig, EngineError};
pub use group::{ClusterConfig, ConfigError, Group, GroupOptions, GroupStatus, JournalKind};
pub use journal::{FileJournal, Journal, JournalError, MemoryJournal};
pub use metrics::EngineMetrics;
pub use network::{PeerAddr, Transport};
pub use raft::{Entry, EntryKind, LogIndex, NodeId, RaftConfig, RaftCore, Role, Term};
pub use state_machine::{KeyValueStateMachine, KvCommand, NoOpStateMachine, StateMachine};
