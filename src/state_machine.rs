//! State Machine Abstraction
//!
//! Application callbacks supplied per group. Both run on the group's apply
//! worker, never on the engine thread, and must not block indefinitely.

use crate::raft::{Entry, LogIndex};
use crate::wake::{read, write};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Replicated application state.
///
/// # Example
///
/// ```ignore
/// struct Counter(AtomicU64);
///
/// impl StateMachine for Counter {
///     fn apply_write(&self, _index: LogIndex, _payload: &[u8]) {
///         self.0.fetch_add(1, Ordering::Relaxed);
///     }
///
///     fn apply_reads(&self, deferred: &[Vec<u8>], fresh: &[Vec<u8>]) -> Vec<Vec<u8>> {
///         let value = self.0.load(Ordering::Relaxed).to_be_bytes().to_vec();
///         vec![value; deferred.len() + fresh.len()]
///     }
/// }
/// ```
pub trait StateMachine: Send + Sync {
    /// Applies one committed entry. Entries arrive in index order, once per
    /// process lifetime; after a restart the committed prefix is replayed.
    fn apply_write(&self, index: LogIndex, payload: &[u8]);

    /// Applies a contiguous run of committed entries starting at `start`.
    fn apply_writes(&self, start: LogIndex, entries: &[Entry]) {
        for (offset, entry) in entries.iter().enumerate() {
            self.apply_write(start + offset as LogIndex, &entry.data);
        }
    }

    /// Answers a round of reads. `deferred` were parked behind earlier
    /// writes, `fresh` became serviceable immediately. Returns one result per
    /// read, `deferred` first, each list in submission order.
    fn apply_reads(&self, deferred: &[Vec<u8>], fresh: &[Vec<u8>]) -> Vec<Vec<u8>>;

    /// Returns the name of this state machine (for logging/metrics).
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// A simple no-op state machine for testing.
#[derive(Debug, Default, Clone)]
pub struct NoOpStateMachine;

impl StateMachine for NoOpStateMachine {
    fn apply_write(&self, _index: LogIndex, _payload: &[u8]) {}

    fn apply_reads(&self, deferred: &[Vec<u8>], fresh: &[Vec<u8>]) -> Vec<Vec<u8>> {
        vec![Vec::new(); deferred.len() + fresh.len()]
    }

    fn name(&self) -> &str {
        "NoOpStateMachine"
    }
}

/// Commands understood by [`KeyValueStateMachine`], JSON encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl KvCommand {
    pub fn set(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        KvCommand::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        KvCommand::Delete { key: key.into() }
    }

    /// Serializes the command into a write payload.
    pub fn encode(&self) -> Vec<u8> {
        // Plain enum of strings and bytes; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// A key-value store state machine for testing and examples.
///
/// Writes carry a JSON [`KvCommand`]; a read payload is a UTF-8 key and
/// returns the stored value, or an empty result when absent.
#[derive(Debug, Default)]
pub struct KeyValueStateMachine {
    data: RwLock<HashMap<String, Vec<u8>>>,
    last_applied: RwLock<LogIndex>,
}

impl KeyValueStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        read(&self.data).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        read(&self.data).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_applied(&self) -> LogIndex {
        *read(&self.last_applied)
    }
}

impl StateMachine for KeyValueStateMachine {
    fn apply_write(&self, index: LogIndex, payload: &[u8]) {
        match KvCommand::decode(payload) {
            Ok(KvCommand::Set { key, value }) => {
                write(&self.data).insert(key, value);
            }
            Ok(KvCommand::Delete { key }) => {
                write(&self.data).remove(&key);
            }
            Err(e) => {
                tracing::warn!(index, error = %e, "Skipping undecodable command");
            }
        }
        let mut last = write(&self.last_applied);
        *last = (*last).max(index);
    }

    fn apply_reads(&self, deferred: &[Vec<u8>], fresh: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let data = read(&self.data);
        deferred
            .iter()
            .chain(fresh)
            .map(|key| {
                std::str::from_utf8(key)
                    .ok()
                    .and_then(|key| data.get(key).cloned())
                    .unwrap_or_default()
            })
            .collect()
    }

    fn name(&self) -> &str {
        "KeyValueStateMachine"
    }
}
