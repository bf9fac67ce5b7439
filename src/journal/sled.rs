//! Sled-backed journal: a `records` tree keyed by big-endian index and a
//! `state` tree of UTF-8 values.

use super::{Journal, JournalError, Transaction};
use crate::raft::{Entry, EntryKind, LogIndex};
use crate::wake::lock;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug)]
struct Trees {
    db: sled::Db,
    records: sled::Tree,
    state: sled::Tree,
}

/// Journal stored in an embedded sled database.
#[derive(Debug)]
pub struct SledJournal {
    path: PathBuf,
    cache_capacity: Option<u64>,
    inner: Mutex<Option<Trees>>,
}

impl From<sled::Error> for JournalError {
    fn from(e: sled::Error) -> Self {
        JournalError::Backend(e.to_string())
    }
}

impl SledJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache_capacity: None,
            inner: Mutex::new(None),
        }
    }

    /// Sets sled's page cache size in bytes.
    pub fn with_cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = Some(bytes);
        self
    }

    fn trees<T>(&self, f: impl FnOnce(&Trees) -> Result<T, JournalError>) -> Result<T, JournalError> {
        let guard = lock(&self.inner);
        let trees = guard.as_ref().ok_or(JournalError::Closed)?;
        f(trees)
    }
}

fn encode_entry(entry: &Entry) -> Vec<u8> {
    let mut value = Vec::with_capacity(9 + entry.data.len());
    value.extend_from_slice(&entry.term.to_be_bytes());
    value.push(entry.kind.to_byte());
    value.extend_from_slice(&entry.data);
    value
}

fn decode_entry(index: LogIndex, value: &[u8]) -> Result<Entry, JournalError> {
    let Some((term, rest)) = value.split_first_chunk::<8>() else {
        return Err(JournalError::Corrupt(format!("record {index} is {} bytes", value.len())));
    };
    let Some((&kind, data)) = rest.split_first() else {
        return Err(JournalError::Corrupt(format!("record {index} has no kind")));
    };
    let kind = EntryKind::from_byte(kind)
        .ok_or_else(|| JournalError::Corrupt(format!("record {index} has unknown kind {kind}")))?;
    Ok(Entry::with_kind(u64::from_be_bytes(*term), kind, data))
}

impl Journal for SledJournal {
    fn name(&self) -> &str {
        "sled"
    }

    fn open(&self) -> Result<(), JournalError> {
        let mut inner = lock(&self.inner);
        if inner.is_some() {
            return Ok(());
        }
        let mut config = sled::Config::new().path(&self.path);
        if let Some(bytes) = self.cache_capacity {
            config = config.cache_capacity(bytes);
        }
        let db = config.open()?;
        let records = db.open_tree("records")?;
        let state = db.open_tree("state")?;
        tracing::debug!(path = %self.path.display(), records = records.len(), "Opened sled journal");
        *inner = Some(Trees { db, records, state });
        Ok(())
    }

    fn close(&self) -> Result<(), JournalError> {
        if let Some(trees) = lock(&self.inner).take() {
            trees.db.flush()?;
        }
        Ok(())
    }

    fn commit_tx(&self, tx: Transaction) -> Result<(), JournalError> {
        self.trees(|trees| {
            let mut records = sled::Batch::default();
            for (index, entry) in tx.records() {
                records.insert(index.to_be_bytes().to_vec(), encode_entry(entry));
            }
            let mut state = sled::Batch::default();
            for (key, value) in tx.state() {
                state.insert(key.as_bytes(), value.as_bytes());
            }
            // Records land before the state that makes them visible.
            trees.records.apply_batch(records)?;
            trees.state.apply_batch(state)?;
            trees.db.flush()?;
            Ok(())
        })
    }

    fn get_record(&self, index: LogIndex) -> Result<Option<Entry>, JournalError> {
        self.trees(|trees| {
            trees
                .records
                .get(index.to_be_bytes())?
                .map(|value| decode_entry(index, &value))
                .transpose()
        })
    }

    fn get_state(&self, key: &str) -> Result<Option<String>, JournalError> {
        self.trees(|trees| {
            trees
                .state
                .get(key.as_bytes())?
                .map(|value| {
                    String::from_utf8(value.to_vec()).map_err(|e| JournalError::Corrupt(e.to_string()))
                })
                .transpose()
        })
    }
}
