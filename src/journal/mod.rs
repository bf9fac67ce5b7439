//! Journal
//!
//! Durable storage for a group's log records and its small key/value state
//! (term, vote, commit and last index). Backends implement [`Journal`];
//! the engine never depends on a particular one.
//!
//! Writes go through a [`Transaction`], which buffers records and state and
//! lands them together on `commit_tx`.

use crate::raft::{Entry, EntryKind, HardState, LogIndex, NodeId, Term};
use crate::wake::lock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[cfg(feature = "sled")]
mod sled;
#[cfg(feature = "sled")]
pub use self::sled::SledJournal;

/// State key holding the current term.
pub const TERM_KEY: &str = "term";
/// State key holding the vote cast in the current term.
pub const VOTED_FOR_KEY: &str = "voted_for";
/// State key holding the highest applied commit index.
pub const COMMIT_INDEX_KEY: &str = "commit_index";
/// State key holding the index of the last valid record.
pub const LAST_INDEX_KEY: &str = "last_index";

// ============================================================================
// ERRORS
// ============================================================================

/// Errors raised by journal backends.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Corrupt journal: {0}")]
    Corrupt(String),
    #[error("Journal is closed")]
    Closed,
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<std::io::Error> for JournalError {
    fn from(e: std::io::Error) -> Self {
        JournalError::Io(e.to_string())
    }
}

// ============================================================================
// TRANSACTION
// ============================================================================

/// Buffered journal writes, applied atomically by [`Journal::commit_tx`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transaction {
    records: Vec<(LogIndex, Entry)>,
    state: Vec<(String, String)>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_record(&mut self, index: LogIndex, entry: Entry) {
        self.records.push((index, entry));
    }

    pub fn set_state(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.state.push((key.into(), value.into()));
    }

    pub fn records(&self) -> &[(LogIndex, Entry)] {
        &self.records
    }

    pub fn state(&self) -> &[(String, String)] {
        &self.state
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.state.is_empty()
    }
}

// ============================================================================
// JOURNAL TRAIT
// ============================================================================

/// Storage backend for one group.
///
/// Calls for one group arrive from one journal worker and the engine
/// thread; implementations only need interior locking, not ordering.
pub trait Journal: Send + Sync + fmt::Debug {
    /// Backend name, for logs.
    fn name(&self) -> &str;

    fn open(&self) -> Result<(), JournalError>;

    fn close(&self) -> Result<(), JournalError>;

    fn begin_tx(&self) -> Result<Transaction, JournalError> {
        Ok(Transaction::new())
    }

    /// Makes every write buffered in `tx` durable.
    fn commit_tx(&self, tx: Transaction) -> Result<(), JournalError>;

    /// Discards `tx`.
    fn abort_tx(&self, tx: Transaction) {
        drop(tx);
    }

    fn get_record(&self, index: LogIndex) -> Result<Option<Entry>, JournalError>;

    fn set_record(&self, index: LogIndex, entry: Entry) -> Result<(), JournalError> {
        let mut tx = self.begin_tx()?;
        tx.set_record(index, entry);
        self.commit_tx(tx)
    }

    fn get_state(&self, key: &str) -> Result<Option<String>, JournalError>;

    fn set_state(&self, key: &str, value: &str) -> Result<(), JournalError> {
        let mut tx = self.begin_tx()?;
        tx.set_state(key, value);
        self.commit_tx(tx)
    }
}

// ============================================================================
// LOG HELPERS
// ============================================================================

/// Persists `entries` at `start..` and moves the valid tail to their end in
/// one transaction.
pub fn persist_batch(journal: &dyn Journal, start: LogIndex, entries: &[Entry]) -> Result<(), JournalError> {
    if entries.is_empty() {
        return Ok(());
    }
    let mut tx = journal.begin_tx()?;
    for (offset, entry) in entries.iter().enumerate() {
        tx.set_record(start + offset as LogIndex, entry.clone());
    }
    let last = start + entries.len() as LogIndex - 1;
    tx.set_state(LAST_INDEX_KEY, last.to_string());
    journal.commit_tx(tx)
}

/// Persists term and vote together.
pub fn persist_hard_state(journal: &dyn Journal, term: Term, voted_for: Option<NodeId>) -> Result<(), JournalError> {
    let mut tx = journal.begin_tx()?;
    tx.set_state(TERM_KEY, term.to_string());
    tx.set_state(
        VOTED_FOR_KEY,
        voted_for.map(|id| id.to_string()).unwrap_or_default(),
    );
    journal.commit_tx(tx)
}

fn parse_u64(journal: &dyn Journal, key: &str) -> Result<Option<u64>, JournalError> {
    match journal.get_state(key)? {
        None => Ok(None),
        Some(value) if value.is_empty() => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| JournalError::Corrupt(format!("state {key} = {value:?} is not a number"))),
    }
}

/// Reads the persisted term, vote and commit index.
pub fn load_hard_state(journal: &dyn Journal) -> Result<HardState, JournalError> {
    Ok(HardState {
        term: parse_u64(journal, TERM_KEY)?.unwrap_or(0),
        voted_for: parse_u64(journal, VOTED_FOR_KEY)?,
        commit_index: parse_u64(journal, COMMIT_INDEX_KEY)?.unwrap_or(0),
    })
}

/// Reads records `1..=last_index`. Records past the stored last index are
/// leftovers of a truncated tail and are ignored.
pub fn load_log(journal: &dyn Journal) -> Result<Vec<Entry>, JournalError> {
    let last = parse_u64(journal, LAST_INDEX_KEY)?.unwrap_or(0);
    (1..=last)
        .map(|index| {
            journal
                .get_record(index)?
                .ok_or_else(|| JournalError::Corrupt(format!("missing record {index} (last index {last})")))
        })
        .collect()
}

// ============================================================================
// MEMORY JOURNAL
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    open: bool,
    records: BTreeMap<LogIndex, Entry>,
    state: BTreeMap<String, String>,
}

/// Volatile journal. Contents survive `close`/`open` but not the process.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    inner: Mutex<MemoryState>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        lock(&self.inner).records.len()
    }
}

impl Journal for MemoryJournal {
    fn name(&self) -> &str {
        "memory"
    }

    fn open(&self) -> Result<(), JournalError> {
        lock(&self.inner).open = true;
        Ok(())
    }

    fn close(&self) -> Result<(), JournalError> {
        lock(&self.inner).open = false;
        Ok(())
    }

    fn commit_tx(&self, tx: Transaction) -> Result<(), JournalError> {
        let mut inner = lock(&self.inner);
        if !inner.open {
            return Err(JournalError::Closed);
        }
        for (index, entry) in tx.records {
            inner.records.insert(index, entry);
        }
        for (key, value) in tx.state {
            inner.state.insert(key, value);
        }
        Ok(())
    }

    fn get_record(&self, index: LogIndex) -> Result<Option<Entry>, JournalError> {
        let inner = lock(&self.inner);
        if !inner.open {
            return Err(JournalError::Closed);
        }
        Ok(inner.records.get(&index).cloned())
    }

    fn get_state(&self, key: &str) -> Result<Option<String>, JournalError> {
        let inner = lock(&self.inner);
        if !inner.open {
            return Err(JournalError::Closed);
        }
        Ok(inner.state.get(key).cloned())
    }
}

// ============================================================================
// FILE JOURNAL
// ============================================================================

const RECORDS_FILE: &str = "records.log";
const STATE_FILE: &str = "state.json";
/// `[len u32][crc32 u32]`
const RECORD_HEADER: usize = 8;
/// `[index u64][term u64][kind u8]`
const RECORD_FIXED: usize = 17;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    values: BTreeMap<String, String>,
}

#[derive(Debug)]
struct FileState {
    records_file: File,
    records: BTreeMap<LogIndex, Entry>,
    state: BTreeMap<String, String>,
}

/// Journal in a directory: an append-only record file plus a JSON state
/// file replaced atomically.
///
/// A later record for the same index supersedes an earlier one. On open the
/// record file is scanned and a torn or corrupt tail is cut off.
#[derive(Debug)]
pub struct FileJournal {
    dir: PathBuf,
    sync: bool,
    inner: Mutex<Option<FileState>>,
}

impl FileJournal {
    /// Journal rooted at `dir`, syncing on every commit.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sync: true,
            inner: Mutex::new(None),
        }
    }

    /// Disables `fsync` on commit. Data survives process crashes only.
    pub fn without_sync(mut self) -> Self {
        self.sync = false;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn encode_record(index: LogIndex, entry: &Entry, out: &mut Vec<u8>) {
        let len = (RECORD_FIXED + entry.data.len()) as u32;
        let mut body = Vec::with_capacity(len as usize);
        body.extend_from_slice(&index.to_be_bytes());
        body.extend_from_slice(&entry.term.to_be_bytes());
        body.push(entry.kind.to_byte());
        body.extend_from_slice(&entry.data);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
        out.extend_from_slice(&body);
    }

    /// Scans `bytes`, returning decoded records and the length of the valid prefix.
    fn scan_records(bytes: &[u8]) -> (BTreeMap<LogIndex, Entry>, usize) {
        let mut records = BTreeMap::new();
        let mut pos = 0;
        while let Some(header) = bytes.get(pos..pos + RECORD_HEADER) {
            let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
            let start = pos + RECORD_HEADER;
            let Some(body) = bytes.get(start..start + len) else {
                break;
            };
            if len < RECORD_FIXED || crc32fast::hash(body) != crc {
                break;
            }
            let Some(kind) = EntryKind::from_byte(body[16]) else {
                break;
            };
            let mut index = [0u8; 8];
            let mut term = [0u8; 8];
            index.copy_from_slice(&body[..8]);
            term.copy_from_slice(&body[8..16]);
            records.insert(
                u64::from_be_bytes(index),
                Entry::with_kind(u64::from_be_bytes(term), kind, &body[RECORD_FIXED..]),
            );
            pos = start + len;
        }
        (records, pos)
    }

    fn write_state(&self, state: &BTreeMap<String, String>) -> Result<(), JournalError> {
        let file = StateFile {
            values: state.clone(),
        };
        let bytes = serde_json::to_vec(&file).map_err(|e| JournalError::Backend(e.to_string()))?;
        let tmp = self.dir.join(format!("{STATE_FILE}.tmp"));
        {
            let mut out = File::create(&tmp)?;
            out.write_all(&bytes)?;
            if self.sync {
                out.sync_all()?;
            }
        }
        fs::rename(&tmp, self.dir.join(STATE_FILE))?;
        Ok(())
    }
}

impl Journal for FileJournal {
    fn name(&self) -> &str {
        "file"
    }

    fn open(&self) -> Result<(), JournalError> {
        let mut inner = lock(&self.inner);
        if inner.is_some() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;

        let mut records_file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(self.dir.join(RECORDS_FILE))?;
        let mut bytes = Vec::new();
        records_file.read_to_end(&mut bytes)?;
        let (records, valid) = Self::scan_records(&bytes);
        if valid < bytes.len() {
            tracing::warn!(
                dir = %self.dir.display(),
                valid,
                total = bytes.len(),
                "Truncating torn journal tail"
            );
            records_file.set_len(valid as u64)?;
            records_file.seek(SeekFrom::End(0))?;
        }

        let state = match fs::read(self.dir.join(STATE_FILE)) {
            Ok(bytes) => serde_json::from_slice::<StateFile>(&bytes)
                .map_err(|e| JournalError::Corrupt(format!("state file: {e}")))?
                .values,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(dir = %self.dir.display(), records = records.len(), "Opened file journal");
        *inner = Some(FileState {
            records_file,
            records,
            state,
        });
        Ok(())
    }

    fn close(&self) -> Result<(), JournalError> {
        if let Some(state) = lock(&self.inner).take() {
            state.records_file.sync_all()?;
        }
        Ok(())
    }

    fn commit_tx(&self, tx: Transaction) -> Result<(), JournalError> {
        let mut guard = lock(&self.inner);
        let inner = guard.as_mut().ok_or(JournalError::Closed)?;

        if !tx.records.is_empty() {
            let mut buf = Vec::new();
            for (index, entry) in &tx.records {
                Self::encode_record(*index, entry, &mut buf);
            }
            inner.records_file.write_all(&buf)?;
            if self.sync {
                inner.records_file.sync_data()?;
            }
        }

        if !tx.state.is_empty() {
            let mut state = inner.state.clone();
            state.extend(tx.state);
            self.write_state(&state)?;
            inner.state = state;
        }

        inner.records.extend(tx.records);
        Ok(())
    }

    fn get_record(&self, index: LogIndex) -> Result<Option<Entry>, JournalError> {
        let guard = lock(&self.inner);
        let inner = guard.as_ref().ok_or(JournalError::Closed)?;
        Ok(inner.records.get(&index).cloned())
    }

    fn get_state(&self, key: &str) -> Result<Option<String>, JournalError> {
        let guard = lock(&self.inner);
        let inner = guard.as_ref().ok_or(JournalError::Closed)?;
        Ok(inner.state.get(key).cloned())
    }
}
