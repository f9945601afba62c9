//! Embedded durable key-value store
//!
//! The whole keyspace lives in an ordered in-memory index; every change is
//! first appended to the log as one CRC-framed batch and synced, then applied
//! to the index. Opening the store replays the log. When more than half of the
//! log is dead (overwritten or deleted entries) it is compacted into a fresh
//! file holding only live entries.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use super::acquire_lock;
use super::format::{Op, OP_HEADER_SIZE};
use super::reader::LogReader;
use super::writer::{rewrite, LogWriter};
use crate::Result;

/// Dead bytes tolerated before compaction is considered
const COMPACT_MIN_DEAD_BYTES: u64 = 4 * 1024 * 1024;

/// Operations per batch when rewriting the log
const COMPACT_BATCH_OPS: usize = 1024;

type Index = BTreeMap<Vec<u8>, Vec<u8>>;

/// Durable, ordered key-value store backed by an append-only log
pub struct LogStore {
    state: Mutex<LogState>,
}

struct LogState {
    path: PathBuf,
    index: Index,
    writer: LogWriter,
    live_bytes: u64,
    dead_bytes: u64,
}

impl LogStore {
    /// Open the store at `path`, creating the log if it does not exist
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but is not a log, or cannot be opened
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut index = Index::new();

        let writer = if path.exists() {
            let reader = LogReader::open(path)?;
            let outcome = reader.replay(|ops| apply(&mut index, ops));

            if let Some(reason) = &outcome.stopped {
                warn!(
                    "Discarding log tail of {} after offset {}: {}",
                    path.display(),
                    outcome.valid_len,
                    reason
                );
            }

            info!(
                "Replayed {} batches from {} ({} keys)",
                outcome.batches,
                path.display(),
                index.len()
            );

            drop(reader);
            LogWriter::open(path, outcome.valid_len)?
        } else {
            info!("Creating log {}", path.display());
            LogWriter::create(path)?
        };

        let live_bytes = index.iter().map(|(k, v)| entry_size(k, v)).sum::<u64>();
        let dead_bytes = writer.len().saturating_sub(live_bytes);

        Ok(Self {
            state: Mutex::new(LogState {
                path: path.to_path_buf(),
                index,
                writer,
                live_bytes,
                dead_bytes,
            }),
        })
    }

    /// Read a value
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        acquire_lock(&self.state).index.get(key).cloned()
    }

    /// Run `f` against a consistent view of the store, without writing
    pub fn view<T>(&self, f: impl FnOnce(&Txn<'_>) -> T) -> T {
        let state = acquire_lock(&self.state);
        let txn = Txn::new(&state.index);
        f(&txn)
    }

    /// Run `f` and commit the writes it stages as one atomic batch
    ///
    /// Reads inside `f` see the state before the transaction. If `f` fails
    /// nothing is written.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, or of writing the batch
    pub fn transact<T>(&self, f: impl FnOnce(&mut Txn<'_>) -> Result<T>) -> Result<T> {
        let mut state = acquire_lock(&self.state);

        let (value, ops) = {
            let mut txn = Txn::new(&state.index);
            let value = f(&mut txn)?;
            (value, txn.ops)
        };

        state.commit(ops)?;
        Ok(value)
    }

    /// Number of keys
    #[must_use]
    pub fn len(&self) -> usize {
        acquire_lock(&self.state).index.len()
    }

    /// Whether the store holds no keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current size of the log file
    #[must_use]
    pub fn log_len(&self) -> u64 {
        acquire_lock(&self.state).writer.len()
    }

    /// Rewrite the log with live entries only
    ///
    /// # Errors
    ///
    /// Returns error if the new log cannot be written
    pub fn compact(&self) -> Result<()> {
        acquire_lock(&self.state).compact()
    }
}

impl LogState {
    fn commit(&mut self, ops: Vec<Op>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        self.writer.append(&ops)?;

        for op in ops {
            if let Some(old) = self.index.get(op.key()) {
                let size = entry_size(op.key(), old);
                self.live_bytes = self.live_bytes.saturating_sub(size);
                self.dead_bytes += size;
            }
            match op {
                Op::Put(key, value) => {
                    self.live_bytes += entry_size(&key, &value);
                    self.index.insert(key, value);
                }
                Op::Delete(key) => {
                    self.dead_bytes += (OP_HEADER_SIZE + key.len()) as u64;
                    self.index.remove(&key);
                }
            }
        }

        if self.dead_bytes > COMPACT_MIN_DEAD_BYTES && self.dead_bytes > self.live_bytes {
            if let Err(e) = self.compact() {
                // The batch is already durable; compaction is retried on the next commit
                warn!("Log compaction of {} failed: {}", self.path.display(), e);
            }
        }

        Ok(())
    }

    fn compact(&mut self) -> Result<()> {
        let before = self.writer.len();
        let entries = self.index.iter().map(|(k, v)| (k.as_slice(), v.as_slice()));

        self.writer = rewrite(&self.path, entries, COMPACT_BATCH_OPS)?;
        self.dead_bytes = self.writer.len().saturating_sub(self.live_bytes);

        debug!(
            "Compacted {}: {} -> {} bytes",
            self.path.display(),
            before,
            self.writer.len()
        );
        Ok(())
    }
}

fn apply(index: &mut Index, ops: Vec<Op>) {
    for op in ops {
        match op {
            Op::Put(key, value) => {
                index.insert(key, value);
            }
            Op::Delete(key) => {
                index.remove(&key);
            }
        }
    }
}

fn entry_size(key: &[u8], value: &[u8]) -> u64 {
    (OP_HEADER_SIZE + key.len() + value.len()) as u64
}

/// A view of the store that stages writes
pub struct Txn<'a> {
    index: &'a Index,
    ops: Vec<Op>,
}

impl<'a> Txn<'a> {
    fn new(index: &'a Index) -> Self {
        Self {
            index,
            ops: Vec::new(),
        }
    }

    /// Read a committed value
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<&'a [u8]> {
        self.index.get(key).map(Vec::as_slice)
    }

    /// Committed entries whose key starts with `prefix`, in key order
    pub fn scan_prefix(
        &self,
        prefix: &[u8],
    ) -> impl DoubleEndedIterator<Item = (&'a [u8], &'a [u8])> {
        let upper = match prefix_successor(prefix) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };

        self.index
            .range::<Vec<u8>, _>((Bound::Included(prefix.to_vec()), upper))
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Stage setting `key` to `value`
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(Op::Put(key, value));
    }

    /// Stage removing `key`
    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push(Op::Delete(key));
    }
}

/// Smallest key greater than every key starting with `prefix`
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}
