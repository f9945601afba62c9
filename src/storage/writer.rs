//! Log file writer

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytemuck::bytes_of;

use super::format::{encode_batch, FileHeader, Op, FILE_HEADER_SIZE};
use crate::Result;

/// Appends batches to a log file
pub struct LogWriter {
    file: File,
    len: u64,
}

impl LogWriter {
    /// Create a new, empty log file (truncating any existing one)
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be created or synced
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        file.write_all(bytes_of(&FileHeader::default()))?;
        file.sync_all()?;

        Ok(Self {
            file,
            len: FILE_HEADER_SIZE as u64,
        })
    }

    /// Open an existing log for appending after `valid_len` bytes
    ///
    /// Anything beyond `valid_len` (a torn batch) is cut off.
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be opened or truncated
    pub fn open(path: &Path, valid_len: u64) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;

        if file.metadata()?.len() != valid_len {
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_len))?;

        Ok(Self {
            file,
            len: valid_len,
        })
    }

    /// Current log length
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the log holds no batches
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len <= FILE_HEADER_SIZE as u64
    }

    /// Append one batch and sync it to disk
    ///
    /// On failure the log is cut back to its previous length, so a batch is
    /// either fully written or absent.
    ///
    /// # Errors
    ///
    /// Returns error if the write or sync fails
    pub fn append(&mut self, ops: &[Op]) -> Result<()> {
        let frame = encode_batch(ops)?;

        let written = self
            .file
            .write_all(&frame)
            .and_then(|()| self.file.sync_data());

        if let Err(e) = written {
            // Best effort: the reader ignores a torn tail anyway
            let _ = self.file.set_len(self.len);
            let _ = self.file.seek(SeekFrom::Start(self.len));
            return Err(e.into());
        }

        self.len += frame.len() as u64;
        Ok(())
    }
}

/// Write `ops` into a fresh log at a temporary path, then move it over `path`
///
/// # Errors
///
/// Returns error if the new log cannot be written or renamed
pub fn rewrite<'a>(
    path: &Path,
    entries: impl Iterator<Item = (&'a [u8], &'a [u8])>,
    ops_per_batch: usize,
) -> Result<LogWriter> {
    let tmp_path = compaction_path(path);

    {
        let mut writer = LogWriter::create(&tmp_path)?;
        let mut batch = Vec::with_capacity(ops_per_batch);

        for (key, value) in entries {
            batch.push(Op::Put(key.to_vec(), value.to_vec()));
            if batch.len() == ops_per_batch {
                writer.append(&batch)?;
                batch.clear();
            }
        }

        if !batch.is_empty() {
            writer.append(&batch)?;
        }
    }

    std::fs::rename(&tmp_path, path)?;

    let len = std::fs::metadata(path)?.len();
    LogWriter::open(path, len)
}

fn compaction_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".compact");
    path.with_file_name(name)
}
