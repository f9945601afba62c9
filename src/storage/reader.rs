//! Log file reader

use std::fs::File;
use std::path::Path;

use bytemuck::pod_read_unaligned;
use memmap2::Mmap;

use super::format::{decode_payload, BatchHeader, FileHeader, Op, BATCH_HEADER_SIZE, FILE_HEADER_SIZE};
use crate::{BasketsError, Result};

/// Result of replaying a log
#[derive(Debug)]
pub struct ReplayOutcome {
    /// Offset just past the last intact batch
    pub valid_len: u64,
    /// Number of batches applied
    pub batches: usize,
    /// Why replay stopped before the end of the file, if it did
    pub stopped: Option<BasketsError>,
}

/// Reader for log files
pub struct LogReader {
    _file: File,
    mmap: Mmap,
}

impl LogReader {
    /// Open an existing log file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be opened, mapped, or has an invalid header
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < FILE_HEADER_SIZE {
            return Err(BasketsError::InvalidFormat(
                "File too small to contain header".to_string(),
            ));
        }

        let header: FileHeader = pod_read_unaligned(&mmap[..FILE_HEADER_SIZE]);
        header.validate()?;

        Ok(Self { _file: file, mmap })
    }

    /// Total file length
    #[must_use]
    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Whether the log holds no batches
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.len() <= FILE_HEADER_SIZE
    }

    /// Feed every intact batch, in order, to `apply`
    ///
    /// Replay stops at the first incomplete or corrupted batch; everything
    /// before it is applied and its end offset reported.
    pub fn replay(&self, mut apply: impl FnMut(Vec<Op>)) -> ReplayOutcome {
        let mut offset = FILE_HEADER_SIZE;
        let mut batches = 0;

        let stopped = loop {
            if offset == self.mmap.len() {
                break None;
            }

            match self.read_batch(offset) {
                Ok((ops, next)) => {
                    apply(ops);
                    batches += 1;
                    offset = next;
                }
                Err(e) => break Some(e),
            }
        };

        ReplayOutcome {
            valid_len: offset as u64,
            batches,
            stopped,
        }
    }

    fn read_batch(&self, offset: usize) -> Result<(Vec<Op>, usize)> {
        let payload_start = offset + BATCH_HEADER_SIZE;
        if payload_start > self.mmap.len() {
            return Err(BasketsError::InvalidFormat(format!(
                "Incomplete batch header at offset {offset}"
            )));
        }

        let header: BatchHeader = pod_read_unaligned(&self.mmap[offset..payload_start]);
        let payload_end = payload_start + header.payload_len as usize;
        if payload_end > self.mmap.len() {
            return Err(BasketsError::InvalidFormat(format!(
                "Batch data extends beyond file: {payload_end} > {}",
                self.mmap.len()
            )));
        }

        let payload = &self.mmap[payload_start..payload_end];
        let actual = crc32fast::hash(payload);
        if actual != header.crc {
            return Err(BasketsError::CorruptedData {
                offset: offset as u64,
                expected: header.crc,
                actual,
            });
        }

        let ops = decode_payload(payload, header.op_count)?;
        Ok((ops, payload_end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::format::encode_batch;
    use crate::storage::LogWriter;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_replay_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.db");

        {
            let mut writer = LogWriter::create(&path).unwrap();
            for i in 0..10u8 {
                writer
                    .append(&[Op::Put(vec![i], format!("value {i}").into_bytes())])
                    .unwrap();
            }
        }

        let reader = LogReader::open(&path).unwrap();
        let mut seen = Vec::new();
        let outcome = reader.replay(|ops| seen.extend(ops));

        assert_eq!(outcome.batches, 10);
        assert!(outcome.stopped.is_none());
        assert_eq!(outcome.valid_len, reader.len());
        assert_eq!(seen[3], Op::Put(vec![3], b"value 3".to_vec()));
    }

    #[test]
    fn test_replay_stops_at_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.db");

        let intact_len = {
            let mut writer = LogWriter::create(&path).unwrap();
            writer.append(&[Op::Put(b"a".to_vec(), b"1".to_vec())]).unwrap();
            writer.len()
        };

        // Half of a second batch
        let frame = encode_batch(&[Op::Put(b"b".to_vec(), b"2".to_vec())]).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&frame[..frame.len() / 2]).unwrap();
        drop(file);

        let reader = LogReader::open(&path).unwrap();
        let mut seen = Vec::new();
        let outcome = reader.replay(|ops| seen.extend(ops));

        assert_eq!(outcome.batches, 1);
        assert_eq!(outcome.valid_len, intact_len);
        assert!(outcome.stopped.is_some());
        assert_eq!(seen, vec![Op::Put(b"a".to_vec(), b"1".to_vec())]);
    }

    #[test]
    fn test_replay_detects_crc_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.db");

        {
            let mut writer = LogWriter::create(&path).unwrap();
            writer.append(&[Op::Put(b"key".to_vec(), b"value".to_vec())]).unwrap();
        }

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let reader = LogReader::open(&path).unwrap();
        let outcome = reader.replay(|_| {});

        assert_eq!(outcome.batches, 0);
        assert!(matches!(
            outcome.stopped,
            Some(BasketsError::CorruptedData { .. })
        ));
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("other.db");
        std::fs::write(&path, b"SQLite format 3\0 and more bytes").unwrap();

        assert!(LogReader::open(&path).is_err());
    }
}
