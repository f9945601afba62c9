//! Binary format of the embedded key-value log
//!
//! ```text
//! FileHeader (16 bytes)
//! repeated:
//!   BatchHeader (16 bytes)
//!   payload: op_count x [kind u8][key_len u16][value_len u32][key][value]
//! ```
//!
//! A batch is applied whole or not at all: its CRC covers the payload, and a
//! batch whose header or payload is incomplete marks the end of the log.

use bytemuck::{Pod, Zeroable};

use crate::{BasketsError, Result};

/// File magic bytes: "BSKTLOG\x00"
pub const LOG_MAGIC: [u8; 8] = [0x42, 0x53, 0x4B, 0x54, 0x4C, 0x4F, 0x47, 0x00];

/// Current format version
pub const LOG_VERSION: u32 = 1;

/// File header size
pub const FILE_HEADER_SIZE: usize = 16;

/// Batch header size
pub const BATCH_HEADER_SIZE: usize = 16;

/// Size of the fixed part of an operation
pub const OP_HEADER_SIZE: usize = 7;

/// Largest key an operation can carry
pub const KEY_LEN_MAX: usize = u16::MAX as usize;

/// File header
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct FileHeader {
    /// Magic bytes for file format identification
    pub magic: [u8; 8],
    /// Format version
    pub version: u32,
    /// Reserved for future use
    pub reserved: [u8; 4],
}

static_assertions::const_assert_eq!(std::mem::size_of::<FileHeader>(), FILE_HEADER_SIZE);

impl Default for FileHeader {
    fn default() -> Self {
        Self {
            magic: LOG_MAGIC,
            version: LOG_VERSION,
            reserved: [0; 4],
        }
    }
}

impl FileHeader {
    /// Validate magic and version
    ///
    /// # Errors
    ///
    /// Returns error if magic or version is invalid
    pub fn validate(&self) -> Result<()> {
        if self.magic != LOG_MAGIC {
            return Err(BasketsError::InvalidFormat(format!(
                "Invalid magic bytes: expected {:?}, got {:?}",
                LOG_MAGIC, self.magic
            )));
        }

        if self.version != LOG_VERSION {
            return Err(BasketsError::InvalidFormat(format!(
                "Unsupported version: {}, expected {}",
                self.version, LOG_VERSION
            )));
        }

        Ok(())
    }
}

/// Header preceding each batch of operations
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct BatchHeader {
    /// CRC32 of the payload
    pub crc: u32,
    /// Payload length in bytes
    pub payload_len: u32,
    /// Number of operations in the payload
    pub op_count: u32,
    /// Reserved for future use
    pub reserved: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<BatchHeader>(), BATCH_HEADER_SIZE);

/// Operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    /// Set a key
    Put = 1,
    /// Remove a key
    Delete = 2,
}

impl TryFrom<u8> for OpKind {
    type Error = BasketsError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Put),
            2 => Ok(Self::Delete),
            other => Err(BasketsError::InvalidFormat(format!(
                "Unknown operation kind: {other}"
            ))),
        }
    }
}

/// A single key-value operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Set `key` to `value`
    Put(Vec<u8>, Vec<u8>),
    /// Remove `key`
    Delete(Vec<u8>),
}

impl Op {
    /// The key this operation touches
    #[must_use]
    pub fn key(&self) -> &[u8] {
        match self {
            Self::Put(key, _) | Self::Delete(key) => key,
        }
    }

    /// Encoded size of this operation
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Put(key, value) => OP_HEADER_SIZE + key.len() + value.len(),
            Self::Delete(key) => OP_HEADER_SIZE + key.len(),
        }
    }
}

/// Encode a batch of operations as header + payload
///
/// # Errors
///
/// Returns error if a key is longer than `KEY_LEN_MAX`
pub fn encode_batch(ops: &[Op]) -> Result<Vec<u8>> {
    let payload_len: usize = ops.iter().map(Op::encoded_len).sum();
    let mut frame = vec![0u8; BATCH_HEADER_SIZE];
    frame.reserve(payload_len);

    for op in ops {
        let (kind, key, value): (OpKind, &[u8], &[u8]) = match op {
            Op::Put(key, value) => (OpKind::Put, key.as_slice(), value.as_slice()),
            Op::Delete(key) => (OpKind::Delete, key.as_slice(), &[][..]),
        };

        if key.len() > KEY_LEN_MAX {
            return Err(BasketsError::DataTooLarge {
                size: key.len(),
                limit: KEY_LEN_MAX,
            });
        }

        frame.push(kind as u8);
        frame.extend_from_slice(&(key.len() as u16).to_le_bytes());
        frame.extend_from_slice(&(value.len() as u32).to_le_bytes());
        frame.extend_from_slice(key);
        frame.extend_from_slice(value);
    }

    let header = BatchHeader {
        crc: crc32fast::hash(&frame[BATCH_HEADER_SIZE..]),
        payload_len: payload_len as u32,
        op_count: ops.len() as u32,
        reserved: 0,
    };
    frame[..BATCH_HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&header));

    Ok(frame)
}

/// Decode the operations of a batch payload whose CRC was already verified
///
/// # Errors
///
/// Returns error if the payload does not hold `op_count` well-formed operations
pub fn decode_payload(payload: &[u8], op_count: u32) -> Result<Vec<Op>> {
    let mut ops = Vec::with_capacity(op_count as usize);
    let mut offset = 0;

    for _ in 0..op_count {
        if payload.len() < offset + OP_HEADER_SIZE {
            return Err(BasketsError::InvalidFormat(
                "Operation header extends beyond batch".to_string(),
            ));
        }

        let kind = OpKind::try_from(payload[offset])?;
        let key_len = u16::from_le_bytes([payload[offset + 1], payload[offset + 2]]) as usize;
        let value_len = u32::from_le_bytes([
            payload[offset + 3],
            payload[offset + 4],
            payload[offset + 5],
            payload[offset + 6],
        ]) as usize;
        offset += OP_HEADER_SIZE;

        if payload.len() < offset + key_len + value_len {
            return Err(BasketsError::InvalidFormat(
                "Operation data extends beyond batch".to_string(),
            ));
        }

        let key = payload[offset..offset + key_len].to_vec();
        offset += key_len;
        let value = payload[offset..offset + value_len].to_vec();
        offset += value_len;

        ops.push(match kind {
            OpKind::Put => Op::Put(key, value),
            OpKind::Delete => Op::Delete(key),
        });
    }

    Ok(ops)
}
