//! Binary encoding of basket entries and stored records
//!
//! Length-prefixed little-endian fields. Strings and byte strings carry a u32
//! length, maps carry a u32 entry count.

use std::collections::BTreeMap;

use crate::basket::BasketConfig;
use crate::capture::{CaptureRecord, StoredRecord};
use crate::{BasketsError, Result};

use super::BasketEntry;

/// Encoding version of entries and records
const CODEC_VERSION: u8 = 1;

struct Encoder {
    data: Vec<u8>,
}

impl Encoder {
    fn new() -> Self {
        Self {
            data: vec![CODEC_VERSION],
        }
    }

    fn u8(&mut self, value: u8) {
        self.data.push(value);
    }

    fn u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    fn bytes(&mut self, value: &[u8]) {
        self.u32(value.len() as u32);
        self.data.extend_from_slice(value);
    }

    fn str(&mut self, value: &str) {
        self.bytes(value.as_bytes());
    }

    fn map(&mut self, map: &BTreeMap<String, Vec<String>>) {
        self.u32(map.len() as u32);
        for (key, values) in map {
            self.str(key);
            self.u32(values.len() as u32);
            for value in values {
                self.str(value);
            }
        }
    }

    fn finish(self) -> Vec<u8> {
        self.data
    }
}

struct Decoder<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Result<Self> {
        let mut decoder = Self { data, offset: 0 };
        let version = decoder.u8()?;
        if version != CODEC_VERSION {
            return Err(BasketsError::InvalidFormat(format!(
                "Unsupported encoding version: {version}, expected {CODEC_VERSION}"
            )));
        }
        Ok(decoder)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                BasketsError::InvalidFormat(format!(
                    "Truncated value: need {len} bytes at offset {}, have {}",
                    self.offset,
                    self.data.len()
                ))
            })?;

        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn str(&mut self) -> Result<String> {
        String::from_utf8(self.bytes()?)
            .map_err(|e| BasketsError::InvalidFormat(format!("Invalid UTF-8 string: {e}")))
    }

    fn map(&mut self) -> Result<BTreeMap<String, Vec<String>>> {
        let count = self.u32()?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = self.str()?;
            let value_count = self.u32()?;
            let mut values = Vec::new();
            for _ in 0..value_count {
                values.push(self.str()?);
            }
            map.insert(key, values);
        }
        Ok(map)
    }
}

/// Encode a basket entry
pub(crate) fn encode_entry(entry: &BasketEntry) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.str(&entry.token);
    encoder.str(&entry.config.forward_url);
    encoder.u64(entry.config.capacity as u64);
    encoder.u8(u8::from(entry.config.expand_path));
    encoder.u64(entry.total_count);
    encoder.finish()
}

/// Decode a basket entry
pub(crate) fn decode_entry(data: &[u8]) -> Result<BasketEntry> {
    let mut decoder = Decoder::new(data)?;
    let token = decoder.str()?;
    let forward_url = decoder.str()?;
    let capacity = decoder.u64()? as usize;
    let expand_path = decoder.u8()? != 0;
    let total_count = decoder.u64()?;

    Ok(BasketEntry {
        token,
        config: BasketConfig {
            forward_url,
            capacity,
            expand_path,
        },
        total_count,
    })
}

/// Encode a stored record
pub(crate) fn encode_record(stored: &StoredRecord) -> Vec<u8> {
    let record = &stored.record;
    let mut encoder = Encoder::new();
    encoder.u64(stored.id);
    encoder.u64(record.date);
    encoder.str(&record.method);
    encoder.str(&record.path);
    encoder.map(&record.query);
    encoder.str(&record.raw_query);
    encoder.map(&record.headers);
    encoder.bytes(&record.body);
    encoder.u8(u8::from(record.body_truncated));
    encoder.u64(record.content_length);
    encoder.str(&record.remote_addr);
    encoder.finish()
}

/// Decode a stored record
pub(crate) fn decode_record(data: &[u8]) -> Result<StoredRecord> {
    let mut decoder = Decoder::new(data)?;
    let id = decoder.u64()?;
    let date = decoder.u64()?;
    let method = decoder.str()?;
    let path = decoder.str()?;
    let query = decoder.map()?;
    let raw_query = decoder.str()?;
    let headers = decoder.map()?;
    let body = decoder.bytes()?;
    let body_truncated = decoder.u8()? != 0;
    let content_length = decoder.u64()?;
    let remote_addr = decoder.str()?;

    Ok(StoredRecord {
        id,
        record: CaptureRecord {
            method,
            path,
            query,
            raw_query,
            headers,
            body,
            body_truncated,
            content_length,
            remote_addr,
            date,
        },
    })
}

/// Read only the capture date of an encoded record
pub(crate) fn record_date(data: &[u8]) -> Result<u64> {
    let mut decoder = Decoder::new(data)?;
    decoder.u64()?;
    decoder.u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::{HeaderMap, Method};

    fn sample_record() -> StoredRecord {
        let mut headers = HeaderMap::new();
        headers.append("x-test", "a".parse().unwrap());
        headers.append("x-test", "b".parse().unwrap());

        StoredRecord {
            id: 9,
            record: CaptureRecord::from_parts(
                &Method::PUT,
                &"/orders/1?x=1&x=2".parse().unwrap(),
                &headers,
                vec![0, 159, 146, 150],
                true,
                "192.168.1.7:5000",
            ),
        }
    }

    #[test]
    fn test_record_encoding_preserves_fields() {
        let stored = sample_record();
        let decoded = decode_record(&encode_record(&stored)).unwrap();

        assert_eq!(decoded, stored);
        assert_eq!(record_date(&encode_record(&stored)).unwrap(), stored.record.date);
    }

    #[test]
    fn test_entry_encoding_preserves_fields() {
        let entry = BasketEntry {
            token: "tok".to_string(),
            config: BasketConfig {
                forward_url: "http://example.com".to_string(),
                capacity: 42,
                expand_path: true,
            },
            total_count: 1_000,
        };

        assert_eq!(decode_entry(&encode_entry(&entry)).unwrap(), entry);
    }

    #[test]
    fn test_truncated_input() {
        let data = encode_record(&sample_record());
        let result = decode_record(&data[..data.len() - 3]);
        assert!(matches!(result, Err(BasketsError::InvalidFormat(_))));
    }

    #[test]
    fn test_unknown_version() {
        let mut data = encode_entry(&BasketEntry::new("t", BasketConfig::with_capacity(1)));
        data[0] = 99;
        assert!(decode_entry(&data).is_err());
    }
}
