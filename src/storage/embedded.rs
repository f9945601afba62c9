//! Embedded backend on top of the durable log store
//!
//! Keyspace:
//!
//! ```text
//! b\0<name>                 basket entry
//! r\0<name>\0<seq:u64 BE>   record, big-endian so key order is capture order
//! ```
//!
//! Basket names never contain NUL, so prefixes of different baskets cannot
//! overlap.

use std::path::Path;

use tracing::debug;

use super::codec::{decode_entry, decode_record, encode_entry, encode_record, record_date};
use super::log::{LogStore, Txn};
use super::{excess, not_found, Backend, BasketEntry, BasketSummary};
use crate::basket::{BasketConfig, NamesPage, Page, RequestsPage};
use crate::capture::{CaptureRecord, StoredRecord};
use crate::config::BackendKind;
use crate::{BasketsError, Result};

const META_PREFIX: &[u8] = b"b\0";
const RECORD_PREFIX: &[u8] = b"r\0";

fn meta_key(name: &str) -> Vec<u8> {
    [META_PREFIX, name.as_bytes()].concat()
}

fn records_prefix(name: &str) -> Vec<u8> {
    [RECORD_PREFIX, name.as_bytes(), b"\0"].concat()
}

fn record_key(name: &str, seq: u64) -> Vec<u8> {
    let mut key = records_prefix(name);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn load_entry(txn: &Txn<'_>, name: &str) -> Result<Option<BasketEntry>> {
    txn.get(&meta_key(name)).map(decode_entry).transpose()
}

fn require_entry(txn: &Txn<'_>, name: &str) -> Result<BasketEntry> {
    load_entry(txn, name)?.ok_or_else(|| not_found(name))
}

/// Oldest held sequence number and the number of records held
///
/// Eviction drops the oldest records and clear drops all of them, so the held
/// records are always the run of sequence numbers ending at `total_count`.
fn held(txn: &Txn<'_>, name: &str, total_count: u64) -> (u64, usize) {
    let prefix = records_prefix(name);
    let oldest = txn
        .scan_prefix(&prefix)
        .next()
        .and_then(|(key, _)| <[u8; 8]>::try_from(key.get(prefix.len()..)?).ok())
        .map_or(total_count + 1, u64::from_be_bytes);

    let count = (total_count + 1).saturating_sub(oldest);
    (oldest, usize::try_from(count).unwrap_or(usize::MAX))
}

/// Stage deletion of the `count` oldest records of a basket
fn evict_oldest(txn: &mut Txn<'_>, name: &str, oldest: u64, count: usize) {
    for seq in (oldest..).take(count) {
        txn.delete(record_key(name, seq));
    }
}

/// Durable backend persisting to a single log file
pub struct EmbeddedBackend {
    store: LogStore,
}

impl EmbeddedBackend {
    /// Open or create the log at `path`
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or is not a basket log
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            store: LogStore::open(path)?,
        })
    }
}

impl Backend for EmbeddedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    fn create(&self, name: &str, entry: &BasketEntry) -> Result<()> {
        self.store.transact(|txn| {
            let key = meta_key(name);
            if txn.get(&key).is_some() {
                return Err(BasketsError::NameConflict(name.to_string()));
            }
            txn.put(key, encode_entry(entry));
            Ok(())
        })
    }

    fn load(&self, name: &str) -> Result<Option<BasketEntry>> {
        self.store.view(|txn| load_entry(txn, name))
    }

    fn update(&self, name: &str, config: &BasketConfig) -> Result<()> {
        self.store.transact(|txn| {
            let mut entry = require_entry(txn, name)?;
            let (oldest, count) = held(txn, name, entry.total_count);

            evict_oldest(txn, name, oldest, excess(count, 0, config.capacity));
            entry.config = config.clone();
            txn.put(meta_key(name), encode_entry(&entry));
            Ok(())
        })
    }

    fn delete(&self, name: &str) -> Result<bool> {
        self.store.transact(|txn| {
            let key = meta_key(name);
            if txn.get(&key).is_none() {
                return Ok(false);
            }

            let records: Vec<Vec<u8>> = txn
                .scan_prefix(&records_prefix(name))
                .map(|(key, _)| key.to_vec())
                .collect();
            debug!("Deleting basket {} with {} records", name, records.len());

            for record in records {
                txn.delete(record);
            }
            txn.delete(key);
            Ok(true)
        })
    }

    fn append(&self, name: &str, record: CaptureRecord) -> Result<StoredRecord> {
        self.store.transact(|txn| {
            let mut entry = require_entry(txn, name)?;
            let (oldest, count) = held(txn, name, entry.total_count);

            evict_oldest(txn, name, oldest, excess(count, 1, entry.config.capacity));

            entry.total_count += 1;
            let stored = StoredRecord {
                id: entry.total_count,
                record,
            };
            txn.put(record_key(name, stored.id), encode_record(&stored));
            txn.put(meta_key(name), encode_entry(&entry));

            Ok(stored)
        })
    }

    fn requests(&self, name: &str, page: Page) -> Result<RequestsPage> {
        self.store.view(|txn| {
            let entry = require_entry(txn, name)?;
            let (_, count) = held(txn, name, entry.total_count);

            let requests = page
                .apply(txn.scan_prefix(&records_prefix(name)).rev())
                .map(|(_, value)| decode_record(value))
                .collect::<Result<Vec<_>>>()?;

            Ok(RequestsPage {
                requests,
                count,
                total_count: entry.total_count,
                has_more: page.has_more(count),
            })
        })
    }

    fn clear(&self, name: &str) -> Result<()> {
        self.store.transact(|txn| {
            let entry = require_entry(txn, name)?;
            let (oldest, count) = held(txn, name, entry.total_count);
            evict_oldest(txn, name, oldest, count);
            Ok(())
        })
    }

    fn names(&self, page: Page) -> Result<NamesPage> {
        let names = self.store.view(|txn| {
            txn.scan_prefix(META_PREFIX)
                .map(|(key, _)| String::from_utf8_lossy(&key[META_PREFIX.len()..]).into_owned())
                .collect::<Vec<_>>()
        });
        Ok(NamesPage::from_sorted(names, page))
    }

    fn summaries(&self) -> Result<Vec<BasketSummary>> {
        self.store.view(|txn| {
            txn.scan_prefix(META_PREFIX)
                .map(|(key, value)| -> Result<BasketSummary> {
                    let name = String::from_utf8_lossy(&key[META_PREFIX.len()..]).into_owned();
                    let entry = decode_entry(value)?;
                    let (_, count) = held(txn, &name, entry.total_count);

                    let last_date = txn
                        .scan_prefix(&records_prefix(&name))
                        .next_back()
                        .map(|(_, data)| record_date(data))
                        .transpose()?;

                    Ok(BasketSummary {
                        count,
                        total_count: entry.total_count,
                        last_date,
                        name,
                    })
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::{HeaderMap, Method};
    use tempfile::TempDir;

    fn record(path: &str) -> CaptureRecord {
        CaptureRecord::from_parts(
            &Method::POST,
            &path.parse().unwrap(),
            &HeaderMap::new(),
            b"payload".to_vec(),
            false,
            "127.0.0.1:1",
        )
    }

    #[test]
    fn test_record_keys_sort_by_sequence() {
        assert!(record_key("a", 255) < record_key("a", 256));
        assert!(record_key("a", u64::MAX) < records_prefix("a\u{1}"));
        assert!(!record_key("ab", 1).starts_with(&records_prefix("a")));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("baskets.db");

        {
            let backend = EmbeddedBackend::open(&path).unwrap();
            backend
                .create("orders", &BasketEntry::new("tok", BasketConfig::with_capacity(2)))
                .unwrap();
            for i in 1..=3 {
                backend.append("orders", record(&format!("/orders/{i}"))).unwrap();
            }
        }

        let backend = EmbeddedBackend::open(&path).unwrap();
        let entry = backend.load("orders").unwrap().unwrap();
        assert_eq!(entry.token, "tok");
        assert_eq!(entry.total_count, 3);

        let page = backend.requests("orders", Page::all()).unwrap();
        let ids: Vec<u64> = page.requests.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 2]);
        assert_eq!(page.requests[0].record.path, "/orders/3");
    }

    #[test]
    fn test_counts_after_clear_and_shrink() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("baskets.db");

        {
            let backend = EmbeddedBackend::open(&path).unwrap();
            backend
                .create("hooks", &BasketEntry::new("t", BasketConfig::with_capacity(4)))
                .unwrap();
            for i in 1..=6 {
                backend.append("hooks", record(&format!("/hooks/{i}"))).unwrap();
            }
            assert_eq!(backend.requests("hooks", Page::all()).unwrap().count, 4);

            backend.clear("hooks").unwrap();
            assert_eq!(backend.requests("hooks", Page::all()).unwrap().count, 0);

            for i in 7..=9 {
                backend.append("hooks", record(&format!("/hooks/{i}"))).unwrap();
            }
            backend.update("hooks", &BasketConfig::with_capacity(2)).unwrap();
            backend.append("hooks", record("/hooks/10")).unwrap();
        }

        let backend = EmbeddedBackend::open(&path).unwrap();
        let page = backend.requests("hooks", Page::all()).unwrap();
        let ids: Vec<u64> = page.requests.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![10, 9]);
        assert_eq!(page.count, 2);
        assert_eq!(page.total_count, 10);
        assert_eq!(backend.store.len(), 3);

        let summaries = backend.summaries().unwrap();
        assert_eq!(summaries[0].count, 2);
    }

    #[test]
    fn test_delete_removes_records() {
        let dir = TempDir::new().unwrap();
        let backend = EmbeddedBackend::open(&dir.path().join("baskets.db")).unwrap();

        backend
            .create("a", &BasketEntry::new("t", BasketConfig::with_capacity(5)))
            .unwrap();
        backend
            .create("ab", &BasketEntry::new("t", BasketConfig::with_capacity(5)))
            .unwrap();
        backend.append("a", record("/a")).unwrap();
        backend.append("ab", record("/ab")).unwrap();

        assert!(backend.delete("a").unwrap());
        assert!(!backend.delete("a").unwrap());

        assert_eq!(backend.requests("ab", Page::all()).unwrap().count, 1);
        assert_eq!(backend.names(Page::all()).unwrap().names, vec!["ab"]);
    }

    #[test]
    fn test_summaries() {
        let dir = TempDir::new().unwrap();
        let backend = EmbeddedBackend::open(&dir.path().join("baskets.db")).unwrap();

        backend
            .create("idle", &BasketEntry::new("t", BasketConfig::with_capacity(5)))
            .unwrap();
        backend
            .create("busy", &BasketEntry::new("t", BasketConfig::with_capacity(5)))
            .unwrap();
        let last = backend.append("busy", record("/busy")).unwrap();

        let mut summaries = backend.summaries().unwrap();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(summaries[0].name, "busy");
        assert_eq!(summaries[0].count, 1);
        assert_eq!(summaries[0].last_date, Some(last.record.date));
        assert_eq!(summaries[1].last_date, None);
    }
}
