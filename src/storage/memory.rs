//! In-memory backend

use std::collections::VecDeque;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{excess, not_found, Backend, BasketEntry, BasketSummary};
use crate::basket::{BasketConfig, NamesPage, Page, RequestsPage};
use crate::capture::{CaptureRecord, StoredRecord};
use crate::config::BackendKind;
use crate::{BasketsError, Result};

struct MemoryBasket {
    token: String,
    config: BasketConfig,
    total_count: u64,
    /// Most recent first
    records: VecDeque<StoredRecord>,
}

impl MemoryBasket {
    fn entry(&self) -> BasketEntry {
        BasketEntry {
            token: self.token.clone(),
            config: self.config.clone(),
            total_count: self.total_count,
        }
    }
}

/// Backend holding everything in process memory; contents die with the process
#[derive(Default)]
pub struct MemoryBackend {
    baskets: DashMap<String, MemoryBasket>,
}

impl MemoryBackend {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn create(&self, name: &str, entry: &BasketEntry) -> Result<()> {
        match self.baskets.entry(name.to_string()) {
            Entry::Occupied(_) => Err(BasketsError::NameConflict(name.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryBasket {
                    token: entry.token.clone(),
                    config: entry.config.clone(),
                    total_count: entry.total_count,
                    records: VecDeque::with_capacity(entry.config.capacity.min(64)),
                });
                Ok(())
            }
        }
    }

    fn load(&self, name: &str) -> Result<Option<BasketEntry>> {
        Ok(self.baskets.get(name).map(|basket| basket.entry()))
    }

    fn update(&self, name: &str, config: &BasketConfig) -> Result<()> {
        let mut basket = self.baskets.get_mut(name).ok_or_else(|| not_found(name))?;
        basket.config = config.clone();
        basket.records.truncate(config.capacity);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.baskets.remove(name).is_some())
    }

    fn append(&self, name: &str, record: CaptureRecord) -> Result<StoredRecord> {
        let mut basket = self.baskets.get_mut(name).ok_or_else(|| not_found(name))?;

        let evict = excess(basket.records.len(), 1, basket.config.capacity);
        for _ in 0..evict {
            basket.records.pop_back();
        }

        basket.total_count += 1;
        let stored = StoredRecord {
            id: basket.total_count,
            record,
        };
        basket.records.push_front(stored.clone());

        Ok(stored)
    }

    fn requests(&self, name: &str, page: Page) -> Result<RequestsPage> {
        let basket = self.baskets.get(name).ok_or_else(|| not_found(name))?;
        let count = basket.records.len();

        Ok(RequestsPage {
            requests: page.apply(basket.records.iter()).cloned().collect(),
            count,
            total_count: basket.total_count,
            has_more: page.has_more(count),
        })
    }

    fn clear(&self, name: &str) -> Result<()> {
        let mut basket = self.baskets.get_mut(name).ok_or_else(|| not_found(name))?;
        basket.records.clear();
        Ok(())
    }

    fn names(&self, page: Page) -> Result<NamesPage> {
        let mut names: Vec<String> = self.baskets.iter().map(|b| b.key().clone()).collect();
        names.sort_unstable();
        Ok(NamesPage::from_sorted(names, page))
    }

    fn summaries(&self) -> Result<Vec<BasketSummary>> {
        Ok(self
            .baskets
            .iter()
            .map(|basket| BasketSummary {
                name: basket.key().clone(),
                count: basket.records.len(),
                total_count: basket.total_count,
                last_date: basket.records.front().map(|r| r.record.date),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::{HeaderMap, Method};

    fn record(path: &str) -> CaptureRecord {
        CaptureRecord::from_parts(
            &Method::GET,
            &path.parse().unwrap(),
            &HeaderMap::new(),
            Vec::new(),
            false,
            "127.0.0.1:1",
        )
    }

    #[test]
    fn test_retains_most_recent() {
        let backend = MemoryBackend::new();
        backend
            .create("orders", &BasketEntry::new("t", BasketConfig::with_capacity(3)))
            .unwrap();

        for i in 1..=5 {
            backend.append("orders", record(&format!("/orders/{i}"))).unwrap();
        }

        let page = backend.requests("orders", Page::all()).unwrap();
        let ids: Vec<u64> = page.requests.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert_eq!(page.count, 3);
        assert_eq!(page.total_count, 5);
    }

    #[test]
    fn test_missing_basket() {
        let backend = MemoryBackend::new();
        assert!(backend.load("nope").unwrap().is_none());
        assert!(!backend.delete("nope").unwrap());
        assert!(matches!(
            backend.append("nope", record("/x")),
            Err(BasketsError::NotFound(_))
        ));
    }

    #[test]
    fn test_update_shrinks_log() {
        let backend = MemoryBackend::new();
        backend
            .create("b", &BasketEntry::new("t", BasketConfig::with_capacity(10)))
            .unwrap();
        for i in 0..6 {
            backend.append("b", record(&format!("/b/{i}"))).unwrap();
        }

        backend.update("b", &BasketConfig::with_capacity(2)).unwrap();

        let page = backend.requests("b", Page::all()).unwrap();
        assert_eq!(page.count, 2);
        assert_eq!(page.requests[0].id, 6);
        assert_eq!(page.total_count, 6);
    }
}
