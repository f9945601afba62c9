//! Persistence backends for baskets and their captured requests
//!
//! Every backend honours the same contract: a basket's log holds at most
//! `capacity` records, newest first, and an append that would exceed the
//! capacity evicts the oldest records in the same atomic step. Backends are
//! interchangeable; the choice between them is operational only.

mod codec;
mod embedded;
mod format;
mod log;
mod memory;
mod reader;
mod sql;
mod writer;

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

pub use embedded::EmbeddedBackend;
pub use format::{BatchHeader, FileHeader, OpKind, BATCH_HEADER_SIZE, FILE_HEADER_SIZE, LOG_MAGIC, LOG_VERSION};
pub use log::{LogStore, Txn};
pub use memory::MemoryBackend;
pub use reader::LogReader;
pub use sql::SqlBackend;
pub use writer::LogWriter;

use crate::basket::{BasketConfig, NamesPage, Page, RequestsPage};
use crate::capture::{CaptureRecord, StoredRecord};
use crate::config::{BackendKind, ServerConfig};
use crate::{BasketsError, Result};

/// Everything a backend keeps about a basket besides its requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasketEntry {
    /// Access token
    pub token: String,
    /// Current configuration
    pub config: BasketConfig,
    /// Requests ever captured
    pub total_count: u64,
}

impl BasketEntry {
    /// Entry for a freshly created basket
    #[must_use]
    pub fn new(token: impl Into<String>, config: BasketConfig) -> Self {
        Self {
            token: token.into(),
            config,
            total_count: 0,
        }
    }
}

/// Per-basket figures used for statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasketSummary {
    /// Basket name
    pub name: String,
    /// Requests currently held
    pub count: usize,
    /// Requests ever captured
    pub total_count: u64,
    /// Capture time of the newest held request
    pub last_date: Option<u64>,
}

/// Storage contract shared by all backends
///
/// Operations on a basket that does not exist fail with `NotFound`, except
/// `load` (which returns `None`) and `delete` (which returns `false`).
pub trait Backend: Send + Sync {
    /// Which backend this is
    fn kind(&self) -> BackendKind;

    /// Store a new basket; fails with `NameConflict` if the name is taken
    fn create(&self, name: &str, entry: &BasketEntry) -> Result<()>;

    /// Look up a basket
    fn load(&self, name: &str) -> Result<Option<BasketEntry>>;

    /// Replace a basket's configuration, evicting the oldest records beyond the new capacity
    fn update(&self, name: &str, config: &BasketConfig) -> Result<()>;

    /// Remove a basket and all its records; returns whether it existed
    fn delete(&self, name: &str) -> Result<bool>;

    /// Insert a record at the head of the log, evicting from the tail to stay within capacity
    fn append(&self, name: &str, record: CaptureRecord) -> Result<StoredRecord>;

    /// Read a window of the log, most recent first
    fn requests(&self, name: &str, page: Page) -> Result<RequestsPage>;

    /// Drop every record, keeping the basket and its total count
    fn clear(&self, name: &str) -> Result<()>;

    /// Basket names in ascending order
    fn names(&self, page: Page) -> Result<NamesPage>;

    /// Figures for every basket
    fn summaries(&self) -> Result<Vec<BasketSummary>>;
}

/// Open the backend selected by the configuration
///
/// # Errors
///
/// Returns error if a durable backend cannot be opened
pub fn open_backend(config: &ServerConfig) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
        BackendKind::Embedded => Arc::new(EmbeddedBackend::open(&config.db_file)?),
        BackendKind::Sql => Arc::new(SqlBackend::open(&config.sql_target())?),
    };

    info!("Using {} storage backend", backend.kind());
    Ok(backend)
}

/// Acquire a mutex, recovering the guard if a previous holder panicked
pub(crate) fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("Storage mutex was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// Number of oldest records to evict so `held + incoming` fits in `capacity`
pub(crate) fn excess(held: usize, incoming: usize, capacity: usize) -> usize {
    (held + incoming).saturating_sub(capacity)
}

pub(crate) fn not_found(name: &str) -> BasketsError {
    BasketsError::NotFound(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excess() {
        assert_eq!(excess(0, 1, 5), 0);
        assert_eq!(excess(5, 1, 5), 1);
        assert_eq!(excess(10, 0, 3), 7);
        assert_eq!(excess(2, 0, 3), 0);
    }

    #[test]
    fn test_open_memory_backend() {
        let backend = open_backend(&ServerConfig::default()).unwrap();
        assert_eq!(backend.kind(), BackendKind::Memory);
    }

    #[test]
    fn test_open_embedded_backend() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ServerConfig {
            backend: BackendKind::Embedded,
            db_file: dir.path().join("baskets.db"),
            ..ServerConfig::default()
        };

        let backend = open_backend(&config).unwrap();
        assert_eq!(backend.kind(), BackendKind::Embedded);
    }

    #[test]
    fn test_open_sql_backend() {
        let config = ServerConfig {
            backend: BackendKind::Sql,
            db_connection: Some(":memory:".to_string()),
            ..ServerConfig::default()
        };

        let backend = open_backend(&config).unwrap();
        assert_eq!(backend.kind(), BackendKind::Sql);
    }
}
