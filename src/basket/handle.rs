//! Live handle on one basket

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use super::{BasketConfig, BasketConfigPatch, BasketLimits, Page, RequestsPage, SearchScope};
use crate::capture::{CaptureRecord, StoredRecord};
use crate::storage::Backend;
use crate::{BasketsError, Result};

/// A basket: name, token and access to its stored log
///
/// Writes to one basket (captures, configuration changes, clearing and
/// deletion) are serialized by a per-basket lock; reads go straight to the
/// backend and see either the state before or after a write. Once the basket
/// is deleted the handle answers `NotFound`, even if a new basket has since
/// been created under the same name.
pub struct Basket {
    name: String,
    token: String,
    master_token: Arc<str>,
    backend: Arc<dyn Backend>,
    limits: BasketLimits,
    writer: Mutex<()>,
    deleted: AtomicBool,
}

impl Basket {
    pub(crate) fn new(
        name: impl Into<String>,
        token: impl Into<String>,
        master_token: Arc<str>,
        backend: Arc<dyn Backend>,
        limits: BasketLimits,
    ) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            master_token,
            backend,
            limits,
            writer: Mutex::new(()),
            deleted: AtomicBool::new(false),
        }
    }

    /// Basket name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Access token issued at creation
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether `credential` grants access: it must be non-empty and equal to
    /// the basket token or the master token
    #[must_use]
    pub fn authorize(&self, credential: &str) -> bool {
        !credential.is_empty()
            && (credential == self.token || credential == &*self.master_token)
    }

    /// Current configuration
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the basket was deleted meanwhile
    pub fn config(&self) -> Result<BasketConfig> {
        self.ensure_live()?;
        self.backend
            .load(&self.name)?
            .map(|entry| entry.config)
            .ok_or_else(|| BasketsError::NotFound(self.name.clone()))
    }

    /// Append a captured request, evicting the oldest beyond capacity
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails or the basket was deleted
    pub async fn capture(&self, record: CaptureRecord) -> Result<StoredRecord> {
        self.capture_with_config(record).await.map(|(stored, _)| stored)
    }

    /// Append a captured request and return it with the configuration in
    /// force when it was stored
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails or the basket was deleted
    pub async fn capture_with_config(
        &self,
        record: CaptureRecord,
    ) -> Result<(StoredRecord, BasketConfig)> {
        let _guard = self.writer.lock().await;
        self.ensure_live()?;

        let stored = self.backend.append(&self.name, record)?;
        debug!(
            "Captured {} {} into basket {} as #{}",
            stored.record.method, stored.record.path, self.name, stored.id
        );

        let config = self.config()?;
        Ok((stored, config))
    }

    /// A window of the log, most recent first
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub fn requests(&self, page: Page) -> Result<RequestsPage> {
        self.ensure_live()?;
        self.backend.requests(&self.name, page)
    }

    /// Requests containing `query` within `scope`, most recent first
    ///
    /// `count` is the number of matches; an empty query matches everything.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub fn find_requests(&self, query: &str, scope: SearchScope, page: Page) -> Result<RequestsPage> {
        let all = self.requests(Page::all())?;

        let matches: Vec<StoredRecord> = all
            .requests
            .into_iter()
            .filter(|stored| scope.matches(&stored.record, query))
            .collect();
        let count = matches.len();

        Ok(RequestsPage {
            requests: page.apply(matches.into_iter()).collect(),
            count,
            total_count: all.total_count,
            has_more: page.has_more(count),
        })
    }

    /// Drop every stored request; the total count is kept
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.writer.lock().await;
        self.ensure_live()?;
        self.backend.clear(&self.name)
    }

    /// Replace the configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` without changing anything if `config` is invalid
    pub async fn update(&self, config: BasketConfig) -> Result<()> {
        config.validate(self.limits.max_capacity)?;

        let _guard = self.writer.lock().await;
        self.ensure_live()?;
        self.backend.update(&self.name, &config)
    }

    /// Merge a partial configuration onto the current one and store the result
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` without changing anything if the merged
    /// configuration is invalid
    pub async fn patch(&self, patch: &BasketConfigPatch) -> Result<BasketConfig> {
        let _guard = self.writer.lock().await;

        let config = patch.apply(&self.config()?, self.limits.max_capacity)?;
        self.backend.update(&self.name, &config)?;
        Ok(config)
    }

    /// Hold the write lock, e.g. while the basket is being removed
    pub(crate) async fn lock_writes(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.writer.lock().await
    }

    /// Retire the handle; callers hold the write lock
    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    /// Whether the basket has been deleted
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_deleted() {
            return Err(BasketsError::NotFound(self.name.clone()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Basket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Basket")
            .field("name", &self.name)
            .field("backend", &self.backend.kind())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BasketEntry, MemoryBackend};
    use hyper::{HeaderMap, Method};

    fn basket(capacity: usize) -> Basket {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        backend
            .create("orders", &BasketEntry::new("basket-token", BasketConfig::with_capacity(capacity)))
            .unwrap();
        Basket::new("orders", "basket-token", Arc::from("master"), backend, BasketLimits::default())
    }

    fn record(body: &str) -> CaptureRecord {
        CaptureRecord::from_parts(
            &Method::POST,
            &"/orders".parse().unwrap(),
            &HeaderMap::new(),
            body.as_bytes().to_vec(),
            false,
            "127.0.0.1:1",
        )
    }

    #[test]
    fn test_authorize() {
        let basket = basket(5);
        assert!(basket.authorize("basket-token"));
        assert!(basket.authorize("master"));
        assert!(!basket.authorize(""));
        assert!(!basket.authorize("wrong"));
    }

    #[test]
    fn test_empty_master_token_grants_nothing() {
        let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
        let basket = Basket::new("b", "tok", Arc::from(""), backend, BasketLimits::default());
        assert!(!basket.authorize(""));
    }

    #[tokio::test]
    async fn test_find_requests() {
        let basket = basket(10);
        basket.capture(record("alpha")).await.unwrap();
        basket.capture(record("beta")).await.unwrap();
        basket.capture(record("alphabet")).await.unwrap();

        let found = basket
            .find_requests("alpha", SearchScope::Body, Page::new(1, 0))
            .unwrap();
        assert_eq!(found.count, 2);
        assert!(found.has_more);
        assert_eq!(found.requests[0].id, 3);
        assert_eq!(found.total_count, 3);
    }

    #[tokio::test]
    async fn test_invalid_update_changes_nothing() {
        let basket = basket(5);
        let result = basket.update(BasketConfig::with_capacity(0)).await;

        assert!(matches!(result, Err(BasketsError::InvalidConfig(_))));
        assert_eq!(basket.config().unwrap().capacity, 5);
    }

    #[tokio::test]
    async fn test_patch_merges() {
        let basket = basket(5);
        let patch = BasketConfigPatch {
            expand_path: Some(true),
            ..BasketConfigPatch::default()
        };

        let config = basket.patch(&patch).await.unwrap();
        assert!(config.expand_path);
        assert_eq!(config.capacity, 5);
        assert_eq!(basket.config().unwrap(), config);
    }

    #[tokio::test]
    async fn test_clear_keeps_total() {
        let basket = basket(5);
        basket.capture(record("one")).await.unwrap();
        basket.clear().await.unwrap();

        let page = basket.requests(Page::all()).unwrap();
        assert_eq!(page.count, 0);
        assert_eq!(page.total_count, 1);

        let next = basket.capture(record("two")).await.unwrap();
        assert_eq!(next.id, 2);
    }

    #[tokio::test]
    async fn test_deleted_handle_refuses_everything() {
        let basket = basket(5);
        basket.capture(record("before")).await.unwrap();

        {
            let _writes = basket.lock_writes().await;
            basket.mark_deleted();
        }
        assert!(basket.is_deleted());

        let not_found = |result: Result<()>| matches!(result, Err(BasketsError::NotFound(_)));
        assert!(not_found(basket.capture(record("after")).await.map(|_| ())));
        assert!(not_found(basket.clear().await));
        assert!(not_found(basket.update(BasketConfig::with_capacity(3)).await));
        assert!(not_found(basket.patch(&BasketConfigPatch::default()).await.map(|_| ())));
        assert!(not_found(basket.config().map(|_| ())));
        assert!(not_found(basket.requests(Page::all()).map(|_| ())));
    }

    #[tokio::test]
    async fn test_capture_reports_config_in_force() {
        let basket = basket(5);
        let config = BasketConfig {
            forward_url: "http://localhost:9000/hook".to_string(),
            capacity: 5,
            expand_path: false,
        };
        basket.update(config.clone()).await.unwrap();

        let (stored, used) = basket.capture_with_config(record("x")).await.unwrap();
        assert_eq!(stored.id, 1);
        assert_eq!(used, config);
    }
}
