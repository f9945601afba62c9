//! Entry points for the routing layer
//!
//! The routing layer locates the basket name in the request path and calls
//! in here. Capture is open to any caller; every other operation first goes
//! through [`BasketService::access`].

pub mod payload;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use hyper::body::Body;
use hyper::Request;
use tracing::debug;

pub use payload::SearchParams;

use crate::basket::{Basket, BasketConfig, Page, RequestsPage};
use crate::capture::{CaptureRecord, StoredRecord};
use crate::config::{LimitsConfig, ServerConfig};
use crate::registry::Registry;
use crate::relay::{ForwardTarget, Relay};
use crate::{BasketsError, Result};

/// Outcome of capturing a request into a basket
#[derive(Debug)]
pub struct Captured {
    /// The basket that captured it
    pub basket: Arc<Basket>,
    /// The stored record
    pub stored: StoredRecord,
    /// Where it should be relayed, if anywhere
    pub forward: Option<ForwardTarget>,
}

/// Registry, relay and boundary limits wired together
pub struct BasketService {
    registry: Arc<Registry>,
    relay: Arc<Relay>,
    limits: LimitsConfig,
}

impl BasketService {
    /// Wire an existing registry and relay
    #[must_use]
    pub fn new(registry: Arc<Registry>, relay: Arc<Relay>, limits: LimitsConfig) -> Self {
        Self {
            registry,
            relay,
            limits,
        }
    }

    /// Open the registry and create the relay described by `config`
    ///
    /// # Errors
    ///
    /// Returns error if the registry cannot be opened
    pub fn open(config: &ServerConfig) -> Result<Self> {
        Ok(Self::new(
            Arc::new(Registry::open(config)?),
            Arc::new(Relay::new(&config.relay)),
            config.limits.clone(),
        ))
    }

    /// The basket registry
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The forwarding relay
    #[must_use]
    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Capture `request` into the basket called `name`
    ///
    /// The body is read up to the configured limit; anything beyond is cut
    /// and flagged. Nothing is relayed here.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no such basket, or a backend error
    pub async fn resolve_and_capture<B>(
        &self,
        name: &str,
        request: Request<B>,
        remote_addr: SocketAddr,
    ) -> Result<Captured>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Display,
    {
        let basket = self
            .registry
            .get(name)
            .ok_or_else(|| BasketsError::NotFound(name.to_string()))?;

        let record =
            CaptureRecord::from_request(request, remote_addr, self.limits.max_body_size).await?;
        let (stored, config) = basket.capture_with_config(record).await?;

        Ok(Captured {
            forward: ForwardTarget::from_config(basket.name(), &config),
            basket,
            stored,
        })
    }

    /// Capture `request` and relay it in the background when the basket forwards
    ///
    /// # Errors
    ///
    /// Same as [`BasketService::resolve_and_capture`]; relay failures are never returned
    pub async fn accept<B>(
        &self,
        name: &str,
        request: Request<B>,
        remote_addr: SocketAddr,
    ) -> Result<StoredRecord>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Display,
    {
        let captured = self.resolve_and_capture(name, request, remote_addr).await?;

        if let Some(target) = captured.forward {
            self.relay.dispatch(captured.stored.record.clone(), target);
        }

        Ok(captured.stored)
    }

    /// Whether `credential` grants access to the basket called `name`
    #[must_use]
    pub fn authorize_credential(&self, name: &str, credential: &str) -> bool {
        self.registry
            .get(name)
            .is_some_and(|basket| basket.authorize(credential))
    }

    /// Resolve a basket for a management operation
    ///
    /// An absent basket is `NotFound` and a rejected credential is
    /// `Unauthorized`, so callers can tell the two apart.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `Unauthorized`
    pub fn access(&self, name: &str, credential: Option<&str>) -> Result<Arc<Basket>> {
        let basket = self
            .registry
            .get(name)
            .ok_or_else(|| BasketsError::NotFound(name.to_string()))?;

        if !basket.authorize(credential.unwrap_or_default()) {
            debug!("Rejected credential for basket {}", name);
            return Err(BasketsError::Unauthorized(name.to_string()));
        }

        Ok(basket)
    }

    /// Create a basket from a configuration payload and return its token
    ///
    /// An empty payload creates the basket with the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DataTooLarge` for an oversized payload, the validation errors
    /// of [`Registry::create`], or `NameConflict`
    pub fn create_basket(&self, name: &str, payload: &[u8]) -> Result<String> {
        payload::check_size(payload, self.limits.max_config_size)?;

        let config = payload::create_config(
            payload,
            &self.registry.default_config(),
            self.registry.limits().max_capacity,
        )?;
        self.registry.create(name, config)
    }

    /// Apply a configuration payload; `None` when the payload is empty and
    /// nothing changed
    ///
    /// # Errors
    ///
    /// Returns `DataTooLarge` or `InvalidConfig`; the basket is then unchanged
    pub async fn update_basket(&self, basket: &Basket, payload: &[u8]) -> Result<Option<BasketConfig>> {
        payload::check_size(payload, self.limits.max_config_size)?;

        match payload::update_patch(payload)? {
            Some(patch) => basket.patch(&patch).await.map(Some),
            None => Ok(None),
        }
    }

    /// Requests of a basket, paged by the `max` and `skip` parameters of `query`
    ///
    /// With a `q` parameter only matching requests are listed.
    ///
    /// # Errors
    ///
    /// Returns a backend error
    pub fn list_requests(&self, basket: &Basket, query: Option<&str>) -> Result<RequestsPage> {
        let page = self.page(query);
        let search = SearchParams::from_query(query);

        if search.query.is_empty() {
            basket.requests(page)
        } else {
            basket.find_requests(&search.query, search.scope, page)
        }
    }

    /// Paging parameters of a listing query
    #[must_use]
    pub fn page(&self, query: Option<&str>) -> Page {
        payload::page(query, self.registry.limits().page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basket::BasketLimits;
    use crate::config::RelayConfig;
    use crate::storage::MemoryBackend;
    use http_body_util::Full;

    fn service() -> BasketService {
        let registry = Registry::new(
            Arc::new(MemoryBackend::new()),
            BasketLimits::default(),
            "master",
        )
        .unwrap();
        BasketService::new(
            Arc::new(registry),
            Arc::new(Relay::new(&RelayConfig::default())),
            LimitsConfig::default(),
        )
    }

    fn remote() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], 5000))
    }

    fn get(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .header("X-Test", "a")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_orders_lifecycle() {
        let service = service();
        let token = service.create_basket("orders", b"").unwrap();
        assert_eq!(token.len(), 40);

        let stored = service.accept("orders", get("/orders?x=1"), remote()).await.unwrap();
        assert_eq!(stored.record.path, "/orders");
        assert_eq!(stored.record.query["x"], vec!["1"]);
        assert_eq!(stored.record.headers["X-Test"], vec!["a"]);
        assert_eq!(stored.record.remote_addr, "10.0.0.1:5000");

        assert!(service.registry().delete("orders").await.unwrap());
        assert!(service.registry().get("orders").is_none());

        let missing = service.accept("orders", get("/orders"), remote()).await;
        assert!(matches!(missing, Err(BasketsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_access_distinguishes_absent_from_unauthorized() {
        let service = service();
        let token = service.create_basket("private", b"").unwrap();

        assert!(service.access("private", Some(&token)).is_ok());
        assert!(service.access("private", Some("master")).is_ok());
        assert!(matches!(
            service.access("private", Some("guess")),
            Err(BasketsError::Unauthorized(_))
        ));
        assert!(matches!(
            service.access("private", None),
            Err(BasketsError::Unauthorized(_))
        ));
        assert!(matches!(
            service.access("absent", Some(&token)),
            Err(BasketsError::NotFound(_))
        ));

        assert!(service.authorize_credential("private", &token));
        assert!(!service.authorize_credential("absent", &token));
    }

    #[tokio::test]
    async fn test_create_payload_limits() {
        let service = service();
        let oversized = vec![b' '; 2049];

        let err = service.create_basket("big", &oversized).unwrap_err();
        assert_eq!(err.status_code(), hyper::StatusCode::PAYLOAD_TOO_LARGE);

        let err = service
            .create_basket("bad", br#"{"capacity": 5000}"#)
            .unwrap_err();
        assert_eq!(err.status_code(), hyper::StatusCode::UNPROCESSABLE_ENTITY);

        let err = service.create_basket("web", b"").unwrap_err();
        assert_eq!(err.status_code(), hyper::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_update_basket() {
        let service = service();
        service.create_basket("cfg", br#"{"capacity": 10}"#).unwrap();
        let basket = service.access("cfg", Some("master")).unwrap();

        assert_eq!(service.update_basket(&basket, b"").await.unwrap(), None);

        let config = service
            .update_basket(&basket, br#"{"capacity": 3}"#)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(config.capacity, 3);

        let rejected = service
            .update_basket(&basket, br#"{"forward_url": "nope"}"#)
            .await;
        assert!(rejected.is_err());
        assert_eq!(basket.config().unwrap().capacity, 3);
    }

    #[tokio::test]
    async fn test_capture_follows_updated_forward_url() {
        let service = service();
        service.create_basket("relay", b"").unwrap();
        let basket = service.access("relay", Some("master")).unwrap();

        let captured = service
            .resolve_and_capture("relay", get("/relay"), remote())
            .await
            .unwrap();
        assert!(captured.forward.is_none());

        service
            .update_basket(
                &basket,
                br#"{"forward_url": "http://127.0.0.1:9/hook", "expand_path": true}"#,
            )
            .await
            .unwrap();

        let captured = service
            .resolve_and_capture("relay", get("/relay/sub"), remote())
            .await
            .unwrap();
        let target = captured.forward.unwrap();
        assert_eq!(target.url, "http://127.0.0.1:9/hook");
        assert!(target.expand_path);
        assert_eq!(captured.stored.id, 2);
    }

    #[tokio::test]
    async fn test_list_requests_with_search() {
        let service = service();
        service.create_basket("hooks", b"").unwrap();

        for i in 0..4 {
            service
                .accept("hooks", get(&format!("/hooks?event=e{i}")), remote())
                .await
                .unwrap();
        }

        let basket = service.access("hooks", Some("master")).unwrap();

        let page = service.list_requests(&basket, Some("max=2")).unwrap();
        assert_eq!(page.requests.len(), 2);
        assert_eq!(page.count, 4);
        assert!(page.has_more);

        let found = service
            .list_requests(&basket, Some("q=e2&in=query"))
            .unwrap();
        assert_eq!(found.count, 1);
        assert_eq!(found.requests[0].record.query["event"], vec!["e2"]);
    }
}
