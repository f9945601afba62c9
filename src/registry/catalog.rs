//! Basket registry

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::{generate_token, validate_name, BasketsStats};
use crate::basket::{Basket, BasketConfig, BasketLimits, NamesPage, Page};
use crate::config::{BackendKind, ServerConfig};
use crate::storage::{open_backend, Backend, BasketEntry};
use crate::{BasketsError, Result};

/// Catalogue of baskets over one storage backend
///
/// The in-process map is the authority on which baskets exist: it is loaded
/// from the backend once at construction, and creation and deletion update
/// the backend and the map under the same map entry, so concurrent creates
/// of one name cannot both succeed.
pub struct Registry {
    backend: Arc<dyn Backend>,
    baskets: DashMap<String, Arc<Basket>>,
    limits: BasketLimits,
    master_token: Arc<str>,
}

impl Registry {
    /// Registry over an opened backend, loading the baskets it already holds
    ///
    /// # Errors
    ///
    /// Returns error if the stored baskets cannot be read
    pub fn new(
        backend: Arc<dyn Backend>,
        limits: BasketLimits,
        master_token: impl Into<Arc<str>>,
    ) -> Result<Self> {
        let registry = Self {
            backend,
            baskets: DashMap::new(),
            limits,
            master_token: master_token.into(),
        };

        for name in registry.backend.names(Page::all())?.names {
            if let Some(entry) = registry.backend.load(&name)? {
                let basket = registry.handle(&name, entry.token);
                registry.baskets.insert(name, basket);
            }
        }

        if !registry.baskets.is_empty() {
            info!("Loaded {} baskets from storage", registry.baskets.len());
        }

        Ok(registry)
    }

    /// Open the configured backend and pre-create the configured baskets
    ///
    /// A master token is generated, and logged once, when none is configured.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be opened or a configured basket
    /// cannot be created
    pub fn open(config: &ServerConfig) -> Result<Self> {
        let backend = open_backend(config)?;

        let master_token = match config.master_token.as_deref() {
            Some(token) if !token.is_empty() => token.to_string(),
            _ => {
                let token = generate_token();
                info!("Generated master token: {}", token);
                token
            }
        };

        let registry = Self::new(backend, BasketLimits::from(config), master_token)?;
        registry.ensure_baskets(&config.baskets)?;
        Ok(registry)
    }

    /// Token granting access to every basket
    #[must_use]
    pub fn master_token(&self) -> &str {
        &self.master_token
    }

    /// Capacity and paging limits
    #[must_use]
    pub fn limits(&self) -> BasketLimits {
        self.limits
    }

    /// Storage backend in use
    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Configuration for baskets created without one
    #[must_use]
    pub fn default_config(&self) -> BasketConfig {
        BasketConfig::with_capacity(self.limits.init_capacity)
    }

    /// Create a basket with a freshly generated token
    ///
    /// # Errors
    ///
    /// Returns `ReservedName`, `InvalidName` or `InvalidConfig` for bad input,
    /// `NameConflict` if the name is taken, or a backend error
    pub fn create(&self, name: &str, config: BasketConfig) -> Result<String> {
        let basket = self.create_with_token(name, config, generate_token())?;
        Ok(basket.token().to_string())
    }

    /// Create a basket with a token chosen by an administrator
    ///
    /// # Errors
    ///
    /// Same as [`Registry::create`]; an empty token is an `InvalidConfig`
    pub fn create_with_token(
        &self,
        name: &str,
        config: BasketConfig,
        token: String,
    ) -> Result<Arc<Basket>> {
        validate_name(name)?;
        config.validate(self.limits.max_capacity)?;
        if token.is_empty() {
            return Err(BasketsError::InvalidConfig(
                "Basket token must not be empty".to_string(),
            ));
        }

        match self.baskets.entry(name.to_string()) {
            Entry::Occupied(_) => Err(BasketsError::NameConflict(name.to_string())),
            Entry::Vacant(vacant) => {
                self.backend.create(name, &BasketEntry::new(token.clone(), config))?;

                let basket = self.handle(name, token);
                vacant.insert(Arc::clone(&basket));
                info!("Created basket: {}", name);
                Ok(basket)
            }
        }
    }

    /// Look up a basket
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Basket>> {
        self.baskets.get(name).map(|basket| Arc::clone(basket.value()))
    }

    /// Remove a basket and every request it holds
    ///
    /// Waits for in-flight writes to the basket to finish. Handles obtained
    /// earlier refuse further use. Returns whether the basket existed;
    /// deleting an absent basket is not an error.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails; the basket is then kept
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let Some(basket) = self.get(name) else {
            return Ok(false);
        };

        let _writes = basket.lock_writes().await;

        match self.baskets.entry(name.to_string()) {
            Entry::Occupied(occupied) if Arc::ptr_eq(occupied.get(), &basket) => {
                self.backend.delete(name)?;
                basket.mark_deleted();
                occupied.remove();
                info!("Deleted basket: {}", name);
                Ok(true)
            }
            // Deleted (and possibly recreated) while we waited
            _ => Ok(false),
        }
    }

    /// Basket names in ascending order
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub fn names(&self, page: Page) -> Result<NamesPage> {
        self.backend.names(page)
    }

    /// Names containing `query`, in ascending order
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub fn find_names(&self, query: &str, page: Page) -> Result<NamesPage> {
        let names = self
            .backend
            .names(Page::all())?
            .names
            .into_iter()
            .filter(|name| name.contains(query))
            .collect();
        Ok(NamesPage::from_sorted(names, page))
    }

    /// Statistics over every basket
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub fn stats(&self, max_top: usize) -> Result<BasketsStats> {
        let summaries = self.backend.summaries()?;
        Ok(BasketsStats::collect(&summaries, max_top))
    }

    /// Create each named basket with the default configuration unless it exists
    ///
    /// Returns how many baskets were created.
    ///
    /// # Errors
    ///
    /// Returns error if a name is invalid or the backend fails
    pub fn ensure_baskets(&self, names: &[String]) -> Result<usize> {
        let mut created = 0;

        for name in names {
            if self.baskets.contains_key(name) {
                debug!("Basket {} already exists", name);
                continue;
            }

            match self.create(name, self.default_config()) {
                Ok(token) => {
                    info!("Basket {} token: {}", name, token);
                    created += 1;
                }
                Err(BasketsError::NameConflict(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(created)
    }

    /// Number of baskets
    #[must_use]
    pub fn len(&self) -> usize {
        self.baskets.len()
    }

    /// Whether there are no baskets
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.baskets.is_empty()
    }

    fn handle(&self, name: &str, token: String) -> Arc<Basket> {
        Arc::new(Basket::new(
            name,
            token,
            Arc::clone(&self.master_token),
            Arc::clone(&self.backend),
            self.limits,
        ))
    }
}
