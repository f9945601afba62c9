//! Baskets: named, capacity-bounded capture logs

mod config;
mod handle;
mod page;

pub use config::{validate_forward_url, BasketConfig, BasketConfigPatch};
pub use handle::Basket;
pub use page::{NamesPage, Page, RequestsPage, SearchScope};

/// Capacity ceiling and paging defaults shared by every basket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasketLimits {
    /// Capacity for baskets created without one
    pub init_capacity: usize,
    /// Largest allowed capacity
    pub max_capacity: usize,
    /// Default page size for listings
    pub page_size: usize,
}

impl Default for BasketLimits {
    fn default() -> Self {
        Self {
            init_capacity: crate::config::INIT_BASKET_CAPACITY,
            max_capacity: crate::config::MAX_BASKET_CAPACITY,
            page_size: crate::config::DEFAULT_PAGE_SIZE,
        }
    }
}

impl From<&crate::config::ServerConfig> for BasketLimits {
    fn from(config: &crate::config::ServerConfig) -> Self {
        Self {
            init_capacity: config.init_capacity,
            max_capacity: config.max_capacity,
            page_size: config.page_size,
        }
    }
}
