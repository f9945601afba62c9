//! Aggregate figures over all baskets

use serde::Serialize;

use crate::storage::BasketSummary;

/// Figures for one basket in a top list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BasketInfo {
    /// Basket name
    pub name: String,
    /// Requests currently held
    pub requests_count: usize,
    /// Requests ever captured
    pub requests_total_count: u64,
    /// Capture time of the newest held request, 0 if none
    pub last_request_date: u64,
}

impl From<&BasketSummary> for BasketInfo {
    fn from(summary: &BasketSummary) -> Self {
        Self {
            name: summary.name.clone(),
            requests_count: summary.count,
            requests_total_count: summary.total_count,
            last_request_date: summary.last_date.unwrap_or(0),
        }
    }
}

/// Statistics over every basket of a registry
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BasketsStats {
    /// Number of baskets
    pub baskets_count: usize,
    /// Baskets holding no requests
    pub empty_baskets_count: usize,
    /// Requests currently held
    pub requests_count: usize,
    /// Requests ever captured
    pub requests_total_count: u64,
    /// Largest number of held requests in one basket
    pub max_basket_size: usize,
    /// Average number of held requests per non-empty basket
    pub avg_basket_size: usize,
    /// Largest baskets, by held requests
    pub top_baskets_size: Vec<BasketInfo>,
    /// Most recently used baskets
    pub top_baskets_recent: Vec<BasketInfo>,
}

impl BasketsStats {
    /// Aggregate `summaries`, keeping at most `max_top` baskets in each top list
    #[must_use]
    pub fn collect(summaries: &[BasketSummary], max_top: usize) -> Self {
        let mut stats = Self {
            baskets_count: summaries.len(),
            ..Self::default()
        };

        for summary in summaries {
            if summary.count == 0 {
                stats.empty_baskets_count += 1;
            }
            stats.requests_count += summary.count;
            stats.requests_total_count += summary.total_count;
            stats.max_basket_size = stats.max_basket_size.max(summary.count);
        }

        let non_empty = stats.baskets_count - stats.empty_baskets_count;
        if non_empty > 0 {
            stats.avg_basket_size = stats.requests_count / non_empty;
        }

        let mut by_size: Vec<&BasketSummary> = summaries.iter().filter(|s| s.count > 0).collect();
        by_size.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
        stats.top_baskets_size = by_size.into_iter().take(max_top).map(BasketInfo::from).collect();

        let mut by_date: Vec<&BasketSummary> =
            summaries.iter().filter(|s| s.last_date.is_some()).collect();
        by_date.sort_by(|a, b| b.last_date.cmp(&a.last_date).then_with(|| a.name.cmp(&b.name)));
        stats.top_baskets_recent = by_date.into_iter().take(max_top).map(BasketInfo::from).collect();

        stats
    }
}
