//! Paging and listing envelopes

use std::str::FromStr;

use serde::Serialize;

use crate::capture::{CaptureRecord, StoredRecord};
use crate::BasketsError;

/// A window over a most-recent-first listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Maximum number of items
    pub max: usize,
    /// Items to skip from the start
    pub skip: usize,
}

impl Page {
    /// Page with explicit bounds
    #[must_use]
    pub fn new(max: usize, skip: usize) -> Self {
        Self { max, skip }
    }

    /// Everything, from the start
    #[must_use]
    pub fn all() -> Self {
        Self::new(usize::MAX, 0)
    }

    /// Parse `max` and `skip` from a raw query string
    ///
    /// Absent, negative or non-numeric values fall back to `default_max` and 0.
    #[must_use]
    pub fn from_query(query: Option<&str>, default_max: usize) -> Self {
        let mut page = Self::new(default_max, 0);

        for pair in query.unwrap_or_default().split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "max" => page.max = value.parse().unwrap_or(default_max),
                "skip" => page.skip = value.parse().unwrap_or(0),
                _ => {}
            }
        }

        page
    }

    /// Apply the window to an iterator
    pub fn apply<I: Iterator>(&self, items: I) -> impl Iterator<Item = I::Item> {
        items.skip(self.skip).take(self.max)
    }

    /// Whether more items follow this window in a listing of `count` items
    #[must_use]
    pub fn has_more(&self, count: usize) -> bool {
        self.skip.saturating_add(self.max) < count
    }
}

/// A page of captured requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestsPage {
    /// Requests, most recent first
    pub requests: Vec<StoredRecord>,
    /// Requests currently held (or matched, for searches)
    pub count: usize,
    /// Requests ever captured by the basket
    pub total_count: u64,
    /// More requests follow this page
    pub has_more: bool,
}

/// A page of basket names
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamesPage {
    /// Names in ascending order
    pub names: Vec<String>,
    /// Baskets in the listing
    pub count: usize,
    /// More names follow this page
    pub has_more: bool,
}

impl NamesPage {
    /// Page over an already sorted list of names
    #[must_use]
    pub fn from_sorted(names: Vec<String>, page: Page) -> Self {
        let count = names.len();
        Self {
            names: page.apply(names.into_iter()).collect(),
            count,
            has_more: page.has_more(count),
        }
    }
}

/// Part of a request a search looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchScope {
    /// Body, query and headers
    #[default]
    Any,
    /// Body only
    Body,
    /// Query parameter names and values
    Query,
    /// Header names and values
    Headers,
}

impl SearchScope {
    /// Whether `record` contains `needle` within this scope
    #[must_use]
    pub fn matches(self, record: &CaptureRecord, needle: &str) -> bool {
        let in_map = |map: &std::collections::BTreeMap<String, Vec<String>>| {
            map.iter().any(|(key, values)| {
                key.contains(needle) || values.iter().any(|value| value.contains(needle))
            })
        };

        match self {
            Self::Any => {
                record.body_text().contains(needle)
                    || in_map(&record.query)
                    || in_map(&record.headers)
            }
            Self::Body => record.body_text().contains(needle),
            Self::Query => in_map(&record.query),
            Self::Headers => in_map(&record.headers),
        }
    }
}

impl FromStr for SearchScope {
    type Err = BasketsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "any" => Ok(Self::Any),
            "body" => Ok(Self::Body),
            "query" => Ok(Self::Query),
            "headers" => Ok(Self::Headers),
            other => Err(BasketsError::Other(format!("Unknown search scope: {other}"))),
        }
    }
}
