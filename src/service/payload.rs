//! Parsing of request payloads and listing parameters

use bytes::Bytes;
use hyper::body::Body;

use crate::basket::{BasketConfig, BasketConfigPatch, Page, SearchScope};
use crate::capture::{parse_query, read_body_truncated};
use crate::{BasketsError, Result};

/// Read a configuration payload, rejecting anything over `limit` bytes
///
/// # Errors
///
/// Returns `DataTooLarge` over the limit, or the body stream error
pub async fn read_payload<B>(body: B, limit: usize) -> Result<Bytes>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let (payload, truncated) = read_body_truncated(body, limit).await?;
    if truncated {
        return Err(BasketsError::DataTooLarge {
            size: limit + 1,
            limit,
        });
    }
    Ok(payload)
}

/// Check the size of an already buffered payload
///
/// # Errors
///
/// Returns `DataTooLarge` over the limit
pub fn check_size(payload: &[u8], limit: usize) -> Result<()> {
    if payload.len() > limit {
        return Err(BasketsError::DataTooLarge {
            size: payload.len(),
            limit,
        });
    }
    Ok(())
}

/// Configuration for a new basket: omitted fields take the defaults
///
/// # Errors
///
/// Returns `InvalidConfig` for a malformed or out-of-range payload
pub fn create_config(
    payload: &[u8],
    defaults: &BasketConfig,
    max_capacity: usize,
) -> Result<BasketConfig> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(defaults.clone());
    }
    BasketConfigPatch::from_json(payload)?.apply(defaults, max_capacity)
}

/// Configuration change, `None` when the payload is empty
///
/// # Errors
///
/// Returns `InvalidConfig` for a malformed payload
pub fn update_patch(payload: &[u8]) -> Result<Option<BasketConfigPatch>> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    BasketConfigPatch::from_json(payload).map(Some)
}

/// Search parameters of a listing query: `q` (substring) and `in` (scope)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchParams {
    /// Substring to look for
    pub query: String,
    /// Part of a request to search
    pub scope: SearchScope,
}

impl SearchParams {
    /// Parse from a raw query string; an unknown scope searches everywhere
    #[must_use]
    pub fn from_query(raw: Option<&str>) -> Self {
        let params = parse_query(raw.unwrap_or_default());
        let first = |key: &str| {
            params
                .get(key)
                .and_then(|values| values.first())
                .cloned()
                .unwrap_or_default()
        };

        Self {
            query: first("q"),
            scope: first("in").parse().unwrap_or_default(),
        }
    }
}

/// Paging parameters of a listing query
#[must_use]
pub fn page(raw: Option<&str>, default_max: usize) -> Page {
    Page::from_query(raw, default_max)
}
