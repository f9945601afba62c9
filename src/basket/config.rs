//! Basket configuration and its validation

use hyper::Uri;
use serde::{Deserialize, Serialize};

use crate::{BasketsError, Result};

/// Per-basket configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasketConfig {
    /// Downstream URL captured requests are relayed to, empty to disable
    #[serde(default)]
    pub forward_url: String,
    /// Maximum number of retained requests
    pub capacity: usize,
    /// Append the captured path (minus the basket prefix) to the forward URL
    #[serde(default)]
    pub expand_path: bool,
}

impl BasketConfig {
    /// Configuration with the given capacity and no forwarding
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            forward_url: String::new(),
            capacity,
            expand_path: false,
        }
    }

    /// Whether captured requests should be relayed
    #[must_use]
    pub fn forwards(&self) -> bool {
        !self.forward_url.is_empty()
    }

    /// Validate capacity bounds and forward URL
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the capacity is outside `1..=max_capacity`
    /// or the forward URL is not an absolute http(s) URL
    pub fn validate(&self, max_capacity: usize) -> Result<()> {
        if self.capacity < 1 {
            return Err(BasketsError::InvalidConfig(format!(
                "Capacity should be a positive number, but was {}",
                self.capacity
            )));
        }

        if self.capacity > max_capacity {
            return Err(BasketsError::InvalidConfig(format!(
                "Capacity may not be greater than {max_capacity}"
            )));
        }

        validate_forward_url(&self.forward_url)
    }
}

/// Validate a forward URL: empty, or absolute with an http(s) scheme and a host
///
/// # Errors
///
/// Returns `InvalidConfig` for anything else
pub fn validate_forward_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Ok(());
    }

    let uri = url
        .parse::<Uri>()
        .map_err(|e| BasketsError::InvalidConfig(format!("Invalid forward URL '{url}': {e}")))?;

    match uri.scheme_str() {
        Some("http" | "https") => {}
        _ => {
            return Err(BasketsError::InvalidConfig(format!(
                "Forward URL must use http or https: {url}"
            )))
        }
    }

    if uri.host().map_or(true, str::is_empty) {
        return Err(BasketsError::InvalidConfig(format!(
            "Forward URL has no host: {url}"
        )));
    }

    Ok(())
}

/// Configuration payload as sent by clients; omitted fields keep their value
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BasketConfigPatch {
    /// New forward URL
    #[serde(default)]
    pub forward_url: Option<String>,
    /// New capacity, signed so negative input is reported rather than rejected by the parser
    #[serde(default)]
    pub capacity: Option<i64>,
    /// New path expansion flag
    #[serde(default)]
    pub expand_path: Option<bool>,
}

impl BasketConfigPatch {
    /// Parse a JSON payload
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the payload is not a JSON object of the expected shape
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| BasketsError::InvalidConfig(format!("Malformed configuration: {e}")))
    }

    /// Merge onto `base` and validate the result
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the merged configuration is invalid
    pub fn apply(&self, base: &BasketConfig, max_capacity: usize) -> Result<BasketConfig> {
        let mut config = base.clone();

        if let Some(url) = &self.forward_url {
            config.forward_url = url.clone();
        }

        if let Some(capacity) = self.capacity {
            config.capacity = usize::try_from(capacity).map_err(|_| {
                BasketsError::InvalidConfig(format!(
                    "Capacity should be a positive number, but was {capacity}"
                ))
            })?;
        }

        if let Some(expand_path) = self.expand_path {
            config.expand_path = expand_path;
        }

        config.validate(max_capacity)?;
        Ok(config)
    }
}
