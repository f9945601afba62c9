//! Fire-and-forget relay of captured requests

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::StatusCode;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::client::{build_forward_uri, RelayClient};
use super::permits::RelayPermits;
use crate::basket::BasketConfig;
use crate::capture::CaptureRecord;
use crate::config::RelayConfig;
use crate::{BasketsError, Result};

/// Where a basket relays its captures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    /// Basket the capture belongs to
    pub basket: String,
    /// Configured forward URL
    pub url: String,
    /// Append the captured sub-path to the URL path
    pub expand_path: bool,
}

impl ForwardTarget {
    /// Target for a basket configuration, `None` if it does not forward
    #[must_use]
    pub fn from_config(basket: &str, config: &BasketConfig) -> Option<Self> {
        config.forwards().then(|| Self {
            basket: basket.to_string(),
            url: config.forward_url.clone(),
            expand_path: config.expand_path,
        })
    }
}

/// Relay outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Relays started
    pub dispatched: u64,
    /// Relays answered with a 2xx status
    pub delivered: u64,
    /// Relays that failed (network error, timeout or non-2xx status)
    pub failed: u64,
    /// Relays skipped because the in-flight limit was reached or no runtime was available
    pub dropped: u64,
    /// Relays currently running
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    dispatched: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Relays captured requests to forward URLs on detached tasks
///
/// Each relay is bounded by a timeout and by a cap on concurrently running
/// relays. A relay that cannot get a permit is dropped, never queued, so
/// the capture path does not wait on it. Failures are logged and counted
/// and never retried.
pub struct Relay {
    client: RelayClient,
    permits: RelayPermits,
    timeout: Duration,
    counters: Counters,
}

impl Relay {
    /// Create a relay with its own pooled client
    #[must_use]
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            client: RelayClient::new(),
            permits: RelayPermits::new(config.max_in_flight),
            timeout: config.timeout(),
            counters: Counters::default(),
        }
    }

    /// Send `record` to `target` and wait for the outcome
    ///
    /// # Errors
    ///
    /// Returns `Forward` on network error, timeout or a non-2xx response
    pub async fn forward(&self, record: &CaptureRecord, target: &ForwardTarget) -> Result<StatusCode> {
        let uri = build_forward_uri(&target.url, record, &target.basket, target.expand_path)?;

        let status = tokio::time::timeout(self.timeout, self.client.send(record, uri))
            .await
            .map_err(|_| {
                BasketsError::Forward(format!(
                    "No response from {} within {:?}",
                    target.url, self.timeout
                ))
            })??;

        if !status.is_success() {
            return Err(BasketsError::Forward(format!(
                "{} answered with status {}",
                target.url, status
            )));
        }

        Ok(status)
    }

    /// Relay `record` on a detached task; returns whether a task was started
    ///
    /// Never waits: without a free permit or outside a Tokio runtime the
    /// relay is dropped and counted.
    pub fn dispatch(self: &Arc<Self>, record: CaptureRecord, target: ForwardTarget) -> bool {
        let Ok(runtime) = Handle::try_current() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("No runtime to relay basket {} capture", target.basket);
            return false;
        };

        let Some(permit) = self.permits.try_acquire() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Relay limit of {} reached, dropping relay for basket {}",
                self.permits.capacity(),
                target.basket
            );
            return false;
        };

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        let relay = Arc::clone(self);

        runtime.spawn(async move {
            let _permit = permit;
            match relay.forward(&record, &target).await {
                Ok(status) => {
                    relay.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!("Relayed basket {} capture: {}", target.basket, status);
                }
                Err(e) => {
                    relay.counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("Relay for basket {} failed: {}", target.basket, e);
                }
            }
        });

        true
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            in_flight: self.permits.in_flight(),
        }
    }
}
