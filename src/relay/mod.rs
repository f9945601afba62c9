//! Best-effort relay of captured requests to forward URLs

mod client;
mod engine;
mod permits;

pub use client::{build_forward_uri, is_hop_by_hop, RelayClient};
pub use engine::{ForwardTarget, Relay, RelayStats};
pub use permits::{RelayPermit, RelayPermits};
