//! Baskets - capture, inspect and relay HTTP requests
//!
//! A basket is a named endpoint that records every request sent to it in a
//! bounded, most-recent-first log and can relay each capture to a forward URL.
//! Baskets live in a [`registry::Registry`] over one of three interchangeable
//! [`storage`] backends; [`service::BasketService`] is the surface a routing
//! layer drives.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::multiple_crate_versions
)]

pub mod basket;
pub mod capture;
pub mod config;
pub mod error;
pub mod registry;
pub mod relay;
pub mod service;
pub mod storage;

pub use error::{BasketsError, Result};
