//! # Shopfinity backend
//!
//! Messaging and caching infrastructure behind the Shopfinity storefront.
//!
//! - `messaging`: publishes domain events (orders, payments, inventory,
//!   notifications) to topic exchanges and consumes them with explicit
//!   acknowledgment.
//! - `cache`: key/value cache with TTLs for product listings, sessions and
//!   carts.
//! - `config`: layered settings from `config/default.toml` and environment.
//! - `server`: the liveness endpoint.
//! - `app`: startup, default consumers and graceful shutdown.
//! - `utils`: error types, logging and retry.

pub mod app;
pub mod cache;
pub mod config;
pub mod messaging;
pub mod server;
pub mod utils;
