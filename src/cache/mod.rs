//! The `cache` module is the key/value collaborator the storefront uses for
//! read-through caching of product listings, sessions and carts.
//!
//! It is backed by `sled`, an embedded key-value store. An unavailable cache
//! is a cold cache, never an error: reads return `None` and writes `false`.

pub mod sled_store;

pub use sled_store::{CacheEntry, CacheService};

#[cfg(test)]
mod tests;
