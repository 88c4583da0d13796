//! Shared utilities: error types, logging setup and the bounded retry loop
//! used when bringing up the broker and cache connections.

pub mod error;
pub mod logging;
pub mod retry;
