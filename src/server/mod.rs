//! HTTP surface of the backend process.
//!
//! Only liveness lives here: `GET /health` answers as soon as the process is
//! up and does not look at broker or cache state.

pub mod health;

pub use health::{AppState, router, serve};
