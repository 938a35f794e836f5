//! ch-stream - run a ClickHouse query over HTTP with live progress and
//! responsive cancellation.
//!
//! This library exposes the core modules for the binary and the integration tests.

pub mod cancel;
pub mod client;
pub mod config;
pub mod display;
pub mod error;
pub mod executor;
pub mod logging;
pub mod progress;
pub mod session;
pub mod testing;
