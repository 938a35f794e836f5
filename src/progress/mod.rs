//! Progress snapshot sources.
//!
//! Two interchangeable strategies produce [`ProgressSnapshot`]s while a query
//! runs:
//!
//! - [`poll`]: side-channel lookups against `system.processes` on a fixed
//!   interval. Failures only cost the current tick.
//! - [`headers`]: `X-ClickHouse-Progress` header lines sniffed from the
//!   primary response before its body starts. Malformed headers are fatal.
//!
//! [`stats`] reads the finished query's row from `system.query_log`.

pub mod headers;
pub mod poll;
pub mod stats;

pub use headers::{parse_progress_header, sniff_progress_headers, PROGRESS_HEADER};
pub use poll::{fetch_progress, parse_progress_rows, ProgressPoller, POLL_INTERVAL};
pub use stats::{fetch_query_stats, parse_query_stats, QueryStats};

use std::str::FromStr;
use std::time::Duration;

use crate::client::ServiceClient;
use crate::error::{Result, StreamError};

/// Point-in-time reading of a running query's counters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProgressSnapshot {
    pub elapsed_seconds: f64,
    pub read_rows: u64,
    pub read_bytes: u64,
    pub total_rows_approx: u64,
    pub written_rows: u64,
    pub written_bytes: u64,
    /// Bytes; may be negative when the server reports an underflow.
    pub memory_usage: i64,
}

impl ProgressSnapshot {
    /// Elapsed time as a duration. Negative or non-finite readings give zero.
    pub fn elapsed(&self) -> Duration {
        Duration::try_from_secs_f64(self.elapsed_seconds).unwrap_or_default()
    }
}

/// Keeps the displayed progress non-decreasing.
///
/// Ticks are independent requests and can arrive out of order; a snapshot
/// whose `read_rows` or `read_bytes` is below the last accepted one is stale.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last: Option<ProgressSnapshot>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the snapshot should be displayed.
    pub fn accept(&mut self, snapshot: ProgressSnapshot) -> bool {
        if let Some(last) = &self.last {
            if snapshot.read_rows < last.read_rows || snapshot.read_bytes < last.read_bytes {
                return false;
            }
        }
        self.last = Some(snapshot);
        true
    }
}

/// Asks the server for its version string.
pub async fn server_version(service: &dyn ServiceClient) -> Result<String> {
    let rows = service.service_request("SELECT version()").await?;
    rows.into_iter()
        .next()
        .and_then(|row| row.into_iter().next())
        .ok_or_else(|| StreamError::protocol("empty response to version probe"))
}

/// Parses one cell of a service response.
pub(crate) fn parse_cell<T: FromStr>(row: &[String], index: usize, column: &str) -> Result<T> {
    let raw = row
        .get(index)
        .ok_or_else(|| StreamError::protocol(format!("missing column {column}")))?;
    raw.trim()
        .parse()
        .map_err(|_| StreamError::protocol(format!("column {column}: not a number: {raw:?}")))
}
