//! Post-completion statistics from `system.query_log`.

use tracing::debug;

use super::parse_cell;
use crate::client::{quote_literal, ServiceClient};
use crate::display::{format_bytes, format_count};
use crate::error::{Result, StreamError};

/// Number of columns requested from `system.query_log`.
const STATS_COLUMNS: usize = 11;

/// Final statistics of a finished query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryStats {
    pub duration_ms: u64,
    pub read_rows: u64,
    pub read_bytes: u64,
    pub written_rows: u64,
    pub written_bytes: u64,
    pub result_rows: u64,
    pub result_bytes: u64,
    pub memory_usage: u64,
    pub exception: String,
    pub stack_trace: String,
    /// Log entry type (`QueryFinish`, `ExceptionWhileProcessing`, ...).
    pub kind: String,
}

impl QueryStats {
    /// Multi-line summary for the operator.
    pub fn summary(&self) -> String {
        let mut text = format!(
            "Duration: {} ms\nRead: {} rows, {}\nWritten: {} rows, {}\nResult: {} rows, {}\nPeak memory: {}\n",
            self.duration_ms,
            format_count(self.read_rows),
            format_bytes(self.read_bytes),
            format_count(self.written_rows),
            format_bytes(self.written_bytes),
            format_count(self.result_rows),
            format_bytes(self.result_bytes),
            format_bytes(self.memory_usage),
        );
        if !self.exception.is_empty() {
            text.push_str(&format!("Exception: {}\n", self.exception));
        }
        text
    }
}

fn stats_query(query_id: &str) -> String {
    format!(
        "SELECT query_duration_ms, read_rows, read_bytes, written_rows, written_bytes, \
         result_rows, result_bytes, memory_usage, exception, stack_trace, type \
         FROM system.query_log WHERE query_id = {} AND type != 'QueryStart'",
        quote_literal(query_id)
    )
}

/// Reads the finished query's log entry.
///
/// The query log is flushed first on a best-effort basis; a user without the
/// `SYSTEM FLUSH LOGS` grant may simply have to wait for the periodic flush.
pub async fn fetch_query_stats(service: &dyn ServiceClient, query_id: &str) -> Result<QueryStats> {
    if let Err(e) = service.service_request("SYSTEM FLUSH LOGS").await {
        debug!("query log flush skipped: {e}");
    }
    let rows = service.service_request(&stats_query(query_id)).await?;
    parse_query_stats(&rows)
}

/// Parses a `system.query_log` response: exactly one row of eleven columns.
pub fn parse_query_stats(rows: &[Vec<String>]) -> Result<QueryStats> {
    let [row] = rows else {
        return Err(StreamError::protocol(format!(
            "bad response dimensions: {} rows",
            rows.len()
        )));
    };
    if row.len() != STATS_COLUMNS {
        return Err(StreamError::protocol(format!(
            "bad response dimensions: {} columns",
            row.len()
        )));
    }

    Ok(QueryStats {
        duration_ms: parse_cell(row, 0, "query_duration_ms")?,
        read_rows: parse_cell(row, 1, "read_rows")?,
        read_bytes: parse_cell(row, 2, "read_bytes")?,
        written_rows: parse_cell(row, 3, "written_rows")?,
        written_bytes: parse_cell(row, 4, "written_bytes")?,
        result_rows: parse_cell(row, 5, "result_rows")?,
        result_bytes: parse_cell(row, 6, "result_bytes")?,
        memory_usage: parse_cell(row, 7, "memory_usage")?,
        exception: row[8].clone(),
        stack_trace: row[9].clone(),
        kind: row[10].clone(),
    })
}
