//! Progress headers streaming strategy.
//!
//! With `send_progress_in_http_headers=1` the server interleaves
//! `X-ClickHouse-Progress: {...}` lines into the response head while the query
//! runs. The counters in the JSON payload are string-encoded integers.

use std::time::{Duration, Instant};

use serde::{Deserialize, Deserializer};
use tokio::io::AsyncRead;
use tracing::debug;

use super::ProgressSnapshot;
use crate::client::replay::HeaderPeek;
use crate::display::ProgressSink;
use crate::error::{Result, StreamError};

/// Header line prefix carrying a progress payload.
pub const PROGRESS_HEADER: &str = "X-ClickHouse-Progress:";

#[derive(Debug, Deserialize)]
struct ProgressPayload {
    #[serde(default, deserialize_with = "string_u64")]
    read_rows: Option<u64>,
    #[serde(default, deserialize_with = "string_u64")]
    read_bytes: Option<u64>,
    #[serde(default, deserialize_with = "string_u64")]
    written_rows: Option<u64>,
    #[serde(default, deserialize_with = "string_u64")]
    written_bytes: Option<u64>,
    #[serde(default, deserialize_with = "string_u64")]
    total_rows: Option<u64>,
    #[serde(default, deserialize_with = "string_u64")]
    total_rows_to_read: Option<u64>,
}

fn string_u64<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map(Some).map_err(serde::de::Error::custom)
}

/// Parses a header line.
///
/// Returns `None` for lines that are not progress headers, and an error for
/// progress headers whose payload is malformed.
pub fn parse_progress_header(line: &str, elapsed: Duration) -> Option<Result<ProgressSnapshot>> {
    let prefix = line.get(..PROGRESS_HEADER.len())?;
    if !prefix.eq_ignore_ascii_case(PROGRESS_HEADER) {
        return None;
    }
    let json = line[PROGRESS_HEADER.len()..].trim();

    let parsed = serde_json::from_str::<ProgressPayload>(json)
        .map(|payload| ProgressSnapshot {
            elapsed_seconds: elapsed.as_secs_f64(),
            read_rows: payload.read_rows.unwrap_or_default(),
            read_bytes: payload.read_bytes.unwrap_or_default(),
            total_rows_approx: payload
                .total_rows_to_read
                .or(payload.total_rows)
                .unwrap_or_default(),
            written_rows: payload.written_rows.unwrap_or_default(),
            written_bytes: payload.written_bytes.unwrap_or_default(),
            memory_usage: 0,
        })
        .map_err(|e| StreamError::protocol(format!("malformed progress header {json:?}: {e}")));
    Some(parsed)
}

/// Consumes the response head, rendering every progress header on `sink`
/// as it arrives. Returns the number of progress headers seen.
///
/// Each render is flushed before the next line is read, so the progress is
/// on screen before the body starts.
pub async fn sniff_progress_headers<R>(
    peek: &mut HeaderPeek<R>,
    sink: &mut dyn ProgressSink,
    started: Instant,
) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut seen = 0;
    while let Some(line) = peek.next_line().await? {
        let Some(parsed) = parse_progress_header(&line, started.elapsed()) else {
            continue;
        };
        let snapshot = parsed?;
        seen += 1;
        if let Err(e) = sink.write_progress(
            snapshot.read_rows,
            snapshot.read_bytes,
            snapshot.total_rows_approx,
            snapshot.elapsed(),
        ) {
            debug!("progress display write failed: {e}");
        }
    }
    Ok(seen)
}
