//! Polling progress strategy.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use super::{parse_cell, ProgressSnapshot};
use crate::client::{quote_literal, ServiceClient};
use crate::error::{Result, StreamError};
use crate::executor::ExecutionEvent;

/// Fixed interval between status lookups.
pub const POLL_INTERVAL: Duration = Duration::from_millis(125);

/// Number of columns requested from `system.processes`.
const PROGRESS_COLUMNS: usize = 7;

fn progress_query(query_id: &str) -> String {
    format!(
        "SELECT elapsed, read_rows, read_bytes, total_rows_approx, written_rows, written_bytes, memory_usage \
         FROM system.processes WHERE query_id = {}",
        quote_literal(query_id)
    )
}

/// Looks up the current progress of a running query.
pub async fn fetch_progress(service: &dyn ServiceClient, query_id: &str) -> Result<ProgressSnapshot> {
    let rows = service.service_request(&progress_query(query_id)).await?;
    parse_progress_rows(&rows)
}

/// Parses a `system.processes` response: exactly one row of seven numbers.
pub fn parse_progress_rows(rows: &[Vec<String>]) -> Result<ProgressSnapshot> {
    let [row] = rows else {
        return Err(StreamError::protocol(format!(
            "bad response dimensions: {} rows",
            rows.len()
        )));
    };
    if row.len() != PROGRESS_COLUMNS {
        return Err(StreamError::protocol(format!(
            "bad response dimensions: {} columns",
            row.len()
        )));
    }

    Ok(ProgressSnapshot {
        elapsed_seconds: parse_cell(row, 0, "elapsed")?,
        read_rows: parse_cell(row, 1, "read_rows")?,
        read_bytes: parse_cell(row, 2, "read_bytes")?,
        total_rows_approx: parse_cell(row, 3, "total_rows_approx")?,
        written_rows: parse_cell(row, 4, "written_rows")?,
        written_bytes: parse_cell(row, 5, "written_bytes")?,
        memory_usage: parse_cell(row, 6, "memory_usage")?,
    })
}

/// Background task polling progress for one query.
///
/// Stopping uses a oneshot channel, so [`ProgressPoller::stop`] never waits
/// for the task, whatever it is doing at the time.
pub struct ProgressPoller {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl ProgressPoller {
    /// Starts polling. Snapshots are offered to `events` without waiting;
    /// when the channel is full the tick is dropped.
    pub fn spawn(
        service: Arc<dyn ServiceClient>,
        query_id: String,
        events: mpsc::Sender<ExecutionEvent>,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(poll_loop(service, query_id, events, stop_rx));
        Self {
            stop: Some(stop_tx),
            handle,
        }
    }

    /// Signals the task to stop. Idempotent.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            // The task may already be gone; nothing to do then.
            let _ = stop.send(());
        }
    }

    /// Stops the task and waits for it to exit.
    pub async fn finish(mut self) {
        self.stop();
        if let Err(e) = self.handle.await {
            debug!("progress poller ended abnormally: {e}");
        }
    }
}

async fn poll_loop(
    service: Arc<dyn ServiceClient>,
    query_id: String,
    events: mpsc::Sender<ExecutionEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    let mut ticker = interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the first lookup happens one interval in.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = ticker.tick() => {}
        }

        let lookup = tokio::select! {
            biased;
            _ = &mut stop => break,
            lookup = fetch_progress(service.as_ref(), &query_id) => lookup,
        };

        match lookup {
            Ok(snapshot) => match events.try_send(ExecutionEvent::Progress(snapshot)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!("event channel full, progress tick dropped"),
                Err(TrySendError::Closed(_)) => break,
            },
            // Soft failure: progress is best-effort, the next tick tries again.
            Err(e) => debug!(query_id = %query_id, "progress tick skipped: {e}"),
        }
    }
    debug!(query_id = %query_id, "progress poller stopped");
}
