//! Result stream reader task.

use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ExecutionEvent;
use crate::client::{PreparedRequest, QueryTransport};
use crate::error::StreamError;

/// Opens the primary request and forwards its body line by line.
///
/// Emits `Status` once, then `Data` per line, then exactly one of `End` or
/// `Error`. Once `cancel` fires nothing more is emitted.
pub(crate) async fn read_results(
    transport: Arc<dyn QueryTransport>,
    request: PreparedRequest,
    events: mpsc::Sender<ExecutionEvent>,
    cancel: CancellationToken,
) {
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        opened = transport.open(&request) => opened,
    };

    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            let _ = events.send(ExecutionEvent::Error(e)).await;
            return;
        }
    };

    if events.send(ExecutionEvent::Status(stream.status)).await.is_err() {
        return;
    }

    let mut line = Vec::new();
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            read = stream.body.read_until(b'\n', &mut line) => read,
        };

        let event = match read {
            Ok(0) => ExecutionEvent::End,
            Ok(_) => ExecutionEvent::Data(std::mem::take(&mut line)),
            Err(e) => ExecutionEvent::Error(StreamError::transport(e.to_string())),
        };
        let last = !matches!(event, ExecutionEvent::Data(_));

        if events.send(event).await.is_err() {
            debug!("coordinator gone, result reader stopping");
            return;
        }
        if last {
            return;
        }
    }
}
