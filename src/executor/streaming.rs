//! Header mode: progress sniffed from the primary response on a raw connection.
//!
//! The server streams `X-ClickHouse-Progress` lines in the response head while
//! the query runs. Those are rendered as they arrive; then the recorded bytes
//! are replayed so the head can be parsed properly and the body copied out.

use std::io::Write;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::events::StateMachine;
use super::{show, streaming_settings, Coordinator, Ending, ExecutionOutcome, ExecutionState};
use crate::client::http1::{copy_body, read_response_head};
use crate::client::replay::HeaderPeek;
use crate::client::{BoxedIo, PreparedRequest};
use crate::display::ProgressSink;
use crate::error::{Result, StreamError};
use crate::progress::sniff_progress_headers;
use crate::session::QueryIdentity;

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub(super) async fn run_streaming(
        &self,
        identity: &QueryIdentity,
        query: &str,
        format: &str,
        machine: &mut StateMachine,
        cancel: &CancellationToken,
        out: &mut (dyn Write + Send),
        sink: &mut dyn ProgressSink,
    ) -> ExecutionOutcome {
        let Some(connector) = self.connector.clone() else {
            return ExecutionOutcome::Failed(StreamError::config(
                "progress headers need a raw connection to the server",
            ));
        };
        let request = self
            .factory
            .prepare_request(query, format, &streaming_settings(identity));
        machine.advance(ExecutionState::Running);

        let started = Instant::now();
        let work = async {
            let io = connector.connect().await?;
            stream_response(io, &request, sink, out, started).await
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = work => Some(result),
        };

        let ending = match result {
            None => Ending::Cancel,
            Some(Ok(status)) => Ending::Complete(status),
            Some(Err(e)) => Ending::Fail(e),
        };
        self.conclude(identity, ending, machine, sink).await
    }
}

/// Sends the request and drives the response to its end. Returns the status.
async fn stream_response(
    mut io: BoxedIo,
    request: &PreparedRequest,
    sink: &mut dyn ProgressSink,
    out: &mut (dyn Write + Send),
    started: Instant,
) -> Result<u16> {
    io.write_all(&request.to_http1())
        .await
        .map_err(|e| StreamError::connection(format!("sending query: {e}")))?;
    io.flush()
        .await
        .map_err(|e| StreamError::connection(format!("sending query: {e}")))?;

    let mut peek = HeaderPeek::new(io);
    let seen = sniff_progress_headers(&mut peek, sink, started).await?;
    debug!(progress_headers = seen, "response head received");

    let mut replay = peek.into_replay();
    let head = read_response_head(&mut replay).await?;
    show(sink.clear_progress());

    let framing = head.body_framing()?;
    copy_body(&mut replay, framing, out).await?;
    Ok(head.status)
}
