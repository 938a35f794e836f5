//! Query execution coordinator.
//!
//! One [`Coordinator::run`] call drives a query from start to a terminal
//! [`ExecutionOutcome`]:
//!
//! ```text
//! Starting -> Running -> Completing -> Terminated
//!                    \-> Cancelling -/
//! ```
//!
//! In poll mode the result reader and the progress poller are separate tasks
//! feeding one mpsc channel; the coordinator drains it in arrival order and
//! races it against the cancellation token. In header mode the work happens
//! inline on a raw connection, see [`streaming`].

mod events;
mod reader;
mod streaming;

pub use events::{ExecutionEvent, ExecutionState};

use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancel::QueryKiller;
use crate::client::{QueryTransport, RawConnector, RequestFactory, ServiceClient, Settings};
use crate::config::ProgressMode;
use crate::display::{format_elapsed, ProgressSink};
use crate::error::StreamError;
use crate::progress::{ProgressPoller, ProgressTracker};
use crate::session::{QueryIdentity, SessionContext};
use events::StateMachine;
use reader::read_results;

/// Capacity of the merge channel. Data sends wait for room; progress ticks
/// are dropped when it is full.
const EVENT_BUFFER: usize = 64;

/// Terminal result of one execution.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// The result stream ended; carries the HTTP status of the primary request.
    Completed(u16),
    /// A producer or the output sink failed.
    Failed(StreamError),
    /// The caller cancelled; `killed` is the server's acknowledgment.
    Cancelled { killed: bool },
}

impl ExecutionOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed(status) if (200..300).contains(status) => 0,
            Self::Completed(_) | Self::Failed(_) => 1,
            Self::Cancelled { .. } => 130,
        }
    }
}

/// A finished execution.
#[derive(Debug)]
pub struct Execution {
    pub identity: QueryIdentity,
    pub outcome: ExecutionOutcome,
    pub elapsed: Duration,
}

/// How the merge loop ended.
enum Ending {
    Complete(u16),
    Cancel,
    Fail(StreamError),
}

/// Runs queries against one server.
pub struct Coordinator {
    session: SessionContext,
    factory: RequestFactory,
    service: Arc<dyn ServiceClient>,
    transport: Arc<dyn QueryTransport>,
    killer: Arc<dyn QueryKiller>,
    connector: Option<Arc<dyn RawConnector>>,
}

impl Coordinator {
    pub fn new(
        session: SessionContext,
        factory: RequestFactory,
        service: Arc<dyn ServiceClient>,
        transport: Arc<dyn QueryTransport>,
        killer: Arc<dyn QueryKiller>,
    ) -> Self {
        Self {
            session,
            factory,
            service,
            transport,
            killer,
            connector: None,
        }
    }

    /// Enables header mode, which needs raw connections.
    pub fn with_connector(mut self, connector: Arc<dyn RawConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Executes `query`, streaming its result to `out` and progress to `sink`.
    ///
    /// Never returns early: failures and cancellation are reported through
    /// the outcome once every spawned task has exited.
    pub async fn run(
        &self,
        query: &str,
        format: &str,
        mode: ProgressMode,
        cancel: CancellationToken,
        out: &mut (dyn Write + Send),
        sink: &mut dyn ProgressSink,
    ) -> Execution {
        let started = Instant::now();
        let identity = self.session.new_query();
        let mut machine = StateMachine::new(identity.query_id());
        info!(query_id = %identity, ?mode, "query started");

        let outcome = match mode {
            ProgressMode::Poll => {
                self.run_polling(&identity, query, format, &mut machine, &cancel, out, sink)
                    .await
            }
            ProgressMode::Headers => {
                self.run_streaming(&identity, query, format, &mut machine, &cancel, out, sink)
                    .await
            }
        };

        let elapsed = started.elapsed();
        match &outcome {
            ExecutionOutcome::Completed(status) => {
                show(sink.notice(&format!("Elapsed: {}\n", format_elapsed(elapsed))));
                info!(query_id = %identity, status, ?elapsed, "query completed");
            }
            ExecutionOutcome::Failed(e) => {
                show(sink.notice(&format!("\n{e}\n")));
                warn!(query_id = %identity, "query failed: {e}");
            }
            ExecutionOutcome::Cancelled { killed } => {
                info!(query_id = %identity, killed, "query cancelled");
            }
        }
        machine.advance(ExecutionState::Terminated);

        Execution {
            identity,
            outcome,
            elapsed,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_polling(
        &self,
        identity: &QueryIdentity,
        query: &str,
        format: &str,
        machine: &mut StateMachine,
        cancel: &CancellationToken,
        out: &mut (dyn Write + Send),
        sink: &mut dyn ProgressSink,
    ) -> ExecutionOutcome {
        let request = self
            .factory
            .prepare_request(query, format, &polling_settings(identity));

        let (events_tx, mut events) = mpsc::channel(EVENT_BUFFER);
        let poller = ProgressPoller::spawn(
            self.service.clone(),
            identity.query_id().to_string(),
            events_tx.clone(),
        );
        let reader_cancel = cancel.child_token();
        let reader = tokio::spawn(read_results(
            self.transport.clone(),
            request,
            events_tx,
            reader_cancel.clone(),
        ));
        machine.advance(ExecutionState::Running);

        let mut tracker = ProgressTracker::new();
        let mut status = None;
        let ending = loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ending::Cancel,
                event = events.recv() => event,
            };

            match event {
                Some(ExecutionEvent::Status(code)) => status = Some(code),
                Some(ExecutionEvent::Data(bytes)) => {
                    show(sink.clear_progress());
                    if let Err(e) = out.write_all(&bytes).and_then(|()| out.flush()) {
                        break Ending::Fail(e.into());
                    }
                }
                Some(ExecutionEvent::Progress(snapshot)) => {
                    if tracker.accept(snapshot) {
                        show(sink.write_progress(
                            snapshot.read_rows,
                            snapshot.read_bytes,
                            snapshot.total_rows_approx,
                            snapshot.elapsed(),
                        ));
                    }
                }
                Some(ExecutionEvent::Error(e)) => break Ending::Fail(e),
                Some(ExecutionEvent::End) => match status {
                    Some(code) => break Ending::Complete(code),
                    None => break Ending::Fail(StreamError::internal("stream ended before its status")),
                },
                None => {
                    break Ending::Fail(StreamError::internal(
                        "event producers exited without ending the stream",
                    ))
                }
            }
        };

        // Leaving Running: stop both producers before reporting anything.
        reader_cancel.cancel();
        drop(events);
        poller.finish().await;
        if let Err(e) = reader.await {
            debug!("result reader ended abnormally: {e}");
        }

        self.conclude(identity, ending, machine, sink).await
    }

    /// Shared tail of both modes: clear the display and, on cancellation,
    /// run the kill path.
    async fn conclude(
        &self,
        identity: &QueryIdentity,
        ending: Ending,
        machine: &mut StateMachine,
        sink: &mut dyn ProgressSink,
    ) -> ExecutionOutcome {
        match ending {
            Ending::Complete(status) => {
                machine.advance(ExecutionState::Completing);
                show(sink.clear_progress());
                ExecutionOutcome::Completed(status)
            }
            Ending::Cancel => {
                machine.advance(ExecutionState::Cancelling);
                show(sink.clear_progress());
                show(sink.notice(&format!("\nKilling query (id: {})... ", identity.query_id())));
                let killed = self.killer.kill_query(identity.query_id()).await;
                show(sink.notice(if killed { "killed!\n\n" } else { "failure!\n\n" }));
                ExecutionOutcome::Cancelled { killed }
            }
            Ending::Fail(e) => {
                show(sink.clear_progress());
                ExecutionOutcome::Failed(e)
            }
        }
    }
}

/// Settings for the primary request in poll mode.
fn polling_settings(identity: &QueryIdentity) -> Settings {
    let mut settings = Settings::new();
    settings.insert("log_queries".to_string(), "1".to_string());
    settings.insert("query_id".to_string(), identity.query_id().to_string());
    settings.insert("session_id".to_string(), identity.session_id().to_string());
    settings
}

/// Settings for the primary request in header mode.
fn streaming_settings(identity: &QueryIdentity) -> Settings {
    let mut settings = Settings::new();
    settings.insert("log_queries".to_string(), "1".to_string());
    settings.insert("query_id".to_string(), identity.query_id().to_string());
    settings.insert("send_progress_in_http_headers".to_string(), "1".to_string());
    settings
}

/// Display writes are cosmetic; a failure must not end the query.
fn show(result: io::Result<()>) {
    if let Err(e) = result {
        debug!("progress display write failed: {e}");
    }
}
