//! Poll-mode execution against in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use ch_stream::cancel::CancellationController;
use ch_stream::client::RequestFactory;
use ch_stream::config::{ConnectionConfig, ProgressMode};
use ch_stream::executor::{Coordinator, Execution, ExecutionOutcome};
use ch_stream::progress::{fetch_progress, ProgressSnapshot, POLL_INTERVAL};
use ch_stream::session::SessionContext;
use ch_stream::testing::{
    MockKiller, MockServiceClient, MockTransport, RecordingSink, SinkEvent, Step,
};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

fn coordinator(
    service: Arc<MockServiceClient>,
    transport: Arc<MockTransport>,
    killer: Arc<MockKiller>,
) -> Coordinator {
    Coordinator::new(
        SessionContext::new(),
        RequestFactory::from_connection(&ConnectionConfig::default()).unwrap(),
        service,
        transport,
        killer,
    )
}

async fn run(
    coordinator: &Coordinator,
    query: &str,
    cancel: CancellationToken,
) -> (Execution, Vec<u8>, RecordingSink) {
    let mut out = Vec::new();
    let mut sink = RecordingSink::new();
    let execution = coordinator
        .run(query, "TabSeparated", ProgressMode::Poll, cancel, &mut out, &mut sink)
        .await;
    (execution, out, sink)
}

fn cancel_after(delay: Duration) -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });
    cancel
}

fn progress_rows(sink: &RecordingSink) -> Vec<u64> {
    sink.events()
        .iter()
        .filter_map(|e| match e {
            SinkEvent::Progress { read_rows, .. } => Some(*read_rows),
            _ => None,
        })
        .collect()
}

/// Scenario: SELECT 1
/// Given the server answers 200 with body "1\n"
/// When the query runs to completion
/// Then the outcome is Completed(200) and the output is exactly "1\n"
#[tokio::test]
async fn test_select_one_completes() {
    let transport = Arc::new(MockTransport::new(200, vec![Step::chunk("1\n")]));
    let killer = Arc::new(MockKiller::new(true));
    let coordinator = coordinator(Arc::new(MockServiceClient::new()), transport, killer.clone());

    let (execution, out, _) = run(&coordinator, "SELECT 1", CancellationToken::new()).await;

    assert!(matches!(execution.outcome, ExecutionOutcome::Completed(200)));
    assert_eq!(execution.outcome.exit_code(), 0);
    assert_eq!(out, b"1\n".to_vec());
    assert_eq!(killer.calls(), 0);
}

/// Scenario: progress lookup row
/// Given the status lookup returns [["1.5","100","2048","1000","0","0","4096"]]
/// Then the snapshot carries those counters
#[tokio::test]
async fn test_progress_row_is_parsed() {
    let service = MockServiceClient::new().respond(
        "system.processes",
        vec![vec!["1.5", "100", "2048", "1000", "0", "0", "4096"]],
    );

    let snapshot = fetch_progress(&service, "q-1").await.unwrap();

    assert_eq!(
        snapshot,
        ProgressSnapshot {
            elapsed_seconds: 1.5,
            read_rows: 100,
            read_bytes: 2048,
            total_rows_approx: 1000,
            written_rows: 0,
            written_bytes: 0,
            memory_usage: 4096,
        }
    );
}

/// Scenario: cancel before any data, kill not acknowledged
/// Then the outcome is Cancelled(false) and the operator sees "failure!"
#[tokio::test(start_paused = true)]
async fn test_cancel_before_data_reports_failure() {
    let transport = Arc::new(MockTransport::new(200, vec![Step::Hang]));
    let killer = Arc::new(MockKiller::new(false));
    let coordinator = coordinator(Arc::new(MockServiceClient::new()), transport, killer.clone());

    let (execution, out, sink) =
        run(&coordinator, "SELECT sleep(3)", cancel_after(Duration::from_millis(20))).await;

    assert!(matches!(
        execution.outcome,
        ExecutionOutcome::Cancelled { killed: false }
    ));
    assert_eq!(execution.outcome.exit_code(), 130);
    assert!(out.is_empty());
    assert_eq!(killer.calls(), 1);
    assert!(sink.notices().contains("failure!"));
}

/// Scenario: cancel mid-stream
/// Given one line was already streamed and the rest hangs
/// When cancellation fires
/// Then the first line stays written, the kill runs exactly once and is acknowledged
#[tokio::test(start_paused = true)]
async fn test_cancel_after_partial_output() {
    let transport = Arc::new(MockTransport::new(200, vec![Step::chunk("1\n"), Step::Hang]));
    let killer = Arc::new(MockKiller::new(true));
    let coordinator = coordinator(Arc::new(MockServiceClient::new()), transport, killer.clone());

    let (execution, out, sink) = run(
        &coordinator,
        "SELECT number FROM system.numbers",
        cancel_after(Duration::from_millis(500)),
    )
    .await;

    assert!(matches!(
        execution.outcome,
        ExecutionOutcome::Cancelled { killed: true }
    ));
    assert_eq!(out, b"1\n".to_vec());
    assert_eq!(killer.killed_ids(), vec![execution.identity.query_id().to_string()]);
    assert!(sink.notices().contains("killed!"));
}

/// Scenario: cancellation through the real controller
/// Then a KILL QUERY for this query id goes through the service client
#[tokio::test(start_paused = true)]
async fn test_cancel_issues_kill_query() {
    let service = Arc::new(
        MockServiceClient::new().respond("KILL QUERY", vec![vec!["waiting", "x", "default"]]),
    );
    let transport = Arc::new(MockTransport::new(200, vec![Step::Hang]));
    let coordinator = Coordinator::new(
        SessionContext::new(),
        RequestFactory::from_connection(&ConnectionConfig::default()).unwrap(),
        service.clone(),
        transport,
        Arc::new(CancellationController::new(service.clone())),
    );

    let (execution, _, _) =
        run(&coordinator, "SELECT sleep(3)", cancel_after(Duration::from_millis(20))).await;

    assert!(matches!(
        execution.outcome,
        ExecutionOutcome::Cancelled { killed: true }
    ));
    let kills: Vec<String> = service
        .calls()
        .into_iter()
        .filter(|sql| sql.starts_with("KILL QUERY"))
        .collect();
    assert_eq!(
        kills,
        vec![format!(
            "KILL QUERY WHERE query_id = '{}'",
            execution.identity.query_id()
        )]
    );
}

/// Scenario: malformed progress rows
/// Given every status lookup returns the wrong number of columns
/// Then no progress is shown and the query still completes
#[tokio::test(start_paused = true)]
async fn test_malformed_progress_does_not_abort() {
    let service = Arc::new(
        MockServiceClient::new().respond("system.processes", vec![vec!["1.5", "100"]]),
    );
    let transport = Arc::new(MockTransport::new(
        200,
        vec![Step::Delay(POLL_INTERVAL * 4), Step::chunk("42\n")],
    ));
    let coordinator = coordinator(service.clone(), transport, Arc::new(MockKiller::new(true)));

    let (execution, out, sink) = run(&coordinator, "SELECT 42", CancellationToken::new()).await;

    assert!(matches!(execution.outcome, ExecutionOutcome::Completed(200)));
    assert_eq!(out, b"42\n".to_vec());
    assert!(progress_rows(&sink).is_empty());
    assert!(service.calls().len() >= 3);
}

/// Scenario: out-of-order progress
/// Given later lookups report fewer rows than earlier ones
/// Then the displayed progress never goes backwards
#[tokio::test(start_paused = true)]
async fn test_progress_display_is_monotonic() {
    let service = Arc::new(
        MockServiceClient::new()
            .respond("system.processes", vec![vec!["0.1", "10", "100", "50", "0", "0", "1"]])
            .respond("system.processes", vec![vec!["0.2", "30", "300", "50", "0", "0", "1"]])
            .respond("system.processes", vec![vec!["0.3", "20", "200", "50", "0", "0", "1"]])
            .respond("system.processes", vec![vec!["0.4", "40", "400", "50", "0", "0", "1"]]),
    );
    let transport = Arc::new(MockTransport::new(
        200,
        vec![
            Step::Delay(POLL_INTERVAL * 4 + Duration::from_millis(50)),
            Step::chunk("done\n"),
        ],
    ));
    let coordinator = coordinator(service, transport, Arc::new(MockKiller::new(true)));

    let (execution, _, sink) = run(&coordinator, "SELECT 1", CancellationToken::new()).await;

    assert!(matches!(execution.outcome, ExecutionOutcome::Completed(200)));
    assert_eq!(progress_rows(&sink), vec![10, 30, 40]);
}

/// Scenario: read error after some output
/// Then the execution fails fast without killing anything
#[tokio::test]
async fn test_stream_error_fails_execution() {
    let transport = Arc::new(MockTransport::new(
        200,
        vec![Step::chunk("1\n"), Step::fail("unexpected EOF")],
    ));
    let killer = Arc::new(MockKiller::new(true));
    let coordinator = coordinator(Arc::new(MockServiceClient::new()), transport, killer.clone());

    let (execution, out, _) = run(&coordinator, "SELECT 1", CancellationToken::new()).await;

    assert!(matches!(execution.outcome, ExecutionOutcome::Failed(_)));
    assert_eq!(execution.outcome.exit_code(), 1);
    assert_eq!(out, b"1\n".to_vec());
    assert_eq!(killer.calls(), 0);
}

/// Scenario: the primary request cannot be opened
#[tokio::test]
async fn test_open_failure_is_connection_error() {
    let transport = Arc::new(MockTransport::failing("Connection refused"));
    let coordinator = coordinator(
        Arc::new(MockServiceClient::new()),
        transport,
        Arc::new(MockKiller::new(true)),
    );

    let (execution, _, _) = run(&coordinator, "SELECT 1", CancellationToken::new()).await;

    match execution.outcome {
        ExecutionOutcome::Failed(e) => assert_eq!(e.category(), "Connection Error"),
        other => panic!("Expected Failed, got {other:?}"),
    }
}

/// Scenario: every query of a session gets its own id
#[tokio::test]
async fn test_query_ids_are_unique_within_a_session() {
    let transport = Arc::new(MockTransport::new(200, vec![Step::chunk("1\n")]));
    let coordinator = coordinator(
        Arc::new(MockServiceClient::new()),
        transport.clone(),
        Arc::new(MockKiller::new(true)),
    );

    let (first, _, _) = run(&coordinator, "SELECT 1", CancellationToken::new()).await;
    let (second, _, _) = run(&coordinator, "SELECT 1", CancellationToken::new()).await;

    assert_ne!(first.identity.query_id(), second.identity.query_id());
    assert_eq!(first.identity.session_id(), second.identity.session_id());

    let requests = transport.requests();
    assert_eq!(
        requests[0].setting("session_id"),
        requests[1].setting("session_id")
    );
    assert_eq!(requests[0].setting("log_queries").as_deref(), Some("1"));
}
