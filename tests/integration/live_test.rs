//! Tests against a real ClickHouse server.
//!
//! Skipped unless CLICKHOUSE_URL is set.

use std::sync::Arc;
use std::time::Duration;

use ch_stream::cancel::CancellationController;
use ch_stream::client::{HttpClient, RequestFactory, TcpConnector};
use ch_stream::config::{ConnectionConfig, ProgressMode};
use ch_stream::executor::{Coordinator, Execution, ExecutionOutcome};
use ch_stream::progress::{fetch_query_stats, server_version};
use ch_stream::session::SessionContext;
use ch_stream::testing::RecordingSink;
use tokio_util::sync::CancellationToken;

/// Helper to get the test server URL from environment.
fn get_test_server_url() -> Option<String> {
    std::env::var("CLICKHOUSE_URL").ok()
}

struct Live {
    http: Arc<HttpClient>,
    coordinator: Coordinator,
}

fn live() -> Option<Live> {
    let url = get_test_server_url()?;
    let connection = ConnectionConfig::from_connection_string(&url).ok()?;
    let factory = RequestFactory::from_connection(&connection).ok()?;
    let http = Arc::new(HttpClient::new(factory.clone()).ok()?);
    let mut coordinator = Coordinator::new(
        SessionContext::new(),
        factory,
        http.clone(),
        http.clone(),
        Arc::new(CancellationController::new(http.clone())),
    );
    if let Ok(connector) = TcpConnector::new(&connection) {
        coordinator = coordinator.with_connector(Arc::new(connector));
    }
    Some(Live { http, coordinator })
}

async fn run(
    live: &Live,
    query: &str,
    mode: ProgressMode,
    cancel: CancellationToken,
) -> (Execution, Vec<u8>) {
    let mut out = Vec::new();
    let mut sink = RecordingSink::new();
    let execution = live
        .coordinator
        .run(query, "TabSeparated", mode, cancel, &mut out, &mut sink)
        .await;
    (execution, out)
}

#[tokio::test]
async fn test_live_select_one() {
    let Some(live) = live() else {
        eprintln!("Skipping test: CLICKHOUSE_URL not set");
        return;
    };

    for mode in [ProgressMode::Poll, ProgressMode::Headers] {
        let (execution, out) = run(&live, "SELECT 1", mode, CancellationToken::new()).await;
        assert!(matches!(execution.outcome, ExecutionOutcome::Completed(200)));
        assert_eq!(out, b"1\n".to_vec());
    }
}

#[tokio::test]
async fn test_live_server_version() {
    let Some(live) = live() else {
        eprintln!("Skipping test: CLICKHOUSE_URL not set");
        return;
    };

    let version = server_version(live.http.as_ref()).await.unwrap();
    assert!(version.chars().next().is_some_and(|c| c.is_ascii_digit()));
}

#[tokio::test]
async fn test_live_cancel_kills_query() {
    let Some(live) = live() else {
        eprintln!("Skipping test: CLICKHOUSE_URL not set");
        return;
    };

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let (execution, _) = run(
        &live,
        "SELECT count() FROM system.numbers",
        ProgressMode::Poll,
        cancel,
    )
    .await;

    assert!(matches!(
        execution.outcome,
        ExecutionOutcome::Cancelled { killed: true }
    ));
}

#[tokio::test]
async fn test_live_query_stats() {
    let Some(live) = live() else {
        eprintln!("Skipping test: CLICKHOUSE_URL not set");
        return;
    };

    let (execution, _) = run(
        &live,
        "SELECT number FROM numbers(10)",
        ProgressMode::Poll,
        CancellationToken::new(),
    )
    .await;
    assert!(matches!(execution.outcome, ExecutionOutcome::Completed(200)));

    let stats = fetch_query_stats(live.http.as_ref(), execution.identity.query_id())
        .await
        .unwrap();
    assert_eq!(stats.result_rows, 10);
    assert_eq!(stats.kind, "QueryFinish");
}
