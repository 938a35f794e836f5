//! reqwest-backed client against a loopback fake server.

use std::sync::Arc;

use ch_stream::client::{HttpClient, RequestFactory, ServiceClient};
use ch_stream::config::ProgressMode;
use ch_stream::executor::{Coordinator, ExecutionOutcome};
use ch_stream::progress::{fetch_query_stats, server_version};
use ch_stream::session::SessionContext;
use ch_stream::testing::{MockKiller, RecordingSink};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use super::{http_response, FakeServer};

fn client(server: &FakeServer) -> HttpClient {
    HttpClient::new(RequestFactory::from_connection(&server.connection()).unwrap()).unwrap()
}

/// Scenario: service request
/// Then the TSV body is decoded and the request carries auth and format
#[tokio::test]
async fn test_service_request_decodes_rows() {
    let server = FakeServer::start(vec![(
        "system.processes",
        http_response(200, "1.5\t100\t2048\t1000\t0\t0\t4096\n"),
    )])
    .await;
    let client = client(&server);

    let rows = client
        .service_request("SELECT elapsed FROM system.processes")
        .await
        .unwrap();

    assert_eq!(
        rows,
        vec![vec!["1.5", "100", "2048", "1000", "0", "0", "4096"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()]
    );
    // hyper lowercases header names.
    let request = server.requests()[0].to_lowercase();
    assert!(request.starts_with("post /?default_format=tabseparated"));
    assert!(request.contains("x-clickhouse-user: tester"));
    assert!(request.contains("x-clickhouse-key: secret"));
}

/// Scenario: service request rejected
/// Then the error is a server error carrying the body
#[tokio::test]
async fn test_service_request_error_status() {
    let server = FakeServer::start(vec![(
        "KILL QUERY",
        http_response(500, "Code: 497. DB::Exception: Not enough privileges\n"),
    )])
    .await;
    let client = client(&server);

    let err = client
        .service_request("KILL QUERY WHERE query_id = 'x'")
        .await
        .unwrap_err();

    assert_eq!(err.category(), "Server Error");
    assert!(err.to_string().contains("Not enough privileges"));
    assert!(err.to_string().contains("(500)"));
}

#[tokio::test]
async fn test_server_version() {
    let server = FakeServer::start(vec![("version()", http_response(200, "24.8.4.13\n"))]).await;
    let client = client(&server);

    assert_eq!(server_version(&client).await.unwrap(), "24.8.4.13");
}

/// Scenario: statistics after completion
/// Then the log is flushed first and the 11 columns are parsed
#[tokio::test]
async fn test_query_stats() {
    let server = FakeServer::start(vec![
        ("FLUSH LOGS", http_response(200, "")),
        (
            "system.query_log",
            http_response(200, "7\t10\t80\t0\t0\t10\t21\t1024\t\t\tQueryFinish\n"),
        ),
    ])
    .await;
    let client = client(&server);

    let stats = fetch_query_stats(&client, "q-1").await.unwrap();

    assert_eq!(stats.duration_ms, 7);
    assert_eq!(stats.read_rows, 10);
    assert_eq!(stats.result_bytes, 21);
    assert_eq!(stats.kind, "QueryFinish");
    assert!(server.requests()[0].ends_with("SYSTEM FLUSH LOGS"));
}

/// Scenario: poll mode end to end over HTTP
/// Then the body is streamed and the primary request carries the identity settings
#[tokio::test]
async fn test_poll_mode_over_http() {
    let server = FakeServer::start(vec![
        ("system.processes", http_response(200, "")),
        ("numbers(3)", http_response(200, "0\n1\n2\n")),
    ])
    .await;
    let factory = RequestFactory::from_connection(&server.connection()).unwrap();
    let client = Arc::new(HttpClient::new(factory.clone()).unwrap());
    let coordinator = Coordinator::new(
        SessionContext::new(),
        factory,
        client.clone(),
        client,
        Arc::new(MockKiller::new(true)),
    );

    let mut out = Vec::new();
    let mut sink = RecordingSink::new();
    let execution = coordinator
        .run(
            "SELECT number FROM numbers(3)",
            "TabSeparated",
            ProgressMode::Poll,
            CancellationToken::new(),
            &mut out,
            &mut sink,
        )
        .await;

    assert!(matches!(execution.outcome, ExecutionOutcome::Completed(200)));
    assert_eq!(String::from_utf8(out).unwrap(), "0\n1\n2\n");

    let primary = server
        .requests()
        .into_iter()
        .find(|r| r.ends_with("SELECT number FROM numbers(3)"))
        .unwrap();
    assert!(primary.contains("log_queries=1"));
    assert!(primary.contains(&format!("query_id={}", execution.identity.query_id())));
    assert!(primary.contains(&format!("session_id={}", execution.identity.session_id())));
}
