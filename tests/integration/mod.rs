//! Integration tests for ch-stream.
//!
//! `FakeServer` is a tiny HTTP/1.1 server on a loopback port. It answers each
//! request with the first route whose needle appears in the raw request.

pub mod coordinator_test;
pub mod http_test;
pub mod live_test;

use std::sync::{Arc, Mutex};

use ch_stream::config::ConnectionConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Builds a complete response with a `Content-Length` body.
pub fn http_response(status: u16, body: &str) -> String {
    let reason = if status == 200 { "OK" } else { "Error" };
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

pub struct FakeServer {
    port: u16,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeServer {
    /// Starts serving `routes` as `(needle, raw response)` pairs.
    pub async fn start(routes: Vec<(&'static str, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        let routes = Arc::new(routes);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let recorded = recorded.clone();
                let routes = routes.clone();
                tokio::spawn(async move {
                    handle(socket, &routes, &recorded).await;
                });
            }
        });

        Self { port, requests }
    }

    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: Some("127.0.0.1".to_string()),
            port: self.port,
            user: Some("tester".to_string()),
            password: Some("secret".to_string()),
            ..Default::default()
        }
    }

    /// Raw text of every request received.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn handle(
    mut socket: TcpStream,
    routes: &[(&'static str, String)],
    recorded: &Mutex<Vec<String>>,
) {
    let request = read_request(&mut socket).await;
    recorded.lock().unwrap().push(request.clone());

    let response = routes
        .iter()
        .find(|(needle, _)| request.contains(needle))
        .map(|(_, response)| response.clone())
        .unwrap_or_else(|| http_response(404, "no route\n"));

    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

async fn read_request(socket: &mut TcpStream) -> String {
    let mut request = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        if let Some(head_end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&request[..head_end]).to_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if request.len() >= head_end + 4 + length {
                break;
            }
        }
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&request).into_owned()
}
