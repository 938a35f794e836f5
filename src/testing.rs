//! In-memory fakes for the client seams.
//!
//! Used by the unit tests and the integration tests under `tests/`, so
//! the module is always compiled.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, Stream};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::io::StreamReader;

use crate::cancel::QueryKiller;
use crate::client::{
    BoxedIo, OpenedStream, PreparedRequest, QueryTransport, RawConnector, Rows, ServiceClient,
};
use crate::display::ProgressSink;
use crate::error::{Result, StreamError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Clone)]
enum Reply {
    Rows(Rows),
    Error(String),
}

/// Scripted [`ServiceClient`].
///
/// Replies are matched by substring. Several replies for the same needle are
/// used in order; the last one repeats. Unmatched queries fail with a
/// server error.
#[derive(Debug, Default)]
pub struct MockServiceClient {
    replies: Mutex<Vec<(String, VecDeque<Reply>)>>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl MockServiceClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers queries containing `needle` with `rows`.
    pub fn respond<S: Into<String>>(self, needle: &str, rows: Vec<Vec<S>>) -> Self {
        let rows = rows
            .into_iter()
            .map(|row| row.into_iter().map(Into::into).collect())
            .collect();
        self.push(needle, Reply::Rows(rows))
    }

    /// Fails queries containing `needle` with a server error.
    pub fn respond_error(self, needle: &str, message: &str) -> Self {
        self.push(needle, Reply::Error(message.to_string()))
    }

    /// Delays every request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every query received, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    fn push(mut self, needle: &str, reply: Reply) -> Self {
        let replies = self.replies.get_mut().unwrap_or_else(|e| e.into_inner());
        match replies.iter_mut().find(|(n, _)| n == needle) {
            Some((_, queue)) => queue.push_back(reply),
            None => replies.push((needle.to_string(), VecDeque::from([reply]))),
        }
        self
    }

    fn next_reply(&self, sql: &str) -> Option<Reply> {
        let mut replies = lock(&self.replies);
        let (_, queue) = replies.iter_mut().find(|(needle, _)| sql.contains(needle.as_str()))?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl ServiceClient for MockServiceClient {
    async fn service_request(&self, sql: &str) -> Result<Rows> {
        lock(&self.calls).push(sql.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_reply(sql) {
            Some(Reply::Rows(rows)) => Ok(rows),
            Some(Reply::Error(message)) => Err(StreamError::server(message)),
            None => Err(StreamError::server(format!("no scripted reply for: {sql}"))),
        }
    }
}

/// One step of a scripted response body.
#[derive(Debug, Clone)]
pub enum Step {
    /// Bytes delivered in one read.
    Chunk(Vec<u8>),
    /// Pause before the next step.
    Delay(Duration),
    /// Read error (transport) or dropped connection (connector).
    Fail(String),
    /// Never completes.
    Hang,
}

impl Step {
    pub fn chunk(data: impl AsRef<[u8]>) -> Self {
        Self::Chunk(data.as_ref().to_vec())
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail(message.into())
    }
}

fn scripted_body(steps: Vec<Step>) -> impl Stream<Item = io::Result<VecDeque<u8>>> + Send {
    stream::unfold(steps.into_iter(), |mut steps| async move {
        loop {
            let step = match steps.next() {
                Some(step) => step,
                None => return None,
            };
            match step {
                Step::Chunk(bytes) => return Some((Ok(VecDeque::from(bytes)), steps)),
                Step::Delay(delay) => tokio::time::sleep(delay).await,
                Step::Fail(message) => {
                    let error = io::Error::new(io::ErrorKind::ConnectionReset, message);
                    return Some((Err(error), steps));
                }
                Step::Hang => std::future::pending::<()>().await,
            }
        }
    })
}

/// Scripted [`QueryTransport`].
#[derive(Debug)]
pub struct MockTransport {
    status: u16,
    steps: Vec<Step>,
    open_error: Option<String>,
    requests: Mutex<Vec<PreparedRequest>>,
}

impl MockTransport {
    /// Responds with `status` and a body played from `steps`.
    pub fn new(status: u16, steps: Vec<Step>) -> Self {
        Self {
            status,
            steps,
            open_error: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Fails every open with a connection error.
    pub fn failing(message: &str) -> Self {
        Self {
            open_error: Some(message.to_string()),
            ..Self::new(0, Vec::new())
        }
    }

    /// Every request opened, in order.
    pub fn requests(&self) -> Vec<PreparedRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl QueryTransport for MockTransport {
    async fn open(&self, request: &PreparedRequest) -> Result<OpenedStream> {
        lock(&self.requests).push(request.clone());
        if let Some(message) = &self.open_error {
            return Err(StreamError::connection(message.clone()));
        }
        Ok(OpenedStream {
            status: self.status,
            body: Box::pin(StreamReader::new(scripted_body(self.steps.clone()))),
        })
    }
}

/// [`QueryKiller`] with a fixed answer.
#[derive(Debug)]
pub struct MockKiller {
    acknowledge: bool,
    killed: Mutex<Vec<String>>,
}

impl MockKiller {
    pub fn new(acknowledge: bool) -> Self {
        Self {
            acknowledge,
            killed: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        lock(&self.killed).len()
    }

    pub fn killed_ids(&self) -> Vec<String> {
        lock(&self.killed).clone()
    }
}

#[async_trait]
impl QueryKiller for MockKiller {
    async fn kill_query(&self, query_id: &str) -> bool {
        lock(&self.killed).push(query_id.to_string());
        self.acknowledge
    }
}

/// [`RawConnector`] backed by an in-process fake server.
///
/// Each connection reads one request (head plus `Content-Length` body),
/// records it, then writes the scripted response and closes.
#[derive(Debug)]
pub struct MockConnector {
    steps: Vec<Step>,
    refuse: Option<String>,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockConnector {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            refuse: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fails every connect with a connection error.
    pub fn refusing(message: &str) -> Self {
        Self {
            refuse: Some(message.to_string()),
            ..Self::new(Vec::new())
        }
    }

    /// Raw bytes of every request received, in order.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl RawConnector for MockConnector {
    async fn connect(&self) -> Result<BoxedIo> {
        if let Some(message) = &self.refuse {
            return Err(StreamError::connection(message.clone()));
        }
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(server, self.steps.clone(), self.requests.clone()));
        Ok(Box::new(client))
    }
}

async fn serve(mut io: DuplexStream, steps: Vec<Step>, requests: Arc<Mutex<Vec<Vec<u8>>>>) {
    let Ok(request) = read_request(&mut io).await else {
        return;
    };
    lock(&requests).push(request);

    for step in steps {
        match step {
            Step::Chunk(bytes) => {
                if io.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            Step::Delay(delay) => tokio::time::sleep(delay).await,
            Step::Fail(_) => return,
            Step::Hang => std::future::pending::<()>().await,
        }
    }
    let _ = io.shutdown().await;
}

async fn read_request(io: &mut DuplexStream) -> io::Result<Vec<u8>> {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        if let Some(head_end) = request.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&request[..head_end]);
            let length = head
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if request.len() >= head_end + 4 + length {
                return Ok(request);
            }
        }
        let n = io.read(&mut buf).await?;
        if n == 0 {
            return Ok(request);
        }
        request.extend_from_slice(&buf[..n]);
    }
}

/// What a [`RecordingSink`] was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Progress {
        read_rows: u64,
        read_bytes: u64,
        total_rows_approx: u64,
        elapsed: Duration,
    },
    Clear,
    Notice(String),
}

/// [`ProgressSink`] that records every call.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Vec<SinkEvent>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[SinkEvent] {
        &self.events
    }

    /// All notices, concatenated.
    pub fn notices(&self) -> String {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Notice(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn write_progress(
        &mut self,
        read_rows: u64,
        read_bytes: u64,
        total_rows_approx: u64,
        elapsed: Duration,
    ) -> io::Result<()> {
        self.events.push(SinkEvent::Progress {
            read_rows,
            read_bytes,
            total_rows_approx,
            elapsed,
        });
        Ok(())
    }

    fn clear_progress(&mut self) -> io::Result<()> {
        self.events.push(SinkEvent::Clear);
        Ok(())
    }

    fn notice(&mut self, message: &str) -> io::Result<()> {
        self.events.push(SinkEvent::Notice(message.to_string()));
        Ok(())
    }
}

/// Request against a local server with the given settings.
#[cfg(test)]
pub(crate) fn test_request(query: &str, settings: &crate::client::Settings) -> PreparedRequest {
    use crate::client::RequestFactory;
    use crate::config::ConnectionConfig;

    RequestFactory::from_connection(&ConnectionConfig::default())
        .expect("default connection is valid")
        .prepare_request(query, "TabSeparated", settings)
}
