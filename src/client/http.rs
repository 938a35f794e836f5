//! HTTP implementations of the client traits.
//!
//! [`HttpClient`] uses reqwest for service requests and for the primary result
//! stream. [`TcpConnector`] opens plain TCP connections for the
//! progress-header path, which needs to see header lines before the response
//! is handed to a parser.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::Client;
use tokio::net::TcpStream;
use tokio_util::io::StreamReader;
use tracing::debug;

use super::{
    decode_tab_separated, BoxedIo, OpenedStream, PreparedRequest, QueryTransport, RawConnector,
    RequestFactory, Rows, ServiceClient, Settings,
};
use crate::config::ConnectionConfig;
use crate::error::{Result, StreamError};

/// Format requested for service requests.
const SERVICE_FORMAT: &str = "TabSeparated";

/// Connect timeout for service requests (kill, progress lookup, stats).
pub const SERVICE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// reqwest-backed server client.
#[derive(Debug, Clone)]
pub struct HttpClient {
    stream: Client,
    service: Client,
    factory: RequestFactory,
}

impl HttpClient {
    /// Creates a new client.
    ///
    /// The result stream has no timeout of any kind: the lifetime of a query
    /// is bounded only by the caller's cancellation signal. Service requests
    /// give up connecting after [`SERVICE_CONNECT_TIMEOUT`] so a kill against
    /// an unreachable server cannot stall shutdown.
    pub fn new(factory: RequestFactory) -> Result<Self> {
        let build_error =
            |e: reqwest::Error| StreamError::connection(format!("Failed to create HTTP client: {e}"));
        let stream = Client::builder().build().map_err(build_error)?;
        let service = Client::builder()
            .connect_timeout(SERVICE_CONNECT_TIMEOUT)
            .build()
            .map_err(build_error)?;

        Ok(Self {
            stream,
            service,
            factory,
        })
    }

    async fn send(client: &Client, request: &PreparedRequest) -> Result<reqwest::Response> {
        let mut builder = client
            .post(request.url.clone())
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder.send().await.map_err(|e| {
            if e.is_connect() {
                StreamError::connection(format!("Failed to connect to server: {e}"))
            } else {
                StreamError::connection(format!("Request failed: {e}"))
            }
        })
    }
}

#[async_trait]
impl ServiceClient for HttpClient {
    async fn service_request(&self, sql: &str) -> Result<Rows> {
        let request = self
            .factory
            .prepare_request(sql, SERVICE_FORMAT, &Settings::new());
        let response = Self::send(&self.service, &request).await?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StreamError::transport(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(StreamError::server(format!(
                "{} ({})",
                body.trim(),
                status.as_u16()
            )));
        }

        Ok(decode_tab_separated(&body))
    }
}

#[async_trait]
impl QueryTransport for HttpClient {
    async fn open(&self, request: &PreparedRequest) -> Result<OpenedStream> {
        let response = Self::send(&self.stream, request).await?;
        let status = response.status().as_u16();
        debug!(status, "result stream opened");

        let chunks = response
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));

        Ok(OpenedStream {
            status,
            body: Box::pin(StreamReader::new(chunks)),
        })
    }
}

/// Plain TCP connector for the raw-socket path.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    authority: String,
}

impl TcpConnector {
    /// Creates a connector for the connection's host and port.
    ///
    /// TLS is not available on the raw path.
    pub fn new(connection: &ConnectionConfig) -> Result<Self> {
        if connection.secure {
            return Err(StreamError::config(
                "progress headers mode needs a plain http connection",
            ));
        }
        Ok(Self {
            authority: connection.authority(),
        })
    }
}

#[async_trait]
impl RawConnector for TcpConnector {
    async fn connect(&self) -> Result<BoxedIo> {
        let stream = TcpStream::connect(&self.authority).await.map_err(|e| {
            StreamError::connection(format!("Cannot connect to {}: {e}", self.authority))
        })?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
