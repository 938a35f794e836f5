//! Server access for ch-stream.
//!
//! The execution engine talks to the server through the narrow traits in this
//! module: [`ServiceClient`] for small tabular side-channel queries,
//! [`QueryTransport`] for the long-lived result stream and [`RawConnector`] for
//! the raw-socket progress-header path. HTTP implementations live in
//! [`http`]; in-memory fakes live in [`crate::testing`].

pub mod http;
pub mod http1;
pub mod replay;

pub use http::{HttpClient, TcpConnector};

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite};
use url::Url;

use crate::config::ConnectionConfig;
use crate::error::Result;

/// Extra server settings attached to a request as URL parameters.
pub type Settings = BTreeMap<String, String>;

/// Tabular response of a service request: rows of string cells.
pub type Rows = Vec<Vec<String>>;

/// A fully described HTTP request, ready for either transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    /// Interface URL including every setting as a query parameter.
    pub url: Url,
    /// Extra headers (authentication).
    pub headers: Vec<(String, String)>,
    /// Query text, sent as the POST body.
    pub body: String,
}

impl PreparedRequest {
    /// Returns the value of a URL setting, if present.
    pub fn setting(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    /// Serialises the request as HTTP/1.1 for a raw connection.
    pub fn to_http1(&self) -> Vec<u8> {
        let mut target = self.url.path().to_string();
        if let Some(query) = self.url.query() {
            target.push('?');
            target.push_str(query);
        }
        let host = match (self.url.host_str(), self.url.port_or_known_default()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            _ => "localhost".to_string(),
        };

        let mut head = format!("POST {target} HTTP/1.1\r\nHost: {host}\r\n");
        for (name, value) in &self.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str(&format!(
            "Content-Length: {}\r\nConnection: close\r\n\r\n",
            self.body.len()
        ));

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(self.body.as_bytes());
        bytes
    }
}

/// Builds [`PreparedRequest`]s for one server.
#[derive(Debug, Clone)]
pub struct RequestFactory {
    base_url: Url,
    user: Option<String>,
    password: Option<String>,
    database: Option<String>,
}

impl RequestFactory {
    /// Creates a factory for the given connection.
    pub fn from_connection(connection: &ConnectionConfig) -> Result<Self> {
        Ok(Self {
            base_url: connection.base_url()?,
            user: connection.user.clone(),
            password: connection.password.clone(),
            database: connection.database.clone(),
        })
    }

    /// Prepares a query request with the output format and extra settings.
    pub fn prepare_request(
        &self,
        query: &str,
        output_format: &str,
        extra_settings: &Settings,
    ) -> PreparedRequest {
        let mut url = self.base_url.clone();
        {
            let mut params = url.query_pairs_mut();
            if let Some(database) = &self.database {
                params.append_pair("database", database);
            }
            if !output_format.is_empty() {
                params.append_pair("default_format", output_format);
            }
            for (name, value) in extra_settings {
                params.append_pair(name, value);
            }
        }

        let mut headers = Vec::new();
        if let Some(user) = &self.user {
            headers.push(("X-ClickHouse-User".to_string(), user.clone()));
        }
        if let Some(password) = &self.password {
            headers.push(("X-ClickHouse-Key".to_string(), password.clone()));
        }

        PreparedRequest {
            url,
            headers,
            body: query.to_string(),
        }
    }
}

/// Executes small side-channel queries and returns their rows.
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Runs `sql` and returns the result as rows of string cells.
    async fn service_request(&self, sql: &str) -> Result<Rows>;
}

/// An opened primary result stream.
pub struct OpenedStream {
    /// HTTP status code of the response.
    pub status: u16,
    /// Response body, read incrementally.
    pub body: Pin<Box<dyn AsyncBufRead + Send>>,
}

impl std::fmt::Debug for OpenedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedStream")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Opens the long-lived request that streams query results.
#[async_trait]
pub trait QueryTransport: Send + Sync {
    /// Sends the request and returns once the response status is known.
    async fn open(&self, request: &PreparedRequest) -> Result<OpenedStream>;
}

/// Bidirectional byte stream for the raw-socket path.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Boxed raw connection.
pub type BoxedIo = Box<dyn AsyncStream>;

/// Opens raw connections to the server's HTTP port.
#[async_trait]
pub trait RawConnector: Send + Sync {
    async fn connect(&self) -> Result<BoxedIo>;
}

/// Decodes a `TabSeparated` response body into rows.
///
/// Escapes (`\t`, `\n`, `\\`, ...) are resolved; `\N` (NULL) becomes an empty cell.
pub fn decode_tab_separated(body: &str) -> Rows {
    body.lines()
        .filter(|line| !line.is_empty())
        .map(|line| line.split('\t').map(unescape_field).collect())
        .collect()
}

fn unescape_field(raw: &str) -> String {
    if raw == "\\N" {
        return String::new();
    }
    if !raw.contains('\\') {
        return raw.to_string();
    }

    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('0') => out.push('\0'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Quotes a value as a single-quoted SQL string literal.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}'")
}
