//! Minimal HTTP/1.1 response reading for the raw-socket path.
//!
//! Only what a query response needs: status line, headers, and a body framed
//! by `Transfer-Encoding: chunked`, `Content-Length`, or connection close.

use std::io::Write;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::{Result, StreamError};

/// Largest slice copied to the output in one write.
const COPY_BUF_SIZE: usize = 8 * 1024;

/// Parsed status line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Returns the first header with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Determines how the body is framed.
    pub fn body_framing(&self) -> Result<BodyFraming> {
        if let Some(encoding) = self.header("Transfer-Encoding") {
            if encoding
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case("chunked"))
            {
                return Ok(BodyFraming::Chunked);
            }
        }
        if let Some(length) = self.header("Content-Length") {
            let length = length
                .trim()
                .parse()
                .map_err(|_| StreamError::protocol(format!("invalid Content-Length: {length}")))?;
            return Ok(BodyFraming::Length(length));
        }
        Ok(BodyFraming::UntilClose)
    }
}

/// How the end of a response body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Chunked,
    Length(u64),
    UntilClose,
}

/// Reads the status line and headers, stopping after the blank line.
pub async fn read_response_head<R>(reader: &mut R) -> Result<ResponseHead>
where
    R: AsyncBufRead + Unpin,
{
    let status_line = read_line(reader)
        .await?
        .ok_or_else(|| StreamError::protocol("connection closed before the response started"))?;

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(StreamError::protocol(format!(
            "unexpected status line: {status_line}"
        )));
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| StreamError::protocol(format!("unexpected status line: {status_line}")))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    loop {
        let line = read_line(reader)
            .await?
            .ok_or_else(|| StreamError::protocol("connection closed inside response headers"))?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| StreamError::protocol(format!("malformed header line: {line}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(ResponseHead {
        status,
        reason,
        headers,
    })
}

/// Copies the body to `out` as it arrives. Returns the number of body bytes.
pub async fn copy_body<R>(
    reader: &mut R,
    framing: BodyFraming,
    out: &mut (dyn Write + Send),
) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let copied = match framing {
        BodyFraming::Length(length) => copy_exact(reader, length, out).await?,
        BodyFraming::UntilClose => copy_to_end(reader, out).await?,
        BodyFraming::Chunked => {
            let mut total = 0;
            loop {
                let size_line = read_line(reader)
                    .await?
                    .ok_or_else(|| StreamError::transport("connection closed inside chunked body"))?;
                let size_hex = size_line.split(';').next().unwrap_or_default().trim();
                let size = u64::from_str_radix(size_hex, 16)
                    .map_err(|_| StreamError::protocol(format!("invalid chunk size: {size_line}")))?;
                if size == 0 {
                    // Trailers end with a blank line.
                    while let Some(line) = read_line(reader).await? {
                        if line.is_empty() {
                            break;
                        }
                    }
                    break;
                }
                total += copy_exact(reader, size, out).await?;
                match read_line(reader).await? {
                    Some(line) if line.is_empty() => {}
                    _ => return Err(StreamError::protocol("missing CRLF after chunk")),
                }
            }
            total
        }
    };
    out.flush()?;
    Ok(copied)
}

async fn copy_exact<R>(reader: &mut R, mut remaining: u64, out: &mut (dyn Write + Send)) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let total = remaining;
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    while remaining > 0 {
        let want = remaining.min(COPY_BUF_SIZE as u64) as usize;
        let n = reader
            .read(&mut buf[..want])
            .await
            .map_err(|e| StreamError::transport(e.to_string()))?;
        if n == 0 {
            return Err(StreamError::transport("connection closed before body finished"));
        }
        out.write_all(&buf[..n])?;
        out.flush()?;
        remaining -= n as u64;
    }
    Ok(total)
}

async fn copy_to_end<R>(reader: &mut R, out: &mut (dyn Write + Send)) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0;
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| StreamError::transport(e.to_string()))?;
        if n == 0 {
            return Ok(total);
        }
        out.write_all(&buf[..n])?;
        out.flush()?;
        total += n as u64;
    }
}

/// Reads one CRLF (or LF) terminated line without the terminator.
/// Returns `None` at end of stream.
async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = reader
        .read_until(b'\n', &mut line)
        .await
        .map_err(|e| StreamError::transport(e.to_string()))?;
    if n == 0 {
        return Ok(None);
    }
    while matches!(line.last(), Some(b'\n' | b'\r')) {
        line.pop();
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}
