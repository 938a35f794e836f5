//! Header peeking with replay.
//!
//! The raw-socket path has to look at header lines while the server is still
//! sending them, and afterwards hand the complete response to
//! [`read_response_head`](super::http1::read_response_head). [`HeaderPeek`]
//! records every byte pulled from the connection so the consumed prefix can be
//! replayed in front of the rest of the socket.

use std::io::{self, Cursor};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, ReadBuf};

use crate::error::{Result, StreamError};

/// Reader that keeps a copy of everything read through it.
#[derive(Debug)]
pub struct TeeReader<R> {
    inner: R,
    recorded: Vec<u8>,
}

impl<R> TeeReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            recorded: Vec::new(),
        }
    }

    /// Returns the inner reader and the recorded bytes.
    pub fn into_parts(self) -> (R, Vec<u8>) {
        (self.inner, self.recorded)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            this.recorded.extend_from_slice(&buf.filled()[before..]);
        }
        poll
    }
}

/// Line-oriented view of a response head that can be replayed afterwards.
#[derive(Debug)]
pub struct HeaderPeek<R> {
    reader: BufReader<TeeReader<R>>,
    finished: bool,
}

impl<R: AsyncRead + Unpin> HeaderPeek<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(TeeReader::new(inner)),
            finished: false,
        }
    }

    /// Returns the next header line, trimmed. The status line counts as a
    /// header line. Returns `None` once the blank line ending the head (or
    /// end of stream) is reached.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        if self.finished {
            return Ok(None);
        }

        let mut line = Vec::new();
        let n = self
            .reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| StreamError::transport(format!("reading response headers: {e}")))?;

        let text = String::from_utf8_lossy(&line).trim().to_string();
        if n == 0 || text.is_empty() {
            self.finished = true;
            return Ok(None);
        }
        Ok(Some(text))
    }

    /// Rebuilds the full response stream: everything read so far (including
    /// bytes buffered past the head) followed by the unread connection.
    pub fn into_replay(self) -> impl AsyncBufRead + Unpin {
        let (inner, recorded) = self.reader.into_inner().into_parts();
        BufReader::new(Cursor::new(recorded).chain(inner))
    }
}
