//! Newline-delimited scanning of child process output.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use hc_spin_error::SpinError;

/// Longest line a child may print before its stream is treated as broken.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Which standard stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// Yields complete lines from a byte stream in the order they were received.
///
/// Bytes are buffered until a newline arrives, so a line split across reads
/// comes out whole. A final line without a trailing newline is still emitted
/// once the stream closes. Invalid UTF-8 is replaced rather than rejected,
/// since child processes decorate their output with arbitrary escape bytes.
/// A line longer than the cap fails the stream instead of growing the buffer.
pub struct LineScanner<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    max_len: usize,
    finished: bool,
}

impl<R: AsyncRead + Unpin> LineScanner<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::with_capacity(256),
            max_len: MAX_LINE_LEN,
            finished: false,
        }
    }

    pub fn with_max_line_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Returns the next line, `Ok(None)` at end of stream, or the read error.
    ///
    /// After `None` or an error the scanner stays finished.
    pub async fn next_line(&mut self) -> Result<Option<String>, SpinError> {
        if self.finished {
            return Ok(None);
        }
        self.buf.clear();
        let limit = self.max_len as u64 + 1;
        let read = match (&mut self.reader)
            .take(limit)
            .read_until(b'\n', &mut self.buf)
            .await
        {
            Ok(read) => read,
            Err(err) => {
                self.finished = true;
                return Err(SpinError::StreamError {
                    message: format!("failed to read child output: {err}"),
                });
            }
        };
        if read == 0 {
            self.finished = true;
            return Ok(None);
        }
        if self.buf.len() > self.max_len && self.buf.last() != Some(&b'\n') {
            self.finished = true;
            return Err(SpinError::StreamError {
                message: format!("child output line exceeds {} bytes", self.max_len),
            });
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).into_owned()))
    }
}
