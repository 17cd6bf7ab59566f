//! Line protocol: requests, responses and the single-exchange client.
//!
//! The wire format is one command per LF-terminated line in each direction:
//!
//! ```text
//! Request:  PING\n
//! Request:  SET cookie secret\n
//! Request:  GET cookie\n
//! Response: <backend defined>\n
//! ```
//!
//! Response content is opaque here. The presence of the terminator, not the
//! text before it, is what makes an exchange successful.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use crate::backend::Connection;

/// Default bound on one write-then-read exchange.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest response line accepted before the backend is treated as broken.
pub const MAX_RESPONSE_LINE: usize = 64 * 1024;

/// Initial read buffer size
const BUFFER_SIZE: usize = 512;

/// A malformed request line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("empty request")]
    Empty,
    #[error("request contains an embedded line break")]
    EmbeddedNewline,
    #[error("invalid key '{0}'")]
    InvalidKey(String),
}

/// One client command, without its line terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    line: String,
}

impl Request {
    /// Validate a request line.
    ///
    /// A single trailing `\n` (or `\r\n`) is accepted and stripped, so
    /// `"PING\n"` and `"PING"` are the same request.
    pub fn new(line: impl Into<String>) -> Result<Self, RequestError> {
        let mut line = line.into();
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }

        if line.contains(['\n', '\r']) {
            return Err(RequestError::EmbeddedNewline);
        }
        if line.trim().is_empty() {
            return Err(RequestError::Empty);
        }

        Ok(Self { line })
    }

    pub fn ping() -> Self {
        Self {
            line: "PING".to_string(),
        }
    }

    pub fn set(key: &str, value: &str) -> Result<Self, RequestError> {
        validate_key(key)?;
        Self::new(format!("SET {} {}", key, value))
    }

    pub fn get(key: &str) -> Result<Self, RequestError> {
        validate_key(key)?;
        Self::new(format!("GET {}", key))
    }

    /// The request line without a terminator.
    pub fn line(&self) -> &str {
        &self.line
    }

    /// First word of the line, e.g. `SET`.
    pub fn verb(&self) -> &str {
        self.line.split_whitespace().next().unwrap_or("")
    }

    /// Encode for the wire: the line plus exactly one `\n`.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.line.len() + 1);
        buf.extend_from_slice(self.line.as_bytes());
        buf.extend_from_slice(b"\n");
        buf
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

fn validate_key(key: &str) -> Result<(), RequestError> {
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(RequestError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// One response line, terminator included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    raw: Bytes,
}

impl Response {
    /// Raw bytes as received, ending in `\n`.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Line content without `\n` or a preceding `\r`.
    pub fn line(&self) -> &[u8] {
        let line = &self.raw[..self.raw.len() - 1];
        line.strip_suffix(b"\r").unwrap_or(line)
    }

    /// Lossy UTF-8 view of [`Response::line`].
    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.line()).into_owned()
    }

    /// True for a bare terminator, which still counts as an answer.
    pub fn is_empty_line(&self) -> bool {
        self.line().is_empty()
    }
}

/// Why a backend accepted the connection but did not answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error("no response line before the deadline")]
    Timeout,
    #[error("backend closed the connection without a complete line")]
    Closed,
    #[error("response line exceeds {} bytes", MAX_RESPONSE_LINE)]
    LineTooLong,
    #[error("{message}")]
    Io { kind: io::ErrorKind, message: String },
}

impl From<io::Error> for ExchangeError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ExchangeError::Closed,
            kind => ExchangeError::Io {
                kind,
                message: err.to_string(),
            },
        }
    }
}

/// Write `request` on `conn` and read back one line.
///
/// The connection is consumed, so it is closed when this returns whatever
/// the outcome. `limit` bounds the write and the read together. No retry
/// happens here.
pub async fn exchange(
    conn: Connection,
    request: &Request,
    limit: Duration,
) -> Result<Response, ExchangeError> {
    let address = conn.address().clone();
    let mut stream = conn.stream;

    let result = match tokio::time::timeout(limit, async {
        stream.write_all(&request.encode()).await?;
        stream.flush().await?;
        read_line(&mut stream).await
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ExchangeError::Timeout),
    };

    trace!(address = %address, verb = request.verb(), ok = result.is_ok(), "Exchange finished");
    result
}

/// Read until the first `\n`; bytes after it are discarded.
async fn read_line<R>(reader: &mut R) -> Result<Response, ExchangeError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let mut scanned = 0;

    loop {
        if let Some(pos) = buffer[scanned..].iter().position(|&b| b == b'\n') {
            let end = scanned + pos + 1;
            return Ok(Response {
                raw: buffer.split_to(end).freeze(),
            });
        }
        scanned = buffer.len();

        if scanned >= MAX_RESPONSE_LINE {
            return Err(ExchangeError::LineTooLong);
        }

        let n = reader.read_buf(&mut buffer).await?;
        if n == 0 {
            return Err(ExchangeError::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendAddress, Connector};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_request_strips_single_terminator() {
        assert_eq!(Request::new("PING\n").unwrap().line(), "PING");
        assert_eq!(Request::new("PING\r\n").unwrap().line(), "PING");
        assert_eq!(Request::new("GET cookie").unwrap().line(), "GET cookie");
    }

    #[test]
    fn test_request_rejects_embedded_newline() {
        assert_eq!(
            Request::new("SET a b\nGET a\n"),
            Err(RequestError::EmbeddedNewline)
        );
        assert_eq!(Request::new("PING\n\n"), Err(RequestError::EmbeddedNewline));
        assert_eq!(Request::new("PI\rNG"), Err(RequestError::EmbeddedNewline));
    }

    #[test]
    fn test_request_rejects_empty() {
        assert_eq!(Request::new(""), Err(RequestError::Empty));
        assert_eq!(Request::new("\n"), Err(RequestError::Empty));
        assert_eq!(Request::new("   "), Err(RequestError::Empty));
    }

    #[test]
    fn test_request_builders() {
        assert_eq!(Request::ping().line(), "PING");
        assert_eq!(Request::set("cookie", "secret").unwrap().line(), "SET cookie secret");
        assert_eq!(Request::get("cookie").unwrap().verb(), "GET");
        assert!(matches!(
            Request::get("two words"),
            Err(RequestError::InvalidKey(_))
        ));
        assert_eq!(&Request::ping().encode()[..], b"PING\n");
    }

    #[tokio::test]
    async fn test_read_line_stops_at_first_terminator() {
        let mut input: &[u8] = b"PONG\r\nextra\n";
        let response = assert_ok!(read_line(&mut input).await);
        assert_eq!(response.as_bytes(), b"PONG\r\n");
        assert_eq!(response.line(), b"PONG");
        assert_eq!(response.text(), "PONG");
    }

    #[tokio::test]
    async fn test_read_line_empty_line_is_success() {
        let mut input: &[u8] = b"\n";
        let response = assert_ok!(read_line(&mut input).await);
        assert!(response.is_empty_line());
    }

    #[tokio::test]
    async fn test_read_line_partial_then_eof() {
        let mut input: &[u8] = b"PON";
        assert_eq!(read_line(&mut input).await, Err(ExchangeError::Closed));
    }

    #[tokio::test]
    async fn test_read_line_too_long() {
        let data = vec![b'x'; MAX_RESPONSE_LINE + 10];
        let mut input: &[u8] = &data;
        assert_eq!(read_line(&mut input).await, Err(ExchangeError::LineTooLong));
    }

    async fn backend(reply: Option<&'static [u8]>) -> BackendAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string().parse().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut reader = BufReader::new(reader);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            match reply {
                Some(bytes) => writer.write_all(bytes).await.unwrap(),
                // Hold the connection open without answering
                None => {
                    let mut rest = Vec::new();
                    let _ = reader.read_to_end(&mut rest).await;
                }
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_exchange_success() {
        let addr = backend(Some(b"PONG\n")).await;
        let conn = Connector::default().open(&addr).await.unwrap();

        let response = assert_ok!(exchange(conn, &Request::ping(), DEFAULT_EXCHANGE_TIMEOUT).await);
        assert_eq!(response.text(), "PONG");
    }

    #[tokio::test]
    async fn test_exchange_closed_without_line() {
        let addr = backend(Some(b"")).await;
        let conn = Connector::default().open(&addr).await.unwrap();

        let err = assert_err!(exchange(conn, &Request::ping(), DEFAULT_EXCHANGE_TIMEOUT).await);
        assert_eq!(err, ExchangeError::Closed);
    }

    #[tokio::test]
    async fn test_exchange_silent_backend_times_out() {
        let addr = backend(None).await;
        let conn = Connector::default().open(&addr).await.unwrap();

        let err = assert_err!(exchange(conn, &Request::ping(), Duration::from_millis(100)).await);
        assert_eq!(err, ExchangeError::Timeout);
    }
}
