//! Backend addresses and the connector that opens one TCP connection per
//! attempt.
//!
//! The connector never retries. A failed connect is reported to the caller
//! (the dispatcher), which decides whether another candidate is tried.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::trace;

/// Default bound on a single connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A `host:port` identifier for one backend.
///
/// Parsed once when the pool is built and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendAddress {
    host: String,
    port: u16,
}

/// Reasons a string is not a usable backend address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address '{0}' is missing a ':port' suffix")]
    MissingPort(String),
    #[error("address '{0}' has an empty host")]
    EmptyHost(String),
    #[error("address '{0}' has an invalid port")]
    InvalidPort(String),
    #[error("address '{0}' contains whitespace")]
    Whitespace(String),
}

impl BackendAddress {
    /// Parse `host:port`. IPv6 hosts must be bracketed (`[::1]:7001`).
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        if input.chars().any(char::is_whitespace) {
            return Err(AddressError::Whitespace(input.to_string()));
        }

        let (host, port) = input
            .rsplit_once(':')
            .ok_or_else(|| AddressError::MissingPort(input.to_string()))?;

        let host = match host.strip_prefix('[') {
            Some(inner) => inner
                .strip_suffix(']')
                .ok_or_else(|| AddressError::EmptyHost(input.to_string()))?,
            // An unbracketed host with colons is an IPv6 literal missing brackets
            None if host.contains(':') => {
                return Err(AddressError::MissingPort(input.to_string()))
            }
            None => host,
        };

        if host.is_empty() {
            return Err(AddressError::EmptyHost(input.to_string()));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| AddressError::InvalidPort(input.to_string()))?;
        if port == 0 {
            return Err(AddressError::InvalidPort(input.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for BackendAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Why a connect attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectCause {
    #[error("connect timed out")]
    Timeout,
    #[error("{message}")]
    Io { kind: io::ErrorKind, message: String },
}

impl From<io::Error> for ConnectCause {
    fn from(err: io::Error) -> Self {
        ConnectCause::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// A backend could not be reached.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to connect to {address}: {cause}")]
pub struct ConnectError {
    pub address: BackendAddress,
    pub cause: ConnectCause,
}

/// An open stream to one backend.
///
/// Owned by exactly one exchange; dropping it closes the socket.
#[derive(Debug)]
pub struct Connection {
    pub(crate) stream: TcpStream,
    address: BackendAddress,
}

impl Connection {
    pub fn address(&self) -> &BackendAddress {
        &self.address
    }
}

/// Opens single connections with a bounded connect timeout.
#[derive(Debug, Clone, Copy)]
pub struct Connector {
    connect_timeout: Duration,
}

impl Default for Connector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl Connector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Open one connection to `address`.
    pub async fn open(&self, address: &BackendAddress) -> Result<Connection, ConnectError> {
        self.open_within(address, self.connect_timeout).await
    }

    /// Open one connection, bounded by `limit` instead of the configured
    /// timeout. Used when a request deadline leaves less time than that.
    pub async fn open_within(
        &self,
        address: &BackendAddress,
        limit: Duration,
    ) -> Result<Connection, ConnectError> {
        let fail = |cause| ConnectError {
            address: address.clone(),
            cause,
        };

        let connect = TcpStream::connect((address.host(), address.port()));
        let stream = match tokio::time::timeout(limit, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(fail(e.into())),
            Err(_) => return Err(fail(ConnectCause::Timeout)),
        };

        // Requests are single small lines
        stream.set_nodelay(true).map_err(|e| fail(e.into()))?;

        trace!(address = %address, "Backend connection opened");

        Ok(Connection {
            stream,
            address: address.clone(),
        })
    }
}
