//! TCP front-end for proxied apps.
//!
//! Each configured app gets one listener per listen address. Client
//! connections send LF-terminated request lines; every line is routed
//! through the app's dispatcher and the backend's response line is written
//! back verbatim.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::config::{Config, ConfigError};
use crate::dispatcher::{DispatchResult, RetryDispatcher};
use crate::protocol::Request;

/// Longest client request line accepted
pub const MAX_REQUEST_LINE: usize = 64 * 1024;

/// Listen backlog for front-end sockets
const LISTEN_BACKLOG: i32 = 1024;

/// Sent to the client when every backend failed
const NO_BACKEND: &[u8] = b"ERROR no backend available\n";

/// Front-end errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no listen address could be bound")]
    NoListeners,
}

/// A bound front-end socket and the dispatcher serving it.
struct AppListener {
    app: Arc<str>,
    listener: TcpListener,
    dispatcher: RetryDispatcher,
}

/// Server instance
pub struct Server {
    listeners: Vec<AppListener>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Bind every configured listen address.
    ///
    /// An address that fails to bind is logged and skipped; binding nothing
    /// at all is an error.
    pub async fn bind(config: &Config) -> Result<Self, ServerError> {
        let mut listeners = Vec::new();

        for app in &config.apps {
            let dispatcher = app.dispatcher(config.dispatch)?;
            let name: Arc<str> = Arc::from(app.name.as_str());

            for addr in &app.listen {
                match bind_listener(addr).await {
                    Ok(listener) => {
                        info!(app = %name, address = %addr, targets = ?app.targets, "Listening");
                        listeners.push(AppListener {
                            app: Arc::clone(&name),
                            listener,
                            dispatcher: dispatcher.clone(),
                        });
                    }
                    Err(e) => {
                        warn!(app = %name, address = %addr, error = %e, "Could not bind listen address");
                    }
                }
            }
        }

        if listeners.is_empty() {
            return Err(ServerError::NoListeners);
        }

        Ok(Server {
            listeners,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    /// Bound addresses, paired with their app names.
    pub fn local_addrs(&self) -> Vec<(String, SocketAddr)> {
        self.listeners
            .iter()
            .filter_map(|l| {
                l.listener
                    .local_addr()
                    .ok()
                    .map(|addr| (l.app.to_string(), addr))
            })
            .collect()
    }

    /// Accept connections on every listener until all accept loops stop.
    pub async fn run(self) -> Result<(), ServerError> {
        let mut loops = JoinSet::new();
        for listener in self.listeners {
            loops.spawn(accept_loop(listener, Arc::clone(&self.connection_limit)));
        }

        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Accept loop aborted");
            }
        }

        Ok(())
    }
}

/// Resolve `addr` and bind it with `SO_REUSEADDR`.
async fn bind_listener(addr: &str) -> io::Result<TcpListener> {
    let socket_addr = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "address did not resolve"))?;

    let socket = socket2::Socket::new(
        match socket_addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&socket_addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

async fn accept_loop(app: AppListener, connection_limit: Arc<Semaphore>) {
    loop {
        // Wait for a connection slot
        let permit = match Arc::clone(&connection_limit).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        match app.listener.accept().await {
            Ok((stream, peer)) => {
                debug!(app = %app.app, peer = %peer, "New connection");

                let dispatcher = app.dispatcher.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, dispatcher).await {
                        debug!(error = %e, "Connection error");
                    }
                    drop(permit);
                });
            }
            Err(e) => {
                error!(app = %app.app, error = %e, "Failed to accept connection");
            }
        }
    }
}

/// Serve one client: dispatch each request line and relay the answer.
async fn handle_connection(stream: TcpStream, dispatcher: RetryDispatcher) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::with_capacity(256);

    loop {
        line.clear();

        let n = (&mut reader)
            .take(MAX_REQUEST_LINE as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            trace!("Connection closed by client");
            return Ok(());
        }

        if line.last() != Some(&b'\n') {
            if line.len() > MAX_REQUEST_LINE {
                writer.write_all(b"ERROR request line too long\n").await?;
            }
            // Too long, or EOF mid-line
            return Ok(());
        }

        let text = match std::str::from_utf8(&line) {
            Ok(text) => text.trim_end_matches(['\r', '\n']),
            Err(_) => {
                writer.write_all(b"ERROR request is not valid UTF-8\n").await?;
                continue;
            }
        };
        if text.trim().is_empty() {
            continue;
        }

        let request = match Request::new(text) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Rejected request");
                writer.write_all(format!("ERROR {}\n", e).as_bytes()).await?;
                continue;
            }
        };

        match dispatcher.send(&request).await {
            DispatchResult::Succeeded(success) => {
                writer.write_all(success.response.as_bytes()).await?;
            }
            DispatchResult::Exhausted(_) => {
                writer.write_all(NO_BACKEND).await?;
            }
        }
    }
}
