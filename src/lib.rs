//! line-dispatch: ordered failover for line-based key/value backends
//!
//! The core is three layers:
//! - `backend`: addresses and a connector opening one bounded TCP connection
//! - `protocol`: request/response lines and a single write-then-read exchange
//! - `dispatcher`: walks a fixed pool of backends until one answers
//!
//! `server` puts a TCP front-end on top, one listener per configured
//! address, and `config` builds it from CLI arguments or a TOML file.

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod protocol;
pub mod server;

pub use backend::{AddressError, BackendAddress, ConnectCause, ConnectError, Connection, Connector};
pub use dispatcher::{
    AttemptError, DispatchEvent, DispatchOptions, DispatchResult, DispatchState, Exhausted,
    FailedAttempt, RetryDispatcher, Success,
};
pub use protocol::{exchange, ExchangeError, Request, RequestError, Response};
