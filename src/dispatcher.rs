//! Ordered failover over a fixed pool of backends.
//!
//! Each `send` walks the pool from the first address, opening a fresh
//! connection per candidate and stopping at the first backend that answers
//! with a complete line. Candidates are tried one at a time, so at most one
//! backend socket is open per call. The pool is the only shared state and it
//! is never mutated, so concurrent sends need no coordination.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::{AddressError, BackendAddress, ConnectError, Connector, DEFAULT_CONNECT_TIMEOUT};
use crate::protocol::{self, ExchangeError, Request, RequestError, Response, DEFAULT_EXCHANGE_TIMEOUT};

/// Timeouts applied by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Bound on each connect attempt
    pub connect_timeout: Duration,
    /// Bound on each write-then-read exchange
    pub exchange_timeout: Duration,
    /// Optional bound on a whole `send`, across all candidates
    pub request_deadline: Option<Duration>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            request_deadline: None,
        }
    }
}

/// Progress of a single dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Pending,
    /// Attempting the candidate at this pool index.
    TryingCandidate(usize),
    /// The candidate at this index answered.
    Succeeded(usize),
    Exhausted,
}

/// Input to [`DispatchState::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEvent {
    Start,
    Answered,
    Failed,
    DeadlineElapsed,
}

impl DispatchState {
    /// Apply one event for a pool of `pool_len` candidates.
    ///
    /// Terminal states absorb every event. Events that make no sense for the
    /// current state leave it unchanged.
    pub fn next(self, event: DispatchEvent, pool_len: usize) -> Self {
        match (self, event) {
            (Self::Succeeded(_) | Self::Exhausted, _) => self,
            (_, DispatchEvent::DeadlineElapsed) => Self::Exhausted,
            (Self::Pending, DispatchEvent::Start) if pool_len == 0 => Self::Exhausted,
            (Self::Pending, DispatchEvent::Start) => Self::TryingCandidate(0),
            (Self::TryingCandidate(i), DispatchEvent::Answered) => Self::Succeeded(i),
            (Self::TryingCandidate(i), DispatchEvent::Failed) if i + 1 < pool_len => {
                Self::TryingCandidate(i + 1)
            }
            (Self::TryingCandidate(_), DispatchEvent::Failed) => Self::Exhausted,
            _ => self,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DispatchState::Succeeded(_) | DispatchState::Exhausted)
    }
}

/// Why one candidate did not answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("exchange failed: {0}")]
    Exchange(#[from] ExchangeError),
}

/// A candidate that was contacted and failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAttempt {
    pub address: BackendAddress,
    pub error: AttemptError,
}

/// The first backend, in pool order, that answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Success {
    pub address: BackendAddress,
    /// Position of `address` in the pool
    pub index: usize,
    pub response: Response,
    /// Candidates that failed before this one, in pool order
    pub failures: Vec<FailedAttempt>,
}

/// No backend answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted {
    /// One entry per contacted candidate, in pool order
    pub attempts: Vec<FailedAttempt>,
    /// The request deadline stopped the walk before the pool ran out
    pub deadline_elapsed: bool,
}

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no backend answered ({} attempted", self.attempts.len())?;
        if self.deadline_elapsed {
            write!(f, ", deadline elapsed")?;
        }
        write!(f, ")")?;
        for attempt in &self.attempts {
            write!(f, "; {}: {}", attempt.address, attempt.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for Exhausted {}

/// Outcome of [`RetryDispatcher::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    Succeeded(Success),
    Exhausted(Exhausted),
}

impl DispatchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchResult::Succeeded(_))
    }

    pub fn response(&self) -> Option<&Response> {
        match self {
            DispatchResult::Succeeded(success) => Some(&success.response),
            DispatchResult::Exhausted(_) => None,
        }
    }

    /// The backend that answered, if any.
    pub fn address(&self) -> Option<&BackendAddress> {
        match self {
            DispatchResult::Succeeded(success) => Some(&success.address),
            DispatchResult::Exhausted(_) => None,
        }
    }

    pub fn into_result(self) -> Result<Success, Exhausted> {
        match self {
            DispatchResult::Succeeded(success) => Ok(success),
            DispatchResult::Exhausted(exhausted) => Err(exhausted),
        }
    }
}

/// Routes each request to the first live backend in a fixed pool.
#[derive(Debug, Clone)]
pub struct RetryDispatcher {
    pool: Arc<[BackendAddress]>,
    connector: Connector,
    options: DispatchOptions,
}

impl RetryDispatcher {
    pub fn new(pool: Vec<BackendAddress>, options: DispatchOptions) -> Self {
        Self {
            pool: pool.into(),
            connector: Connector::new(options.connect_timeout),
            options,
        }
    }

    /// Build a dispatcher from `host:port` strings.
    pub fn from_addresses<I, S>(addresses: I, options: DispatchOptions) -> Result<Self, AddressError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let pool = addresses
            .into_iter()
            .map(|addr| BackendAddress::parse(addr.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(pool, options))
    }

    pub fn pool(&self) -> &[BackendAddress] {
        &self.pool
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// Validate `line` and dispatch it. Malformed lines never reach the
    /// network.
    pub async fn send_line(&self, line: &str) -> Result<DispatchResult, RequestError> {
        let request = Request::new(line)?;
        Ok(self.send(&request).await)
    }

    /// Dispatch `request`, bounded by the configured request deadline if any.
    pub async fn send(&self, request: &Request) -> DispatchResult {
        let deadline = self.options.request_deadline.map(|d| Instant::now() + d);
        self.dispatch(request, deadline).await
    }

    /// Dispatch `request`, starting no new candidate once `deadline` passes.
    pub async fn send_with_deadline(&self, request: &Request, deadline: Instant) -> DispatchResult {
        self.dispatch(request, Some(deadline)).await
    }

    async fn dispatch(&self, request: &Request, deadline: Option<Instant>) -> DispatchResult {
        let pool_len = self.pool.len();
        let mut failures = Vec::new();
        let mut answer = None;
        let mut deadline_elapsed = false;

        let mut state = DispatchState::Pending.next(DispatchEvent::Start, pool_len);

        while let DispatchState::TryingCandidate(index) = state {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                deadline_elapsed = true;
                state = state.next(DispatchEvent::DeadlineElapsed, pool_len);
                continue;
            }

            let address = &self.pool[index];
            let event = match self.attempt(address, request, deadline).await {
                Ok(response) => {
                    answer = Some(response);
                    DispatchEvent::Answered
                }
                Err(error) => {
                    debug!(address = %address, index, error = %error, "Backend attempt failed");
                    failures.push(FailedAttempt {
                        address: address.clone(),
                        error,
                    });
                    DispatchEvent::Failed
                }
            };
            state = state.next(event, pool_len);
        }

        match (state, answer) {
            (DispatchState::Succeeded(index), Some(response)) => {
                debug!(
                    address = %self.pool[index],
                    index,
                    failed = failures.len(),
                    verb = request.verb(),
                    "Request dispatched"
                );
                DispatchResult::Succeeded(Success {
                    address: self.pool[index].clone(),
                    index,
                    response,
                    failures,
                })
            }
            _ => {
                warn!(
                    attempted = failures.len(),
                    pool = pool_len,
                    deadline_elapsed,
                    verb = request.verb(),
                    "No backend answered"
                );
                DispatchResult::Exhausted(Exhausted {
                    attempts: failures,
                    deadline_elapsed,
                })
            }
        }
    }

    /// One connect-then-exchange against a single candidate.
    async fn attempt(
        &self,
        address: &BackendAddress,
        request: &Request,
        deadline: Option<Instant>,
    ) -> Result<Response, AttemptError> {
        let connect_limit = clamp(self.options.connect_timeout, deadline);
        let conn = self.connector.open_within(address, connect_limit).await?;

        let exchange_limit = clamp(self.options.exchange_timeout, deadline);
        Ok(protocol::exchange(conn, request, exchange_limit).await?)
    }
}

/// Shrink `limit` to whatever is left before `deadline`.
fn clamp(limit: Duration, deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(deadline) => limit.min(deadline.saturating_duration_since(Instant::now())),
        None => limit,
    }
}
