//! Runtime error type and the pluggable connection error policies.

use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error as ThisError;

use crate::jsonrpc;
use crate::jsonrpc::Message;

/// The result of a fallible client runtime operation.
pub type Result<T> = std::result::Result<T, Error>;

/// An error raised by the client runtime.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The request was cancelled through its cancellation token.
    #[error("request cancelled")]
    Cancelled,
    /// The connection closed while the operation was in flight.
    #[error("connection closed")]
    ConnectionClosed,
    /// The operation requires a running client.
    #[error("client is not running")]
    NotRunning,
    /// `start` was called while the client was starting or running.
    #[error("client is already running")]
    AlreadyRunning,
    /// The transport failed to connect or broke down.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    /// A capability registration could not be applied.
    #[error("registration failed: {0}")]
    Registration(String),
    /// The server answered with a JSON-RPC error response.
    #[error("protocol error: {0}")]
    Rpc(#[from] jsonrpc::Error),
    /// A message body could not be serialized or deserialized.
    #[error("failed to parse: {0}")]
    Parse(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` if this error represents a cancelled request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Returns the JSON-RPC error response, if this is one.
    pub fn as_rpc(&self) -> Option<&jsonrpc::Error> {
        match self {
            Error::Rpc(err) => Some(err),
            _ => None,
        }
    }
}

/// What to do after the connection reported a read or write fault.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorAction {
    /// Keep the connection running.
    Continue,
    /// Tear the connection down.
    Shutdown,
}

/// What to do after the connection closed unexpectedly.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseAction {
    /// Leave the client stopped.
    DoNotRestart,
    /// Re-run the start sequence over a fresh connection.
    Restart,
}

/// Policy consulted on connection faults and closes.
///
/// The [`DefaultErrorHandler`] implements the standard policy: shut down
/// after three consecutive faults, restart on close unless the restart budget
/// within a three-minute window is exhausted.
pub trait ErrorHandler: Send + Sync {
    /// Called for every transport fault, with the number of consecutive
    /// faults observed since the last successfully transferred message.
    fn error(&self, error: &io::Error, message: Option<&Message>, count: u32) -> ErrorAction;

    /// Called when the connection to the server closed unexpectedly.
    fn closed(&self) -> CloseAction;
}

/// Sliding window within which restarts are counted against the budget.
const RESTART_WINDOW: Duration = Duration::from_secs(180);

/// Maximum number of consecutive transport faults tolerated before shutdown.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Time source for the restart window, swappable so window aging can be
/// driven from tests (`tokio::time::pause` has no effect on
/// [`std::time::Instant`]).
type Clock = Box<dyn Fn() -> Instant + Send + Sync>;

/// The built-in [`ErrorHandler`].
pub struct DefaultErrorHandler {
    max_restart_count: u32,
    restarts: Mutex<Vec<Instant>>,
    clock: Clock,
}

impl DefaultErrorHandler {
    /// Creates a handler allowing at most `max_restart_count` restarts within
    /// any three-minute window.
    pub fn new(max_restart_count: u32) -> Self {
        DefaultErrorHandler::with_clock(max_restart_count, Box::new(Instant::now))
    }

    fn with_clock(max_restart_count: u32, clock: Clock) -> Self {
        DefaultErrorHandler {
            max_restart_count,
            restarts: Mutex::new(Vec::new()),
            clock,
        }
    }
}

impl std::fmt::Debug for DefaultErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultErrorHandler")
            .field("max_restart_count", &self.max_restart_count)
            .field("restarts", &self.restarts)
            .finish_non_exhaustive()
    }
}

impl ErrorHandler for DefaultErrorHandler {
    fn error(&self, _error: &io::Error, _message: Option<&Message>, count: u32) -> ErrorAction {
        if count >= MAX_CONSECUTIVE_ERRORS {
            ErrorAction::Shutdown
        } else {
            ErrorAction::Continue
        }
    }

    fn closed(&self) -> CloseAction {
        let mut restarts = self.restarts.lock().expect("restart history poisoned");
        restarts.push((self.clock)());

        if restarts.len() <= self.max_restart_count as usize {
            return CloseAction::Restart;
        }

        let newest = *restarts.last().expect("restart history is non-empty");
        let oldest = *restarts.first().expect("restart history is non-empty");
        if newest.duration_since(oldest) <= RESTART_WINDOW {
            CloseAction::DoNotRestart
        } else {
            restarts.remove(0);
            CloseAction::Restart
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn continues_below_consecutive_error_budget() {
        let handler = DefaultErrorHandler::new(4);
        let error = io::Error::new(io::ErrorKind::InvalidData, "bad frame");
        assert_eq!(handler.error(&error, None, 1), ErrorAction::Continue);
        assert_eq!(handler.error(&error, None, 2), ErrorAction::Continue);
        assert_eq!(handler.error(&error, None, 3), ErrorAction::Shutdown);
    }

    #[test]
    fn allows_max_restart_count_restarts() {
        let handler = DefaultErrorHandler::new(4);
        for _ in 0..4 {
            assert_eq!(handler.closed(), CloseAction::Restart);
        }
        assert_eq!(handler.closed(), CloseAction::DoNotRestart);
    }

    #[test]
    fn zero_budget_never_restarts() {
        let handler = DefaultErrorHandler::new(0);
        assert_eq!(handler.closed(), CloseAction::DoNotRestart);
    }

    #[test]
    fn restarts_age_out_of_the_window() {
        let offset = Arc::new(AtomicU64::new(0));
        let tick = offset.clone();
        let base = Instant::now();
        let handler = DefaultErrorHandler::with_clock(
            2,
            Box::new(move || base + Duration::from_secs(tick.load(Ordering::SeqCst))),
        );

        // Two closes exhaust the budget inside the window.
        assert_eq!(handler.closed(), CloseAction::Restart);
        assert_eq!(handler.closed(), CloseAction::Restart);

        // More than 180s after the oldest close, it no longer counts: the
        // over-budget close prunes it and still restarts.
        offset.store(200, Ordering::SeqCst);
        assert_eq!(handler.closed(), CloseAction::Restart);
        assert_eq!(handler.closed(), CloseAction::Restart);

        // Back over budget within the current window.
        assert_eq!(handler.closed(), CloseAction::DoNotRestart);
    }
}
