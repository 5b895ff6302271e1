use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Why a retry run gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The error kind is permanent; retrying was not attempted.
    Aborted,
    /// Every allowed attempt failed.
    Exhausted,
    /// The end predicate asked to stop before the next attempt.
    Ended,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Aborted => "aborted",
            StopReason::Exhausted => "exhausted",
            StopReason::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// The last error of a failed run together with how the run ended.
#[derive(Error, Debug)]
#[error("{error} ({reason} after {attempts} attempt(s))")]
pub struct RetryFailure<E: fmt::Display + fmt::Debug> {
    pub error: E,
    pub attempts: u32,
    pub reason: StopReason,
}

impl<E: fmt::Display + fmt::Debug> RetryFailure<E> {
    pub fn into_inner(self) -> E {
        self.error
    }
}

/// Published on the abort channel when a permanent, non-benign error ends a
/// run. Subscribers use it for cross-cutting reactions such as halting trading.
#[derive(Debug, Clone, PartialEq)]
pub struct AbortedError<K> {
    /// Label of the operation that failed, e.g. `"close_position BTCUSDT"`.
    pub operation: String,
    pub kind: K,
    pub message: String,
    pub at: DateTime<Utc>,
}
