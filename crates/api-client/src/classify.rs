//! Mapping of raw exchange failures to the kinds retry decisions branch on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What a failed exchange call means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    // Transient: worth retrying.
    Timeout,
    RateLimited,
    Network,
    ServerError,
    // Permanent: retrying wastes time and risks duplicate side effects.
    InsufficientBalance,
    InvalidParameters,
    Rejected,
    // Benign: the desired state already holds.
    AlreadyHandled,
    PositionNotFound,
    Unknown,
}

impl ErrorKind {
    /// Kinds that end a retry run on first occurrence.
    pub const STOP: [ErrorKind; 5] = [
        ErrorKind::InsufficientBalance,
        ErrorKind::InvalidParameters,
        ErrorKind::Rejected,
        ErrorKind::AlreadyHandled,
        ErrorKind::PositionNotFound,
    ];

    /// Stop kinds that are not published on the abort channel.
    pub const BENIGN: [ErrorKind; 2] = [ErrorKind::AlreadyHandled, ErrorKind::PositionNotFound];

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::RateLimited
                | ErrorKind::Network
                | ErrorKind::ServerError
                | ErrorKind::Unknown
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Network => "network",
            ErrorKind::ServerError => "server_error",
            ErrorKind::InsufficientBalance => "insufficient_balance",
            ErrorKind::InvalidParameters => "invalid_parameters",
            ErrorKind::Rejected => "rejected",
            ErrorKind::AlreadyHandled => "already_handled",
            ErrorKind::PositionNotFound => "position_not_found",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Gateway error codes (Binance futures numbering) and their kinds.
const CODE_TABLE: &[(i64, ErrorKind)] = &[
    (-1001, ErrorKind::Network),             // DISCONNECTED
    (-1003, ErrorKind::RateLimited),         // TOO_MANY_REQUESTS
    (-1007, ErrorKind::Timeout),             // TIMEOUT
    (-1008, ErrorKind::ServerError),         // SERVER_BUSY
    (-1013, ErrorKind::InvalidParameters),   // INVALID_MESSAGE
    (-1102, ErrorKind::InvalidParameters),   // MANDATORY_PARAM_EMPTY_OR_MALFORMED
    (-1111, ErrorKind::InvalidParameters),   // BAD_PRECISION
    (-1121, ErrorKind::InvalidParameters),   // BAD_SYMBOL
    (-2010, ErrorKind::Rejected),            // NEW_ORDER_REJECTED
    (-2011, ErrorKind::AlreadyHandled),      // CANCEL_REJECTED / unknown order
    (-2018, ErrorKind::InsufficientBalance), // BALANCE_NOT_SUFFICIENT
    (-2019, ErrorKind::InsufficientBalance), // MARGIN_NOT_SUFFICIEN
    (-2022, ErrorKind::PositionNotFound),    // REDUCE_ONLY_REJECT
    (-4003, ErrorKind::InvalidParameters),   // QTY_LESS_THAN_ZERO
    (-4028, ErrorKind::InvalidParameters),   // INVALID_LEVERAGE
    (-4046, ErrorKind::AlreadyHandled),      // NO_NEED_TO_CHANGE_MARGIN_TYPE
    (-4059, ErrorKind::AlreadyHandled),      // NO_NEED_TO_CHANGE_POSITION_SIDE
    (-4164, ErrorKind::InvalidParameters),   // MIN_NOTIONAL
];

/// Kind of a gateway error code; `Unknown` for codes not in the table.
pub fn classify_code(code: i64) -> ErrorKind {
    CODE_TABLE
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, kind)| *kind)
        .unwrap_or(ErrorKind::Unknown)
}

/// Kind of an HTTP status when the body carries no usable code.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        408 | 504 => ErrorKind::Timeout,
        418 | 429 => ErrorKind::RateLimited,
        400 | 422 => ErrorKind::InvalidParameters,
        401 | 403 => ErrorKind::Rejected,
        409 => ErrorKind::AlreadyHandled,
        500..=599 => ErrorKind::ServerError,
        _ => ErrorKind::Unknown,
    }
}
