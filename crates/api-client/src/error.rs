use crate::classify::{ErrorKind, classify_code, classify_status};
use retry::Classify;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP transport failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Gateway returned {status}{}: {message}", .code.map(|c| format!(" (code {c})")).unwrap_or_default())]
    Gateway {
        status: u16,
        code: Option<i64>,
        message: String,
    },

    /// An error raised by a non-HTTP exchange (the paper exchange, tests).
    #[error("{kind} error: {message}")]
    Exchange { kind: ErrorKind, message: String },

    #[error("Failed to deserialize the API response: {0}")]
    Deserialization(String),

    #[error("Invalid data format from API: {0}")]
    InvalidData(String),
}

impl ApiError {
    pub fn exchange(kind: ErrorKind, message: impl Into<String>) -> Self {
        ApiError::Exchange {
            kind,
            message: message.into(),
        }
    }
}

impl Classify for ApiError {
    type Kind = ErrorKind;

    fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Transport(e) if e.is_timeout() => ErrorKind::Timeout,
            ApiError::Transport(e) if e.is_decode() => ErrorKind::Unknown,
            ApiError::Transport(e) => match e.status() {
                Some(status) => classify_status(status.as_u16()),
                None => ErrorKind::Network,
            },
            // The gateway's own code is more specific than the HTTP status.
            ApiError::Gateway { status, code, .. } => code
                .map(classify_code)
                .filter(|kind| *kind != ErrorKind::Unknown)
                .unwrap_or_else(|| classify_status(*status)),
            ApiError::Exchange { kind, .. } => *kind,
            ApiError::Deserialization(_) => ErrorKind::Unknown,
            ApiError::InvalidData(_) => ErrorKind::InvalidParameters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_code_wins_over_status() {
        let err = ApiError::Gateway {
            status: 400,
            code: Some(-2019),
            message: "Margin is insufficient.".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::InsufficientBalance);
        assert!(err.to_string().contains("code -2019"));
    }

    #[test]
    fn test_unknown_code_falls_back_to_status() {
        let err = ApiError::Gateway {
            status: 429,
            code: Some(-9999),
            message: "slow down".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::RateLimited);

        let err = ApiError::Gateway { status: 503, code: None, message: String::new() };
        assert_eq!(err.kind(), ErrorKind::ServerError);
    }
}
