use thiserror::Error;

#[derive(Error, Debug)]
pub enum AlerterError {
    #[error("Telegram request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Telegram answered with a non-success status.
    #[error("Telegram rejected the message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Telegram alerts are disabled: token or chat_id is empty.")]
    NotConfigured,
}
