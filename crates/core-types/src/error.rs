use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum CoreError {
    #[error("Invalid input for {0}: {1}")]
    InvalidInput(String, String),

    #[error("Calculation error: {0}")]
    Calculation(String),

    #[error("Unknown {kind} value: '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}
