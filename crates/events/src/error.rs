use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventsError {
    #[error("Failed to serialize event message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Listener capacity must be at least 1")]
    ZeroCapacity,
}
