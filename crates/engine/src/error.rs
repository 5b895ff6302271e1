use api_client::ApiError;
use retry::RetryFailure;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("API client error: {0}")]
    ApiClient(#[from] ApiError),

    #[error("Exchange call failed: {0}")]
    Exchange(#[from] RetryFailure<ApiError>),

    #[error("Database error: {0}")]
    Database(#[from] database::DbError),

    #[error("Calculation error: {0}")]
    Core(#[from] core_types::CoreError),

    #[error("Position {0} was rejected by the store: {1}")]
    Rejected(uuid::Uuid, core_types::UpdateRejection),
}

/// Failure of a lock operation.
#[derive(Error, Debug)]
pub enum LockError {
    /// The store could not tell whether the write happened. Callers must
    /// treat the lock as not acquired.
    #[error("Lock state for '{name}' is indeterminate: {source}")]
    Indeterminate {
        name: String,
        #[source]
        source: database::DbError,
    },
}
