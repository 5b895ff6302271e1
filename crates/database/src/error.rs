use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database connection is not configured: {0}")]
    ConnectionConfigError(String),

    #[error("Database query failed: {0}")]
    QueryError(#[from] sqlx::Error),

    #[error("Database migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("Invalid input: {0}")]
    InvalidInput(#[from] core_types::CoreError),

    #[error("Stored row could not be decoded: {0}")]
    InvalidRow(String),
}
