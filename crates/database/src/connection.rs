use crate::error::DbError;
use configuration::DatabaseConfig;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::env;
use std::time::Duration;
use tracing::info;

/// Establishes a connection pool to the PostgreSQL database.
///
/// The URL comes from `config.url`, or from `DATABASE_URL` when the config
/// leaves it empty. The pool is shared by the lock and position stores.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, DbError> {
    let database_url = if config.url.is_empty() {
        env::var("DATABASE_URL")
            .map_err(|_e| DbError::ConnectionConfigError("DATABASE_URL must be set.".to_string()))?
    } else {
        config.url.clone()
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(&database_url)
        .await?;

    info!(max_connections = config.max_connections, "Database pool connected.");
    Ok(pool)
}

/// Applies the embedded migrations, bringing the schema up to date.
pub async fn run_migrations(pool: &PgPool) -> Result<(), DbError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied.");
    Ok(())
}
