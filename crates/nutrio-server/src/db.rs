//! PostgreSQL pool setup and schema migrations.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Ledger transactions hold a connection while they wait on a user's row lock.
const MAX_CONNECTIONS: u32 = 20;

/// Waiting longer than this for a connection is reported as retry-later.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Failed to connect to database: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("Failed to run migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await
}

/// Applies the schema under `migrations/`. Already applied steps are skipped.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Opens the pool and brings the schema up to date.
pub async fn connect(database_url: &str) -> Result<PgPool, DbError> {
    let pool = create_pool(database_url).await?;
    run_migrations(&pool).await?;
    tracing::info!(max_connections = MAX_CONNECTIONS, "Database ready");
    Ok(pool)
}
