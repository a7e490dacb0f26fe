//! Persistence layer: SQLite with sqlx.
//!
//! Connection pool management, models, and repositories. Migrations are
//! linear; adding a nullable column is always a safe step.

pub mod models;
pub mod repositories;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

const DEFAULT_POOL_SIZE: u32 = 10;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Initialize the database connection pool with WAL mode.
pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
        .foreign_keys(true)
        .create_if_missing(true);

    // An in-memory database exists per connection; more than one connection
    // would see disjoint schemas.
    let max_connections = if database_url.contains(":memory:") {
        1
    } else {
        DEFAULT_POOL_SIZE
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(connect_options)
        .await?;

    tracing::info!("Database pool initialized with WAL mode");

    Ok(pool)
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_pool() {
        let pool = init_pool("sqlite::memory:").await.unwrap();

        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();

        // In-memory databases report "memory"; file-based would report "wal".
        assert!(result.0 == "memory" || result.0 == "wal");
    }
}
