//! PostgreSQL adapters for the ordercore workflow engine.
//!
//! One connection pool backs all three capability traits:
//!
//! - [`PostgresOrderStore`] keeps order documents as JSONB rows
//! - [`PostgresHistoryStore`] keeps the orchestration replay ledger
//! - [`PostgresWorkQueue`] implements an at-least-once queue with visibility
//!   timeouts on top of `FOR UPDATE SKIP LOCKED`
//!
//! ```ignore
//! let backend = PostgresBackend::new("postgres://localhost/ordercore").await?;
//! backend.migrate().await?;
//!
//! let orders = backend.order_store();
//! let history = backend.history_store();
//! let queue = backend.work_queue();
//! ```

mod history_store;
mod order_store;
mod work_queue;

use std::num::NonZeroU32;
use std::time::Duration;

use nutype::nutype;
use sqlx::{postgres::PgPoolOptions, query, Pool, Postgres};
use thiserror::Error;
use tracing::{info, instrument};

pub use history_store::PostgresHistoryStore;
pub use order_store::PostgresOrderStore;
pub use work_queue::PostgresWorkQueue;

/// Failures while connecting to or preparing the database.
#[derive(Debug, Error)]
pub enum PostgresError {
    /// The pool could not open a connection.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// `SELECT 1` failed.
    #[error("postgres did not answer the health check")]
    PingFailed(#[source] sqlx::Error),

    /// A migration could not be applied.
    #[error("postgres migration failed")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),
}

/// Upper bound on pooled connections. Never zero.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(NonZeroU32);

/// Pool sizing and queue visibility settings.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Pool size (default 10).
    pub max_connections: MaxConnections,
    /// How long a caller waits for a free connection (default 30s).
    pub acquire_timeout: Duration,
    /// Idle connections are closed after this long (default 10 min).
    pub idle_timeout: Duration,
    /// A received message stays hidden this long unless it is acked or
    /// released first (default 5 min).
    pub visibility_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const TEN: NonZeroU32 = NonZeroU32::MIN.saturating_add(9);

        Self {
            max_connections: MaxConnections::new(TEN),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(10 * 60),
            visibility_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl PostgresConfig {
    fn pool_options(&self) -> PgPoolOptions {
        let max_connections: NonZeroU32 = self.max_connections.into();
        PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(self.idle_timeout)
    }
}

/// Connection pool shared by the PostgreSQL adapters.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: Pool<Postgres>,
    config: PostgresConfig,
}

impl PostgresBackend {
    /// Connect with default configuration.
    pub async fn new<S: Into<String>>(connection_string: S) -> Result<Self, PostgresError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Connect with custom configuration.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresError> {
        let url: String = connection_string.into();
        let pool = config
            .pool_options()
            .connect(&url)
            .await
            .map_err(PostgresError::ConnectionFailed)?;
        Ok(Self { pool, config })
    }

    /// Wrap an existing pool.
    ///
    /// Use this when the pool is shared with components outside ordercore.
    pub fn from_pool(pool: Pool<Postgres>, config: PostgresConfig) -> Self {
        Self { pool, config }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Check that the database answers.
    ///
    /// # Errors
    ///
    /// [`PostgresError::PingFailed`] if the query fails.
    #[instrument(name = "postgres.ping", skip(self))]
    pub async fn ping(&self) -> Result<(), PostgresError> {
        query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(PostgresError::PingFailed)?;
        Ok(())
    }

    /// Create or upgrade the ordercore tables.
    #[instrument(name = "postgres.migrate", skip(self))]
    pub async fn migrate(&self) -> Result<(), PostgresError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(PostgresError::MigrationFailed)?;
        info!("[postgres.migrate] schema is up to date");
        Ok(())
    }

    /// Order store over this pool.
    pub fn order_store(&self) -> PostgresOrderStore {
        PostgresOrderStore::from_pool(self.pool.clone())
    }

    /// History ledger over this pool.
    pub fn history_store(&self) -> PostgresHistoryStore {
        PostgresHistoryStore::from_pool(self.pool.clone())
    }

    /// Work queue over this pool, using the configured visibility timeout.
    pub fn work_queue(&self) -> PostgresWorkQueue {
        PostgresWorkQueue::from_pool(self.pool.clone(), self.config.visibility_timeout)
    }
}

/// SQLSTATE for unique constraint violations.
const UNIQUE_VIOLATION: &str = "23505";

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db_error) if db_error.code().as_deref() == Some(UNIQUE_VIOLATION)
    )
}
