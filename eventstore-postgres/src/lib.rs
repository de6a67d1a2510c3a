//! PostgreSQL adapters for the eventstore crate.
//!
//! [`PgRepository`] stores the event log in `eventstore.events` and the unique
//! constraints in `eventstore.unique_constraints`. [`PgProjectionStore`]
//! keeps projection cursors, failed statements and lease locks in the
//! `projections` schema and runs statements on the projection tables.
//! Both share one connection pool when created from the same [`Pool`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod projection_store;
mod query;
mod repository;
pub mod retry;

use std::time::Duration;

use eventstore::EventstoreError;
use nutype::nutype;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use thiserror::Error;
use tracing::error;

pub use projection_store::PgProjectionStore;
pub use repository::PgRepository;
pub use retry::RetryStrategy;

/// Errors raised by the PostgreSQL adapters before they are translated into
/// [`EventstoreError`].
#[derive(Debug, Error)]
pub enum PostgresError {
    /// The connection pool could not be created.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// A statement failed.
    #[error("database operation {operation} failed")]
    Database {
        /// Name of the failed operation.
        operation: &'static str,
        /// Driver error.
        #[source]
        source: sqlx::Error,
    },

    /// Schema migrations failed.
    #[error("postgres migration failed")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// The operation failed for a reason unrelated to the database.
    #[error(transparent)]
    Eventstore(#[from] EventstoreError),
}

impl PostgresError {
    pub(crate) fn database(operation: &'static str) -> impl Fn(sqlx::Error) -> Self {
        move |source| Self::Database { operation, source }
    }
}

impl From<PostgresError> for EventstoreError {
    fn from(error: PostgresError) -> Self {
        match error {
            PostgresError::Eventstore(error) => error,
            other => {
                error!(error = %other, "[postgres.database_error] database operation failed");
                if retry::is_transient(&other) {
                    Self::Unavailable(other.to_string())
                } else {
                    Self::Internal(other.to_string())
                }
            }
        }
    }
}

/// Maximum number of database connections in the pool.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(std::num::NonZeroU32);

/// Configuration of the connection pool and the push retry behaviour.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
    /// Retries of pushes failing with transient errors
    pub retry: RetryStrategy,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: std::num::NonZeroU32 = match std::num::NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600), // 10 minutes
            retry: RetryStrategy::default(),
        }
    }
}

/// Opens a connection pool.
pub async fn connect(connection_string: &str, config: &PostgresConfig) -> Result<Pool<Postgres>, PostgresError> {
    let max_connections: std::num::NonZeroU32 = config.max_connections.into();
    PgPoolOptions::new()
        .max_connections(max_connections.get())
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(connection_string)
        .await
        .map_err(PostgresError::ConnectionFailed)
}

/// Creates the `eventstore` and `projections` schemas.
pub async fn migrate(pool: &Pool<Postgres>) -> Result<(), PostgresError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub(crate) fn to_i64(value: u64, what: &str) -> Result<i64, EventstoreError> {
    i64::try_from(value).map_err(|_| EventstoreError::invalid_argument(format!("{what} {value} out of range")))
}

pub(crate) fn to_u64(value: i64, what: &str) -> Result<u64, EventstoreError> {
    u64::try_from(value).map_err(|_| EventstoreError::internal(format!("negative {what} {value} in database")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_pool_defaults() {
        let config = PostgresConfig::default();
        let max: std::num::NonZeroU32 = config.max_connections.into();

        assert_eq!(max.get(), 10);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
    }

    #[test]
    fn eventstore_errors_pass_through() {
        let error = PostgresError::from(EventstoreError::AlreadyExists("taken".into()));
        assert_eq!(
            EventstoreError::from(error),
            EventstoreError::AlreadyExists("taken".into())
        );
    }

    #[test]
    fn transient_database_errors_become_unavailable() {
        let error = PostgresError::database("push")(sqlx::Error::PoolTimedOut);
        assert!(matches!(EventstoreError::from(error), EventstoreError::Unavailable(_)));

        let error = PostgresError::database("push")(sqlx::Error::RowNotFound);
        assert!(matches!(EventstoreError::from(error), EventstoreError::Internal(_)));
    }

    #[test]
    fn sequences_convert_only_within_range() {
        assert_eq!(to_i64(7, "sequence").unwrap(), 7);
        assert!(to_i64(u64::MAX, "sequence").is_err());
        assert!(to_u64(-1, "sequence").is_err());
    }
}
