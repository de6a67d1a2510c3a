//! Error types for the eventstore and the projection engine.
//!
//! Each subsystem has its own error enum so callers can tell a malformed
//! command apart from a broken projection statement:
//!
//! - **EventstoreError**: push, filter and mapping failures surfaced to callers
//! - **StatementError**: statement builder contract violations and execution failures
//! - **ProjectionError**: failures of the catch-up engine, only ever logged
//!
//! # Retry Strategy
//!
//! ```rust,ignore
//! loop {
//!     match eventstore.push(&[&command]).await {
//!         Ok(events) => break Ok(events),
//!         Err(error) if error.is_retryable() => continue,
//!         Err(error) => break Err(error),
//!     }
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::types::{AggregateId, AggregateType};

/// Errors returned by [`Eventstore`](crate::Eventstore) operations and repositories.
///
/// # Error Handling Strategy
///
/// - **InvalidArgument**: malformed command or event input, do not retry
/// - **PreconditionFailed**: malformed search query, do not retry
/// - **NotFound**: no mapper or configuration found, do not retry
/// - **AlreadyExists**: a unique constraint was violated, do not retry
/// - **ConcurrencyConflict**: the aggregate moved on, retry with fresh state
/// - **Unavailable** / **Timeout**: transient storage failure, retry
/// - **Internal**: serialization or mapping bug, log and investigate
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventstoreError {
    /// Malformed command, event or statement input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed search query.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// A required mapper or configuration entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A unique constraint declared by a command is already taken.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency check failed for an aggregate.
    #[error(
        "concurrency conflict on {aggregate_type}/{aggregate_id}: expected sequence {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// Type of the conflicting aggregate.
        aggregate_type: AggregateType,
        /// Identifier of the conflicting aggregate.
        aggregate_id: AggregateId,
        /// Sequence the writer expected to build on.
        expected: u64,
        /// Sequence found in the store.
        actual: u64,
    },

    /// The storage backend is temporarily unavailable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The operation did not finish before its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Serialization or unexpected mapping failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EventstoreError {
    /// Creates an `InvalidArgument` error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Creates a `PreconditionFailed` error.
    pub fn precondition_failed(message: impl Into<String>) -> Self {
        Self::PreconditionFailed(message.into())
    }

    /// Creates an `Internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns `true` when repeating the same call may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. } | Self::Unavailable(_) | Self::Timeout(_)
        )
    }
}

/// Result type for eventstore operations.
pub type EventstoreResult<T> = Result<T, EventstoreError>;

/// Errors raised while executing a projection statement.
///
/// The first three variants are contract violations of the statement
/// builders and are reported when the statement is executed, not when it is
/// built, so `reduce` functions stay infallible for well-typed events.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatementError {
    /// The statement was executed without a projection (table) name.
    #[error("no projection")]
    NoProjection,

    /// The statement has no columns to write.
    #[error("no values")]
    NoValues,

    /// The statement would touch every row because it has no condition.
    #[error("no condition")]
    NoCondition,

    /// An array or copy column was given to an insert. Those columns read
    /// the current row and only work in updates and copies.
    #[error("column {0} cannot be inserted")]
    NotInsertable(String),

    /// The executor rejected the statement.
    #[error("exec failed: {0}")]
    ExecFailed(String),
}

/// Errors produced by the projection handler.
#[derive(Debug, Clone, Error)]
pub enum ProjectionError {
    /// The projection's table check failed.
    #[error("init check for projection {projection} failed: {message}")]
    InitCheck {
        /// Projection whose check failed.
        projection: String,
        /// Reason reported by the store.
        message: String,
    },

    /// The projection store (cursor, failed events, locks) failed.
    #[error("projection store error: {0}")]
    Store(String),

    /// Fetching events from the eventstore failed.
    #[error("eventstore error: {0}")]
    Eventstore(#[from] EventstoreError),

    /// A statement failed and was not skipped.
    #[error("statement error: {0}")]
    Statement(#[from] StatementError),

    /// Some statements of a batch failed and will be retried.
    #[error("statements of projection {projection} failed starting at sequence {failed_sequence}")]
    SomeStatementsFailed {
        /// Projection that stopped.
        projection: String,
        /// Sequence of the first statement that failed.
        failed_sequence: u64,
    },

    /// The handler was started twice.
    #[error("projection {0} is already running")]
    AlreadyRunning(String),
}

impl ProjectionError {
    /// Creates a `Store` error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }
}

/// Result type for projection operations.
pub type ProjectionResult<T> = Result<T, ProjectionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(EventstoreError::Unavailable("connection reset".into()).is_retryable());
        assert!(EventstoreError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(EventstoreError::ConcurrencyConflict {
            aggregate_type: "user".into(),
            aggregate_id: "1".into(),
            expected: 1,
            actual: 2,
        }
        .is_retryable());
    }

    #[test]
    fn contract_violations_are_not_retryable() {
        assert!(!EventstoreError::invalid_argument("aggregate id missing").is_retryable());
        assert!(!EventstoreError::precondition_failed("no query").is_retryable());
        assert!(!EventstoreError::AlreadyExists("name taken".into()).is_retryable());
        assert!(!EventstoreError::internal("mapper").is_retryable());
    }

    #[test]
    fn statement_errors_keep_their_messages() {
        assert_eq!(StatementError::NoProjection.to_string(), "no projection");
        assert_eq!(StatementError::NoValues.to_string(), "no values");
        assert_eq!(StatementError::NoCondition.to_string(), "no condition");
        assert_eq!(
            StatementError::NotInsertable("roles".into()).to_string(),
            "column roles cannot be inserted"
        );
    }

    #[test]
    fn projection_errors_wrap_statement_errors() {
        let error: ProjectionError = StatementError::NoValues.into();
        assert!(matches!(error, ProjectionError::Statement(StatementError::NoValues)));
    }
}
