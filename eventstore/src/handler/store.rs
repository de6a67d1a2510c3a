//! Persistence of projection progress.
//!
//! A [`ProjectionStore`] hands out transactions on the database holding the
//! projection tables. The handler executes statements and advances the
//! cursor inside the same [`ProjectionTransaction`], so both commit or
//! neither does.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::ProjectionResult;
use crate::types::InstanceId;

use super::executor::Executor;

/// A failure recorded for a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedEvent {
    /// Projection the statement belongs to.
    pub projection: String,
    /// Instance of the event.
    pub instance_id: InstanceId,
    /// Sequence of the failed statement.
    pub sequence: u64,
    /// Number of failed executions.
    pub failure_count: u32,
    /// Last error message.
    pub error: String,
}

/// Database holding projection tables, cursors, failures and leases.
#[async_trait]
pub trait ProjectionStore: Send + Sync {
    /// Opens a transaction.
    async fn begin(&self) -> ProjectionResult<Box<dyn ProjectionTransaction>>;

    /// Reads the cursor outside of a transaction. 0 if the projection never ran.
    async fn current_sequence(&self, projection: &str, instance_id: &InstanceId) -> ProjectionResult<u64>;

    /// Takes or renews the lease of `locker_id` on the projection's instance.
    /// Returns `false` while another locker holds an unexpired lease.
    async fn lock(
        &self,
        projection: &str,
        instance_id: &InstanceId,
        locker_id: &str,
        duration: Duration,
    ) -> ProjectionResult<bool>;

    /// Releases the lease if `locker_id` holds it.
    async fn unlock(&self, projection: &str, instance_id: &InstanceId, locker_id: &str) -> ProjectionResult<()>;

    /// Failures recorded for the projection.
    async fn failed_events(&self, projection: &str) -> ProjectionResult<Vec<FailedEvent>>;
}

/// A transaction on the projection database.
///
/// Dropping an uncommitted transaction rolls it back.
#[async_trait]
pub trait ProjectionTransaction: Executor {
    /// The transaction as a statement executor.
    fn executor(&mut self) -> &mut dyn Executor;

    /// Reads the cursor and locks it until the transaction ends.
    async fn current_sequence(&mut self, projection: &str, instance_id: &InstanceId) -> ProjectionResult<u64>;

    /// Moves the cursor.
    async fn update_sequence(&mut self, projection: &str, instance_id: &InstanceId, sequence: u64) -> ProjectionResult<()>;

    /// Failed executions recorded for the statement, 0 if none.
    async fn failure_count(&mut self, projection: &str, instance_id: &InstanceId, sequence: u64) -> ProjectionResult<u32>;

    /// Records a failed execution.
    async fn set_failure_count(
        &mut self,
        projection: &str,
        instance_id: &InstanceId,
        sequence: u64,
        count: u32,
        error: &str,
    ) -> ProjectionResult<()>;

    /// Opens a savepoint.
    async fn savepoint(&mut self) -> ProjectionResult<()>;

    /// Discards everything since the savepoint.
    async fn rollback_to_savepoint(&mut self) -> ProjectionResult<()>;

    /// Keeps everything since the savepoint.
    async fn release_savepoint(&mut self) -> ProjectionResult<()>;

    /// Commits the transaction.
    async fn commit(self: Box<Self>) -> ProjectionResult<()>;

    /// Rolls the transaction back.
    async fn rollback(self: Box<Self>) -> ProjectionResult<()>;
}
