use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use eventstore::handler::{Executor, FailedEvent, ProjectionStore, ProjectionTransaction, SqlValue};
use eventstore::{InstanceId, ProjectionError, ProjectionResult, StatementError};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// A statement executed by the in-memory projection store.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    /// Rendered SQL.
    pub sql: String,
    /// Bound arguments.
    pub args: Vec<SqlValue>,
}

type CursorKey = (String, InstanceId);
type FailureKey = (String, InstanceId, u64);
type FailPredicate = Arc<dyn Fn(&str, &[SqlValue]) -> bool + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct Tables {
    cursors: HashMap<CursorKey, u64>,
    failures: HashMap<FailureKey, (u32, String)>,
    executed: Vec<ExecutedStatement>,
}

#[derive(Default)]
struct Shared {
    committed: Mutex<Tables>,
    leases: Mutex<HashMap<CursorKey, (String, Instant)>>,
    fail_when: Mutex<Option<FailPredicate>>,
    transactions: Arc<tokio::sync::Mutex<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> ProjectionResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| ProjectionError::store("projection store lock poisoned"))
}

/// In-memory projection store for testing.
///
/// Transactions are serialized, which stands in for the row lock a database
/// takes on the cursor. Statements are recorded, not interpreted.
#[derive(Clone, Default)]
pub struct InMemoryProjectionStore {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for InMemoryProjectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryProjectionStore").finish_non_exhaustive()
    }
}

impl InMemoryProjectionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every statement for which `predicate` returns `true` fail.
    pub fn fail_statements_when<F>(&self, predicate: F) -> ProjectionResult<()>
    where
        F: Fn(&str, &[SqlValue]) -> bool + Send + Sync + 'static,
    {
        *lock(&self.shared.fail_when)? = Some(Arc::new(predicate));
        Ok(())
    }

    /// Lets every statement succeed again.
    pub fn clear_statement_failures(&self) -> ProjectionResult<()> {
        *lock(&self.shared.fail_when)? = None;
        Ok(())
    }

    /// Statements of committed transactions, in execution order.
    pub fn executed(&self) -> ProjectionResult<Vec<ExecutedStatement>> {
        Ok(lock(&self.shared.committed)?.executed.clone())
    }
}

#[async_trait]
impl ProjectionStore for InMemoryProjectionStore {
    async fn begin(&self) -> ProjectionResult<Box<dyn ProjectionTransaction>> {
        let gate = Arc::clone(&self.shared.transactions).lock_owned().await;
        let working = lock(&self.shared.committed)?.clone();
        let fail_when = lock(&self.shared.fail_when)?.clone();
        Ok(Box::new(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            working,
            savepoints: Vec::new(),
            fail_when,
            _gate: gate,
        }))
    }

    async fn current_sequence(&self, projection: &str, instance_id: &InstanceId) -> ProjectionResult<u64> {
        Ok(lock(&self.shared.committed)?
            .cursors
            .get(&(projection.to_string(), instance_id.clone()))
            .copied()
            .unwrap_or(0))
    }

    async fn lock(
        &self,
        projection: &str,
        instance_id: &InstanceId,
        locker_id: &str,
        duration: Duration,
    ) -> ProjectionResult<bool> {
        let mut leases = lock(&self.shared.leases)?;
        let key = (projection.to_string(), instance_id.clone());
        let now = Instant::now();
        if let Some((holder, until)) = leases.get(&key) {
            if holder != locker_id && *until > now {
                return Ok(false);
            }
        }
        leases.insert(key, (locker_id.to_string(), now + duration));
        Ok(true)
    }

    async fn unlock(&self, projection: &str, instance_id: &InstanceId, locker_id: &str) -> ProjectionResult<()> {
        let mut leases = lock(&self.shared.leases)?;
        let key = (projection.to_string(), instance_id.clone());
        if leases.get(&key).is_some_and(|(holder, _)| holder == locker_id) {
            leases.remove(&key);
        }
        Ok(())
    }

    async fn failed_events(&self, projection: &str) -> ProjectionResult<Vec<FailedEvent>> {
        let committed = lock(&self.shared.committed)?;
        let mut failed: Vec<FailedEvent> = committed
            .failures
            .iter()
            .filter(|((name, _, _), _)| name == projection)
            .map(|((name, instance_id, sequence), (count, error))| FailedEvent {
                projection: name.clone(),
                instance_id: instance_id.clone(),
                sequence: *sequence,
                failure_count: *count,
                error: error.clone(),
            })
            .collect();
        failed.sort_by_key(|event| event.sequence);
        Ok(failed)
    }
}

struct InMemoryTransaction {
    shared: Arc<Shared>,
    working: Tables,
    savepoints: Vec<Tables>,
    fail_when: Option<FailPredicate>,
    _gate: OwnedMutexGuard<()>,
}

#[async_trait]
impl Executor for InMemoryTransaction {
    async fn exec(&mut self, sql: &str, args: &[SqlValue]) -> Result<u64, StatementError> {
        if self
            .fail_when
            .as_ref()
            .is_some_and(|predicate| predicate(sql, args))
        {
            return Err(StatementError::ExecFailed(format!("statement rejected: {sql}")));
        }
        self.working.executed.push(ExecutedStatement {
            sql: sql.to_string(),
            args: args.to_vec(),
        });
        Ok(1)
    }
}

#[async_trait]
impl ProjectionTransaction for InMemoryTransaction {
    fn executor(&mut self) -> &mut dyn Executor {
        self
    }

    async fn current_sequence(&mut self, projection: &str, instance_id: &InstanceId) -> ProjectionResult<u64> {
        Ok(self
            .working
            .cursors
            .get(&(projection.to_string(), instance_id.clone()))
            .copied()
            .unwrap_or(0))
    }

    async fn update_sequence(&mut self, projection: &str, instance_id: &InstanceId, sequence: u64) -> ProjectionResult<()> {
        self.working
            .cursors
            .insert((projection.to_string(), instance_id.clone()), sequence);
        Ok(())
    }

    async fn failure_count(&mut self, projection: &str, instance_id: &InstanceId, sequence: u64) -> ProjectionResult<u32> {
        Ok(self
            .working
            .failures
            .get(&(projection.to_string(), instance_id.clone(), sequence))
            .map_or(0, |(count, _)| *count))
    }

    async fn set_failure_count(
        &mut self,
        projection: &str,
        instance_id: &InstanceId,
        sequence: u64,
        count: u32,
        error: &str,
    ) -> ProjectionResult<()> {
        self.working.failures.insert(
            (projection.to_string(), instance_id.clone(), sequence),
            (count, error.to_string()),
        );
        Ok(())
    }

    async fn savepoint(&mut self) -> ProjectionResult<()> {
        self.savepoints.push(self.working.clone());
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> ProjectionResult<()> {
        self.working = self
            .savepoints
            .pop()
            .ok_or_else(|| ProjectionError::store("no savepoint to roll back to"))?;
        Ok(())
    }

    async fn release_savepoint(&mut self) -> ProjectionResult<()> {
        self.savepoints
            .pop()
            .map(|_| ())
            .ok_or_else(|| ProjectionError::store("no savepoint to release"))
    }

    async fn commit(self: Box<Self>) -> ProjectionResult<()> {
        let this = *self;
        let statements = this.working.executed.len();
        *lock(&this.shared.committed)? = this.working;
        debug!(statements, "[memory.commit] projection transaction committed");
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> ProjectionResult<()> {
        Ok(())
    }
}
