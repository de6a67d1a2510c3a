use std::time::Duration;

use async_trait::async_trait;
use eventstore::handler::{Executor, FailedEvent, ProjectionStore, ProjectionTransaction, SqlValue};
use eventstore::{InstanceId, ProjectionError, ProjectionResult, StatementError};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgTypeInfo};
use sqlx::types::Json;
use sqlx::{Encode, Pool, Postgres, Row, Transaction, Type};
use tracing::error;

use crate::{migrate, PostgresError};

const SAVEPOINT: &str = "exec_stmt";

/// A `NULL` whose type Postgres infers from the statement.
struct UntypedNull;

impl Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

fn bind_all<'q>(sql: &'q str, args: &'q [SqlValue]) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    args.iter().fold(sqlx::query(sql), |query, arg| match arg {
        SqlValue::Null => query.bind(UntypedNull),
        SqlValue::Bool(value) => query.bind(*value),
        SqlValue::Int(value) => query.bind(*value),
        SqlValue::Float(value) => query.bind(*value),
        SqlValue::Text(value) => query.bind(value.as_str()),
        SqlValue::TextArray(values) => query.bind(values.as_slice()),
        SqlValue::Bytes(bytes) => query.bind(bytes.as_slice()),
        SqlValue::Timestamp(date) => query.bind(*date),
        SqlValue::Json(value) => query.bind(Json(value)),
    })
}

fn store_error(operation: &'static str) -> impl Fn(sqlx::Error) -> ProjectionError {
    move |source| {
        error!(operation, error = %source, "[postgres.projection_store] database operation failed");
        ProjectionError::store(format!("{operation}: {source}"))
    }
}

fn to_i64(sequence: u64) -> ProjectionResult<i64> {
    i64::try_from(sequence).map_err(|_| ProjectionError::store(format!("sequence {sequence} out of range")))
}

fn to_u64(sequence: i64) -> ProjectionResult<u64> {
    u64::try_from(sequence).map_err(|_| ProjectionError::store(format!("negative sequence {sequence}")))
}

/// Projection store on the `projections` schema.
#[derive(Debug, Clone)]
pub struct PgProjectionStore {
    pool: Pool<Postgres>,
}

impl PgProjectionStore {
    /// Uses an existing pool. Projection tables live in the same database.
    pub const fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Runs the schema migrations.
    pub async fn migrate(&self) -> Result<(), PostgresError> {
        migrate(&self.pool).await
    }
}

#[async_trait]
impl ProjectionStore for PgProjectionStore {
    async fn begin(&self) -> ProjectionResult<Box<dyn ProjectionTransaction>> {
        let tx = self.pool.begin().await.map_err(store_error("begin"))?;
        Ok(Box::new(PgProjectionTransaction { tx }))
    }

    async fn current_sequence(&self, projection: &str, instance_id: &InstanceId) -> ProjectionResult<u64> {
        let sequence: Option<i64> = sqlx::query_scalar(
            "SELECT current_sequence FROM projections.current_sequences \
             WHERE instance_id = $1 AND projection_name = $2",
        )
        .bind(instance_id.as_str())
        .bind(projection)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error("current_sequence"))?;
        sequence.map_or(Ok(0), to_u64)
    }

    async fn lock(
        &self,
        projection: &str,
        instance_id: &InstanceId,
        locker_id: &str,
        duration: Duration,
    ) -> ProjectionResult<bool> {
        let result = sqlx::query(
            "INSERT INTO projections.locks (projection_name, instance_id, locker_id, locked_until) \
             VALUES ($1, $2, $3, now() + make_interval(secs => $4)) \
             ON CONFLICT (projection_name, instance_id) DO UPDATE \
             SET locker_id = EXCLUDED.locker_id, locked_until = EXCLUDED.locked_until \
             WHERE projections.locks.locker_id = EXCLUDED.locker_id \
             OR projections.locks.locked_until < now()",
        )
        .bind(projection)
        .bind(instance_id.as_str())
        .bind(locker_id)
        .bind(duration.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(store_error("lock"))?;
        Ok(result.rows_affected() == 1)
    }

    async fn unlock(&self, projection: &str, instance_id: &InstanceId, locker_id: &str) -> ProjectionResult<()> {
        sqlx::query(
            "DELETE FROM projections.locks \
             WHERE projection_name = $1 AND instance_id = $2 AND locker_id = $3",
        )
        .bind(projection)
        .bind(instance_id.as_str())
        .bind(locker_id)
        .execute(&self.pool)
        .await
        .map_err(store_error("unlock"))?;
        Ok(())
    }

    async fn failed_events(&self, projection: &str) -> ProjectionResult<Vec<FailedEvent>> {
        let rows = sqlx::query(
            "SELECT instance_id, failed_sequence, failure_count, error FROM projections.failed_events \
             WHERE projection_name = $1 ORDER BY failed_sequence",
        )
        .bind(projection)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error("failed_events"))?;

        rows.iter()
            .map(|row| {
                let instance_id: String = row.try_get("instance_id").map_err(store_error("failed_events"))?;
                let failure_count: i32 = row.try_get("failure_count").map_err(store_error("failed_events"))?;
                Ok(FailedEvent {
                    projection: projection.to_string(),
                    instance_id: instance_id.into(),
                    sequence: to_u64(row.try_get("failed_sequence").map_err(store_error("failed_events"))?)?,
                    failure_count: u32::try_from(failure_count).unwrap_or_default(),
                    error: row.try_get("error").map_err(store_error("failed_events"))?,
                })
            })
            .collect()
    }
}

struct PgProjectionTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl Executor for PgProjectionTransaction {
    async fn exec(&mut self, sql: &str, args: &[SqlValue]) -> Result<u64, StatementError> {
        bind_all(sql, args)
            .execute(&mut *self.tx)
            .await
            .map(|result| result.rows_affected())
            .map_err(|error| StatementError::ExecFailed(error.to_string()))
    }
}

impl PgProjectionTransaction {
    async fn simple(&mut self, sql: &str, operation: &'static str) -> ProjectionResult<()> {
        sqlx::query(sql)
            .execute(&mut *self.tx)
            .await
            .map_err(store_error(operation))?;
        Ok(())
    }
}

#[async_trait]
impl ProjectionTransaction for PgProjectionTransaction {
    fn executor(&mut self) -> &mut dyn Executor {
        self
    }

    async fn current_sequence(&mut self, projection: &str, instance_id: &InstanceId) -> ProjectionResult<u64> {
        sqlx::query(
            "INSERT INTO projections.current_sequences (projection_name, instance_id) VALUES ($1, $2) \
             ON CONFLICT (instance_id, projection_name) DO NOTHING",
        )
        .bind(projection)
        .bind(instance_id.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(store_error("current_sequence"))?;

        let sequence: i64 = sqlx::query_scalar(
            "SELECT current_sequence FROM projections.current_sequences \
             WHERE instance_id = $1 AND projection_name = $2 FOR UPDATE",
        )
        .bind(instance_id.as_str())
        .bind(projection)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(store_error("current_sequence"))?;
        to_u64(sequence)
    }

    async fn update_sequence(&mut self, projection: &str, instance_id: &InstanceId, sequence: u64) -> ProjectionResult<()> {
        sqlx::query(
            "INSERT INTO projections.current_sequences (projection_name, instance_id, current_sequence, updated_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (instance_id, projection_name) DO UPDATE \
             SET current_sequence = EXCLUDED.current_sequence, updated_at = EXCLUDED.updated_at",
        )
        .bind(projection)
        .bind(instance_id.as_str())
        .bind(to_i64(sequence)?)
        .execute(&mut *self.tx)
        .await
        .map_err(store_error("update_sequence"))?;
        Ok(())
    }

    async fn failure_count(&mut self, projection: &str, instance_id: &InstanceId, sequence: u64) -> ProjectionResult<u32> {
        let count: Option<i32> = sqlx::query_scalar(
            "SELECT failure_count FROM projections.failed_events \
             WHERE projection_name = $1 AND instance_id = $2 AND failed_sequence = $3",
        )
        .bind(projection)
        .bind(instance_id.as_str())
        .bind(to_i64(sequence)?)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(store_error("failure_count"))?;
        Ok(count.map_or(0, |count| u32::try_from(count).unwrap_or_default()))
    }

    async fn set_failure_count(
        &mut self,
        projection: &str,
        instance_id: &InstanceId,
        sequence: u64,
        count: u32,
        error: &str,
    ) -> ProjectionResult<()> {
        sqlx::query(
            "INSERT INTO projections.failed_events \
             (projection_name, instance_id, failed_sequence, failure_count, error, last_failed) \
             VALUES ($1, $2, $3, $4, $5, now()) \
             ON CONFLICT (projection_name, instance_id, failed_sequence) DO UPDATE \
             SET failure_count = EXCLUDED.failure_count, error = EXCLUDED.error, last_failed = EXCLUDED.last_failed",
        )
        .bind(projection)
        .bind(instance_id.as_str())
        .bind(to_i64(sequence)?)
        .bind(i32::try_from(count).unwrap_or(i32::MAX))
        .bind(error)
        .execute(&mut *self.tx)
        .await
        .map_err(store_error("set_failure_count"))?;
        Ok(())
    }

    async fn savepoint(&mut self) -> ProjectionResult<()> {
        self.simple(&format!("SAVEPOINT {SAVEPOINT}"), "savepoint").await
    }

    async fn rollback_to_savepoint(&mut self) -> ProjectionResult<()> {
        self.simple(&format!("ROLLBACK TO SAVEPOINT {SAVEPOINT}"), "rollback_to_savepoint")
            .await
    }

    async fn release_savepoint(&mut self) -> ProjectionResult<()> {
        self.simple(&format!("RELEASE SAVEPOINT {SAVEPOINT}"), "release_savepoint")
            .await
    }

    async fn commit(self: Box<Self>) -> ProjectionResult<()> {
        self.tx.commit().await.map_err(store_error("commit"))
    }

    async fn rollback(self: Box<Self>) -> ProjectionResult<()> {
        self.tx.rollback().await.map_err(store_error("rollback"))
    }
}
