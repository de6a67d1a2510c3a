use std::collections::BTreeSet;

use async_trait::async_trait;
use eventstore::{
    Aggregate, EventstoreError, EventstoreResult, InstanceId, PendingConstraint, PendingEvent,
    Query, RawEvent, Repository, UniqueConstraintAction,
};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{Pool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::query::{compile, EVENT_COLUMNS};
use crate::retry::{with_retries, RetryStrategy};
use crate::{connect, migrate, to_u64, PostgresConfig, PostgresError};

const UNIQUE_VIOLATION: &str = "23505";

const LATEST_OF_STREAM: &str = "SELECT event_sequence FROM eventstore.events \
     WHERE instance_id = $1 AND aggregate_type = $2 AND aggregate_id = $3 \
     ORDER BY event_sequence DESC LIMIT 1";

const INSERT_EVENT: &str = "INSERT INTO eventstore.events (id, event_sequence, instance_id, aggregate_type, \
         aggregate_id, aggregate_version, event_type, previous_aggregate_sequence, \
         previous_aggregate_type_sequence, creation_date, editor_user, editor_service, resource_owner, event_data) \
     SELECT $1, nextval('eventstore.event_sequence'), $2, $3, $4, $5, $6, \
         COALESCE((SELECT event_sequence FROM eventstore.events \
             WHERE instance_id = $2 AND aggregate_type = $3 AND aggregate_id = $4 \
             ORDER BY event_sequence DESC LIMIT 1), 0), \
         COALESCE((SELECT event_sequence FROM eventstore.events \
             WHERE instance_id = $2 AND aggregate_type = $3 \
             ORDER BY event_sequence DESC LIMIT 1), 0), \
         now(), $7, $8, \
         COALESCE(NULLIF($9, ''), (SELECT resource_owner FROM eventstore.events \
             WHERE instance_id = $2 AND aggregate_type = $3 AND aggregate_id = $4 \
             ORDER BY event_sequence DESC LIMIT 1), $4), \
         $10 \
     RETURNING event_sequence, previous_aggregate_sequence, previous_aggregate_type_sequence, \
         creation_date, resource_owner";

/// Event repository backed by `PostgreSQL`.
///
/// Pushes serialize per instance on a transaction-scoped advisory lock, so
/// within an instance sequences become visible in the order they were
/// assigned. A writer bypassing the lock trips the unique index on the
/// stream's previous sequence; the push is then retried against the new
/// stream head.
#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: Pool<Postgres>,
    retry: RetryStrategy,
}

impl PgRepository {
    /// Connects with default configuration.
    pub async fn new(connection_string: &str) -> Result<Self, PostgresError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Connects with custom configuration.
    pub async fn with_config(connection_string: &str, config: PostgresConfig) -> Result<Self, PostgresError> {
        let pool = connect(connection_string, &config).await?;
        Ok(Self {
            pool,
            retry: config.retry,
        })
    }

    /// Uses an existing pool, e.g. one shared with a [`PgProjectionStore`](crate::PgProjectionStore).
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            retry: RetryStrategy::default(),
        }
    }

    /// Replaces the retry strategy for pushes.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryStrategy) -> Self {
        self.retry = retry;
        self
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Runs the schema migrations.
    pub async fn migrate(&self) -> Result<(), PostgresError> {
        migrate(&self.pool).await
    }

    async fn push_once(
        &self,
        events: &[PendingEvent],
        constraints: &[PendingConstraint],
    ) -> Result<Vec<RawEvent>, PostgresError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(PostgresError::database("begin"))?;

        let instances: BTreeSet<&str> = events
            .iter()
            .map(|event| event.aggregate.instance_id.as_str())
            .chain(constraints.iter().map(|constraint| constraint.instance_id.as_str()))
            .collect();
        for instance in instances {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(instance)
                .execute(&mut *tx)
                .await
                .map_err(PostgresError::database("lock_instance"))?;
        }

        let mut stored = Vec::with_capacity(events.len());
        for event in events {
            if let Some(expected) = event.expected_sequence {
                let actual = latest_of_stream(&mut tx, &event.aggregate).await?;
                if actual != expected {
                    return Err(EventstoreError::ConcurrencyConflict {
                        aggregate_type: event.aggregate.aggregate_type.clone(),
                        aggregate_id: event.aggregate.id.clone(),
                        expected,
                        actual,
                    }
                    .into());
                }
            }
            stored.push(insert_event(&mut tx, event).await?);
        }

        for constraint in constraints {
            apply_constraint(&mut tx, constraint).await?;
        }

        tx.commit().await.map_err(PostgresError::database("commit"))?;
        Ok(stored)
    }

    async fn fetch(&self, query: &Query) -> EventstoreResult<Vec<PgRow>> {
        let compiled = compile(query)?;
        compiled
            .bound()
            .fetch_all(&self.pool)
            .await
            .map_err(|error| PostgresError::database("filter")(error).into())
    }
}

async fn latest_of_stream(tx: &mut Transaction<'static, Postgres>, aggregate: &Aggregate) -> Result<u64, PostgresError> {
    let sequence: Option<i64> = sqlx::query_scalar(LATEST_OF_STREAM)
        .bind(aggregate.instance_id.as_str())
        .bind(aggregate.aggregate_type.as_str())
        .bind(aggregate.id.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(PostgresError::database("latest_of_stream"))?;
    Ok(sequence.map(|sequence| to_u64(sequence, "sequence")).transpose()?.unwrap_or(0))
}

async fn insert_event(tx: &mut Transaction<'static, Postgres>, event: &PendingEvent) -> Result<RawEvent, PostgresError> {
    let payload = event
        .payload
        .as_deref()
        .map(serde_json::from_slice::<Value>)
        .transpose()
        .map_err(|error| EventstoreError::invalid_argument(format!("payload is not JSON: {error}")))?;

    let aggregate = &event.aggregate;
    let row = sqlx::query(INSERT_EVENT)
        .bind(Uuid::now_v7())
        .bind(aggregate.instance_id.as_str())
        .bind(aggregate.aggregate_type.as_str())
        .bind(aggregate.id.as_str())
        .bind(aggregate.version.as_str())
        .bind(event.event_type.as_str())
        .bind(event.editor_user.as_str())
        .bind(event.editor_service.as_str())
        .bind(aggregate.resource_owner.as_str())
        .bind(payload.map(Json))
        .fetch_one(&mut **tx)
        .await
        .map_err(PostgresError::database("insert_event"))?;

    let column = |name: &str| -> Result<i64, PostgresError> {
        row.try_get(name).map_err(PostgresError::database("insert_event"))
    };
    let mut aggregate = aggregate.clone();
    aggregate.resource_owner = row
        .try_get::<String, _>("resource_owner")
        .map_err(PostgresError::database("insert_event"))?
        .into();

    Ok(RawEvent {
        aggregate,
        event_type: event.event_type.clone(),
        sequence: to_u64(column("event_sequence")?, "sequence")?,
        previous_aggregate_sequence: to_u64(column("previous_aggregate_sequence")?, "sequence")?,
        previous_aggregate_type_sequence: to_u64(column("previous_aggregate_type_sequence")?, "sequence")?,
        creation_date: row
            .try_get("creation_date")
            .map_err(PostgresError::database("insert_event"))?,
        editor_user: event.editor_user.clone(),
        editor_service: event.editor_service.clone(),
        payload: event.payload.clone(),
    })
}

async fn apply_constraint(
    tx: &mut Transaction<'static, Postgres>,
    pending: &PendingConstraint,
) -> Result<(), PostgresError> {
    let constraint = &pending.constraint;
    let instance = if constraint.is_global {
        ""
    } else {
        pending.instance_id.as_str()
    };

    let result = match constraint.action {
        UniqueConstraintAction::Add => {
            sqlx::query(
                "INSERT INTO eventstore.unique_constraints (instance_id, unique_type, unique_field) \
                 VALUES ($1, $2, $3)",
            )
            .bind(instance)
            .bind(&constraint.unique_type)
            .bind(&constraint.unique_field)
            .execute(&mut **tx)
            .await
        }
        UniqueConstraintAction::Remove => {
            sqlx::query(
                "DELETE FROM eventstore.unique_constraints \
                 WHERE instance_id = $1 AND unique_type = $2 AND unique_field = $3",
            )
            .bind(instance)
            .bind(&constraint.unique_type)
            .bind(&constraint.unique_field)
            .execute(&mut **tx)
            .await
        }
        UniqueConstraintAction::InstanceRemove => {
            // global keys are stored under the empty instance
            if pending.instance_id.is_empty() {
                return Err(EventstoreError::invalid_argument("instance remove needs an instance id").into());
            }
            sqlx::query("DELETE FROM eventstore.unique_constraints WHERE instance_id = $1")
                .bind(pending.instance_id.as_str())
                .execute(&mut **tx)
                .await
        }
    };

    result.map(|_| ()).map_err(|error| {
        if is_unique_violation(&error) {
            EventstoreError::AlreadyExists(constraint.error_message.clone()).into()
        } else {
            PostgresError::database("unique_constraint")(error)
        }
    })
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_error) if db_error.code().as_deref() == Some(UNIQUE_VIOLATION))
}

fn raw_event_from_row(row: &PgRow) -> Result<RawEvent, PostgresError> {
    let get_text = |name: &str| -> Result<String, PostgresError> {
        row.try_get(name).map_err(PostgresError::database("filter"))
    };
    let get_sequence = |name: &str| -> Result<u64, PostgresError> {
        let value: i64 = row.try_get(name).map_err(PostgresError::database("filter"))?;
        Ok(to_u64(value, "sequence")?)
    };
    let payload: Option<Json<Value>> = row
        .try_get("event_data")
        .map_err(PostgresError::database("filter"))?;
    let payload = payload
        .map(|Json(value)| serde_json::to_vec(&value))
        .transpose()
        .map_err(|error| EventstoreError::internal(format!("stored payload unreadable: {error}")))?;

    let aggregate = Aggregate::new(
        get_text("aggregate_id")?,
        get_text("aggregate_type")?,
        get_text("aggregate_version")?,
    )
    .with_resource_owner(get_text("resource_owner")?)
    .with_instance_id(get_text("instance_id")?);

    Ok(RawEvent {
        aggregate,
        event_type: get_text("event_type")?.into(),
        sequence: get_sequence("event_sequence")?,
        previous_aggregate_sequence: get_sequence("previous_aggregate_sequence")?,
        previous_aggregate_type_sequence: get_sequence("previous_aggregate_type_sequence")?,
        creation_date: row
            .try_get("creation_date")
            .map_err(PostgresError::database("filter"))?,
        editor_user: get_text("editor_user")?,
        editor_service: get_text("editor_service")?,
        payload,
    })
}

#[async_trait]
impl Repository for PgRepository {
    async fn health(&self) -> EventstoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|error| PostgresError::database("health")(error).into())
    }

    #[instrument(name = "postgres.push", skip_all, fields(event_count = events.len()))]
    async fn push(
        &self,
        events: Vec<PendingEvent>,
        constraints: Vec<PendingConstraint>,
    ) -> EventstoreResult<Vec<RawEvent>> {
        let (events, constraints) = (events.as_slice(), constraints.as_slice());
        let stored = with_retries(&self.retry, "push", || self.push_once(events, constraints)).await?;
        debug!(
            last_sequence = stored.last().map(|event| event.sequence),
            "[postgres.push] events stored"
        );
        Ok(stored)
    }

    #[instrument(name = "postgres.filter", skip_all)]
    async fn filter(&self, query: &Query) -> EventstoreResult<Vec<RawEvent>> {
        let rows = self.fetch(query).await?;
        rows.iter()
            .map(|row| raw_event_from_row(row).map_err(EventstoreError::from))
            .collect()
    }

    #[instrument(name = "postgres.latest_sequence", skip_all)]
    async fn latest_sequence(&self, query: &Query) -> EventstoreResult<u64> {
        let compiled = compile(query)?;
        let sequence: Option<i64> = compiled
            .bound()
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get(0))
            .map_err(PostgresError::database("latest_sequence"))?;
        sequence.map_or(Ok(0), |sequence| to_u64(sequence, "sequence"))
    }

    #[instrument(name = "postgres.instance_ids", skip_all)]
    async fn instance_ids(&self, query: &Query) -> EventstoreResult<Vec<InstanceId>> {
        self.fetch(query)
            .await?
            .iter()
            .map(|row| {
                row.try_get::<String, _>(0)
                    .map(InstanceId::from)
                    .map_err(|error| PostgresError::database("instance_ids")(error).into())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_is_recognised_only_for_database_errors() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn insert_binds_every_placeholder() {
        for placeholder in 1..=10 {
            assert!(INSERT_EVENT.contains(&format!("${placeholder}")));
        }
        assert!(!INSERT_EVENT.contains("$11"));
    }

    #[test]
    fn event_columns_cover_the_row_mapping() {
        for column in [
            "event_sequence",
            "instance_id",
            "aggregate_type",
            "aggregate_id",
            "aggregate_version",
            "event_type",
            "previous_aggregate_sequence",
            "previous_aggregate_type_sequence",
            "creation_date",
            "editor_user",
            "editor_service",
            "resource_owner",
            "event_data",
        ] {
            assert!(EVENT_COLUMNS.contains(column), "missing {column}");
        }
    }
}
