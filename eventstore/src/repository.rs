//! Storage seam of the eventstore.
//!
//! A [`Repository`] persists and retrieves [`RawEvent`] rows. Search queries
//! reach it already compiled into a [`Query`]: an OR of AND-groups of
//! [`Filter`]s that a SQL backend renders into a `WHERE` clause and an
//! in-memory backend evaluates with [`Query::matches`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::command::UniqueConstraint;
use crate::errors::EventstoreResult;
use crate::event::{Aggregate, RawEvent};
use crate::search::Columns;
use crate::types::{EventType, InstanceId};

/// An event ready to be persisted. The repository assigns the sequence,
/// previous sequences and creation date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEvent {
    /// Aggregate of the event. An empty resource owner is inherited.
    pub aggregate: Aggregate,
    /// Type of the event.
    pub event_type: EventType,
    /// User causing the change.
    pub editor_user: String,
    /// Service causing the change.
    pub editor_service: String,
    /// Serialized JSON payload.
    pub payload: Option<Vec<u8>>,
    /// Aggregate sequence the writer built on.
    pub expected_sequence: Option<u64>,
}

/// A unique constraint bound to the instance of the event declaring it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConstraint {
    /// Instance of the aggregate that declared the constraint.
    pub instance_id: InstanceId,
    /// The constraint itself.
    pub constraint: UniqueConstraint,
}

/// Event column a filter applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// `aggregate_type`
    AggregateType,
    /// `aggregate_id`
    AggregateId,
    /// `event_type`
    EventType,
    /// `event_sequence`
    Sequence,
    /// `creation_date`
    CreationDate,
    /// `resource_owner`
    ResourceOwner,
    /// `instance_id`
    InstanceId,
    /// `editor_user`
    EditorUser,
}

/// Comparison applied by a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Field equals the value.
    Equals,
    /// Field is one of the values.
    In,
    /// Field is greater than the value.
    Greater,
    /// Field is less than the value.
    Less,
}

/// Value compared by a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    /// A single string.
    Text(String),
    /// A list of strings, used with [`Operation::In`].
    TextList(Vec<String>),
    /// An event sequence.
    Sequence(u64),
    /// A point in time.
    Date(DateTime<Utc>),
}

/// One predicate on an event column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    /// Column.
    pub field: Field,
    /// Comparison.
    pub operation: Operation,
    /// Compared value.
    pub value: FilterValue,
}

impl Filter {
    /// Creates a filter.
    pub const fn new(field: Field, operation: Operation, value: FilterValue) -> Self {
        Self {
            field,
            operation,
            value,
        }
    }

    /// Evaluates the filter against a stored event.
    pub fn matches(&self, event: &RawEvent) -> bool {
        match (self.field, &self.value) {
            (Field::Sequence, FilterValue::Sequence(value)) => {
                compare(self.operation, &event.sequence, value)
            }
            (Field::CreationDate, FilterValue::Date(value)) => {
                compare(self.operation, &event.creation_date, value)
            }
            (field, FilterValue::Text(value)) => text_field(field, event)
                .is_some_and(|actual| compare(self.operation, actual, value.as_str())),
            (field, FilterValue::TextList(values)) => text_field(field, event)
                .is_some_and(|actual| values.iter().any(|value| value == actual)),
            _ => false,
        }
    }
}

fn compare<T: PartialOrd + ?Sized>(operation: Operation, actual: &T, value: &T) -> bool {
    match operation {
        Operation::Equals | Operation::In => actual == value,
        Operation::Greater => actual > value,
        Operation::Less => actual < value,
    }
}

fn text_field(field: Field, event: &RawEvent) -> Option<&str> {
    match field {
        Field::AggregateType => Some(event.aggregate.aggregate_type.as_str()),
        Field::AggregateId => Some(event.aggregate.id.as_str()),
        Field::EventType => Some(event.event_type.as_str()),
        Field::ResourceOwner => Some(event.aggregate.resource_owner.as_str()),
        Field::InstanceId => Some(event.aggregate.instance_id.as_str()),
        Field::EditorUser => Some(event.editor_user.as_str()),
        Field::Sequence | Field::CreationDate => None,
    }
}

/// A compiled search query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// What the query returns.
    pub columns: Columns,
    /// Maximum number of rows, 0 for unlimited.
    pub limit: u64,
    /// Order by sequence descending.
    pub desc: bool,
    /// OR of AND-groups.
    pub filters: Vec<Vec<Filter>>,
}

impl Query {
    /// Whether the event satisfies any filter group.
    pub fn matches(&self, event: &RawEvent) -> bool {
        self.filters
            .iter()
            .any(|group| group.iter().all(|filter| filter.matches(event)))
    }
}

/// Persistence of raw events.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Checks that the storage is reachable.
    async fn health(&self) -> EventstoreResult<()>;

    /// Persists all events and constraint changes atomically, in order.
    ///
    /// Returns the stored rows in input order. Fails with
    /// `ConcurrencyConflict` when an expected sequence does not hold and with
    /// `AlreadyExists` when a unique constraint is taken; nothing is written
    /// in either case.
    async fn push(
        &self,
        events: Vec<PendingEvent>,
        constraints: Vec<PendingConstraint>,
    ) -> EventstoreResult<Vec<RawEvent>>;

    /// Returns the events matching the query, ordered by sequence.
    async fn filter(&self, query: &Query) -> EventstoreResult<Vec<RawEvent>>;

    /// Returns the highest sequence matching the query, 0 if none.
    async fn latest_sequence(&self, query: &Query) -> EventstoreResult<u64>;

    /// Returns the distinct instances having events matching the query.
    async fn instance_ids(&self, query: &Query) -> EventstoreResult<Vec<InstanceId>>;
}
