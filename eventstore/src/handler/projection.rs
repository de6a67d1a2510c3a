//! The contract between a projection and the handler running it.

use std::sync::Arc;

use crate::errors::EventstoreResult;
use crate::event::Event;
use crate::types::{AggregateType, EventType};

use super::statement::Statement;
use super::table::TableCheck;

/// Reduces one event into a statement.
///
/// Reducers downcast the event to the type they were registered for and
/// return `InvalidArgument` on a mismatch.
pub type ReduceFn = Arc<dyn Fn(&dyn Event) -> EventstoreResult<Statement> + Send + Sync>;

/// The reducer of one event type.
#[derive(Clone)]
pub struct EventReducer {
    /// Handled event type.
    pub event_type: EventType,
    /// Reducer.
    pub reduce: ReduceFn,
}

impl EventReducer {
    /// Registers `reduce` for `event_type`.
    pub fn new<F>(event_type: impl Into<EventType>, reduce: F) -> Self
    where
        F: Fn(&dyn Event) -> EventstoreResult<Statement> + Send + Sync + 'static,
    {
        Self {
            event_type: event_type.into(),
            reduce: Arc::new(reduce),
        }
    }
}

impl std::fmt::Debug for EventReducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReducer")
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

/// The reducers of one aggregate type.
#[derive(Debug, Clone)]
pub struct AggregateReducer {
    /// Aggregate type.
    pub aggregate_type: AggregateType,
    /// Reducers per event type.
    pub event_reducers: Vec<EventReducer>,
}

impl AggregateReducer {
    /// Groups reducers under an aggregate type.
    pub fn new(aggregate_type: impl Into<AggregateType>, event_reducers: Vec<EventReducer>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            event_reducers,
        }
    }
}

/// A read model kept in sync with the event log.
pub trait Projection: Send + Sync {
    /// Name of the projection table, e.g. `projections.users`.
    fn name(&self) -> &str;

    /// Reducers per aggregate and event type.
    fn reducers(&self) -> Vec<AggregateReducer>;

    /// Tables created before the first event is processed.
    fn init_check(&self) -> Option<TableCheck> {
        None
    }
}
