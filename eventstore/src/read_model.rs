//! Read models rebuilt by folding filtered events.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::errors::EventstoreResult;
use crate::event::Event;
use crate::types::{AggregateId, InstanceId, ResourceOwner};

/// A state folded from events by [`Eventstore::filter_to_reducer`].
///
/// [`Eventstore::filter_to_reducer`]: crate::Eventstore::filter_to_reducer
pub trait Reducer: Send {
    /// Queues events to be folded.
    fn append_events(&mut self, events: Vec<Arc<dyn Event>>);

    /// Folds the queued events into the state.
    fn reduce(&mut self) -> EventstoreResult<()>;
}

/// Bookkeeping shared by read models: identity, position and timestamps.
///
/// Concrete read models embed it, inspect the queued `events` in their own
/// `reduce` and finish by calling [`ReadModel::reduce`].
#[derive(Debug, Clone, Default)]
pub struct ReadModel {
    /// Aggregate of the first folded event.
    pub aggregate_id: Option<AggregateId>,
    /// Sequence of the last folded event.
    pub processed_sequence: u64,
    /// Creation date of the first folded event.
    pub creation_date: Option<DateTime<Utc>>,
    /// Creation date of the last folded event.
    pub change_date: Option<DateTime<Utc>>,
    /// Resource owner of the first folded event.
    pub resource_owner: Option<ResourceOwner>,
    /// Instance of the first folded event.
    pub instance_id: Option<InstanceId>,
    /// Events appended but not yet reduced.
    pub events: Vec<Arc<dyn Event>>,
}

impl Reducer for ReadModel {
    fn append_events(&mut self, events: Vec<Arc<dyn Event>>) {
        self.events.extend(events);
    }

    fn reduce(&mut self) -> EventstoreResult<()> {
        let Some(first) = self.events.first() else {
            return Ok(());
        };
        if self.aggregate_id.is_none() {
            let aggregate = first.aggregate();
            self.aggregate_id = Some(aggregate.id.clone());
            self.resource_owner = Some(aggregate.resource_owner.clone());
            self.instance_id = Some(aggregate.instance_id.clone());
        }
        if self.creation_date.is_none() {
            self.creation_date = Some(first.creation_date());
        }
        if let Some(last) = self.events.last() {
            self.change_date = Some(last.creation_date());
            self.processed_sequence = last.sequence();
        }
        self.events.clear();
        Ok(())
    }
}
