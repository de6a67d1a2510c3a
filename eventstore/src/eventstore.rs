//! The eventstore: push, filter, sequence queries, mapping and subscriptions.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, instrument};

use crate::command::Command;
use crate::config::EventstoreConfig;
use crate::errors::{EventstoreError, EventstoreResult};
use crate::event::{BaseEvent, Event, EventMapper, RawEvent};
use crate::read_model::Reducer;
use crate::repository::{PendingConstraint, PendingEvent, Repository};
use crate::search::{Columns, SearchQueryBuilder};
use crate::subscription::{Subscription, SubscriptionBus};
use crate::types::{AggregateType, EventType, InstanceId};
use crate::utils::lock_recovery::RwLockRecovery;

/// Append-only event log in front of a [`Repository`].
///
/// The eventstore validates and serializes commands, persists them through
/// the repository in one atomic write, turns stored rows back into typed
/// events with the registered mappers, and announces pushed events on its
/// [`SubscriptionBus`].
pub struct Eventstore {
    repository: Arc<dyn Repository>,
    mappers: RwLock<HashMap<EventType, EventMapper>>,
    bus: SubscriptionBus,
    config: EventstoreConfig,
}

impl std::fmt::Debug for Eventstore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Eventstore")
            .field("mappers", &self.mappers.read_recover().len())
            .field("bus", &self.bus)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Eventstore {
    /// Creates an eventstore with default configuration.
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self::with_config(repository, EventstoreConfig::default())
    }

    /// Creates an eventstore.
    pub fn with_config(repository: Arc<dyn Repository>, config: EventstoreConfig) -> Self {
        let bus = SubscriptionBus::new(config.subscription_capacity.into());
        Self {
            repository,
            mappers: RwLock::new(HashMap::new()),
            bus,
            config,
        }
    }

    /// The subscription bus announcing pushed events.
    pub const fn bus(&self) -> &SubscriptionBus {
        &self.bus
    }

    /// Checks that the repository is reachable.
    pub async fn health(&self) -> EventstoreResult<()> {
        self.repository.health().await
    }

    /// Persists the events of all commands atomically.
    ///
    /// Commands are grouped by aggregate, keeping their order, so the events
    /// of one aggregate get contiguous sequences. Returns the pushed events
    /// mapped to their registered types.
    #[instrument(name = "eventstore.push", skip(self, commands), fields(command_count = commands.len()))]
    pub async fn push(&self, commands: &[&dyn Command]) -> EventstoreResult<Vec<Arc<dyn Event>>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let (events, constraints) = commands_to_events(commands)?;
        let raw_events = with_timeout(
            self.config.push_timeout,
            self.repository.push(events, constraints),
        )
        .await?;

        let events: Vec<Arc<dyn Event>> = raw_events
            .into_iter()
            .map(|raw| self.map_pushed(raw))
            .collect();
        debug!(event_count = events.len(), "[eventstore.push] events stored");

        self.bus.notify(&events);
        Ok(events)
    }

    /// Returns the events matching the search, mapped to their registered types.
    ///
    /// Fails with `Internal` when a stored event type has no mapper.
    #[instrument(name = "eventstore.filter", skip(self, builder))]
    pub async fn filter(&self, builder: &SearchQueryBuilder) -> EventstoreResult<Vec<Arc<dyn Event>>> {
        let mut query = builder.build(None)?;
        query.columns = Columns::Event;

        let raw_events =
            with_timeout(self.config.query_timeout, self.repository.filter(&query)).await?;
        debug!(event_count = raw_events.len(), "[eventstore.filter] events loaded");
        self.map_events(raw_events)
    }

    /// Highest sequence matching the search, 0 if nothing matches.
    #[instrument(name = "eventstore.latest_sequence", skip(self, builder))]
    pub async fn latest_sequence(&self, builder: &SearchQueryBuilder) -> EventstoreResult<u64> {
        let mut query = builder.build(None)?;
        query.columns = Columns::MaxSequence;
        with_timeout(
            self.config.query_timeout,
            self.repository.latest_sequence(&query),
        )
        .await
    }

    /// Instances having events matching the search.
    #[instrument(name = "eventstore.instance_ids", skip(self, builder))]
    pub async fn instance_ids(&self, builder: &SearchQueryBuilder) -> EventstoreResult<Vec<InstanceId>> {
        let mut query = builder.build(None)?;
        query.columns = Columns::InstanceIds;
        with_timeout(
            self.config.query_timeout,
            self.repository.instance_ids(&query),
        )
        .await
    }

    /// Filters events and folds them into `reducer`.
    pub async fn filter_to_reducer(
        &self,
        builder: &SearchQueryBuilder,
        reducer: &mut dyn Reducer,
    ) -> EventstoreResult<()> {
        let events = self.filter(builder).await?;
        reducer.append_events(events);
        reducer.reduce()
    }

    /// Registers the mapper for `event_type`.
    ///
    /// An empty event type is ignored. Registering a type again replaces its
    /// mapper.
    pub fn register_filter_event_mapper(&self, event_type: impl Into<EventType>, mapper: EventMapper) {
        let event_type = event_type.into();
        if event_type.is_empty() {
            return;
        }
        self.mappers.write_recover().insert(event_type, mapper);
    }

    /// Subscribes to every event of the given aggregate types.
    pub fn subscribe_aggregates<I, T>(&self, aggregate_types: I) -> Subscription
    where
        I: IntoIterator<Item = T>,
        T: Into<AggregateType>,
    {
        self.bus.subscribe(
            SearchQueryBuilder::new(Columns::Event)
                .add_query()
                .aggregate_types(aggregate_types)
                .builder(),
        )
    }

    /// Subscribes to selected event types per aggregate type. An empty list
    /// subscribes to every event of that aggregate type.
    pub fn subscribe_event_types(&self, types: HashMap<AggregateType, Vec<EventType>>) -> Subscription {
        let mut groups = types.into_iter();
        let Some((aggregate_type, event_types)) = groups.next() else {
            return self.bus.subscribe(SearchQueryBuilder::new(Columns::Event));
        };
        let mut query = SearchQueryBuilder::new(Columns::Event)
            .add_query()
            .aggregate_types([aggregate_type])
            .event_types(event_types);
        for (aggregate_type, event_types) in groups {
            query = query
                .or()
                .aggregate_types([aggregate_type])
                .event_types(event_types);
        }
        self.bus.subscribe(query.builder())
    }

    /// Subscribes to the events matching an arbitrary search.
    pub fn subscribe(&self, builder: SearchQueryBuilder) -> Subscription {
        self.bus.subscribe(builder)
    }

    fn map_events(&self, raw_events: Vec<RawEvent>) -> EventstoreResult<Vec<Arc<dyn Event>>> {
        let mappers = self.mappers.read_recover();
        raw_events
            .into_iter()
            .map(|raw| {
                let mapper = mappers.get(&raw.event_type).ok_or_else(|| {
                    EventstoreError::internal(format!(
                        "no mapper registered for event type {}",
                        raw.event_type
                    ))
                })?;
                mapper(raw)
            })
            .collect()
    }

    fn map_pushed(&self, raw: RawEvent) -> Arc<dyn Event> {
        let mapper = self.mappers.read_recover().get(&raw.event_type).cloned();
        let Some(mapper) = mapper else {
            return Arc::new(BaseEvent::from_raw(raw));
        };
        let fallback = raw.clone();
        mapper(raw).unwrap_or_else(|error| {
            debug!(
                %error,
                sequence = fallback.sequence,
                "[eventstore.push] mapping pushed event failed, announcing base event"
            );
            Arc::new(BaseEvent::from_raw(fallback))
        })
    }
}

fn commands_to_events(
    commands: &[&dyn Command],
) -> EventstoreResult<(Vec<PendingEvent>, Vec<PendingConstraint>)> {
    let mut order = Vec::new();
    let mut by_aggregate: HashMap<_, Vec<PendingEvent>> = HashMap::new();
    let mut constraints = Vec::new();

    for command in commands {
        let aggregate = command.aggregate();
        if aggregate.id.is_empty() {
            return Err(EventstoreError::invalid_argument("aggregate id must not be empty"));
        }
        if aggregate.aggregate_type.is_empty() {
            return Err(EventstoreError::invalid_argument("aggregate type must not be empty"));
        }
        if aggregate.version.is_empty() {
            return Err(EventstoreError::invalid_argument("aggregate version must not be empty"));
        }
        if command.event_type().is_empty() {
            return Err(EventstoreError::invalid_argument("event type must not be empty"));
        }

        let payload = command.payload()?.into_bytes()?;
        constraints.extend(
            command
                .unique_constraints()
                .into_iter()
                .map(|constraint| PendingConstraint {
                    instance_id: aggregate.instance_id.clone(),
                    constraint,
                }),
        );

        let key = aggregate.stream_key();
        let events = by_aggregate.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            Vec::new()
        });
        events.push(PendingEvent {
            aggregate: aggregate.clone(),
            event_type: command.event_type().clone(),
            editor_user: command.editor_user().to_string(),
            editor_service: command.editor_service().to_string(),
            payload,
            expected_sequence: command.expected_sequence(),
        });
    }

    let events = order
        .into_iter()
        .filter_map(|key| by_aggregate.remove(&key))
        .flatten()
        .collect();
    Ok((events, constraints))
}

async fn with_timeout<T>(
    timeout: Option<Duration>,
    operation: impl Future<Output = EventstoreResult<T>> + Send,
) -> EventstoreResult<T> {
    match timeout {
        Some(duration) => tokio::time::timeout(duration, operation)
            .await
            .map_err(|_| EventstoreError::Timeout(duration))?,
        None => operation.await,
    }
}
