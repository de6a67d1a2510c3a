//! The projection handler: catch-up, live processing and progress tracking.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::HandlerConfig;
use crate::errors::{EventstoreResult, ProjectionError, ProjectionResult, StatementError};
use crate::event::Event;
use crate::eventstore::Eventstore;
use crate::search::{Columns, SearchQuery, SearchQueryBuilder};
use crate::subscription::Subscription;
use crate::types::{AggregateType, EventType, InstanceId};

use super::projection::{Projection, ReduceFn};
use super::statement::Statement;
use super::store::{ProjectionStore, ProjectionTransaction};
use super::table::TableCheck;

/// Lifecycle of a projection handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerState {
    /// Created, tables not checked yet.
    Uninitialized,
    /// Tables exist.
    TableChecked,
    /// Processing the backlog of every instance.
    CatchingUp,
    /// Waiting for pushed events or the periodic trigger.
    Live,
    /// The background task ended.
    Stopped,
}

#[derive(Debug, Default)]
struct BatchOutcome {
    applied: usize,
    failed_sequence: Option<u64>,
}

/// Keeps one projection in sync with the event log.
///
/// Every batch runs in one projection store transaction: the cursor is read
/// and locked, the statements of events after it are executed, and the cursor
/// is moved to the last handled event before the commit. A crash therefore
/// loses at most the uncommitted batch and never applies a statement twice.
pub struct ProjectionHandler {
    name: String,
    reducers: HashMap<AggregateType, HashMap<EventType, ReduceFn>>,
    aggregate_types: Vec<AggregateType>,
    event_types: Vec<(AggregateType, Vec<EventType>)>,
    init_check: Option<TableCheck>,
    eventstore: Arc<Eventstore>,
    store: Arc<dyn ProjectionStore>,
    config: HandlerConfig,
    locker_id: String,
    state: watch::Sender<HandlerState>,
    running: AtomicBool,
}

impl std::fmt::Debug for ProjectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionHandler")
            .field("name", &self.name)
            .field("aggregate_types", &self.aggregate_types)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProjectionHandler {
    /// Creates a handler for `projection`.
    pub fn new(
        projection: &dyn Projection,
        eventstore: Arc<Eventstore>,
        store: Arc<dyn ProjectionStore>,
        config: HandlerConfig,
    ) -> Self {
        let mut reducers: HashMap<AggregateType, HashMap<EventType, ReduceFn>> = HashMap::new();
        let mut aggregate_types = Vec::new();
        for aggregate in projection.reducers() {
            if !aggregate_types.contains(&aggregate.aggregate_type) {
                aggregate_types.push(aggregate.aggregate_type.clone());
            }
            let events = reducers.entry(aggregate.aggregate_type).or_default();
            for reducer in aggregate.event_reducers {
                events.insert(reducer.event_type, reducer.reduce);
            }
        }

        let event_types = aggregate_types
            .iter()
            .filter_map(|aggregate_type| {
                let mut types: Vec<EventType> = reducers.get(aggregate_type)?.keys().cloned().collect();
                types.sort();
                (!types.is_empty()).then(|| (aggregate_type.clone(), types))
            })
            .collect();

        let (state, _) = watch::channel(HandlerState::Uninitialized);
        Self {
            name: projection.name().to_string(),
            reducers,
            aggregate_types,
            event_types,
            init_check: projection.init_check(),
            eventstore,
            store,
            config,
            locker_id: Uuid::now_v7().to_string(),
            state,
            running: AtomicBool::new(false),
        }
    }

    /// Name of the projection.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Aggregate types the projection reduces.
    pub fn aggregate_types(&self) -> &[AggregateType] {
        &self.aggregate_types
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HandlerState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn watch_state(&self) -> watch::Receiver<HandlerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: HandlerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(projection = %self.name, ?previous, ?state, "[projection.state] transition");
        }
    }

    /// Runs the projection's table check.
    #[instrument(name = "projection.init", skip(self), fields(projection = %self.name))]
    pub async fn init(&self) -> ProjectionResult<()> {
        if let Some(check) = &self.init_check {
            let init_error = |message: String| ProjectionError::InitCheck {
                projection: self.name.clone(),
                message,
            };
            let mut tx = self.store.begin().await?;
            for ddl in check.statements(&self.name) {
                tx.exec(&ddl, &[])
                    .await
                    .map_err(|e| init_error(e.to_string()))?;
            }
            tx.commit().await.map_err(|e| init_error(e.to_string()))?;
        }
        self.set_state(HandlerState::TableChecked);
        Ok(())
    }

    /// Cursor of the projection for `instance_id`.
    pub async fn current_sequence(&self, instance_id: &InstanceId) -> ProjectionResult<u64> {
        self.store.current_sequence(&self.name, instance_id).await
    }

    /// Processes every event of `instance_id` after the cursor, batch by batch.
    ///
    /// Returns the number of executed statements. With a configured lease,
    /// an instance leased by another handler is skipped.
    #[instrument(name = "projection.trigger", skip(self), fields(projection = %self.name, instance_id = %instance_id))]
    pub async fn trigger(&self, instance_id: &InstanceId) -> ProjectionResult<usize> {
        if self.config.lock_duration.is_none() {
            return self.trigger_batches(instance_id).await;
        }
        if !self.renew_lease(instance_id).await? {
            debug!("[projection.trigger] lease held by another handler");
            return Ok(0);
        }
        let result = self.trigger_batches(instance_id).await;
        if let Err(error) = self.store.unlock(&self.name, instance_id, &self.locker_id).await {
            warn!(%error, "[projection.trigger] releasing lease failed");
        }
        result
    }

    /// Takes or extends the lease. Always `true` without a lease duration.
    async fn renew_lease(&self, instance_id: &InstanceId) -> ProjectionResult<bool> {
        match self.config.lock_duration {
            Some(duration) => {
                self.store
                    .lock(&self.name, instance_id, &self.locker_id, duration)
                    .await
            }
            None => Ok(true),
        }
    }

    async fn trigger_batches(&self, instance_id: &InstanceId) -> ProjectionResult<usize> {
        let bulk_limit: u64 = self.config.bulk_limit.into();
        let mut applied = 0;
        let mut first_batch = true;
        loop {
            if !first_batch && !self.renew_lease(instance_id).await? {
                warn!(applied, "[projection.trigger] lease lost during catch-up");
                return Ok(applied);
            }
            first_batch = false;
            let mut tx = self.store.begin().await?;
            let cursor = tx.current_sequence(&self.name, instance_id).await?;
            let events = match self.events_query(instance_id, cursor, None) {
                Some(query) => self.eventstore.filter(&query.limit(bulk_limit)).await?,
                None => Vec::new(),
            };
            if events.is_empty() {
                tx.rollback().await?;
                return Ok(applied);
            }

            let fetched = events.len() as u64;
            let outcome = self.apply(tx.as_mut(), instance_id, cursor, &events).await?;
            tx.commit().await?;
            applied += outcome.applied;

            if let Some(failed_sequence) = outcome.failed_sequence {
                return Err(ProjectionError::SomeStatementsFailed {
                    projection: self.name.clone(),
                    failed_sequence,
                });
            }
            if fetched < bulk_limit {
                return Ok(applied);
            }
        }
    }

    /// Applies already fetched events of `instance_id` in one transaction.
    ///
    /// Events at or before the cursor and events of other instances are
    /// ignored, so replaying a range is harmless. When the log holds
    /// reducible events between the cursor and the given ones that are
    /// missing from `events`, nothing is applied from the slice and the
    /// backlog is read with [`trigger`](Self::trigger) instead.
    #[instrument(name = "projection.process", skip(self, events), fields(projection = %self.name, instance_id = %instance_id, event_count = events.len()))]
    pub async fn process(&self, instance_id: &InstanceId, events: &[Arc<dyn Event>]) -> ProjectionResult<usize> {
        let mut events: Vec<Arc<dyn Event>> = events
            .iter()
            .filter(|event| &event.aggregate().instance_id == instance_id)
            .cloned()
            .collect();
        events.sort_by_key(|event| event.sequence());

        let Some(last) = events.last().map(|event| event.sequence()) else {
            return Ok(0);
        };

        let mut tx = self.store.begin().await?;
        let cursor = tx.current_sequence(&self.name, instance_id).await?;
        if let Some(missing) = self.first_missing(instance_id, cursor, last, &events).await? {
            tx.rollback().await?;
            debug!(cursor, missing, "[projection.process] gap in given events, reading backlog");
            return self.trigger(instance_id).await;
        }
        let outcome = self.apply(tx.as_mut(), instance_id, cursor, &events).await?;
        tx.commit().await?;

        match outcome.failed_sequence {
            Some(failed_sequence) => Err(ProjectionError::SomeStatementsFailed {
                projection: self.name.clone(),
                failed_sequence,
            }),
            None => Ok(outcome.applied),
        }
    }

    async fn apply(
        &self,
        tx: &mut dyn ProjectionTransaction,
        instance_id: &InstanceId,
        cursor: u64,
        events: &[Arc<dyn Event>],
    ) -> ProjectionResult<BatchOutcome> {
        let max_failure_count: u32 = self.config.max_failure_count.into();
        let mut position = cursor;
        let mut outcome = BatchOutcome::default();

        for event in events {
            let sequence = event.sequence();
            if sequence <= position {
                debug!(sequence, "[projection.apply] event already applied");
                continue;
            }
            let statement = match self.reduce(event.as_ref()) {
                None => {
                    position = sequence;
                    continue;
                }
                Some(Ok(statement)) => statement,
                Some(Err(error)) => {
                    error!(sequence, event_type = %event.event_type(), %error, "[projection.apply] reduce failed, event skipped");
                    let count = tx.failure_count(&self.name, instance_id, sequence).await? + 1;
                    tx.set_failure_count(&self.name, instance_id, sequence, count, &error.to_string())
                        .await?;
                    position = sequence;
                    continue;
                }
            };
            if statement.sequence <= position {
                debug!(sequence = statement.sequence, "[projection.apply] statement already applied");
                continue;
            }

            match self.execute(tx, &statement).await? {
                Ok(()) => {
                    if !statement.is_no_op() {
                        outcome.applied += 1;
                    }
                    position = statement.sequence;
                }
                Err(error) => {
                    let count = tx
                        .failure_count(&self.name, instance_id, statement.sequence)
                        .await?
                        + 1;
                    tx.set_failure_count(
                        &self.name,
                        instance_id,
                        statement.sequence,
                        count,
                        &error.to_string(),
                    )
                    .await?;
                    if count >= max_failure_count {
                        warn!(sequence = statement.sequence, count, %error, "[projection.apply] statement failed too often, skipped");
                        position = statement.sequence;
                    } else {
                        warn!(sequence = statement.sequence, count, %error, "[projection.apply] statement failed");
                        outcome.failed_sequence = Some(statement.sequence);
                        break;
                    }
                }
            }
        }

        if position > cursor {
            tx.update_sequence(&self.name, instance_id, position).await?;
        }
        Ok(outcome)
    }

    fn reduce(&self, event: &dyn Event) -> Option<EventstoreResult<Statement>> {
        let reduce = self
            .reducers
            .get(&event.aggregate().aggregate_type)?
            .get(event.event_type())?;
        Some(reduce(event))
    }

    async fn execute(
        &self,
        tx: &mut dyn ProjectionTransaction,
        statement: &Statement,
    ) -> ProjectionResult<Result<(), StatementError>> {
        if statement.is_no_op() {
            return Ok(Ok(()));
        }
        tx.savepoint().await?;
        match statement.execute(tx.executor(), &self.name).await {
            Ok(()) => {
                tx.release_savepoint().await?;
                Ok(Ok(()))
            }
            Err(error) => {
                tx.rollback_to_savepoint().await?;
                Ok(Err(error))
            }
        }
    }

    /// Sequence of the first reducible event after `cursor` and up to `last`
    /// that `events` does not contain.
    async fn first_missing(
        &self,
        instance_id: &InstanceId,
        cursor: u64,
        last: u64,
        events: &[Arc<dyn Event>],
    ) -> ProjectionResult<Option<u64>> {
        if last <= cursor {
            return Ok(None);
        }
        let Some(query) = self.events_query(instance_id, cursor, Some(last + 1)) else {
            return Ok(None);
        };
        let given: HashSet<u64> = events.iter().map(|event| event.sequence()).collect();
        let stored = self.eventstore.filter(&query).await?;
        Ok(stored
            .iter()
            .map(|event| event.sequence())
            .find(|sequence| !given.contains(sequence)))
    }

    /// Events of `instance_id` after `after` (and before `before`) whose
    /// type has a reducer. `None` if the projection reduces nothing.
    ///
    /// Only reduced event types are read, so unknown events of the same
    /// aggregate never need a mapper.
    fn events_query(&self, instance_id: &InstanceId, after: u64, before: Option<u64>) -> Option<SearchQueryBuilder> {
        let narrow = |query: SearchQuery, aggregate_type: &AggregateType, event_types: &[EventType]| {
            let query = query
                .aggregate_types([aggregate_type])
                .event_types(event_types)
                .sequence_greater(after);
            match before {
                Some(before) => query.sequence_less(before),
                None => query,
            }
        };

        let mut groups = self.event_types.iter();
        let (aggregate_type, event_types) = groups.next()?;
        let mut query = narrow(
            SearchQueryBuilder::new(Columns::Event)
                .instance_id(instance_id.clone())
                .add_query(),
            aggregate_type,
            event_types,
        );
        for (aggregate_type, event_types) in groups {
            query = narrow(query.or(), aggregate_type, event_types);
        }
        Some(query.builder())
    }

    async fn instances(&self) -> Vec<InstanceId> {
        if !self.config.instances.is_empty() {
            return self.config.instances.clone();
        }
        if self.event_types.is_empty() {
            return Vec::new();
        }
        let query = SearchQueryBuilder::new(Columns::InstanceIds)
            .add_query()
            .aggregate_types(self.aggregate_types.iter().cloned())
            .builder();
        match self.eventstore.instance_ids(&query).await {
            Ok(instances) => instances,
            Err(error) => {
                error!(projection = %self.name, %error, "[projection.instances] listing instances failed");
                Vec::new()
            }
        }
    }

    /// Returns `false` when the handler was stopped while waiting to retry.
    async fn trigger_with_retry(&self, instance_id: &InstanceId, shutdown: &mut watch::Receiver<bool>) -> bool {
        let attempts = self.config.retries.max(1);
        for attempt in 1..=attempts {
            match self.trigger(instance_id).await {
                Ok(applied) => {
                    if applied > 0 {
                        debug!(projection = %self.name, %instance_id, applied, "[projection.trigger] statements applied");
                    }
                    return true;
                }
                Err(error) => {
                    warn!(projection = %self.name, %instance_id, attempt, %error, "[projection.trigger] failed");
                    if attempt < attempts {
                        tokio::select! {
                            _ = shutdown.changed() => return false,
                            () = sleep(self.config.retry_failed_after) => {}
                        }
                    }
                }
            }
        }
        error!(projection = %self.name, %instance_id, "[projection.trigger] giving up until the next wake-up");
        true
    }

    /// Spawns the handler loop: table check, catch-up of every instance, then
    /// live processing on pushed events and on the periodic trigger.
    ///
    /// Dropping the returned handle stops the loop as well.
    pub fn start(self: &Arc<Self>) -> ProjectionResult<HandlerHandle> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ProjectionError::AlreadyRunning(self.name.clone()));
        }
        let subscription = self
            .eventstore
            .subscribe_event_types(self.event_types.iter().cloned().collect());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handler = Arc::clone(self);
        let task = tokio::spawn(async move {
            handler.run(subscription, shutdown_rx).await;
            handler.set_state(HandlerState::Stopped);
            handler.running.store(false, Ordering::Release);
        });
        Ok(HandlerHandle { shutdown, task })
    }

    async fn run(&self, mut subscription: Subscription, mut shutdown: watch::Receiver<bool>) {
        if let Err(error) = self.init().await {
            error!(projection = %self.name, %error, "[projection.run] init check failed");
            return;
        }

        self.set_state(HandlerState::CatchingUp);
        let mut instances = self.instances().await;
        for instance_id in &instances {
            if stopping(&shutdown) || !self.trigger_with_retry(instance_id, &mut shutdown).await {
                return;
            }
        }

        self.set_state(HandlerState::Live);
        let mut requeue = interval(self.config.requeue_every);
        requeue.set_missed_tick_behavior(MissedTickBehavior::Delay);
        requeue.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = subscription.recv() => {
                    let Some(event) = received else { break };
                    let mut pending = vec![event.aggregate().instance_id.clone()];
                    while let Some(event) = subscription.try_recv() {
                        let instance_id = &event.aggregate().instance_id;
                        if !pending.contains(instance_id) {
                            pending.push(instance_id.clone());
                        }
                    }
                    for instance_id in pending {
                        if !self.config.instances.is_empty() && !self.config.instances.contains(&instance_id) {
                            continue;
                        }
                        if !instances.contains(&instance_id) {
                            instances.push(instance_id.clone());
                        }
                        if !self.trigger_with_retry(&instance_id, &mut shutdown).await {
                            return;
                        }
                    }
                }
                _ = requeue.tick() => {
                    for instance_id in self.instances().await {
                        if !instances.contains(&instance_id) {
                            instances.push(instance_id);
                        }
                    }
                    for instance_id in &instances {
                        if !self.trigger_with_retry(instance_id, &mut shutdown).await {
                            return;
                        }
                    }
                }
            }
        }
        info!(projection = %self.name, "[projection.run] stopped");
    }
}

/// Whether a stop was requested or the handle was dropped.
fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Handle of a started [`ProjectionHandler`].
#[derive(Debug)]
pub struct HandlerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HandlerHandle {
    /// Stops the handler after the batch in progress and waits for it.
    pub async fn stop(self) -> ProjectionResult<()> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| ProjectionError::store(format!("handler task failed: {e}")))
    }

    /// Whether the background task ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
