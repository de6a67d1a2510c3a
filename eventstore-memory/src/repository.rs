use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use eventstore::{
    EventstoreError, EventstoreResult, InstanceId, PendingConstraint, PendingEvent, Query,
    RawEvent, Repository, ResourceOwner, UniqueConstraintAction,
};
use tracing::{debug, instrument};

type ConstraintKey = (String, String, String);

#[derive(Debug, Default)]
struct State {
    events: Vec<RawEvent>,
    constraints: HashSet<ConstraintKey>,
}

impl State {
    fn latest_of_stream(&self, event: &PendingEvent, staged: &[RawEvent]) -> Option<RawEvent> {
        let matches = |stored: &&RawEvent| {
            stored.aggregate.instance_id == event.aggregate.instance_id
                && stored.aggregate.aggregate_type == event.aggregate.aggregate_type
                && stored.aggregate.id == event.aggregate.id
        };
        staged
            .iter()
            .rev()
            .find(matches)
            .or_else(|| self.events.iter().rev().find(matches))
            .cloned()
    }

    fn latest_of_type(&self, event: &PendingEvent, staged: &[RawEvent]) -> u64 {
        let matches = |stored: &&RawEvent| {
            stored.aggregate.instance_id == event.aggregate.instance_id
                && stored.aggregate.aggregate_type == event.aggregate.aggregate_type
        };
        staged
            .iter()
            .rev()
            .find(matches)
            .or_else(|| self.events.iter().rev().find(matches))
            .map_or(0, |stored| stored.sequence)
    }

}

/// Thread-safe in-memory event repository for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<RwLock<State>>,
}

impl InMemoryRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored event in sequence order.
    pub fn events(&self) -> EventstoreResult<Vec<RawEvent>> {
        Ok(self.read()?.events.clone())
    }

    fn read(&self) -> EventstoreResult<std::sync::RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| EventstoreError::internal("repository lock poisoned"))
    }

    fn matching(&self, query: &Query) -> EventstoreResult<Vec<RawEvent>> {
        Ok(self
            .read()?
            .events
            .iter()
            .filter(|event| query.matches(event))
            .cloned()
            .collect())
    }
}

fn constraint_key(constraint: &PendingConstraint) -> ConstraintKey {
    let instance = if constraint.constraint.is_global {
        String::new()
    } else {
        constraint.instance_id.as_str().to_string()
    };
    (
        instance,
        constraint.constraint.unique_type.clone(),
        constraint.constraint.unique_field.clone(),
    )
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn health(&self) -> EventstoreResult<()> {
        self.read().map(|_| ())
    }

    #[instrument(name = "memory.push", skip_all, fields(event_count = events.len()))]
    async fn push(
        &self,
        events: Vec<PendingEvent>,
        constraints: Vec<PendingConstraint>,
    ) -> EventstoreResult<Vec<RawEvent>> {
        let mut state = self
            .state
            .write()
            .map_err(|_| EventstoreError::internal("repository lock poisoned"))?;

        let creation_date = Utc::now();
        let mut next_sequence = state.events.last().map_or(0, |event| event.sequence) + 1;
        let mut staged: Vec<RawEvent> = Vec::with_capacity(events.len());

        for event in events {
            let previous = state.latest_of_stream(&event, &staged);
            if let Some(expected) = event.expected_sequence {
                let actual = previous.as_ref().map_or(0, |previous| previous.sequence);
                if actual != expected {
                    return Err(EventstoreError::ConcurrencyConflict {
                        aggregate_type: event.aggregate.aggregate_type,
                        aggregate_id: event.aggregate.id,
                        expected,
                        actual,
                    });
                }
            }

            let previous_aggregate_type_sequence = state.latest_of_type(&event, &staged);
            let mut aggregate = event.aggregate;
            if aggregate.resource_owner.is_empty() {
                aggregate.resource_owner = previous.as_ref().map_or_else(
                    || ResourceOwner::from(aggregate.id.as_str()),
                    |previous| previous.aggregate.resource_owner.clone(),
                );
            }

            staged.push(RawEvent {
                aggregate,
                event_type: event.event_type,
                sequence: next_sequence,
                previous_aggregate_sequence: previous.map_or(0, |previous| previous.sequence),
                previous_aggregate_type_sequence,
                creation_date,
                editor_user: event.editor_user,
                editor_service: event.editor_service,
                payload: event.payload,
            });
            next_sequence += 1;
        }

        let mut unique = state.constraints.clone();
        for constraint in &constraints {
            let key = constraint_key(constraint);
            match constraint.constraint.action {
                UniqueConstraintAction::Add => {
                    if !unique.insert(key) {
                        return Err(EventstoreError::AlreadyExists(
                            constraint.constraint.error_message.clone(),
                        ));
                    }
                }
                UniqueConstraintAction::Remove => {
                    unique.remove(&key);
                }
                UniqueConstraintAction::InstanceRemove => {
                    let instance = constraint.instance_id.as_str();
                    // global keys are stored under the empty instance
                    if instance.is_empty() {
                        return Err(EventstoreError::invalid_argument(
                            "instance remove needs an instance id",
                        ));
                    }
                    unique.retain(|(owner, _, _)| owner != instance);
                }
            }
        }

        state.constraints = unique;
        state.events.extend(staged.iter().cloned());
        debug!(
            last_sequence = next_sequence - 1,
            "[memory.push] events stored"
        );
        Ok(staged)
    }

    async fn filter(&self, query: &Query) -> EventstoreResult<Vec<RawEvent>> {
        let mut events = self.matching(query)?;
        if query.desc {
            events.reverse();
        }
        if query.limit > 0 {
            events.truncate(usize::try_from(query.limit).unwrap_or(usize::MAX));
        }
        Ok(events)
    }

    async fn latest_sequence(&self, query: &Query) -> EventstoreResult<u64> {
        Ok(self
            .matching(query)?
            .iter()
            .map(|event| event.sequence)
            .max()
            .unwrap_or(0))
    }

    async fn instance_ids(&self, query: &Query) -> EventstoreResult<Vec<InstanceId>> {
        let instances: BTreeSet<InstanceId> = self
            .matching(query)?
            .into_iter()
            .map(|event| event.aggregate.instance_id)
            .collect();
        Ok(instances.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventstore::{Aggregate, Columns, SearchQueryBuilder, UniqueConstraint};
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn group_by_stream(events: &[RawEvent]) -> HashMap<(InstanceId, String, String), Vec<u64>> {
        let mut streams: HashMap<_, Vec<u64>> = HashMap::new();
        for event in events {
            streams
                .entry((
                    event.aggregate.instance_id.clone(),
                    event.aggregate.aggregate_type.as_str().to_string(),
                    event.aggregate.id.as_str().to_string(),
                ))
                .or_default()
                .push(event.sequence);
        }
        streams
    }

    fn pending(aggregate: Aggregate, event_type: &str) -> PendingEvent {
        PendingEvent {
            aggregate,
            event_type: event_type.into(),
            editor_user: "editor".into(),
            editor_service: "svc".into(),
            payload: None,
            expected_sequence: None,
        }
    }

    fn user(id: &str) -> Aggregate {
        Aggregate::new(id, "user", "v1").with_instance_id("instance")
    }

    fn constraint(constraint: UniqueConstraint) -> PendingConstraint {
        PendingConstraint {
            instance_id: "instance".into(),
            constraint,
        }
    }

    fn all_users() -> Query {
        SearchQueryBuilder::new(Columns::Event)
            .add_query()
            .aggregate_types(["user"])
            .builder()
            .build(None)
            .unwrap()
    }

    #[tokio::test]
    async fn push_links_previous_sequences() {
        let repository = InMemoryRepository::new();
        repository
            .push(vec![pending(user("1"), "user.added"), pending(user("2"), "user.added")], vec![])
            .await
            .unwrap();
        let stored = repository
            .push(vec![pending(user("1"), "user.changed")], vec![])
            .await
            .unwrap();

        assert_eq!(stored[0].sequence, 3);
        assert_eq!(stored[0].previous_aggregate_sequence, 1);
        assert_eq!(stored[0].previous_aggregate_type_sequence, 2);
    }

    #[tokio::test]
    async fn empty_resource_owner_is_inherited() {
        let repository = InMemoryRepository::new();
        let first = repository
            .push(vec![pending(user("1"), "user.added")], vec![])
            .await
            .unwrap();
        assert_eq!(first[0].aggregate.resource_owner.as_str(), "1");

        repository
            .push(
                vec![pending(user("2").with_resource_owner("org"), "user.added")],
                vec![],
            )
            .await
            .unwrap();
        let second = repository
            .push(vec![pending(user("2"), "user.changed")], vec![])
            .await
            .unwrap();
        assert_eq!(second[0].aggregate.resource_owner.as_str(), "org");
    }

    #[tokio::test]
    async fn expected_sequence_mismatch_writes_nothing() {
        let repository = InMemoryRepository::new();
        repository
            .push(vec![pending(user("1"), "user.added")], vec![])
            .await
            .unwrap();

        let mut stale = pending(user("1"), "user.changed");
        stale.expected_sequence = Some(0);
        let result = repository
            .push(vec![pending(user("2"), "user.added"), stale], vec![])
            .await;

        assert!(matches!(
            result,
            Err(EventstoreError::ConcurrencyConflict { expected: 0, actual: 1, .. })
        ));
        assert_eq!(repository.events().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unique_constraints_are_enforced() {
        let repository = InMemoryRepository::new();
        let add = || constraint(UniqueConstraint::add("username", "ada", "username taken"));

        repository
            .push(vec![pending(user("1"), "user.added")], vec![add()])
            .await
            .unwrap();
        let duplicate = repository
            .push(vec![pending(user("2"), "user.added")], vec![add()])
            .await;
        assert_eq!(duplicate.unwrap_err(), EventstoreError::AlreadyExists("username taken".into()));
        assert_eq!(repository.events().unwrap().len(), 1);

        repository
            .push(
                vec![pending(user("1"), "user.removed")],
                vec![constraint(UniqueConstraint::remove("username", "ada"))],
            )
            .await
            .unwrap();
        repository
            .push(vec![pending(user("2"), "user.added")], vec![add()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn global_constraints_span_instances() {
        let repository = InMemoryRepository::new();
        let global = |instance: &str| PendingConstraint {
            instance_id: instance.into(),
            constraint: UniqueConstraint::add_global("domain", "example.com", "domain taken"),
        };

        repository
            .push(vec![pending(user("1"), "user.added")], vec![global("a")])
            .await
            .unwrap();
        let result = repository
            .push(vec![pending(user("2"), "user.added")], vec![global("b")])
            .await;
        assert!(matches!(result, Err(EventstoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn instance_remove_releases_instance_constraints() {
        let repository = InMemoryRepository::new();
        let add = || constraint(UniqueConstraint::add("username", "ada", "taken"));

        repository
            .push(vec![pending(user("1"), "user.added")], vec![add()])
            .await
            .unwrap();
        repository
            .push(
                vec![pending(user("1"), "instance.removed")],
                vec![constraint(UniqueConstraint::remove_instance())],
            )
            .await
            .unwrap();
        repository
            .push(vec![pending(user("2"), "user.added")], vec![add()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn instance_remove_without_instance_keeps_global_constraints() {
        let repository = InMemoryRepository::new();
        let global = PendingConstraint {
            instance_id: "a".into(),
            constraint: UniqueConstraint::add_global("domain", "example.com", "domain taken"),
        };
        repository
            .push(vec![pending(user("1"), "user.added")], vec![global.clone()])
            .await
            .unwrap();

        let unscoped = PendingConstraint {
            instance_id: "".into(),
            constraint: UniqueConstraint::remove_instance(),
        };
        let result = repository
            .push(vec![pending(user("1"), "instance.removed")], vec![unscoped])
            .await;
        assert!(matches!(result, Err(EventstoreError::InvalidArgument(_))));
        assert_eq!(repository.events().unwrap().len(), 1);

        let again = repository
            .push(vec![pending(user("2"), "user.added")], vec![global])
            .await;
        assert!(matches!(again, Err(EventstoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn expected_sequence_sees_events_earlier_in_the_push() {
        let repository = InMemoryRepository::new();
        repository
            .push(vec![pending(user("1"), "user.added")], vec![])
            .await
            .unwrap();

        let decided_on = |sequence| {
            let mut event = pending(user("1"), "user.changed");
            event.expected_sequence = Some(sequence);
            event
        };
        let result = repository.push(vec![decided_on(1), decided_on(1)], vec![]).await;
        assert!(matches!(
            result,
            Err(EventstoreError::ConcurrencyConflict { expected: 1, actual: 2, .. })
        ));
        assert_eq!(repository.events().unwrap().len(), 1);

        let stored = repository
            .push(vec![decided_on(1), decided_on(2)], vec![])
            .await
            .unwrap();
        assert_eq!(
            stored.iter().map(|event| event.sequence).collect::<Vec<_>>(),
            [2, 3]
        );
    }

    #[tokio::test]
    async fn filter_orders_and_limits() {
        let repository = InMemoryRepository::new();
        for id in ["1", "2", "3"] {
            repository
                .push(vec![pending(user(id), "user.added")], vec![])
                .await
                .unwrap();
        }

        let mut query = all_users();
        query.desc = true;
        query.limit = 2;
        let sequences: Vec<u64> = repository
            .filter(&query)
            .await
            .unwrap()
            .iter()
            .map(|event| event.sequence)
            .collect();

        assert_eq!(sequences, vec![3, 2]);
        assert_eq!(repository.latest_sequence(&all_users()).await.unwrap(), 3);
        assert_eq!(
            repository.instance_ids(&all_users()).await.unwrap(),
            vec![InstanceId::from("instance")]
        );
    }

    proptest! {
        #[test]
        fn sequences_increase_per_stream(pushes in prop::collection::vec(prop::collection::vec(0_usize..3, 1..4), 1..8)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let repository = InMemoryRepository::new();
                for push in &pushes {
                    let events = push.iter().map(|id| pending(user(&id.to_string()), "user.changed")).collect();
                    repository.push(events, vec![]).await.unwrap();
                }

                let stored = repository.events().unwrap();
                prop_assert_eq!(stored.len(), pushes.iter().map(Vec::len).sum::<usize>());
                for sequences in group_by_stream(&stored).values() {
                    prop_assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]));
                }
                for (index, event) in stored.iter().enumerate() {
                    let previous = stored[..index]
                        .iter()
                        .rev()
                        .find(|candidate| candidate.aggregate.id == event.aggregate.id)
                        .map_or(0, |candidate| candidate.sequence);
                    prop_assert_eq!(event.previous_aggregate_sequence, previous);
                }
                Ok(())
            })?;
        }
    }
}
