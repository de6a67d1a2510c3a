//! Search query builder.
//!
//! A [`SearchQueryBuilder`] holds builder-wide scoping (resource owner,
//! instance, editor, limit, order) and one or more filter groups. Groups are
//! OR-ed, the filters of a group are AND-ed:
//!
//! ```
//! use eventstore::{Columns, SearchQueryBuilder};
//!
//! let builder = SearchQueryBuilder::new(Columns::Event)
//!     .resource_owner("org-1")
//!     .add_query()
//!     .aggregate_types(["user"])
//!     .event_types(["user.added", "user.removed"])
//!     .or()
//!     .aggregate_types(["org"])
//!     .builder();
//!
//! let query = builder.build(None).unwrap();
//! assert_eq!(query.filters.len(), 2);
//! ```
//!
//! The same builder compiles to a repository [`Query`] with [`build`] and is
//! evaluated in memory with [`matches`]; both must agree on every event.
//!
//! [`build`]: SearchQueryBuilder::build
//! [`matches`]: SearchQueryBuilder::matches

use chrono::{DateTime, Utc};

use crate::errors::{EventstoreError, EventstoreResult};
use crate::event::Event;
use crate::repository::{Field, Filter, FilterValue, Operation, Query};
use crate::types::{AggregateId, AggregateType, EventType, InstanceId, ResourceOwner};

/// What a search returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Columns {
    /// Full event rows.
    #[default]
    Event = 1,
    /// Only the highest matching sequence.
    MaxSequence = 2,
    /// Distinct instances of the matching events.
    InstanceIds = 3,
}

impl TryFrom<u8> for Columns {
    type Error = EventstoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Event),
            2 => Ok(Self::MaxSequence),
            3 => Ok(Self::InstanceIds),
            other => Err(EventstoreError::precondition_failed(format!(
                "column selector {other} out of range"
            ))),
        }
    }
}

/// Builder of a search over the event log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQueryBuilder {
    columns: Columns,
    limit: u64,
    desc: bool,
    resource_owner: Option<ResourceOwner>,
    instance_id: Option<InstanceId>,
    editor_user: Option<String>,
    queries: Vec<QueryGroup>,
}

/// Filters of one AND-group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryGroup {
    aggregate_types: Vec<AggregateType>,
    aggregate_ids: Vec<AggregateId>,
    event_types: Vec<EventType>,
    sequence_greater: Option<u64>,
    sequence_less: Option<u64>,
    creation_date_after: Option<DateTime<Utc>>,
    instance_id: Option<InstanceId>,
}

impl SearchQueryBuilder {
    /// Starts a search returning `columns`.
    pub fn new(columns: Columns) -> Self {
        Self {
            columns,
            ..Self::default()
        }
    }

    /// Changes what the search returns.
    #[must_use]
    pub const fn columns(mut self, columns: Columns) -> Self {
        self.columns = columns;
        self
    }

    /// Returns at most `limit` events. 0 means unlimited.
    #[must_use]
    pub const fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Orders by ascending sequence (the default).
    #[must_use]
    pub const fn order_asc(mut self) -> Self {
        self.desc = false;
        self
    }

    /// Orders by descending sequence.
    #[must_use]
    pub const fn order_desc(mut self) -> Self {
        self.desc = true;
        self
    }

    /// Only events of this resource owner.
    #[must_use]
    pub fn resource_owner(mut self, resource_owner: impl Into<ResourceOwner>) -> Self {
        self.resource_owner = Some(resource_owner.into());
        self
    }

    /// Only events of this instance.
    #[must_use]
    pub fn instance_id(mut self, instance_id: impl Into<InstanceId>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Only events caused by this user.
    #[must_use]
    pub fn editor_user(mut self, editor_user: impl Into<String>) -> Self {
        self.editor_user = Some(editor_user.into());
        self
    }

    /// Opens a new filter group.
    #[must_use]
    pub fn add_query(self) -> SearchQuery {
        SearchQuery {
            builder: self,
            group: QueryGroup::default(),
        }
    }

    /// What the search returns.
    pub const fn get_columns(&self) -> Columns {
        self.columns
    }

    /// The result limit, 0 for unlimited.
    pub const fn get_limit(&self) -> u64 {
        self.limit
    }

    /// Every aggregate type any group asks for.
    pub fn aggregate_types(&self) -> impl Iterator<Item = &AggregateType> {
        self.queries
            .iter()
            .flat_map(|group| group.aggregate_types.iter())
    }

    /// Compiles the builder into a repository query.
    ///
    /// `instance_id` scopes the query when the builder itself has no instance.
    /// Fails with `PreconditionFailed` when there is no filter group or a
    /// group has no aggregate type.
    pub fn build(&self, instance_id: Option<&InstanceId>) -> EventstoreResult<Query> {
        if self.queries.is_empty() {
            return Err(EventstoreError::precondition_failed("no query given"));
        }

        let mut shared = Vec::new();
        if let Some(owner) = &self.resource_owner {
            shared.push(text_filter(Field::ResourceOwner, owner.as_str()));
        }
        if let Some(instance) = self.instance_id.as_ref().or(instance_id) {
            shared.push(text_filter(Field::InstanceId, instance.as_str()));
        }
        if let Some(editor) = &self.editor_user {
            shared.push(text_filter(Field::EditorUser, editor));
        }

        let filters = self
            .queries
            .iter()
            .map(|group| {
                let mut filters = group.filters()?;
                filters.extend(shared.iter().cloned());
                Ok(filters)
            })
            .collect::<EventstoreResult<Vec<_>>>()?;

        Ok(Query {
            columns: self.columns,
            limit: self.limit,
            desc: self.desc,
            filters,
        })
    }

    /// Evaluates the search against a single event.
    ///
    /// `existing_count` is the number of events already collected for this
    /// search; once it reaches the limit nothing matches any more.
    pub fn matches(&self, event: &dyn Event, existing_count: u64) -> bool {
        if self.limit > 0 && existing_count >= self.limit {
            return false;
        }
        let aggregate = event.aggregate();
        if self
            .resource_owner
            .as_ref()
            .is_some_and(|owner| owner != &aggregate.resource_owner)
        {
            return false;
        }
        if self
            .instance_id
            .as_ref()
            .is_some_and(|instance| instance != &aggregate.instance_id)
        {
            return false;
        }
        if self
            .editor_user
            .as_deref()
            .is_some_and(|editor| editor != event.editor_user())
        {
            return false;
        }
        self.queries.iter().any(|group| group.matches(event))
    }
}

impl QueryGroup {
    fn filters(&self) -> EventstoreResult<Vec<Filter>> {
        if self.aggregate_types.is_empty() {
            return Err(EventstoreError::precondition_failed(
                "no aggregate type given",
            ));
        }

        let mut filters = vec![list_filter(
            Field::AggregateType,
            self.aggregate_types.iter().map(AggregateType::as_str),
        )];
        if !self.aggregate_ids.is_empty() {
            filters.push(list_filter(
                Field::AggregateId,
                self.aggregate_ids.iter().map(AggregateId::as_str),
            ));
        }
        if !self.event_types.is_empty() {
            filters.push(list_filter(
                Field::EventType,
                self.event_types.iter().map(EventType::as_str),
            ));
        }
        if let Some(sequence) = self.sequence_greater {
            filters.push(Filter::new(
                Field::Sequence,
                Operation::Greater,
                FilterValue::Sequence(sequence),
            ));
        }
        if let Some(sequence) = self.sequence_less {
            filters.push(Filter::new(
                Field::Sequence,
                Operation::Less,
                FilterValue::Sequence(sequence),
            ));
        }
        if let Some(date) = self.creation_date_after {
            filters.push(Filter::new(
                Field::CreationDate,
                Operation::Greater,
                FilterValue::Date(date),
            ));
        }
        if let Some(instance) = &self.instance_id {
            filters.push(text_filter(Field::InstanceId, instance.as_str()));
        }
        Ok(filters)
    }

    fn matches(&self, event: &dyn Event) -> bool {
        let aggregate = event.aggregate();
        self.aggregate_types.contains(&aggregate.aggregate_type)
            && (self.aggregate_ids.is_empty() || self.aggregate_ids.contains(&aggregate.id))
            && (self.event_types.is_empty() || self.event_types.contains(event.event_type()))
            && self
                .sequence_greater
                .map_or(true, |sequence| event.sequence() > sequence)
            && self
                .sequence_less
                .map_or(true, |sequence| event.sequence() < sequence)
            && self
                .creation_date_after
                .map_or(true, |date| event.creation_date() > date)
            && self
                .instance_id
                .as_ref()
                .map_or(true, |instance| instance == &aggregate.instance_id)
    }
}

fn text_filter(field: Field, value: &str) -> Filter {
    Filter::new(field, Operation::Equals, FilterValue::Text(value.to_string()))
}

fn list_filter<'a>(field: Field, values: impl Iterator<Item = &'a str>) -> Filter {
    let mut values: Vec<String> = values.map(str::to_string).collect();
    if values.len() == 1 {
        let value = values.remove(0);
        return Filter::new(field, Operation::Equals, FilterValue::Text(value));
    }
    Filter::new(field, Operation::In, FilterValue::TextList(values))
}

/// A filter group under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    builder: SearchQueryBuilder,
    group: QueryGroup,
}

impl SearchQuery {
    /// Events of any of these aggregate types. Required.
    #[must_use]
    pub fn aggregate_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<AggregateType>,
    {
        self.group.aggregate_types.extend(types.into_iter().map(Into::into));
        self
    }

    /// Events of any of these aggregates.
    #[must_use]
    pub fn aggregate_ids<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<AggregateId>,
    {
        self.group.aggregate_ids.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Events of any of these types.
    #[must_use]
    pub fn event_types<I, T>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<EventType>,
    {
        self.group.event_types.extend(types.into_iter().map(Into::into));
        self
    }

    /// Events after `sequence`.
    #[must_use]
    pub const fn sequence_greater(mut self, sequence: u64) -> Self {
        self.group.sequence_greater = Some(sequence);
        self
    }

    /// Events before `sequence`.
    #[must_use]
    pub const fn sequence_less(mut self, sequence: u64) -> Self {
        self.group.sequence_less = Some(sequence);
        self
    }

    /// Events created after `date`.
    #[must_use]
    pub const fn creation_date_after(mut self, date: DateTime<Utc>) -> Self {
        self.group.creation_date_after = Some(date);
        self
    }

    /// Events of this instance, for this group only.
    #[must_use]
    pub fn instance_id(mut self, instance_id: impl Into<InstanceId>) -> Self {
        self.group.instance_id = Some(instance_id.into());
        self
    }

    /// Closes this group and opens another one OR-ed with it.
    #[must_use]
    pub fn or(self) -> Self {
        self.builder().add_query()
    }

    /// Closes this group and returns to the builder.
    #[must_use]
    pub fn builder(mut self) -> SearchQueryBuilder {
        self.builder.queries.push(self.group);
        self.builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_support::raw_event;
    use crate::event::BaseEvent;

    #[test]
    fn build_without_groups_fails() {
        let result = SearchQueryBuilder::new(Columns::Event).build(None);
        assert!(matches!(result, Err(EventstoreError::PreconditionFailed(_))));
    }

    #[test]
    fn build_without_aggregate_type_fails() {
        let result = SearchQueryBuilder::new(Columns::Event)
            .add_query()
            .event_types(["user.added"])
            .builder()
            .build(None);
        assert!(matches!(result, Err(EventstoreError::PreconditionFailed(_))));
    }

    #[test]
    fn out_of_range_columns_fail() {
        assert_eq!(Columns::try_from(2).unwrap(), Columns::MaxSequence);
        assert!(matches!(
            Columns::try_from(0),
            Err(EventstoreError::PreconditionFailed(_))
        ));
        assert!(matches!(
            Columns::try_from(4),
            Err(EventstoreError::PreconditionFailed(_))
        ));
    }

    #[test]
    fn single_values_use_equals_and_lists_use_in() {
        let query = SearchQueryBuilder::new(Columns::Event)
            .add_query()
            .aggregate_types(["user"])
            .event_types(["user.added", "user.removed"])
            .builder()
            .build(None)
            .unwrap();

        assert_eq!(
            query.filters,
            vec![vec![
                Filter::new(Field::AggregateType, Operation::Equals, FilterValue::Text("user".into())),
                Filter::new(
                    Field::EventType,
                    Operation::In,
                    FilterValue::TextList(vec!["user.added".into(), "user.removed".into()])
                ),
            ]]
        );
    }

    #[test]
    fn builder_scoping_is_added_to_every_group() {
        let query = SearchQueryBuilder::new(Columns::MaxSequence)
            .resource_owner("org")
            .add_query()
            .aggregate_types(["user"])
            .or()
            .aggregate_types(["org"])
            .builder()
            .build(Some(&InstanceId::from("instance")))
            .unwrap();

        assert_eq!(query.columns, Columns::MaxSequence);
        for group in &query.filters {
            assert!(group.contains(&text_filter(Field::ResourceOwner, "org")));
            assert!(group.contains(&text_filter(Field::InstanceId, "instance")));
        }
    }

    #[test]
    fn builder_instance_wins_over_default() {
        let query = SearchQueryBuilder::new(Columns::Event)
            .instance_id("explicit")
            .add_query()
            .aggregate_types(["user"])
            .builder()
            .build(Some(&InstanceId::from("default")))
            .unwrap();

        assert!(query.filters[0].contains(&text_filter(Field::InstanceId, "explicit")));
        assert!(!query.filters[0].contains(&text_filter(Field::InstanceId, "default")));
    }

    #[test]
    fn matches_respects_limit() {
        let builder = SearchQueryBuilder::new(Columns::Event)
            .limit(2)
            .add_query()
            .aggregate_types(["user"])
            .builder();
        let event = BaseEvent::from_raw(raw_event("user", "1", "user.added", 1));

        assert!(builder.matches(&event, 1));
        assert!(!builder.matches(&event, 2));
    }

    #[test]
    fn matches_respects_scoping() {
        let event = BaseEvent::from_raw(raw_event("user", "1", "user.added", 10));
        let base = || {
            SearchQueryBuilder::new(Columns::Event)
                .add_query()
                .aggregate_types(["user"])
                .builder()
        };

        assert!(base().matches(&event, 0));
        assert!(base().resource_owner("org").matches(&event, 0));
        assert!(!base().resource_owner("other").matches(&event, 0));
        assert!(!base().instance_id("other").matches(&event, 0));
        assert!(!base().editor_user("someone").matches(&event, 0));
    }

    #[test]
    fn matches_evaluates_group_filters() {
        let event = BaseEvent::from_raw(raw_event("user", "1", "user.added", 10));
        let group = || SearchQueryBuilder::new(Columns::Event).add_query().aggregate_types(["user"]);

        assert!(group().sequence_greater(9).builder().matches(&event, 0));
        assert!(!group().sequence_greater(10).builder().matches(&event, 0));
        assert!(group().sequence_less(11).builder().matches(&event, 0));
        assert!(!group().aggregate_ids(["2"]).builder().matches(&event, 0));
        assert!(!group().event_types(["user.removed"]).builder().matches(&event, 0));
        assert!(group()
            .event_types(["user.removed"])
            .or()
            .aggregate_types(["user"])
            .builder()
            .matches(&event, 0));
    }
}
