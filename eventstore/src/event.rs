//! Aggregates, stored events and the typed event abstraction.
//!
//! Events are read from the repository as [`RawEvent`] rows. The eventstore
//! turns each row into an `Arc<dyn Event>` through the mapper registered for
//! its [`EventType`]. Projections and read models recover the concrete type
//! with [`downcast`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{EventstoreError, EventstoreResult};
use crate::types::{AggregateId, AggregateType, EventType, InstanceId, ResourceOwner, Version};

/// The entity an event stream belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aggregate {
    /// Identifier of the aggregate within its type.
    pub id: AggregateId,
    /// Kind of the aggregate.
    pub aggregate_type: AggregateType,
    /// Owning organisation. Empty means "inherit" on push.
    pub resource_owner: ResourceOwner,
    /// Tenant the aggregate lives in.
    pub instance_id: InstanceId,
    /// Event schema version.
    pub version: Version,
}

impl Aggregate {
    /// Creates an aggregate without resource owner and instance.
    pub fn new(
        id: impl Into<AggregateId>,
        aggregate_type: impl Into<AggregateType>,
        version: impl Into<Version>,
    ) -> Self {
        Self {
            id: id.into(),
            aggregate_type: aggregate_type.into(),
            resource_owner: ResourceOwner::default(),
            instance_id: InstanceId::default(),
            version: version.into(),
        }
    }

    /// Sets the resource owner.
    #[must_use]
    pub fn with_resource_owner(mut self, resource_owner: impl Into<ResourceOwner>) -> Self {
        self.resource_owner = resource_owner.into();
        self
    }

    /// Sets the instance.
    #[must_use]
    pub fn with_instance_id(mut self, instance_id: impl Into<InstanceId>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Key identifying the event stream: instance, type and id.
    pub fn stream_key(&self) -> (InstanceId, AggregateType, AggregateId) {
        (
            self.instance_id.clone(),
            self.aggregate_type.clone(),
            self.id.clone(),
        )
    }
}

/// A persisted event row as stored by a [`Repository`](crate::Repository).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Aggregate the event belongs to, with the resource owner resolved.
    pub aggregate: Aggregate,
    /// Name of the change.
    pub event_type: EventType,
    /// Global, strictly increasing position in the log.
    pub sequence: u64,
    /// Sequence of the previous event of the same aggregate, 0 for the first.
    pub previous_aggregate_sequence: u64,
    /// Sequence of the previous event of the same aggregate type, 0 for the first.
    pub previous_aggregate_type_sequence: u64,
    /// Commit time assigned by the store.
    pub creation_date: DateTime<Utc>,
    /// User that caused the change.
    pub editor_user: String,
    /// Service that caused the change.
    pub editor_service: String,
    /// JSON payload, if any.
    pub payload: Option<Vec<u8>>,
}

/// Behaviour shared by every typed event.
///
/// Implementors only provide access to their [`BaseEvent`] and to
/// themselves as [`Any`]; the metadata accessors are derived from the base.
pub trait Event: Send + Sync + fmt::Debug + 'static {
    /// The metadata every event carries.
    fn base(&self) -> &BaseEvent;

    /// Type-erased access used by [`downcast`].
    fn as_any(&self) -> &dyn Any;

    /// Aggregate the event belongs to.
    fn aggregate(&self) -> &Aggregate {
        &self.base().raw.aggregate
    }

    /// Name of the change.
    fn event_type(&self) -> &EventType {
        &self.base().raw.event_type
    }

    /// Global sequence of the event.
    fn sequence(&self) -> u64 {
        self.base().raw.sequence
    }

    /// Sequence of the aggregate's previous event.
    fn previous_aggregate_sequence(&self) -> u64 {
        self.base().raw.previous_aggregate_sequence
    }

    /// Sequence of the aggregate type's previous event.
    fn previous_aggregate_type_sequence(&self) -> u64 {
        self.base().raw.previous_aggregate_type_sequence
    }

    /// Commit time.
    fn creation_date(&self) -> DateTime<Utc> {
        self.base().raw.creation_date
    }

    /// User that caused the change.
    fn editor_user(&self) -> &str {
        &self.base().raw.editor_user
    }

    /// Service that caused the change.
    fn editor_service(&self) -> &str {
        &self.base().raw.editor_service
    }
}

/// Recovers the concrete event type behind a `dyn Event`.
///
/// A mismatch is reported as `InvalidArgument`, which is what `reduce`
/// functions return when they are handed an event they were not registered for.
pub fn downcast<T: Event>(event: &dyn Event) -> EventstoreResult<&T> {
    event.as_any().downcast_ref::<T>().ok_or_else(|| {
        EventstoreError::invalid_argument(format!(
            "event {} of type {} is not a {}",
            event.sequence(),
            event.event_type(),
            std::any::type_name::<T>()
        ))
    })
}

/// Untyped event exposing only metadata and the raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseEvent {
    raw: RawEvent,
}

impl BaseEvent {
    /// Wraps a stored row.
    pub const fn from_raw(raw: RawEvent) -> Self {
        Self { raw }
    }

    /// The stored row.
    pub const fn raw(&self) -> &RawEvent {
        &self.raw
    }

    /// Raw JSON payload.
    pub fn payload(&self) -> Option<&[u8]> {
        self.raw.payload.as_deref()
    }

    /// Deserializes the payload. A missing payload is read as JSON `null`.
    pub fn decode_payload<P: DeserializeOwned>(&self) -> EventstoreResult<P> {
        serde_json::from_slice(self.payload().unwrap_or(b"null")).map_err(|e| {
            EventstoreError::internal(format!(
                "unable to decode payload of event {} ({}): {e}",
                self.raw.sequence, self.raw.event_type
            ))
        })
    }

    /// Mapper that keeps rows untyped.
    pub fn mapper() -> EventMapper {
        Arc::new(|raw| Ok(Arc::new(Self::from_raw(raw)) as Arc<dyn Event>))
    }
}

impl Event for BaseEvent {
    fn base(&self) -> &BaseEvent {
        self
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Event whose JSON payload is decoded into `P`.
pub struct PayloadEvent<P> {
    base: BaseEvent,
    /// Decoded payload.
    pub payload: P,
}

impl<P> PayloadEvent<P>
where
    P: DeserializeOwned + fmt::Debug + Send + Sync + 'static,
{
    /// Decodes the payload of a stored row.
    pub fn from_raw(raw: RawEvent) -> EventstoreResult<Self> {
        let base = BaseEvent::from_raw(raw);
        let payload = base.decode_payload()?;
        Ok(Self { base, payload })
    }

    /// Mapper to register for every event type carrying a `P` payload.
    pub fn mapper() -> EventMapper {
        Arc::new(|raw| Ok(Arc::new(Self::from_raw(raw)?) as Arc<dyn Event>))
    }
}

impl<P: fmt::Debug> fmt::Debug for PayloadEvent<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadEvent")
            .field("event_type", &self.base.raw.event_type)
            .field("sequence", &self.base.raw.sequence)
            .field("payload", &self.payload)
            .finish()
    }
}

impl<P> Event for PayloadEvent<P>
where
    P: fmt::Debug + Send + Sync + 'static,
{
    fn base(&self) -> &BaseEvent {
        &self.base
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Turns a stored row into a typed event.
pub type EventMapper = Arc<dyn Fn(RawEvent) -> EventstoreResult<Arc<dyn Event>> + Send + Sync>;

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn raw_event(aggregate_type: &str, aggregate_id: &str, event_type: &str, sequence: u64) -> RawEvent {
        RawEvent {
            aggregate: Aggregate::new(aggregate_id, aggregate_type, "v1")
                .with_resource_owner("org")
                .with_instance_id("instance"),
            event_type: event_type.into(),
            sequence,
            previous_aggregate_sequence: sequence.saturating_sub(1),
            previous_aggregate_type_sequence: sequence.saturating_sub(1),
            creation_date: Utc::now(),
            editor_user: "editor".to_string(),
            editor_service: "svc".to_string(),
            payload: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::raw_event;
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Renamed {
        name: String,
    }

    #[test]
    fn payload_event_decodes_payload() {
        let mut raw = raw_event("user", "1", "user.renamed", 7);
        raw.payload = Some(br#"{"name":"ada"}"#.to_vec());

        let event = (PayloadEvent::<Renamed>::mapper())(raw).unwrap();
        let renamed = downcast::<PayloadEvent<Renamed>>(event.as_ref()).unwrap();

        assert_eq!(renamed.payload.name, "ada");
        assert_eq!(event.sequence(), 7);
        assert_eq!(event.aggregate().id.as_str(), "1");
    }

    #[test]
    fn payload_event_rejects_malformed_payload() {
        let mut raw = raw_event("user", "1", "user.renamed", 7);
        raw.payload = Some(b"{".to_vec());

        let result = PayloadEvent::<Renamed>::from_raw(raw);
        assert!(matches!(result, Err(EventstoreError::Internal(_))));
    }

    #[test]
    fn downcast_mismatch_is_invalid_argument() {
        let event: Arc<dyn Event> = Arc::new(BaseEvent::from_raw(raw_event("user", "1", "user.added", 1)));

        let result = downcast::<PayloadEvent<Renamed>>(event.as_ref());
        assert!(matches!(result, Err(EventstoreError::InvalidArgument(_))));
    }

    #[test]
    fn base_event_exposes_metadata() {
        let event = BaseEvent::from_raw(raw_event("org", "o1", "org.added", 3));

        assert_eq!(event.event_type().as_str(), "org.added");
        assert_eq!(event.previous_aggregate_sequence(), 2);
        assert_eq!(event.editor_user(), "editor");
        assert!(event.payload().is_none());
    }
}
