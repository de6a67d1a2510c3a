//! Commands: changes that are not yet durable.
//!
//! A [`Command`] describes one event to append. Its payload is serialized at
//! push time and must be JSON object shaped; see [`Payload`].

use serde::Serialize;
use serde_json::Value;

use crate::errors::{EventstoreError, EventstoreResult};
use crate::event::Aggregate;
use crate::types::EventType;

/// Intent to record a change on an aggregate.
pub trait Command: Send + Sync {
    /// Aggregate the event will belong to.
    fn aggregate(&self) -> &Aggregate;

    /// Type of the resulting event.
    fn event_type(&self) -> &EventType;

    /// User causing the change.
    fn editor_user(&self) -> &str {
        ""
    }

    /// Service causing the change.
    fn editor_service(&self) -> &str {
        ""
    }

    /// Payload to store with the event.
    fn payload(&self) -> EventstoreResult<Payload> {
        Ok(Payload::None)
    }

    /// Unique constraints added or removed together with the event.
    fn unique_constraints(&self) -> Vec<UniqueConstraint> {
        Vec::new()
    }

    /// Aggregate sequence the command was decided on, if the caller wants the
    /// push to fail when the aggregate moved on in the meantime.
    fn expected_sequence(&self) -> Option<u64> {
        None
    }
}

/// Event payload before serialization.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// The event carries no data.
    None,
    /// Already serialized JSON.
    Bytes(Vec<u8>),
    /// A JSON object.
    Json(Value),
}

impl Payload {
    /// Serializes a value into a payload.
    ///
    /// Structs and maps become [`Payload::Json`], `null` (e.g. `None` or `()`)
    /// becomes [`Payload::None`]. Primitives and sequences are rejected.
    pub fn serialize<T: Serialize + ?Sized>(value: &T) -> EventstoreResult<Self> {
        let value = serde_json::to_value(value).map_err(|e| {
            EventstoreError::invalid_argument(format!("unable to serialize payload: {e}"))
        })?;
        Self::from_value(value)
    }

    /// Validates an already built JSON value.
    pub fn from_value(value: Value) -> EventstoreResult<Self> {
        match value {
            Value::Null => Ok(Self::None),
            Value::Object(_) => Ok(Self::Json(value)),
            other => Err(EventstoreError::invalid_argument(format!(
                "payload must be an object, got {}",
                kind_of(&other)
            ))),
        }
    }

    /// Produces the bytes stored with the event.
    pub fn into_bytes(self) -> EventstoreResult<Option<Vec<u8>>> {
        match self {
            Self::None => Ok(None),
            Self::Bytes(bytes) => {
                serde_json::from_slice::<Value>(&bytes).map_err(|e| {
                    EventstoreError::invalid_argument(format!("payload bytes are not json: {e}"))
                })?;
                Ok(Some(bytes))
            }
            Self::Json(value) => serde_json::to_vec(&value)
                .map(Some)
                .map_err(|e| EventstoreError::internal(format!("unable to encode payload: {e}"))),
        }
    }
}

const fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// What a unique constraint does when its event is pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniqueConstraintAction {
    /// Reserve the key; fails if it is taken.
    Add,
    /// Release the key.
    Remove,
    /// Release every key of the instance.
    InstanceRemove,
}

/// A global uniqueness assertion checked when the event is pushed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniqueConstraint {
    /// Namespace of the key, e.g. `usernames`.
    pub unique_type: String,
    /// The reserved value.
    pub unique_field: String,
    /// Add or remove.
    pub action: UniqueConstraintAction,
    /// Message returned in `AlreadyExists` when an `Add` collides.
    pub error_message: String,
    /// Whether the key spans all instances.
    pub is_global: bool,
}

impl UniqueConstraint {
    /// Reserves `unique_field` within the aggregate's instance.
    pub fn add(
        unique_type: impl Into<String>,
        unique_field: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            unique_type: unique_type.into(),
            unique_field: unique_field.into(),
            action: UniqueConstraintAction::Add,
            error_message: error_message.into(),
            is_global: false,
        }
    }

    /// Reserves `unique_field` across all instances.
    pub fn add_global(
        unique_type: impl Into<String>,
        unique_field: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            is_global: true,
            ..Self::add(unique_type, unique_field, error_message)
        }
    }

    /// Releases `unique_field` within the aggregate's instance.
    pub fn remove(unique_type: impl Into<String>, unique_field: impl Into<String>) -> Self {
        Self {
            unique_type: unique_type.into(),
            unique_field: unique_field.into(),
            action: UniqueConstraintAction::Remove,
            error_message: String::new(),
            is_global: false,
        }
    }

    /// Releases a global `unique_field`.
    pub fn remove_global(unique_type: impl Into<String>, unique_field: impl Into<String>) -> Self {
        Self {
            is_global: true,
            ..Self::remove(unique_type, unique_field)
        }
    }

    /// Releases every key of the aggregate's instance.
    pub fn remove_instance() -> Self {
        Self {
            unique_type: String::new(),
            unique_field: String::new(),
            action: UniqueConstraintAction::InstanceRemove,
            error_message: String::new(),
            is_global: false,
        }
    }
}

/// General purpose command built from values.
#[derive(Debug, Clone)]
pub struct EventCommand {
    aggregate: Aggregate,
    event_type: EventType,
    editor_user: String,
    editor_service: String,
    payload: Result<Payload, EventstoreError>,
    unique_constraints: Vec<UniqueConstraint>,
    expected_sequence: Option<u64>,
}

impl EventCommand {
    /// Creates a command without payload.
    pub fn new(aggregate: Aggregate, event_type: impl Into<EventType>) -> Self {
        Self {
            aggregate,
            event_type: event_type.into(),
            editor_user: String::new(),
            editor_service: String::new(),
            payload: Ok(Payload::None),
            unique_constraints: Vec::new(),
            expected_sequence: None,
        }
    }

    /// Serializes `payload`. A rejected payload fails the push.
    #[must_use]
    pub fn with_payload<T: Serialize + ?Sized>(mut self, payload: &T) -> Self {
        self.payload = Payload::serialize(payload);
        self
    }

    /// Uses already serialized JSON as payload.
    #[must_use]
    pub fn with_payload_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.payload = Ok(Payload::Bytes(bytes.into()));
        self
    }

    /// Records who issued the command.
    #[must_use]
    pub fn with_editor(mut self, user: impl Into<String>, service: impl Into<String>) -> Self {
        self.editor_user = user.into();
        self.editor_service = service.into();
        self
    }

    /// Adds a unique constraint.
    #[must_use]
    pub fn with_unique_constraint(mut self, constraint: UniqueConstraint) -> Self {
        self.unique_constraints.push(constraint);
        self
    }

    /// Requires the aggregate to still be at `sequence`.
    #[must_use]
    pub const fn with_expected_sequence(mut self, sequence: u64) -> Self {
        self.expected_sequence = Some(sequence);
        self
    }
}

impl Command for EventCommand {
    fn aggregate(&self) -> &Aggregate {
        &self.aggregate
    }

    fn event_type(&self) -> &EventType {
        &self.event_type
    }

    fn editor_user(&self) -> &str {
        &self.editor_user
    }

    fn editor_service(&self) -> &str {
        &self.editor_service
    }

    fn payload(&self) -> EventstoreResult<Payload> {
        self.payload.clone()
    }

    fn unique_constraints(&self) -> Vec<UniqueConstraint> {
        self.unique_constraints.clone()
    }

    fn expected_sequence(&self) -> Option<u64> {
        self.expected_sequence
    }
}
