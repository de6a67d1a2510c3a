//! Append-only event log and projection engine.
//!
//! The [`Eventstore`] persists [`Command`]s as sequenced events through a
//! [`Repository`], maps stored rows back into typed [`Event`]s and announces
//! pushed events on an in-process [`SubscriptionBus`]. The [`handler`]
//! module folds the log into relational read models: projections reduce
//! events into SQL [`Statement`](handler::Statement)s which the
//! [`ProjectionHandler`](handler::ProjectionHandler) executes together with
//! the projection's cursor in one transaction.
//!
//! # Example
//!
//! ```rust,ignore
//! let eventstore = Eventstore::new(Arc::new(InMemoryRepository::new()));
//! eventstore.register_filter_event_mapper("user.added", BaseEvent::mapper());
//!
//! let command = EventCommand::new(Aggregate::new("u1", "user", "v1"), "user.added")
//!     .with_payload(&UserAdded { username: "ada".into() });
//! let events = eventstore.push(&[&command]).await?;
//!
//! let users = SearchQueryBuilder::new(Columns::Event)
//!     .add_query()
//!     .aggregate_types(["user"])
//!     .builder();
//! let stored = eventstore.filter(&users).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
pub mod config;
pub mod errors;
pub mod event;
mod eventstore;
pub mod handler;
pub mod read_model;
pub mod repository;
pub mod search;
pub mod subscription;
pub mod types;
mod utils;

pub use command::{Command, EventCommand, Payload, UniqueConstraint, UniqueConstraintAction};
pub use config::{BulkLimit, EventstoreConfig, HandlerConfig, MaxFailureCount, SubscriptionCapacity};
pub use errors::{
    EventstoreError, EventstoreResult, ProjectionError, ProjectionResult, StatementError,
};
pub use event::{downcast, Aggregate, BaseEvent, Event, EventMapper, PayloadEvent, RawEvent};
pub use eventstore::Eventstore;
pub use read_model::{ReadModel, Reducer};
pub use repository::{
    Field, Filter, FilterValue, PendingConstraint, PendingEvent, Query, Repository,
};
pub use search::{Columns, SearchQuery, SearchQueryBuilder};
pub use subscription::{Subscription, SubscriptionBus};
pub use types::{AggregateId, AggregateType, EventType, InstanceId, ResourceOwner, Version};
