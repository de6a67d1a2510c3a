//! Eventstore Benchmarks
//!
//! Performance benchmarks for pushing and filtering events, fanning pushed
//! events out to subscribers, rendering projection statements and running
//! projection handlers against the in-memory stores.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]

use eventstore::{Aggregate, EventCommand};
use serde::Serialize;

/// Payload used by every benchmark.
#[derive(Debug, Clone, Serialize)]
pub struct UserAdded {
    /// Login name.
    pub username: String,
}

/// A `user.added` command for `id` on `instance`.
pub fn user_added(instance: &str, id: &str) -> EventCommand {
    EventCommand::new(
        Aggregate::new(id, "user", "v1")
            .with_instance_id(instance)
            .with_resource_owner("org"),
        "user.added",
    )
    .with_payload(&UserAdded {
        username: format!("user-{id}"),
    })
}
