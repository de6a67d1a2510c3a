//! In-memory adapters for the eventstore crate.
//!
//! [`InMemoryRepository`] stores events in a vector and evaluates compiled
//! queries with [`Query::matches`](eventstore::Query::matches).
//! [`InMemoryProjectionStore`] keeps cursors, failures and leases in maps
//! and records every executed statement instead of running SQL. Both are
//! meant for tests and local development.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

mod projection_store;
mod repository;

pub use projection_store::{ExecutedStatement, InMemoryProjectionStore};
pub use repository::InMemoryRepository;
