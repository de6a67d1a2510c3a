//! Projection handler and the statement builder it executes.
//!
//! - [`statement`]: SQL statements produced by `reduce` functions
//! - [`table`]: table definitions created by a projection's init check
//! - [`store`]: transactional persistence of cursors, failures and leases
//! - [`ProjectionHandler`]: the catch-up and live processing loop

pub mod executor;
pub mod projection;
mod runner;
pub mod statement;
pub mod store;
pub mod table;

pub use executor::{Executor, SqlValue};
pub use projection::{AggregateReducer, EventReducer, Projection, ReduceFn};
pub use runner::{HandlerHandle, HandlerState, ProjectionHandler};
pub use statement::{
    add_copy_statement, add_create_statement, add_delete_statement, add_no_op_statement,
    add_update_statement, add_upsert_statement, new_array_append_col, new_array_remove_col,
    new_copy_col, new_copy_statement, new_create_statement, new_delete_statement,
    new_multi_statement, new_no_op_statement, new_statement, new_update_statement,
    new_upsert_statement, Column, ColumnValue, Condition, Execute, Operation, Statement,
};
pub use store::{FailedEvent, ProjectionStore, ProjectionTransaction};
pub use table::{ColumnDef, ColumnType, Index, Table, TableCheck};
