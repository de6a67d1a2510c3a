//! Internal helpers.

pub mod lock_recovery;
