//! Integration tests for the eventstore crates
//!
//! The tests in `tests/` drive the `Eventstore`, the subscription bus and
//! projection handlers end to end on the in-memory adapters.

// This is a test-only crate
#![cfg(test)]
