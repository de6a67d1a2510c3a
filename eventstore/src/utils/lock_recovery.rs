//! Recovery from poisoned locks.
//!
//! The mapper registry and the subscription registry are plain std locks.
//! A panic in a subscriber callback or a mapper must not take the whole
//! eventstore down with it, so guards are taken from the poison error
//! instead of propagating the panic. Both registries stay consistent across
//! a panic because every mutation is a single insert or remove.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Extension trait for `RwLock` that ignores poisoning.
pub trait RwLockRecovery<T> {
    /// Acquires a read lock, recovering from poison.
    fn read_recover(&self) -> RwLockReadGuard<'_, T>;

    /// Acquires a write lock, recovering from poison.
    fn write_recover(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> RwLockRecovery<T> for RwLock<T> {
    fn read_recover(&self) -> RwLockReadGuard<'_, T> {
        self.read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_recover(&self) -> RwLockWriteGuard<'_, T> {
        self.write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Extension trait for `Mutex` that ignores poisoning.
pub trait MutexRecovery<T> {
    /// Acquires the lock, recovering from poison.
    fn lock_recover(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexRecovery<T> for Mutex<T> {
    fn lock_recover(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
