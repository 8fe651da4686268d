// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resilient lock helpers.
//!
//! The download registry is touched by every transfer task and every progress
//! or cancel request. A panic inside one job task must not turn every later
//! request into a panic, so poisoned locks are recovered and logged instead.
//!
//! ```no_run
//! use std::sync::RwLock;
//! use bookfetch::security::locks::{resilient_read, resilient_write};
//!
//! let progress = RwLock::new(0u8);
//! *resilient_write(&progress) = 25;
//! assert_eq!(*resilient_read(&progress), 25);
//! ```

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering the guard if the lock is poisoned.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "security::locks",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition, recovering. \
                 A download task panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering the guard if the lock is poisoned.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "security::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition, recovering. \
                 A download task panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_resilient_write_then_read() {
        let lock = RwLock::new(HashMap::new());
        resilient_write(&lock).insert("job", 40u8);
        assert_eq!(resilient_read(&lock).get("job"), Some(&40));
    }

    #[test]
    fn test_recovers_after_panicking_writer() {
        let lock = Arc::new(RwLock::new(HashMap::from([("job", 10u8)])));
        let lock_clone = Arc::clone(&lock);

        // Poison the lock by panicking while holding it
        let handle = thread::spawn(move || {
            let mut guard = lock_clone.write().unwrap();
            guard.insert("job", 20);
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        assert!(lock.is_poisoned());
        assert_eq!(resilient_read(&lock).get("job"), Some(&20));

        resilient_write(&lock).remove("job");
        assert!(resilient_read(&lock).is_empty());
    }
}
