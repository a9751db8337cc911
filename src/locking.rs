// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! In-process + filelock locking discipline for one open array (§4.9, §3).
//!
//! Grounded in `storage_manager/locked_array.{h,cc}`: an array held open by
//! several threads in one process coalesces their shared locks into a
//! single OS filelock, and a single exclusive holder (a writer finalizing
//! a fragment, or a consolidator swapping fragments) excludes every other
//! in-process holder as well as other processes. Unlike the source, which
//! releases and reacquires the OS filelock on every lock/unlock call, this
//! releases it only once the in-process hold count returns to zero — the
//! explicit invariant spec.md states for this component.

use crate::uri::Uri;
use crate::vfs::{LockHandle, LockKind, Vfs};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

struct State {
    /// Count of in-process shared holders.
    shared_locks: u32,
    /// Whether an in-process exclusive holder currently holds the lock.
    exclusive_lock: bool,
    /// The OS filelock, held only while `shared_locks > 0 || exclusive_lock`.
    filelock: Option<LockHandle>,
}

/// Per-process registry of [`LockedArray`]s, so threads opening the same
/// array URI share one in-process lock state (§3: "handles are
/// process-local; two opens of the same URI in one process share state").
#[derive(Default)]
pub struct LockRegistry {
    arrays: Mutex<HashMap<Uri, Arc<LockedArray>>>,
}

impl LockRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the [`LockedArray`] for `uri`, creating it if this is the
    /// first open of that URI in this registry.
    pub fn get_or_create(&self, uri: &Uri) -> Arc<LockedArray> {
        let mut arrays = self.arrays.lock().expect("lock poisoned");
        arrays
            .entry(uri.clone())
            .or_insert_with(|| Arc::new(LockedArray::new(uri.clone())))
            .clone()
    }
}

/// The lock state for one open array, shared by every in-process handle
/// to it.
pub struct LockedArray {
    uri: Uri,
    state: Mutex<State>,
    cv: Condvar,
}

impl LockedArray {
    fn new(uri: Uri) -> Self {
        Self {
            uri,
            state: Mutex::new(State {
                shared_locks: 0,
                exclusive_lock: false,
                filelock: None,
            }),
            cv: Condvar::new(),
        }
    }

    /// Acquires a shared (reader) lock, blocking while an exclusive holder
    /// is active. Acquires the OS filelock on the first in-process shared
    /// hold.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lock`] if the underlying filelock acquisition
    /// fails (e.g. the lock file cannot be created).
    pub fn lock_shared(&self, vfs: &dyn Vfs, lock_uri: &Uri) -> Result<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        while state.exclusive_lock {
            state = self.cv.wait(state).expect("lock poisoned");
        }
        if state.shared_locks == 0 && state.filelock.is_none() {
            let handle = vfs
                .filelock_lock(lock_uri, LockKind::Shared)
                .map_err(|e| Error::Lock(format!("failed to lock {}: {e}", self.uri)))?;
            state.filelock = Some(handle);
        }
        state.shared_locks += 1;
        Ok(())
    }

    /// Releases one shared hold, releasing the OS filelock once the
    /// in-process count returns to zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lock`] if called with no shared hold outstanding,
    /// or if the underlying filelock release fails.
    pub fn unlock_shared(&self, vfs: &dyn Vfs) -> Result<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.shared_locks == 0 {
            return Err(Error::Lock(format!("{} has no shared lock to release", self.uri)));
        }
        state.shared_locks -= 1;
        if state.shared_locks == 0 {
            if let Some(handle) = state.filelock.take() {
                vfs.filelock_unlock(handle)
                    .map_err(|e| Error::Lock(format!("failed to unlock {}: {e}", self.uri)))?;
            }
        }
        self.cv.notify_all();
        Ok(())
    }

    /// Acquires the exclusive (writer/consolidator) lock, blocking until
    /// no shared or exclusive holder remains.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lock`] if the underlying filelock acquisition fails.
    pub fn lock_exclusive(&self, vfs: &dyn Vfs, lock_uri: &Uri) -> Result<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        while state.exclusive_lock || state.shared_locks > 0 {
            state = self.cv.wait(state).expect("lock poisoned");
        }
        let handle = vfs
            .filelock_lock(lock_uri, LockKind::Exclusive)
            .map_err(|e| Error::Lock(format!("failed to lock {}: {e}", self.uri)))?;
        state.filelock = Some(handle);
        state.exclusive_lock = true;
        Ok(())
    }

    /// Releases the exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lock`] if no exclusive hold is active, or if the
    /// underlying filelock release fails.
    pub fn unlock_exclusive(&self, vfs: &dyn Vfs) -> Result<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        if !state.exclusive_lock {
            return Err(Error::Lock(format!("{} has no exclusive lock to release", self.uri)));
        }
        if let Some(handle) = state.filelock.take() {
            vfs.filelock_unlock(handle)
                .map_err(|e| Error::Lock(format!("failed to unlock {}: {e}", self.uri)))?;
        }
        state.exclusive_lock = false;
        self.cv.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::LocalVfs;
    use test_log::test;

    #[test]
    fn shared_locks_coalesce_one_filelock() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = LocalVfs;
        let array_uri = Uri::new(dir.path());
        let lock_uri = array_uri.join("__lock.tdb");
        let locked = LockedArray::new(array_uri);

        locked.lock_shared(&vfs, &lock_uri).unwrap();
        locked.lock_shared(&vfs, &lock_uri).unwrap();
        {
            let state = locked.state.lock().unwrap();
            assert_eq!(state.shared_locks, 2);
            assert!(state.filelock.is_some());
        }
        locked.unlock_shared(&vfs).unwrap();
        {
            let state = locked.state.lock().unwrap();
            assert!(state.filelock.is_some());
        }
        locked.unlock_shared(&vfs).unwrap();
        {
            let state = locked.state.lock().unwrap();
            assert!(state.filelock.is_none());
        }
    }

    #[test]
    fn exclusive_unlock_without_lock_fails() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = LocalVfs;
        let array_uri = Uri::new(dir.path());
        let locked = LockedArray::new(array_uri);
        assert!(locked.unlock_exclusive(&vfs).is_err());
    }

    #[test]
    fn exclusive_then_shared_sequence_is_mutually_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = LocalVfs;
        let array_uri = Uri::new(dir.path());
        let lock_uri = array_uri.join("__lock.tdb");
        let locked = LockedArray::new(array_uri);

        locked.lock_exclusive(&vfs, &lock_uri).unwrap();
        locked.unlock_exclusive(&vfs).unwrap();

        locked.lock_shared(&vfs, &lock_uri).unwrap();
        locked.unlock_shared(&vfs).unwrap();
    }

    #[test]
    fn registry_shares_state_across_opens_of_same_uri() {
        let dir = tempfile::tempdir().unwrap();
        let registry = LockRegistry::new();
        let uri = Uri::new(dir.path());

        let a = registry.get_or_create(&uri);
        let b = registry.get_or_create(&uri);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
