// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::atomic::{AtomicU32, Ordering};

/// Gets the unix timestamp in milliseconds.
///
/// Fragment names embed this to establish total order between writers.
#[must_use]
pub fn unix_timestamp_millis() -> u64 {
    #[cfg(test)]
    {
        if let Some(cell) = NOW_OVERRIDE.get() {
            if let Some(override_val) = *cell.lock().expect("lock is poisoned") {
                return override_val;
            }
        }
    }

    #[expect(clippy::expect_used, reason = "trivial")]
    let now = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .expect("time went backwards");

    now.as_millis() as u64
}

/// Process-wide counter used to disambiguate fragments written in the same
/// millisecond by the same process.
static FRAGMENT_SEQ: AtomicU32 = AtomicU32::new(0);

/// Returns a `(timestamp_ms, disambiguator)` pair unique within this process.
///
/// Two writers racing in the same millisecond get distinct fragment names;
/// true cross-process ordering still comes from the millisecond timestamp.
#[must_use]
pub fn next_fragment_timestamp() -> (u64, u32) {
    let seq = FRAGMENT_SEQ.fetch_add(1, Ordering::SeqCst);
    (unix_timestamp_millis(), seq)
}

#[cfg(test)]
use std::sync::{Mutex, OnceLock};

#[cfg(test)]
static NOW_OVERRIDE: OnceLock<Mutex<Option<u64>>> = OnceLock::new();

#[cfg(test)]
pub(crate) fn set_unix_timestamp_for_test(value: Option<u64>) {
    let cell = NOW_OVERRIDE.get_or_init(|| Mutex::new(None));
    *cell.lock().expect("lock is poisoned") = value;
}
