// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-subsystem counters (SPEC_FULL §F.2).
//!
//! Purely additive bookkeeping, registered against a [`crate::context::Context`].
//! Never consulted for control flow (§7).

use std::sync::atomic::{AtomicU64, Ordering};

/// One named counter. Cheap to increment from multiple threads.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Adds `n` to the counter.
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Registry of engine-wide counters, one [`Stats`] shared per [`crate::context::Context`].
#[derive(Debug, Default)]
pub struct Stats {
    /// Tiles read from disk (cache misses that triggered I/O).
    pub tiles_read: Counter,
    /// Tile-cache hits.
    pub tile_cache_hits: Counter,
    /// Tile-cache misses.
    pub tile_cache_misses: Counter,
    /// Bytes fed into the forward filter pipeline on write.
    pub bytes_compressed_in: Counter,
    /// Bytes produced by the forward filter pipeline on write.
    pub bytes_compressed_out: Counter,
    /// Bytes written to attribute files.
    pub bytes_written: Counter,
    /// Fragments written.
    pub fragments_written: Counter,
    /// Fragments removed by consolidation or vacuum.
    pub fragments_removed: Counter,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::default();
        stats.tiles_read.add(3);
        stats.tiles_read.add(4);
        assert_eq!(stats.tiles_read.get(), 7);
        assert_eq!(stats.tile_cache_hits.get(), 0);
    }
}
