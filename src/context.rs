// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The shared runtime state threaded into array/query/consolidator
//! operations (SPEC_FULL §F.1), replacing the source's global singletons
//! for the tile cache, metadata caches, and stats.

use crate::cache::TileCache;
use crate::config::Config;
use crate::locking::LockRegistry;
use crate::metadata_cache::{ArraySchemaCache, FragmentMetadataCache};
use crate::stats::Stats;
use crate::vfs::{LocalVfs, Vfs};
use std::sync::Arc;

/// Rough average size, in bytes, assumed for one cached schema/fragment
/// metadata blob when converting a byte budget into `quick_cache`'s
/// item-count capacity.
const ASSUMED_METADATA_BLOB_SIZE: usize = 64 * 1024;

/// Shared engine state: one `Context` is built per embedding process (or
/// per test) and passed by reference into [`crate::array::Array::open`],
/// a query's `submit`, and [`crate::consolidator`] operations.
pub struct Context {
    /// Resolved configuration this context was built from.
    pub config: Config,
    /// Backing filesystem.
    pub vfs: Arc<dyn Vfs>,
    /// Strict-LRU decoded-tile cache (§4.5).
    pub tile_cache: Arc<TileCache>,
    /// Approximate-LRU cache of decoded fragment-metadata blobs.
    pub fragment_metadata_cache: Arc<FragmentMetadataCache>,
    /// Approximate-LRU cache of decoded array schemas.
    pub array_schema_cache: Arc<ArraySchemaCache>,
    /// Counters for diagnostics; never consulted for control flow (§7).
    pub stats: Arc<Stats>,
    /// Per-process in-process/filelock coordination (§4.9).
    pub lock_registry: Arc<LockRegistry>,
}

impl Context {
    /// Builds a context over the local filesystem, sizing the caches from
    /// `config`'s byte budgets.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_vfs(config, Arc::new(LocalVfs))
    }

    /// Builds a context over a caller-supplied [`Vfs`] backend.
    #[must_use]
    pub fn with_vfs(config: Config, vfs: Arc<dyn Vfs>) -> Self {
        let tile_cache = Arc::new(TileCache::with_capacity_bytes(config.tile_cache_size));
        let fragment_metadata_cache = Arc::new(FragmentMetadataCache::with_capacity(
            (config.fragment_metadata_cache_size / ASSUMED_METADATA_BLOB_SIZE).max(1),
        ));
        let array_schema_cache = Arc::new(ArraySchemaCache::with_capacity(
            (config.array_metadata_cache_size / ASSUMED_METADATA_BLOB_SIZE).max(1),
        ));
        Self {
            config,
            vfs,
            tile_cache,
            fragment_metadata_cache,
            array_schema_cache,
            stats: Arc::new(Stats::default()),
            lock_registry: Arc::new(LockRegistry::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn new_sizes_caches_from_config() {
        let ctx = Context::new(Config::new().tile_cache_size(1024));
        assert_eq!(ctx.tile_cache.current_size(), 0);
        assert_eq!(ctx.stats.tiles_read.get(), 0);
    }
}
