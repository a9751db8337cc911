// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Array-schema and fragment-metadata caches.
//!
//! Unlike the tile cache (`crate::cache`), §8's exact-order assertions
//! don't apply here, so a `quick_cache`-backed approximate-LRU is enough.

use crate::uri::Uri;
use quick_cache::sync::Cache;
use quick_cache::UnitWeighter;
use std::sync::Arc;

/// Caches decoded fragment-metadata blobs keyed by fragment URI.
pub struct FragmentMetadataCache {
    inner: Cache<Uri, Arc<Vec<u8>>, UnitWeighter, rustc_hash::FxBuildHasher>,
}

impl FragmentMetadataCache {
    /// Creates a cache sized by an approximate item budget.
    ///
    /// `quick_cache` sizes by weighted item count, not raw bytes; callers
    /// pick `capacity_items` from the configured byte budget divided by a
    /// typical fragment-metadata blob size.
    #[must_use]
    pub fn with_capacity(capacity_items: usize) -> Self {
        use quick_cache::sync::DefaultLifecycle;

        #[allow(clippy::default_trait_access)]
        let inner = Cache::with(1_000, capacity_items.max(1) as u64, UnitWeighter, Default::default(), DefaultLifecycle::default());
        Self { inner }
    }

    /// Returns the cached blob for `uri`, if present.
    #[must_use]
    pub fn get(&self, uri: &Uri) -> Option<Arc<Vec<u8>>> {
        self.inner.get(uri)
    }

    /// Inserts a decoded blob into the cache.
    pub fn insert(&self, uri: Uri, blob: Arc<Vec<u8>>) {
        self.inner.insert(uri, blob);
    }
}

/// Caches decoded array-schema blobs keyed by array URI.
pub struct ArraySchemaCache {
    inner: Cache<Uri, Arc<crate::schema::Schema>, UnitWeighter, rustc_hash::FxBuildHasher>,
}

impl ArraySchemaCache {
    /// Creates a cache sized by an approximate item budget.
    #[must_use]
    pub fn with_capacity(capacity_items: usize) -> Self {
        use quick_cache::sync::DefaultLifecycle;

        #[allow(clippy::default_trait_access)]
        let inner = Cache::with(1_000, capacity_items.max(1) as u64, UnitWeighter, Default::default(), DefaultLifecycle::default());
        Self { inner }
    }

    /// Returns the cached schema for `uri`, if present.
    #[must_use]
    pub fn get(&self, uri: &Uri) -> Option<Arc<crate::schema::Schema>> {
        self.inner.get(uri)
    }

    /// Inserts a decoded schema into the cache.
    pub fn insert(&self, uri: Uri, schema: Arc<crate::schema::Schema>) {
        self.inner.insert(uri, schema);
    }
}
