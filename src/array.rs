// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Array lifecycle: create, open, close (§3, §6).
//!
//! Creation writes the schema blob once, atomically, and fails if one
//! already exists. Opening takes the shared in-process/filelock
//! (§4.9: both readers and writers hold a shared lock — only
//! consolidation needs exclusive access) and loads the schema, consulting
//! the context's schema cache first.

use crate::coding::{Decode, Encode};
use crate::context::Context;
use crate::locking::LockedArray;
use crate::schema::{Attribute, Schema};
use crate::uri::{names, Uri};
use crate::{Error, Result};
use std::sync::Arc;

/// Whether an array handle was opened to read existing fragments or to
/// write new ones (§3). Both modes take a shared lock; see
/// [`crate::locking`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QueryType {
    /// Opened for reading.
    Read,
    /// Opened for writing.
    Write,
}

/// An open handle to an array: its location, schema, and the lock held
/// for the duration of the handle.
pub struct Array {
    uri: Uri,
    schema: Arc<Schema>,
    mode: QueryType,
    locked: Arc<LockedArray>,
    ctx: Arc<Context>,
}

impl Array {
    /// Creates a new array directory and writes its schema blob.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] if `uri` already names an array (an
    /// existing schema blob).
    pub fn create(ctx: &Context, uri: &Uri, schema: &Schema) -> Result<()> {
        if ctx.vfs.is_file(&uri.join(names::ARRAY_SCHEMA))? {
            return Err(Error::Schema(format!("array already exists at {uri}")));
        }
        ctx.vfs.create_dir(uri)?;
        let tmp = uri.join(&format!("{}.tmp", names::ARRAY_SCHEMA));
        ctx.vfs.write(&tmp, &schema.encode_into_vec())?;
        ctx.vfs.flush(&tmp)?;
        ctx.vfs.move_path(&tmp, &uri.join(names::ARRAY_SCHEMA))?;
        Ok(())
    }

    /// Opens an existing array for reading or writing, taking a shared
    /// lock and loading its schema (consulting the context's schema
    /// cache first).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] if no schema blob exists at `uri`, or
    /// [`Error::Lock`] if the filelock cannot be acquired.
    pub fn open(ctx: Arc<Context>, uri: &Uri, mode: QueryType) -> Result<Self> {
        let locked = ctx.lock_registry.get_or_create(uri);
        locked.lock_shared(ctx.vfs.as_ref(), &uri.join(names::LOCK))?;

        let schema = match ctx.array_schema_cache.get(uri) {
            Some(schema) => schema,
            None => {
                let schema_uri = uri.join(names::ARRAY_SCHEMA);
                if !ctx.vfs.is_file(&schema_uri)? {
                    locked.unlock_shared(ctx.vfs.as_ref())?;
                    return Err(Error::Schema(format!("no array at {uri}")));
                }
                let bytes = ctx.vfs.read_all(&schema_uri)?;
                let schema = Arc::new(Schema::decode_from(&mut std::io::Cursor::new(bytes))?);
                ctx.array_schema_cache.insert(uri.clone(), schema.clone());
                schema
            }
        };

        Ok(Self {
            uri: uri.clone(),
            schema,
            mode,
            locked,
            ctx,
        })
    }

    /// Releases the lock held by this handle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lock`] if the underlying filelock release fails.
    pub fn close(self) -> Result<()> {
        self.locked.unlock_shared(self.ctx.vfs.as_ref())
    }

    /// The array's location.
    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The loaded schema.
    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// The mode this handle was opened in.
    #[must_use]
    pub fn mode(&self) -> QueryType {
        self.mode
    }

    /// Shared context (caches, stats, VFS).
    #[must_use]
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Lists committed fragment directories: child directories containing
    /// the fragment sentinel file, sorted by fragment timestamp (encoded
    /// in the directory name).
    ///
    /// # Errors
    ///
    /// Propagates [`crate::vfs::Vfs::ls`]'s errors.
    pub fn fragment_uris(&self) -> Result<Vec<Uri>> {
        let mut fragments: Vec<Uri> = self
            .ctx
            .vfs
            .ls(&self.uri)?
            .into_iter()
            .filter(|entry| {
                self.ctx
                    .vfs
                    .is_file(&entry.join(names::FRAGMENT_SENTINEL))
                    .unwrap_or(false)
            })
            .collect();
        fragments.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(fragments)
    }

    /// Evolves the array's schema (SPEC_FULL §F.3): adds or drops
    /// attributes effective at `timestamp_ms`, then atomically republishes
    /// the schema blob and refreshes the context's schema cache so later
    /// `Array::open` calls see the evolved schema immediately.
    ///
    /// Takes the array's exclusive lock for the duration of the
    /// filesystem swap, mirroring [`Self::with_exclusive_lock`]'s
    /// discipline for consolidation/vacuum.
    ///
    /// # Errors
    ///
    /// Propagates [`crate::schema::Schema::evolve`]'s validation errors
    /// (non-increasing timestamp, name collisions, unknown drops), or
    /// [`Error::Lock`]/I/O errors from republishing the blob.
    pub fn evolve(&mut self, timestamp_ms: u64, added: Vec<Attribute>, dropped: &[String]) -> Result<()> {
        let mut schema = (*self.schema).clone();
        self.with_exclusive_lock(|| {
            schema.evolve(timestamp_ms, added, dropped)?;
            let tmp = self.uri.join(&format!("{}.tmp", names::ARRAY_SCHEMA));
            self.ctx.vfs.write(&tmp, &schema.encode_into_vec())?;
            self.ctx.vfs.flush(&tmp)?;
            self.ctx.vfs.move_path(&tmp, &self.uri.join(names::ARRAY_SCHEMA))?;
            Ok(())
        })?;
        let schema = Arc::new(schema);
        self.ctx.array_schema_cache.insert(self.uri.clone(), schema.clone());
        self.schema = schema;
        Ok(())
    }

    /// Acquires the exclusive lock for the duration of `f` (consolidation,
    /// vacuum). Releases it before returning, even if `f` errors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lock`] if the filelock cannot be acquired, or
    /// propagates `f`'s error.
    pub fn with_exclusive_lock<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.locked.lock_exclusive(self.ctx.vfs.as_ref(), &self.uri.join(names::LOCK))?;
        let result = f();
        self.locked.unlock_exclusive(self.ctx.vfs.as_ref())?;
        result
    }
}

impl std::fmt::Debug for Array {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Array")
            .field("uri", &self.uri)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Read => "Read",
                Self::Write => "Write",
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::datatype::Datatype;
    use crate::domain::{Dimension, Order};
    use crate::schema::{ArrayType, Attribute};
    use test_log::test;

    fn test_schema() -> Schema {
        Schema::new(
            ArrayType::Dense,
            crate::domain::Domain::new(vec![Dimension::new_integral("x", Datatype::Int32, 1, 10, 5)]),
            Order::RowMajor,
            Order::RowMajor,
            1000,
            vec![Attribute::new("a", Datatype::Int32, 1)],
        )
        .unwrap()
    }

    #[test]
    fn create_then_open_round_trips_schema() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(Context::new(Config::new()));
        let uri = Uri::new(dir.path().join("my_array"));
        let schema = test_schema();

        Array::create(&ctx, &uri, &schema).unwrap();
        let array = Array::open(ctx.clone(), &uri, QueryType::Read).unwrap();
        assert_eq!(array.schema().as_ref(), &schema);
        array.close().unwrap();
    }

    #[test]
    fn create_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(Context::new(Config::new()));
        let uri = Uri::new(dir.path().join("my_array"));
        let schema = test_schema();

        Array::create(&ctx, &uri, &schema).unwrap();
        assert!(Array::create(&ctx, &uri, &schema).is_err());
    }

    #[test]
    fn open_missing_array_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(Context::new(Config::new()));
        let uri = Uri::new(dir.path().join("missing"));
        assert!(Array::open(ctx, &uri, QueryType::Read).is_err());
    }

    #[test]
    fn fragment_uris_lists_only_committed_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(Context::new(Config::new()));
        let uri = Uri::new(dir.path().join("my_array"));
        Array::create(&ctx, &uri, &test_schema()).unwrap();

        let committed = uri.join("__1_100_0");
        ctx.vfs.create_dir(&committed).unwrap();
        ctx.vfs
            .create_file(&committed.join(names::FRAGMENT_SENTINEL))
            .unwrap();

        let partial = uri.join("__1_200_0");
        ctx.vfs.create_dir(&partial).unwrap();

        let array = Array::open(ctx, &uri, QueryType::Read).unwrap();
        let fragments = array.fragment_uris().unwrap();
        assert_eq!(fragments, vec![committed]);
    }
}
