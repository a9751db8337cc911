// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Fragment consolidation and vacuum (§4.10).
//!
//! Consolidation merges a step-window of fragments into one, without
//! changing query results: it reads the window in global order, writes
//! the merged result as a single new fragment, renames that fragment to
//! a timestamp past every input's, then deletes the inputs under the
//! exclusive lock. The new fragment's sentinel is only created on
//! success (ordinary [`crate::writer::Writer::finalize`] semantics), so a
//! crash mid-consolidation leaves the inputs untouched and a sentinel-less
//! partial fragment that readers already ignore.
//!
//! Simplification (see `DESIGN.md`): the whole window is read and
//! rewritten in one pass with no `max_cells` cap, so `read_fragments`
//! always returns every matching cell in a single call here, never
//! `Incomplete`.
//!
//! Vacuum is independent of consolidation: it scans for fragment
//! directories missing the publication sentinel (left behind by a
//! crashed or cancelled write) and removes them.

use crate::array::Array;
use crate::coding::Decode;
use crate::fragment::FragmentMetadata;
use crate::query::Layout;
use crate::reader::{self, ReadCursor};
use crate::uri::{fragment_dir_name, names, Uri};
use crate::writer::{CellBatch, Writer};
use crate::Result;

/// Runs consolidation and vacuum passes over one array.
pub struct Consolidator<'a> {
    array: &'a Array,
}

impl<'a> Consolidator<'a> {
    /// Builds a consolidator over `array`.
    #[must_use]
    pub fn new(array: &'a Array) -> Self {
        Self { array }
    }

    /// Merges the oldest eligible step-window of fragments (§4.10, sized
    /// by `sm.consolidation.step_min_frags`/`step_max_frags`) into one new
    /// fragment, and deletes the inputs. Returns `Ok(None)` if fewer than
    /// `step_min_frags` fragments are committed, or if the window has no
    /// cells to merge (nothing to consolidate).
    ///
    /// # Errors
    ///
    /// Propagates I/O, decode, filter, and lock errors. Leaves the
    /// existing fragments untouched if any step fails before the
    /// exclusive-lock deletion phase.
    pub fn consolidate(&self) -> Result<Option<Uri>> {
        let ctx = self.array.context();
        let min_frags = ctx.config.consolidation_step_min_frags as usize;
        let max_frags = ctx.config.consolidation_step_max_frags as usize;

        let fragments = self.array.fragment_uris()?;
        if fragments.len() < min_frags.max(2) {
            return Ok(None);
        }
        let window: Vec<Uri> = fragments.into_iter().take(max_frags).collect();

        let mut max_input_ts = 0u64;
        for uri in &window {
            max_input_ts = max_input_ts.max(self.fragment_timestamp(uri)?);
        }

        let schema = self.array.schema();
        let full_ranges: Vec<Vec<(i64, i64)>> = schema
            .domain
            .dimensions
            .iter()
            .map(|dim| vec![(dim.lo.as_i64(), dim.hi.as_i64())])
            .collect();

        let mut cursor = ReadCursor::default();
        let result = reader::read_fragments(self.array, Layout::GlobalOrder, &full_ranges, &window, &mut cursor, None)?;
        if result.coords.is_empty() {
            return Ok(None);
        }

        let mut writer = Writer::new(self.array, Layout::GlobalOrder);
        writer.write_batch(CellBatch {
            coords: result.coords,
            attributes: result.attributes,
            offsets: result.offsets,
            validity: result.validity,
        })?;
        let mut new_fragment_uri = writer.finalize()?;

        if self.fragment_timestamp(&new_fragment_uri)? <= max_input_ts {
            let renamed = self
                .array
                .uri()
                .join(&fragment_dir_name(std::process::id(), max_input_ts + 1, 0));
            ctx.vfs.move_path(&new_fragment_uri, &renamed)?;
            new_fragment_uri = renamed;
        }

        self.array.with_exclusive_lock(|| {
            for uri in &window {
                ctx.vfs.remove_path(uri)?;
                ctx.stats.fragments_removed.add(1);
            }
            Ok(())
        })?;

        Ok(Some(new_fragment_uri))
    }

    /// Removes fragment directories missing the publication sentinel
    /// (§4.10's last sentence): partial fragments left behind by a
    /// crashed or cancelled write.
    ///
    /// # Errors
    ///
    /// Propagates I/O and lock errors.
    pub fn vacuum(&self) -> Result<usize> {
        let ctx = self.array.context();
        let mut removed = 0usize;
        self.array.with_exclusive_lock(|| {
            for entry in ctx.vfs.ls(self.array.uri())? {
                if ctx.vfs.is_dir(&entry)? && !ctx.vfs.is_file(&entry.join(names::FRAGMENT_SENTINEL))? {
                    ctx.vfs.remove_path(&entry)?;
                    removed += 1;
                    ctx.stats.fragments_removed.add(1);
                }
            }
            Ok(())
        })?;
        Ok(removed)
    }

    fn fragment_timestamp(&self, fragment_uri: &Uri) -> Result<u64> {
        let bytes = self.array.context().vfs.read_all(&fragment_uri.join(names::FRAGMENT_METADATA))?;
        let metadata = FragmentMetadata::decode_from(&mut std::io::Cursor::new(bytes))?;
        Ok(metadata.timestamp_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::QueryType;
    use crate::config::Config;
    use crate::context::Context;
    use crate::datatype::Datatype;
    use crate::domain::{Dimension, Domain, Order};
    use crate::query::Query;
    use crate::schema::{ArrayType, Attribute, Schema};
    use std::collections::HashMap;
    use std::sync::Arc;
    use test_log::test;

    fn sparse_schema() -> Schema {
        Schema::new(
            ArrayType::Sparse,
            Domain::new(vec![Dimension::new_integral("x", Datatype::Int32, 1, 1000, 10)]),
            Order::RowMajor,
            Order::RowMajor,
            4,
            vec![Attribute::new("a", Datatype::Int32, 1)],
        )
        .unwrap()
    }

    fn write_one(array: &Array, coord: i64, value: i32, ts: u64) {
        crate::time::set_unix_timestamp_for_test(Some(ts));
        let mut writer = Writer::new(array, Layout::Unordered);
        let mut attrs = HashMap::new();
        attrs.insert("a".to_string(), value.to_le_bytes().to_vec());
        writer.write_batch(CellBatch { coords: vec![coord], attributes: attrs, ..Default::default() }).unwrap();
        writer.finalize().unwrap();
        crate::time::set_unix_timestamp_for_test(None);
    }

    #[test]
    fn consolidate_merges_step_window_and_preserves_results() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(Context::new(Config::new().consolidation_step(2, 10)));
        let uri = Uri::new(dir.path().join("cons"));
        let schema = sparse_schema();
        Array::create(&ctx, &uri, &schema).unwrap();
        let array = Array::open(ctx.clone(), &uri, QueryType::Write).unwrap();

        write_one(&array, 1, 10, 1_000);
        write_one(&array, 2, 20, 1_001);
        write_one(&array, 3, 30, 1_002);
        array.close().unwrap();

        let array = Array::open(ctx.clone(), &uri, QueryType::Read).unwrap();
        assert_eq!(array.fragment_uris().unwrap().len(), 3);

        let consolidator = Consolidator::new(&array);
        let new_uri = consolidator.consolidate().unwrap().unwrap();
        let remaining = array.fragment_uris().unwrap();
        assert_eq!(remaining, vec![new_uri]);
        array.close().unwrap();

        let array = Array::open(ctx, &uri, QueryType::Read).unwrap();
        let mut query = Query::new(&array);
        query.submit().unwrap();
        assert_eq!(query.result_coords, vec![1, 2, 3]);
        let values: Vec<i32> = query
            .results
            .get("a")
            .unwrap()
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(values, vec![10, 20, 30]);
    }

    #[test]
    fn consolidate_below_step_min_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(Context::new(Config::new().consolidation_step(3, 10)));
        let uri = Uri::new(dir.path().join("cons2"));
        let schema = sparse_schema();
        Array::create(&ctx, &uri, &schema).unwrap();
        let array = Array::open(ctx.clone(), &uri, QueryType::Write).unwrap();
        write_one(&array, 1, 10, 1_000);
        array.close().unwrap();

        let array = Array::open(ctx, &uri, QueryType::Read).unwrap();
        let consolidator = Consolidator::new(&array);
        assert!(consolidator.consolidate().unwrap().is_none());
        assert_eq!(array.fragment_uris().unwrap().len(), 1);
    }

    #[test]
    fn vacuum_removes_only_sentinel_less_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(Context::new(Config::new()));
        let uri = Uri::new(dir.path().join("vac"));
        Array::create(&ctx, &uri, &sparse_schema()).unwrap();

        let committed = uri.join("__1_100_0");
        ctx.vfs.create_dir(&committed).unwrap();
        ctx.vfs.create_file(&committed.join(names::FRAGMENT_SENTINEL)).unwrap();

        let partial = uri.join("__1_200_0");
        ctx.vfs.create_dir(&partial).unwrap();

        let array = Array::open(ctx.clone(), &uri, QueryType::Read).unwrap();
        let removed = Consolidator::new(&array).vacuum().unwrap();
        assert_eq!(removed, 1);
        assert!(!ctx.vfs.is_dir(&partial).unwrap());
        assert!(ctx.vfs.is_dir(&committed).unwrap());
    }
}
