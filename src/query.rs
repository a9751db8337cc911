// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Query construction and submission (§4, §6).
//!
//! A [`Query`] wraps a read against existing fragments or an in-progress
//! [`crate::writer::Writer`] and tracks layout, subarray ranges, and
//! state through repeated `submit` calls (§4's incomplete/pagination
//! state machine). Ranges are clipped against the schema's current
//! domain, if one is set (SPEC_FULL §F.4); reads past
//! [`Query::set_max_cells`]'s cap return [`QueryState::Incomplete`] and
//! resume correctly on the next `submit` call.

use crate::array::{Array, QueryType};
use crate::reader::{self, ReadCursor};
use crate::schema::ArrayType;
use crate::writer::{CellBatch, Writer};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cell emission order (§3, §4's layout list).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Layout {
    /// The array's global (tile-then-cell) order.
    GlobalOrder,
    /// Row-major within the subarray bounding box.
    RowMajor,
    /// Column-major within the subarray bounding box.
    ColMajor,
    /// Any order; sparse arrays only, fastest to produce.
    Unordered,
}

/// Outcome of one `submit` call (§4, §6).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QueryState {
    /// Not yet submitted.
    Uninitialized,
    /// All requested results were produced.
    Complete,
    /// Caller buffers filled before all results were produced; submit
    /// again to resume from the recorded cursor.
    Incomplete,
    /// Submit failed; the query cursor did not advance.
    Failed,
}

/// A read or write query against one open [`Array`] (§3, §6).
pub struct Query<'a> {
    array: &'a Array,
    query_type: QueryType,
    layout: Layout,
    ranges: Vec<Vec<(i64, i64)>>,
    state: QueryState,
    cursor: ReadCursor,
    max_cells: Option<usize>,
    writer: Option<Writer<'a>>,
    pending_offsets: HashMap<String, Vec<u64>>,
    pending_validity: HashMap<String, Vec<u8>>,
    cancelled: Arc<AtomicBool>,
    /// Results accumulated by the most recent read submit, per attribute.
    pub results: HashMap<String, Vec<u8>>,
    /// Coordinates accumulated by the most recent read submit (sparse only).
    pub result_coords: Vec<i64>,
    /// Per-cell start offsets accumulated by the most recent read submit,
    /// for every variable-length attribute present in the result.
    pub result_offsets: HashMap<String, Vec<u64>>,
    /// Validity bytes accumulated by the most recent read submit, for
    /// every nullable attribute present in the result.
    pub result_validity: HashMap<String, Vec<u8>>,
}

impl<'a> Query<'a> {
    /// Creates a query of `array`'s open mode (§3: the mode is fixed at
    /// `Array::open` time).
    #[must_use]
    pub fn new(array: &'a Array) -> Self {
        let query_type = array.mode();
        Self {
            array,
            query_type,
            layout: Layout::RowMajor,
            ranges: vec![Vec::new(); array.schema().domain.dim_num()],
            state: QueryState::Uninitialized,
            cursor: ReadCursor::default(),
            max_cells: None,
            writer: if query_type == QueryType::Write {
                Some(Writer::new(array, Layout::GlobalOrder))
            } else {
                None
            },
            pending_offsets: HashMap::new(),
            pending_validity: HashMap::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
            results: HashMap::new(),
            result_coords: Vec::new(),
            result_offsets: HashMap::new(),
            result_validity: HashMap::new(),
        }
    }

    /// Sets the emission/consumption layout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Query`] if `layout` is `Unordered` on a dense array.
    pub fn set_layout(&mut self, layout: Layout) -> Result<()> {
        if layout == Layout::Unordered && self.array.schema().array_type == ArrayType::Dense {
            return Err(Error::Query("UNORDERED layout is only valid for sparse arrays".into()));
        }
        self.layout = layout;
        if let Some(writer) = &mut self.writer {
            *writer = Writer::new(self.array, layout);
        }
        Ok(())
    }

    /// Bounds how many cells one `submit` call returns (§4, §6). Once the
    /// cap is reached with matching cells still unread, `submit` returns
    /// [`QueryState::Incomplete`] and the next call resumes from where it
    /// left off. `None` (the default) returns every matching cell in one
    /// call.
    pub fn set_max_cells(&mut self, max_cells: Option<usize>) {
        self.max_cells = max_cells;
    }

    /// Adds an inclusive range `[lo, hi]` on dimension `dim_idx` (multiple
    /// calls on the same dimension add further ranges — multi-range
    /// reads). If the schema has a current domain set (SPEC_FULL §F.4),
    /// the range is clipped to it; a range that falls entirely outside
    /// the current domain is silently dropped rather than added.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Query`] if `dim_idx` is out of bounds or `lo > hi`.
    pub fn add_range(&mut self, dim_idx: usize, lo: i64, hi: i64) -> Result<()> {
        if lo > hi {
            return Err(Error::Query(format!("range lower bound {lo} exceeds upper bound {hi}")));
        }
        if dim_idx >= self.ranges.len() {
            return Err(Error::Query(format!("dimension index {dim_idx} out of bounds")));
        }

        let (mut lo, mut hi) = (lo, hi);
        if let Some(bound) = &self.array.schema().current_domain {
            if let Some(&(blo, bhi)) = bound.bounds.get(dim_idx) {
                lo = lo.max(blo);
                hi = hi.min(bhi);
                if lo > hi {
                    return Ok(());
                }
            }
        }

        #[allow(clippy::indexing_slicing)]
        self.ranges[dim_idx].push((lo, hi));
        Ok(())
    }

    /// Sets a single range per dimension at once (a rectangular subarray),
    /// clipped to the current domain the same way [`Self::add_range`] is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Query`] if `bounds.len()` doesn't match the
    /// domain's dimensionality.
    pub fn set_subarray(&mut self, bounds: &[(i64, i64)]) -> Result<()> {
        if bounds.len() != self.ranges.len() {
            return Err(Error::Query("subarray dimensionality mismatch".into()));
        }
        for (dim_idx, &(lo, hi)) in bounds.iter().enumerate() {
            #[allow(clippy::indexing_slicing)]
            self.ranges[dim_idx].clear();
            self.add_range(dim_idx, lo, hi)?;
        }
        Ok(())
    }

    /// Stages the per-cell start-offset buffer for a variable-length
    /// attribute's next [`Self::set_data`] call (§6). If the `CellBatch`
    /// passed to `set_data` already carries an `offsets` entry for
    /// `attribute`, the staged buffer is ignored for that attribute;
    /// otherwise the staged buffer is consumed and cleared.
    pub fn set_offsets_buffer(&mut self, attribute: &str, offsets: Vec<u64>) {
        self.pending_offsets.insert(attribute.to_string(), offsets);
    }

    /// Stages the validity buffer for a nullable attribute's next
    /// [`Self::set_data`] call (§6), with the same staged/ignored-if-
    /// already-present rule as [`Self::set_offsets_buffer`].
    pub fn set_validity_buffer(&mut self, attribute: &str, validity: Vec<u8>) {
        self.pending_validity.insert(attribute.to_string(), validity);
    }

    /// Appends a batch of cells to a write query, merging in any buffers
    /// staged via [`Self::set_offsets_buffer`]/[`Self::set_validity_buffer`]
    /// that the batch itself left unset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Query`] if this query was not opened for writing.
    /// Propagates [`Writer::write_batch`]'s errors.
    pub fn set_data(&mut self, mut batch: CellBatch) -> Result<()> {
        for (name, offsets) in self.pending_offsets.drain() {
            batch.offsets.entry(name).or_insert(offsets);
        }
        for (name, validity) in self.pending_validity.drain() {
            batch.validity.entry(name).or_insert(validity);
        }
        self.writer
            .as_mut()
            .ok_or_else(|| Error::Query("query was not opened for writing".into()))?
            .write_batch(batch)
    }

    /// A token the caller can set to request cancellation, checked at
    /// tile boundaries during `submit` (§4).
    #[must_use]
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Current query state.
    #[must_use]
    pub fn status(&self) -> QueryState {
        self.state
    }

    /// Runs one step of the query. For reads, fills `self.results`/
    /// `self.result_coords`/`self.result_offsets`/`self.result_validity`
    /// and returns `Complete`, or `Incomplete` if [`Self::set_max_cells`]'s
    /// cap was reached before every matching cell was produced — call
    /// `submit` again to fetch the next page. For writes, this is a
    /// no-op; call [`Query::finalize`] to publish the fragment.
    ///
    /// # Errors
    ///
    /// Propagates the reader's or writer's errors; on error the state
    /// becomes `Failed` and the cursor does not advance.
    pub fn submit(&mut self) -> Result<QueryState> {
        if self.cancelled.load(Ordering::SeqCst) {
            self.state = QueryState::Failed;
            return Err(Error::Query("query cancelled".into()));
        }
        match self.query_type {
            QueryType::Read => match reader::submit_read(self.array, self.layout, &self.ranges, &mut self.cursor, self.max_cells) {
                Ok(result) => {
                    self.state = if result.incomplete { QueryState::Incomplete } else { QueryState::Complete };
                    self.results = result.attributes;
                    self.result_coords = result.coords;
                    self.result_offsets = result.offsets;
                    self.result_validity = result.validity;
                    Ok(self.state)
                }
                Err(e) => {
                    self.state = QueryState::Failed;
                    Err(e)
                }
            },
            QueryType::Write => {
                self.state = QueryState::Complete;
                Ok(self.state)
            }
        }
    }

    /// Flushes any buffered writes and publishes the fragment. No-op for
    /// reads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Query`] if this query was not opened for writing,
    /// or `finalize` is called before any `submit`/`set_data` call on a
    /// write query that received no cells is attempted without data. Any
    /// I/O or filter error propagates.
    pub fn finalize(mut self) -> Result<Option<crate::uri::Uri>> {
        match self.writer.take() {
            Some(writer) => Ok(Some(writer.finalize()?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::Context;
    use crate::datatype::Datatype;
    use crate::domain::{Dimension, Domain, Order};
    use crate::schema::{Attribute, NdRectangle, Schema};
    use test_log::test;

    fn dense_schema() -> Schema {
        Schema::new(
            ArrayType::Dense,
            Domain::new(vec![Dimension::new_integral("x", Datatype::Int32, 1, 10, 10)]),
            Order::RowMajor,
            Order::RowMajor,
            0,
            vec![Attribute::new("a", Datatype::Int32, 1)],
        )
        .unwrap()
    }

    #[test]
    fn unordered_layout_rejected_on_dense_array() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(Context::new(Config::new()));
        let uri = crate::uri::Uri::new(dir.path());
        Array::create(&ctx, &uri, &dense_schema()).unwrap();
        let array = Array::open(ctx, &uri, QueryType::Read).unwrap();
        let mut query = Query::new(&array);
        assert!(query.set_layout(Layout::Unordered).is_err());
    }

    #[test]
    fn add_range_rejects_inverted_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(Context::new(Config::new()));
        let uri = crate::uri::Uri::new(dir.path());
        Array::create(&ctx, &uri, &dense_schema()).unwrap();
        let array = Array::open(ctx, &uri, QueryType::Read).unwrap();
        let mut query = Query::new(&array);
        assert!(query.add_range(0, 5, 1).is_err());
    }

    #[test]
    fn add_range_clips_to_current_domain() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(Context::new(Config::new()));
        let uri = crate::uri::Uri::new(dir.path());
        let mut schema = dense_schema();
        schema.set_current_domain(NdRectangle { bounds: vec![(2, 6)] }).unwrap();
        Array::create(&ctx, &uri, &schema).unwrap();
        let array = Array::open(ctx, &uri, QueryType::Read).unwrap();
        let mut query = Query::new(&array);
        query.add_range(0, 1, 10).unwrap();
        assert_eq!(query.ranges[0], vec![(2, 6)]);
    }

    #[test]
    fn add_range_outside_current_domain_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(Context::new(Config::new()));
        let uri = crate::uri::Uri::new(dir.path());
        let mut schema = dense_schema();
        schema.set_current_domain(NdRectangle { bounds: vec![(2, 6)] }).unwrap();
        Array::create(&ctx, &uri, &schema).unwrap();
        let array = Array::open(ctx, &uri, QueryType::Read).unwrap();
        let mut query = Query::new(&array);
        query.add_range(0, 7, 9).unwrap();
        assert!(query.ranges[0].is_empty());
    }

    #[test]
    fn max_cells_paginates_and_resumes() {
        use crate::writer::CellBatch;
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(Context::new(Config::new()));
        let uri = crate::uri::Uri::new(dir.path());
        let schema = Schema::new(
            ArrayType::Sparse,
            Domain::new(vec![Dimension::new_integral("x", Datatype::Int32, 1, 100, 10)]),
            Order::RowMajor,
            Order::RowMajor,
            10,
            vec![Attribute::new("a", Datatype::Int32, 1)],
        )
        .unwrap();
        Array::create(&ctx, &uri, &schema).unwrap();
        let array = Array::open(ctx.clone(), &uri, QueryType::Write).unwrap();
        let mut query = Query::new(&array);
        let mut attrs = HashMap::new();
        attrs.insert("a".to_string(), (1..=4i32).flat_map(i32::to_le_bytes).collect());
        query
            .set_data(CellBatch { coords: vec![1, 2, 3, 4], attributes: attrs, ..Default::default() })
            .unwrap();
        query.finalize().unwrap();

        let array = Array::open(ctx, &uri, QueryType::Read).unwrap();
        let mut query = Query::new(&array);
        query.set_max_cells(Some(2));
        assert_eq!(query.submit().unwrap(), QueryState::Incomplete);
        assert_eq!(query.result_coords, vec![1, 2]);
        assert_eq!(query.submit().unwrap(), QueryState::Incomplete);
        assert_eq!(query.result_coords, vec![3, 4]);
        assert_eq!(query.submit().unwrap(), QueryState::Complete);
        assert!(query.result_coords.is_empty());
    }
}
