// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The write pipeline (§4.8): buffers cells, sorts them into global order,
//! tiles them, pushes each tile through its attribute's forward filter
//! pipeline, and publishes the fragment directory atomically.
//!
//! Variable-length attributes carry a per-cell offsets buffer
//! (`<attr>_var.tdb`); nullable attributes carry a per-cell validity
//! buffer (`<attr>_validity.tdb`). Writes are checked against the
//! schema's current domain (SPEC_FULL §F.4), and a fragment's tile index
//! is built against the attribute list effective at the fragment's own
//! timestamp (SPEC_FULL §F.3), so a fragment written between two
//! evolution steps can be read back correctly by a later, further-evolved
//! schema.
//!
//! Simplification (recorded in `DESIGN.md`): rather than modeling
//! streaming, buffer-bounded writes that can themselves return
//! `INCOMPLETE`, one [`Writer`] accumulates every cell passed to
//! [`Writer::write_batch`] in memory and materializes the whole fragment
//! in [`Writer::finalize`]. `ROW_MAJOR`/`COL_MAJOR`/`UNORDERED` inputs are
//! converted to `GLOBAL_ORDER` the same way: by sorting with
//! [`crate::domain::CellOrderComparator`], which is a correct
//! implementation of "convert to global order" regardless of the input's
//! starting order.
//!
//! Per-attribute tile encoding (filter pipeline application) within one
//! tile runs across a process-wide [`rayon`] thread pool (§5): encoding is
//! pure CPU work independent across attributes, so it is computed in
//! parallel and only the resulting bytes are appended to their files
//! sequentially, keeping each attribute's on-disk offsets well-defined.

use crate::array::Array;
use crate::coding::Encode;
use crate::domain::{CellOrderComparator, Mbr};
use crate::fragment::{AttributeTileIndex, FragmentMetadata};
use crate::query::Layout;
use crate::schema::{ArrayType, Attribute, Schema};
use crate::uri::{attr_file_name, attr_validity_file_name, attr_var_file_name, fragment_dir_name, names, Uri};
use crate::{time, Error, Result};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One batch of cells submitted to a [`Writer`].
///
/// `coords` is a flat, dimension-major buffer (`cell_idx * dim_num +
/// dim_idx`); required for sparse arrays, optional for dense arrays
/// (dense cells are tiled by domain position, so a batch covering whole
/// space tiles can omit them).
#[derive(Clone, Debug, Default)]
pub struct CellBatch {
    /// Flat coordinate buffer, dimension-major.
    pub coords: Vec<i64>,
    /// Per-attribute raw value bytes, in the same per-cell order as
    /// `coords`. For a variable-length attribute this is the
    /// concatenation of every cell's bytes, sliced by `offsets`.
    pub attributes: HashMap<String, Vec<u8>>,
    /// Per-cell start byte offset into `attributes[name]`, one entry per
    /// cell, strictly non-decreasing. Required for every variable-length
    /// attribute present in `attributes` (§3, §6's `<attr>_var.tdb`
    /// layout); a cell's length is the gap to the next offset, or to the
    /// end of the buffer for the last cell — so equal consecutive offsets
    /// encode a zero-length cell.
    pub offsets: HashMap<String, Vec<u64>>,
    /// One byte per cell (0 = null, 1 = valid) for nullable attributes.
    /// An attribute omitted here defaults to all-valid.
    pub validity: HashMap<String, Vec<u8>>,
}

/// Accumulates cells for one fragment and publishes it on [`Writer::finalize`].
pub struct Writer<'a> {
    array: &'a Array,
    layout: Layout,
    coords: Vec<i64>,
    attributes: HashMap<String, Vec<u8>>,
    var_offsets: HashMap<String, Vec<u64>>,
    validity: HashMap<String, Vec<u8>>,
    cell_count: u64,
    cancelled: Arc<AtomicBool>,
}

impl<'a> Writer<'a> {
    /// Starts a new fragment write against `array` with the given layout.
    #[must_use]
    pub fn new(array: &'a Array, layout: Layout) -> Self {
        Self {
            array,
            layout,
            coords: Vec::new(),
            attributes: HashMap::new(),
            var_offsets: HashMap::new(),
            validity: HashMap::new(),
            cell_count: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A token the caller can set to request cancellation (§4.8); checked
    /// between tiles during [`Writer::finalize`].
    #[must_use]
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Appends a batch of cells to the pending fragment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Query`] if the batch's coordinate count doesn't
    /// match the domain's dimensionality, a coordinate falls outside the
    /// schema's current domain (if set), a fixed-width attribute buffer's
    /// length doesn't match `cell_count * byte_width * cell_val_num`, a
    /// variable-length attribute is missing its offsets buffer (or the
    /// offsets aren't non-decreasing and in bounds), or a nullable
    /// attribute's validity buffer has the wrong length.
    pub fn write_batch(&mut self, batch: CellBatch) -> Result<()> {
        let schema = self.array.schema();
        let dim_num = schema.domain.dim_num();
        if batch.coords.len() % dim_num != 0 {
            return Err(Error::Query(format!(
                "coordinate buffer length {} is not a multiple of dim_num {dim_num}",
                batch.coords.len()
            )));
        }
        let n = batch.coords.len() / dim_num;

        if let Some(bound) = &schema.current_domain {
            for cell in batch.coords.chunks(dim_num) {
                if !bound.contains(cell) {
                    return Err(Error::Query(format!(
                        "coordinate {cell:?} falls outside the array's current domain"
                    )));
                }
            }
        }

        let effective_attrs = schema.attributes_as_of(time::unix_timestamp_millis());
        for attr in effective_attrs {
            let Some(values) = batch.attributes.get(&attr.name) else {
                continue;
            };
            if attr.is_var() {
                let offsets = batch
                    .offsets
                    .get(&attr.name)
                    .ok_or_else(|| Error::Query(format!("variable-length attribute {} requires an offsets buffer", attr.name)))?;
                if offsets.len() != n {
                    return Err(Error::Query(format!(
                        "attribute {} offsets length {} does not match {n} cells",
                        attr.name,
                        offsets.len()
                    )));
                }
                let mut prev = 0u64;
                for (i, &off) in offsets.iter().enumerate() {
                    if off < prev || off as usize > values.len() {
                        return Err(Error::Query(format!(
                            "attribute {} offsets must be non-decreasing and within the value buffer (cell {i})",
                            attr.name
                        )));
                    }
                    prev = off;
                }
            } else {
                let per_cell = attr.datatype.byte_width() * attr.cell_val_num.max(1) as usize;
                if values.len() != n * per_cell {
                    return Err(Error::Query(format!(
                        "attribute {} buffer length {} does not match {n} cells at {per_cell} bytes/cell",
                        attr.name,
                        values.len()
                    )));
                }
            }
            if attr.nullable {
                if let Some(validity) = batch.validity.get(&attr.name) {
                    if validity.len() != n {
                        return Err(Error::Query(format!(
                            "attribute {} validity length {} does not match {n} cells",
                            attr.name,
                            validity.len()
                        )));
                    }
                }
            }
        }

        self.coords.extend_from_slice(&batch.coords);
        let mut offsets_in = batch.offsets;
        let mut validity_in = batch.validity;
        for (name, values) in batch.attributes {
            let nullable = schema.attribute(&name).map(|a| a.nullable).unwrap_or(false);
            let values_buf = self.attributes.entry(name.clone()).or_default();
            if let Some(offsets) = offsets_in.remove(&name) {
                let base = values_buf.len() as u64;
                self.var_offsets.entry(name.clone()).or_default().extend(offsets.iter().map(|&o| o + base));
            }
            values_buf.extend_from_slice(&values);

            if nullable {
                let validity = validity_in.remove(&name).unwrap_or_else(|| vec![1u8; n]);
                self.validity.entry(name).or_default().extend_from_slice(&validity);
            }
        }
        self.cell_count += n as u64;
        Ok(())
    }

    /// Sorts the accumulated cells into global order, tiles them, writes
    /// every attribute's values (and, where applicable, offsets/validity)
    /// through its forward filter pipeline, and atomically publishes the
    /// fragment directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Query`] if cancelled mid-write (the partial
    /// fragment directory is removed first) or if layout validation
    /// fails (`UNORDERED` on a dense array). Propagates I/O, filter, and
    /// encoding errors.
    pub fn finalize(self) -> Result<crate::uri::Uri> {
        let schema = self.array.schema();
        if self.layout == Layout::Unordered && schema.array_type == ArrayType::Dense {
            return Err(Error::Query("UNORDERED layout is only valid for sparse arrays".into()));
        }
        let dim_num = schema.domain.dim_num();
        let n = self.cell_count as usize;

        let order = sort_order(schema, &self.coords, n, dim_num)?;

        let (timestamp_ms, seq) = time::next_fragment_timestamp();
        let effective_attrs = schema.attributes_as_of(timestamp_ms);
        let fragment_uri = self
            .array
            .uri()
            .join(&fragment_dir_name(std::process::id(), timestamp_ms, seq));
        let ctx = self.array.context();
        ctx.vfs.create_dir(&fragment_uri)?;

        let sorted_coords = permute_coords(&self.coords, &order, dim_num);
        let non_empty_domain = if n == 0 {
            None
        } else {
            let mut mbr = Mbr::from_point(&sorted_coords[0..dim_num]);
            for i in 1..n {
                mbr.expand(&sorted_coords[i * dim_num..(i + 1) * dim_num]);
            }
            Some(mbr)
        };

        let tile_bounds = tile_boundaries(schema, &sorted_coords, n, dim_num);

        let mut tile_cell_nums = Vec::new();
        let mut tile_mbrs = Vec::new();
        let mut attribute_tiles: Vec<AttributeTileIndex> = effective_attrs.iter().map(|_| AttributeTileIndex::default()).collect();

        for (start, end) in &tile_bounds {
            if self.cancelled.load(Ordering::SeqCst) {
                ctx.vfs.remove_path(&fragment_uri)?;
                return Err(Error::Query("write cancelled".into()));
            }
            tile_cell_nums.push((*end - *start) as u64);
            if schema.array_type == ArrayType::Sparse {
                let mut mbr = Mbr::from_point(&sorted_coords[start * dim_num..start * dim_num + dim_num]);
                for i in start + 1..*end {
                    mbr.expand(&sorted_coords[i * dim_num..i * dim_num + dim_num]);
                }
                tile_mbrs.push(mbr);
            }

            let encoded: Vec<Result<Option<EncodedAttrTile>>> = effective_attrs
                .par_iter()
                .map(|attr| self.encode_attr_tile(attr, &order, *start, *end, n))
                .collect();

            for (attr_idx, result) in encoded.into_iter().enumerate() {
                let Some(tile) = result? else { continue };
                #[allow(clippy::indexing_slicing)]
                let attr = &effective_attrs[attr_idx];
                #[allow(clippy::indexing_slicing)]
                let index = &mut attribute_tiles[attr_idx];

                let file_uri = fragment_uri.join(&attr_file_name(&attr.name));
                let offset = file_append_offset(&ctx, &file_uri)?;
                ctx.vfs.write(&file_uri, &tile.values)?;
                ctx.stats.bytes_compressed_in.add(tile.raw_values_len as u64);
                ctx.stats.bytes_compressed_out.add(tile.values.len() as u64);
                ctx.stats.bytes_written.add(tile.values.len() as u64);
                index.tile_offsets.push(offset);
                index.tile_sizes.push(tile.values.len() as u64);

                if let Some(offsets_bytes) = &tile.var_offsets {
                    let var_file_uri = fragment_uri.join(&attr_var_file_name(&attr.name));
                    let var_offset = file_append_offset(&ctx, &var_file_uri)?;
                    ctx.vfs.write(&var_file_uri, offsets_bytes)?;
                    ctx.stats.bytes_written.add(offsets_bytes.len() as u64);
                    index.var_tile_offsets.push(var_offset);
                    index.var_tile_sizes.push(offsets_bytes.len() as u64);
                }

                if let Some(validity_bytes) = &tile.validity {
                    let validity_file_uri = fragment_uri.join(&attr_validity_file_name(&attr.name));
                    let validity_offset = file_append_offset(&ctx, &validity_file_uri)?;
                    ctx.vfs.write(&validity_file_uri, validity_bytes)?;
                    ctx.stats.bytes_written.add(validity_bytes.len() as u64);
                    index.validity_tile_offsets.push(validity_offset);
                    index.validity_tile_sizes.push(validity_bytes.len() as u64);
                }
            }
        }

        if schema.array_type == ArrayType::Sparse && n > 0 {
            let coords_bytes: Vec<u8> = sorted_coords.iter().flat_map(|c| c.to_le_bytes()).collect();
            let encoded = schema.coords_filters.encode(8, &coords_bytes)?;
            ctx.vfs.write(&fragment_uri.join(names::COORDS), &encoded)?;
        }

        let metadata = FragmentMetadata {
            timestamp_ms,
            cell_num: n as u64,
            tile_cell_nums,
            non_empty_domain,
            tile_mbrs,
            attribute_tiles,
        };
        ctx.vfs
            .write(&fragment_uri.join(names::FRAGMENT_METADATA), &metadata.encode_into_vec())?;
        ctx.vfs.create_file(&fragment_uri.join(names::FRAGMENT_SENTINEL))?;
        ctx.stats.fragments_written.add(1);

        Ok(fragment_uri)
    }

    /// Encodes one attribute's slice of one tile (values, and where
    /// applicable offsets/validity) without touching the VFS, so the
    /// (CPU-bound) filter pipeline work can run across tiles' attributes
    /// in parallel; returns `Ok(None)` if this batch never received any
    /// values for `attr`.
    fn encode_attr_tile(&self, attr: &Attribute, order: &[usize], start: usize, end: usize, n: usize) -> Result<Option<EncodedAttrTile>> {
        let Some(values) = self.attributes.get(&attr.name) else {
            return Ok(None);
        };

        let (tile_bytes, raw_values_len, var_offsets) = if attr.is_var() {
            let offsets = self.var_offsets.get(&attr.name).cloned().unwrap_or_default();
            let (sorted_values, sorted_offsets) = permute_var(values, &offsets, order, n);
            #[allow(clippy::indexing_slicing)]
            let tile_start_byte = sorted_offsets.get(start).copied().unwrap_or(0) as usize;
            let tile_end_byte = if end < n {
                sorted_offsets.get(end).copied().unwrap_or(sorted_values.len() as u64) as usize
            } else {
                sorted_values.len()
            };
            let tile_bytes = sorted_values
                .get(tile_start_byte..tile_end_byte)
                .map(<[u8]>::to_vec)
                .unwrap_or_default();
            let tile_rel_offsets: Vec<u64> = sorted_offsets
                .get(start..end)
                .unwrap_or_default()
                .iter()
                .map(|&o| o - tile_start_byte as u64)
                .collect();
            let offsets_bytes: Vec<u8> = tile_rel_offsets.iter().flat_map(|o| o.to_le_bytes()).collect();
            let encoded_offsets = attr.filters.encode(8, &offsets_bytes)?;
            (tile_bytes.clone(), tile_bytes.len(), Some(encoded_offsets))
        } else {
            let per_cell = attr.datatype.byte_width() * attr.cell_val_num.max(1) as usize;
            let sorted_values = permute_bytes(values, order, per_cell);
            #[allow(clippy::indexing_slicing)]
            let tile_bytes = sorted_values[start * per_cell..end * per_cell].to_vec();
            let len = tile_bytes.len();
            (tile_bytes, len, None)
        };

        let encoded_values = attr.filters.encode(attr.datatype.byte_width(), &tile_bytes)?;

        let validity = if attr.nullable {
            self.validity.get(&attr.name).map(|validity| {
                let sorted_validity = permute_bytes(validity, order, 1);
                #[allow(clippy::indexing_slicing)]
                sorted_validity[start..end].to_vec()
            })
        } else {
            None
        };

        Ok(Some(EncodedAttrTile {
            values: encoded_values,
            raw_values_len,
            var_offsets,
            validity,
        }))
    }
}

/// One attribute's already-filter-encoded tile output, ready to append to
/// its files.
struct EncodedAttrTile {
    values: Vec<u8>,
    raw_values_len: usize,
    var_offsets: Option<Vec<u8>>,
    validity: Option<Vec<u8>>,
}

fn file_append_offset(ctx: &crate::context::Context, file_uri: &Uri) -> Result<u64> {
    Ok(ctx.vfs.is_file(file_uri)?.then(|| ctx.vfs.file_size(file_uri)).transpose()?.unwrap_or(0))
}

fn sort_order(schema: &Schema, coords: &[i64], n: usize, dim_num: usize) -> Result<Vec<usize>> {
    let mut order: Vec<usize> = (0..n).collect();
    let cmp = CellOrderComparator::new(&schema.domain, coords, schema.tile_order, schema.cell_order);
    let mut err = None;
    order.sort_by(|&a, &b| match cmp.compare(a, b) {
        Ok(o) => o,
        Err(e) => {
            err = Some(e);
            std::cmp::Ordering::Equal
        }
    });
    if let Some(e) = err {
        return Err(e);
    }
    let _ = dim_num;
    Ok(order)
}

fn permute_coords(coords: &[i64], order: &[usize], dim_num: usize) -> Vec<i64> {
    let mut out = Vec::with_capacity(coords.len());
    for &i in order {
        out.extend_from_slice(&coords[i * dim_num..i * dim_num + dim_num]);
    }
    out
}

fn permute_bytes(values: &[u8], order: &[usize], per_cell: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len());
    for &i in order {
        out.extend_from_slice(&values[i * per_cell..i * per_cell + per_cell]);
    }
    out
}

/// Per-cell `[start, end)` byte ranges into a variable-length attribute's
/// value buffer, derived from its start-offset array (§3: the offset of
/// the next cell, or the buffer's end for the last cell, gives the
/// length).
fn var_cell_bounds(offsets: &[u64], values_len: usize, n: usize) -> Vec<(usize, usize)> {
    (0..n)
        .map(|i| {
            #[allow(clippy::indexing_slicing)]
            let start = offsets[i] as usize;
            let end = if i + 1 < n {
                #[allow(clippy::indexing_slicing)]
                {
                    offsets[i + 1] as usize
                }
            } else {
                values_len
            };
            (start, end)
        })
        .collect()
}

/// Reorders a variable-length attribute's cells by `order`, returning the
/// reordered value bytes and a fresh set of start offsets (0-based,
/// relative to the reordered buffer).
fn permute_var(values: &[u8], offsets: &[u64], order: &[usize], n: usize) -> (Vec<u8>, Vec<u64>) {
    let bounds = var_cell_bounds(offsets, values.len(), n);
    let mut out_values = Vec::with_capacity(values.len());
    let mut out_offsets = Vec::with_capacity(n);
    for &i in order {
        #[allow(clippy::indexing_slicing)]
        let (s, e) = bounds[i];
        out_offsets.push(out_values.len() as u64);
        out_values.extend_from_slice(&values[s..e]);
    }
    (out_values, out_offsets)
}

/// Groups sorted cells into tiles: one tile per space tile for dense
/// arrays (cells sharing a `tile_id`), one tile per `capacity` cells for
/// sparse arrays (§3, §4.8).
fn tile_boundaries(schema: &Schema, sorted_coords: &[i64], n: usize, dim_num: usize) -> Vec<(usize, usize)> {
    if n == 0 {
        return Vec::new();
    }
    match schema.array_type {
        ArrayType::Sparse => {
            let capacity = schema.capacity.max(1) as usize;
            (0..n).step_by(capacity).map(|start| (start, (start + capacity).min(n))).collect()
        }
        ArrayType::Dense => {
            let mut bounds = Vec::new();
            let mut start = 0;
            #[allow(clippy::indexing_slicing)]
            let mut current_tile = schema.domain.tile_id(&sorted_coords[0..dim_num], schema.tile_order).ok();
            for i in 1..n {
                #[allow(clippy::indexing_slicing)]
                let tile_id = schema.domain.tile_id(&sorted_coords[i * dim_num..i * dim_num + dim_num], schema.tile_order).ok();
                if tile_id != current_tile {
                    bounds.push((start, i));
                    start = i;
                    current_tile = tile_id;
                }
            }
            bounds.push((start, n));
            bounds
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{Array, QueryType};
    use crate::config::Config;
    use crate::context::Context;
    use crate::datatype::Datatype;
    use crate::domain::{Dimension, Domain, Order};
    use crate::schema::{ArrayType, Attribute};
    use test_log::test;

    fn sparse_schema() -> Schema {
        Schema::new(
            ArrayType::Sparse,
            Domain::new(vec![Dimension::new_integral("x", Datatype::Int32, 1, 100, 10)]),
            Order::RowMajor,
            Order::RowMajor,
            4,
            vec![Attribute::new("a", Datatype::Int32, 1)],
        )
        .unwrap()
    }

    #[test]
    fn sparse_write_sorts_and_tiles_by_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(Context::new(Config::new()));
        let uri = crate::uri::Uri::new(dir.path().join("s"));
        let schema = sparse_schema();
        Array::create(&ctx, &uri, &schema).unwrap();
        let array = Array::open(ctx, &uri, QueryType::Write).unwrap();

        let mut writer = Writer::new(&array, Layout::Unordered);
        let coords = vec![5i64, 1, 3, 9];
        let values: Vec<u8> = vec![50, 10, 30, 90].into_iter().flat_map(|v: i32| v.to_le_bytes()).collect();
        let mut attrs = HashMap::new();
        attrs.insert("a".to_string(), values);
        writer.write_batch(CellBatch { coords, attributes: attrs, ..Default::default() }).unwrap();
        let fragment_uri = writer.finalize().unwrap();

        assert!(ctx_vfs_is_file(&array, &fragment_uri.join(names::FRAGMENT_SENTINEL)));
        let meta_bytes = array.context().vfs.read_all(&fragment_uri.join(names::FRAGMENT_METADATA)).unwrap();
        let meta = <FragmentMetadata as crate::coding::Decode>::decode_from(&mut std::io::Cursor::new(meta_bytes)).unwrap();
        assert_eq!(meta.cell_num, 4);
        assert_eq!(meta.tile_cell_nums, vec![4]);
    }

    fn var_schema() -> Schema {
        Schema::new(
            ArrayType::Sparse,
            Domain::new(vec![Dimension::new_integral("x", Datatype::Int32, 1, 100, 10)]),
            Order::RowMajor,
            Order::RowMajor,
            10,
            vec![Attribute::new("s", Datatype::Uint8, crate::schema::VAR_NUM)],
        )
        .unwrap()
    }

    #[test]
    fn var_length_write_accepts_zero_length_cells_and_nondecreasing_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(Context::new(Config::new()));
        let uri = crate::uri::Uri::new(dir.path().join("v"));
        let schema = var_schema();
        Array::create(&ctx, &uri, &schema).unwrap();
        let array = Array::open(ctx, &uri, QueryType::Write).unwrap();

        // cells: "ab", "" (zero-length), "c"
        let values = b"abc".to_vec();
        let offsets = vec![0u64, 2, 2];
        let mut attrs = HashMap::new();
        attrs.insert("s".to_string(), values);
        let mut offsets_map = HashMap::new();
        offsets_map.insert("s".to_string(), offsets);

        let mut writer = Writer::new(&array, Layout::Unordered);
        writer
            .write_batch(CellBatch {
                coords: vec![1, 2, 3],
                attributes: attrs,
                offsets: offsets_map,
                ..Default::default()
            })
            .unwrap();
        let fragment_uri = writer.finalize().unwrap();

        let meta_bytes = array.context().vfs.read_all(&fragment_uri.join(names::FRAGMENT_METADATA)).unwrap();
        let meta = <FragmentMetadata as crate::coding::Decode>::decode_from(&mut std::io::Cursor::new(meta_bytes)).unwrap();
        let index = &meta.attribute_tiles[0];
        assert!(!index.var_tile_offsets.is_empty(), "var attribute must produce offsets tiles");
    }

    #[test]
    fn var_length_write_rejects_decreasing_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(Context::new(Config::new()));
        let uri = crate::uri::Uri::new(dir.path().join("v2"));
        let schema = var_schema();
        Array::create(&ctx, &uri, &schema).unwrap();
        let array = Array::open(ctx, &uri, QueryType::Write).unwrap();

        let mut attrs = HashMap::new();
        attrs.insert("s".to_string(), b"ab".to_vec());
        let mut offsets_map = HashMap::new();
        offsets_map.insert("s".to_string(), vec![1u64, 0]);

        let mut writer = Writer::new(&array, Layout::Unordered);
        let err = writer
            .write_batch(CellBatch {
                coords: vec![1, 2],
                attributes: attrs,
                offsets: offsets_map,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }

    #[test]
    fn write_rejects_coordinates_outside_current_domain() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Arc::new(Context::new(Config::new()));
        let uri = crate::uri::Uri::new(dir.path().join("cd"));
        let mut schema = sparse_schema();
        schema
            .set_current_domain(crate::schema::NdRectangle { bounds: vec![(1, 50)] })
            .unwrap();
        Array::create(&ctx, &uri, &schema).unwrap();
        let array = Array::open(ctx, &uri, QueryType::Write).unwrap();

        let mut writer = Writer::new(&array, Layout::Unordered);
        let mut attrs = HashMap::new();
        attrs.insert("a".to_string(), 1i32.to_le_bytes().to_vec());
        let err = writer
            .write_batch(CellBatch { coords: vec![90], attributes: attrs, ..Default::default() })
            .unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }

    fn ctx_vfs_is_file(array: &Array, uri: &crate::uri::Uri) -> bool {
        array.context().vfs.is_file(uri).unwrap()
    }
}
