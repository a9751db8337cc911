// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Query execution against committed fragments (§4.7).
//!
//! Fragments are visited in ascending-timestamp order (the order
//! [`crate::array::Array::fragment_uris`] returns). Each fragment's tile
//! geometry — an R-tree over per-tile MBRs for sparse arrays, recomputed
//! tile boxes for dense arrays, which do not persist per-cell coordinates —
//! is used to find tiles overlapping the query, which are decoded through
//! the shared tile cache and merged with later-fragment-wins semantics.
//! Unwritten cells of a dense read are filled from each attribute's fill
//! value. Each fragment's attribute list is resolved through
//! [`crate::schema::Schema::attributes_as_of`] at that fragment's own
//! write timestamp, so a fragment written before a schema evolution step
//! is still indexed correctly against its own (smaller) attribute set.
//!
//! Simplification (see `DESIGN.md`): a single call still recomputes the
//! whole merge across every matching fragment on every `submit` (there is
//! no tile-level resumable cursor). Pagination is layered on top of that:
//! the fully merged, globally ordered result is sliced by
//! [`ReadCursor::emitted`] and an optional `max_cells` cap, so a caller
//! that sets a buffer capacity gets [`crate::query::QueryState::Incomplete`]
//! and a cursor that resumes correctly, at the cost of redoing the
//! fragment merge on every call rather than resuming mid-tile.
//!
//! The per-fragment merge (here) and the per-tile-hit decode within one
//! fragment (in [`read_sparse_fragment`]/[`read_dense_fragment`]) run
//! across a [`rayon`] thread pool (§5): decoding a tile is pure CPU work
//! (filter inversion) independent of every other tile, so fragments and
//! tile hits are mapped in parallel and only folded together once all
//! values are in memory.

use crate::array::Array;
use crate::cache::TileCacheKey;
use crate::coding::Decode;
use crate::context::Context;
use crate::domain::{compare_coords, Domain, Mbr, Order};
use crate::fragment::{AttributeTileIndex, FragmentMetadata};
use crate::query::Layout;
use crate::schema::{ArrayType, Attribute, Schema};
use crate::uri::{attr_file_name, attr_validity_file_name, attr_var_file_name, names, Uri};
use crate::Result;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};

/// Progress marker for a read query (§4.7, §6).
///
/// `emitted` is the number of cells already handed back to the caller
/// across prior `submit` calls against the same [`crate::query::Query`];
/// the next call recomputes the full merge and skips the first `emitted`
/// cells of the (deterministically ordered) result.
#[derive(Clone, Debug, Default)]
pub struct ReadCursor {
    /// Cells already emitted by earlier `submit` calls on this query.
    pub emitted: usize,
}

/// One cell's per-attribute values, gathered during the fragment merge.
/// Variable-length values are stored per-cell (not yet offset-encoded);
/// [`assemble_result`] concatenates them into the output buffers.
#[derive(Clone, Debug, Default)]
struct CellValues {
    values: HashMap<String, Vec<u8>>,
    validity: HashMap<String, u8>,
}

/// The attribute and coordinate buffers produced by one read submission.
#[derive(Clone, Debug, Default)]
pub struct ReadResult {
    /// Per-attribute value bytes, in the same per-cell order as `coords`.
    /// For a variable-length attribute this is the concatenation of every
    /// returned cell's bytes, sliced by `offsets`.
    pub attributes: HashMap<String, Vec<u8>>,
    /// Flat, dimension-major result coordinates, always populated (even
    /// for dense reads, whose cell positions could otherwise be implied
    /// by the subarray and layout) so a result can be fed straight back
    /// into [`crate::writer::Writer::write_batch`] — the shape
    /// [`crate::consolidator`] needs.
    pub coords: Vec<i64>,
    /// Per-cell start byte offsets into `attributes[name]`, for every
    /// variable-length attribute present in the result.
    pub offsets: HashMap<String, Vec<u64>>,
    /// One byte per cell (0 = null, 1 = valid), for every nullable
    /// attribute present in the result.
    pub validity: HashMap<String, Vec<u8>>,
    /// Whether more cells remain beyond what this call returned (the
    /// `max_cells` cap was reached before every matching cell was
    /// emitted).
    pub incomplete: bool,
}

/// Runs one read query over `array`'s committed fragments, returning at
/// most `max_cells` cells (or every matching cell, if `None`) starting
/// after `cursor.emitted` cells already returned by earlier calls.
///
/// # Errors
///
/// Propagates I/O, decode, and filter errors, and [`crate::Error::Query`]
/// if `ranges` has the wrong dimensionality.
pub fn submit_read(array: &Array, layout: Layout, ranges: &[Vec<(i64, i64)>], cursor: &mut ReadCursor, max_cells: Option<usize>) -> Result<ReadResult> {
    read_fragments(array, layout, ranges, &array.fragment_uris()?, cursor, max_cells)
}

/// Like [`submit_read`], but merges only `fragment_uris` (in the order
/// given) rather than every fragment committed to `array`. Fragments are
/// still merged with later-in-the-list-wins semantics, so callers that
/// need timestamp order must sort `fragment_uris` themselves first — used
/// by [`crate::consolidator`] to merge just the fragments in its step
/// window.
pub(crate) fn read_fragments(
    array: &Array,
    layout: Layout,
    ranges: &[Vec<(i64, i64)>],
    fragment_uris: &[Uri],
    cursor: &mut ReadCursor,
    max_cells: Option<usize>,
) -> Result<ReadResult> {
    let schema = array.schema();
    let ctx = array.context();
    let effective_ranges = resolve_ranges(&schema.domain, ranges)?;
    let bbox = bounding_box(&effective_ranges);

    let per_fragment: Vec<Result<BTreeMap<Vec<i64>, CellValues>>> = fragment_uris
        .par_iter()
        .map(|fragment_uri| -> Result<BTreeMap<Vec<i64>, CellValues>> {
            let metadata = load_fragment_metadata(ctx, fragment_uri)?;
            let attrs = schema.attributes_as_of(metadata.timestamp_ms);
            let mut local: BTreeMap<Vec<i64>, CellValues> = BTreeMap::new();
            match schema.array_type {
                ArrayType::Sparse => {
                    read_sparse_fragment(ctx, schema, attrs, fragment_uri, &metadata, &bbox, &effective_ranges, &mut local)?;
                }
                ArrayType::Dense => {
                    read_dense_fragment(ctx, schema, attrs, fragment_uri, &metadata, &bbox, &effective_ranges, &mut local)?;
                }
            }
            Ok(local)
        })
        .collect();

    let mut merged: BTreeMap<Vec<i64>, CellValues> = BTreeMap::new();
    for (fragment_uri, local) in fragment_uris.iter().zip(per_fragment) {
        let local = local?;
        for (coords, values) in local {
            merged.insert(coords, values);
        }
        let _ = fragment_uri;
    }

    if schema.array_type == ArrayType::Dense {
        fill_dense_gaps(&effective_ranges, &mut merged);
    }

    let ordered = order_keys(&merged, schema, layout)?;

    let total = ordered.len();
    let start = cursor.emitted.min(total);
    let end = match max_cells {
        Some(cap) => (start + cap).min(total),
        None => total,
    };
    let page = ordered.get(start..end).unwrap_or_default();
    let incomplete = end < total;
    cursor.emitted = end;

    let effective_attrs_current = schema.attributes_as_of(crate::time::unix_timestamp_millis());
    let mut result = assemble_result(page, &merged, effective_attrs_current);
    result.incomplete = incomplete;
    Ok(result)
}

/// Flattens the merged, ordered cell slice into per-attribute value,
/// offsets, and validity buffers.
fn assemble_result(page: &[Vec<i64>], merged: &BTreeMap<Vec<i64>, CellValues>, attrs: &[Attribute]) -> ReadResult {
    let mut attributes: HashMap<String, Vec<u8>> = attrs.iter().map(|a| (a.name.clone(), Vec::new())).collect();
    let mut offsets: HashMap<String, Vec<u64>> = attrs.iter().filter(|a| a.is_var()).map(|a| (a.name.clone(), Vec::new())).collect();
    let mut validity: HashMap<String, Vec<u8>> = attrs.iter().filter(|a| a.nullable).map(|a| (a.name.clone(), Vec::new())).collect();
    let mut coords = Vec::with_capacity(page.len());

    for key in page {
        coords.extend_from_slice(key);
        #[allow(clippy::expect_used)]
        let cell = merged.get(key).expect("page key was taken from merged");
        for attr in attrs {
            let bytes = cell.values.get(&attr.name).cloned().unwrap_or_else(|| attr.fill_value.clone());
            if attr.is_var() {
                #[allow(clippy::expect_used)]
                let buf = attributes.get_mut(&attr.name).expect("attribute map pre-populated from schema");
                #[allow(clippy::expect_used)]
                offsets.get_mut(&attr.name).expect("offsets map pre-populated for var attribute").push(buf.len() as u64);
                buf.extend_from_slice(&bytes);
            } else {
                #[allow(clippy::expect_used)]
                attributes.get_mut(&attr.name).expect("attribute map pre-populated from schema").extend_from_slice(&bytes);
            }
            if attr.nullable {
                let valid = cell.validity.get(&attr.name).copied().unwrap_or(1);
                #[allow(clippy::expect_used)]
                validity.get_mut(&attr.name).expect("validity map pre-populated for nullable attribute").push(valid);
            }
        }
    }

    ReadResult {
        attributes,
        coords,
        offsets,
        validity,
        incomplete: false,
    }
}

/// Fills in a full `[lo, hi]` range per dimension for any dimension the
/// caller left unrestricted (no `add_range` call).
fn resolve_ranges(domain: &Domain, ranges: &[Vec<(i64, i64)>]) -> Result<Vec<Vec<(i64, i64)>>> {
    let mut out = Vec::with_capacity(domain.dim_num());
    for (i, dim) in domain.dimensions.iter().enumerate() {
        match ranges.get(i).filter(|r| !r.is_empty()) {
            Some(r) => out.push(r.clone()),
            None => out.push(vec![(dim.lo.as_i64(), dim.hi.as_i64())]),
        }
    }
    Ok(out)
}

/// The `(min, max)` per dimension across every range on that dimension;
/// used to prune fragments/tiles before the exact per-cell check.
fn bounding_box(ranges: &[Vec<(i64, i64)>]) -> Vec<(i64, i64)> {
    ranges
        .iter()
        .map(|dim_ranges| {
            #[allow(clippy::expect_used)]
            let lo = dim_ranges.iter().map(|&(lo, _)| lo).min().expect("resolved ranges are never empty");
            #[allow(clippy::expect_used)]
            let hi = dim_ranges.iter().map(|&(_, hi)| hi).max().expect("resolved ranges are never empty");
            (lo, hi)
        })
        .collect()
}

/// Whether `coords` falls within at least one range on every dimension.
fn cell_in_ranges(coords: &[i64], ranges: &[Vec<(i64, i64)>]) -> bool {
    coords
        .iter()
        .zip(ranges)
        .all(|(&c, dim_ranges)| dim_ranges.iter().any(|&(lo, hi)| c >= lo && c <= hi))
}

fn load_fragment_metadata(ctx: &Context, fragment_uri: &Uri) -> Result<FragmentMetadata> {
    let bytes = match ctx.fragment_metadata_cache.get(fragment_uri) {
        Some(bytes) => bytes,
        None => {
            let raw = ctx.vfs.read_all(&fragment_uri.join(names::FRAGMENT_METADATA))?;
            let bytes = std::sync::Arc::new(raw);
            ctx.fragment_metadata_cache.insert(fragment_uri.clone(), bytes.clone());
            bytes
        }
    };
    Ok(FragmentMetadata::decode_from(&mut std::io::Cursor::new(bytes.as_slice()))?)
}

/// Reads and decodes one attribute's whole values tile, consulting the
/// tile cache first.
fn read_attr_value_tile(ctx: &Context, fragment_uri: &Uri, attr_idx: u32, tile_idx: usize, attr: &Attribute, tile_index: &AttributeTileIndex) -> Result<Vec<u8>> {
    let key = TileCacheKey::values(fragment_uri.clone(), attr_idx, tile_idx as u64);
    if let Some(bytes) = ctx.tile_cache.read(&key) {
        ctx.stats.tile_cache_hits.add(1);
        ctx.stats.tiles_read.add(1);
        return Ok(bytes);
    }
    ctx.stats.tile_cache_misses.add(1);
    #[allow(clippy::indexing_slicing)]
    let offset = tile_index.tile_offsets[tile_idx];
    #[allow(clippy::indexing_slicing)]
    let size = tile_index.tile_sizes[tile_idx] as usize;
    let mut raw = vec![0u8; size];
    ctx.vfs.read(&fragment_uri.join(&attr_file_name(&attr.name)), offset, &mut raw)?;
    let decoded = attr.filters.decode(attr.datatype.byte_width(), &raw)?;
    ctx.tile_cache.insert(key, decoded.clone());
    ctx.stats.tiles_read.add(1);
    Ok(decoded)
}

/// Reads and decodes one variable-length attribute's offsets tile.
fn read_attr_offsets_tile(ctx: &Context, fragment_uri: &Uri, attr_idx: u32, tile_idx: usize, attr: &Attribute, tile_index: &AttributeTileIndex) -> Result<Vec<u64>> {
    let key = TileCacheKey::offsets(fragment_uri.clone(), attr_idx, tile_idx as u64);
    let decoded = if let Some(bytes) = ctx.tile_cache.read(&key) {
        ctx.stats.tile_cache_hits.add(1);
        bytes
    } else {
        ctx.stats.tile_cache_misses.add(1);
        #[allow(clippy::indexing_slicing)]
        let offset = tile_index.var_tile_offsets[tile_idx];
        #[allow(clippy::indexing_slicing)]
        let size = tile_index.var_tile_sizes[tile_idx] as usize;
        let mut raw = vec![0u8; size];
        ctx.vfs.read(&fragment_uri.join(&attr_var_file_name(&attr.name)), offset, &mut raw)?;
        let decoded = attr.filters.decode(8, &raw)?;
        ctx.tile_cache.insert(key, decoded.clone());
        decoded
    };
    Ok(decoded
        .chunks_exact(8)
        .map(|c| {
            #[allow(clippy::expect_used)]
            u64::from_le_bytes(c.try_into().expect("chunks_exact(8) yields 8-byte slices"))
        })
        .collect())
}

/// Reads one nullable attribute's validity tile, unfiltered (§3: validity
/// bitmaps bypass the attribute's filter pipeline, since it is sized for
/// the attribute's scalar type, not a boolean bitmap).
fn read_attr_validity_tile(ctx: &Context, fragment_uri: &Uri, attr_idx: u32, tile_idx: usize, attr: &Attribute, tile_index: &AttributeTileIndex) -> Result<Vec<u8>> {
    let key = TileCacheKey::validity(fragment_uri.clone(), attr_idx, tile_idx as u64);
    if let Some(bytes) = ctx.tile_cache.read(&key) {
        ctx.stats.tile_cache_hits.add(1);
        return Ok(bytes);
    }
    ctx.stats.tile_cache_misses.add(1);
    #[allow(clippy::indexing_slicing)]
    let offset = tile_index.validity_tile_offsets[tile_idx];
    #[allow(clippy::indexing_slicing)]
    let size = tile_index.validity_tile_sizes[tile_idx] as usize;
    let mut raw = vec![0u8; size];
    ctx.vfs.read(&fragment_uri.join(&attr_validity_file_name(&attr.name)), offset, &mut raw)?;
    ctx.tile_cache.insert(key, raw.clone());
    Ok(raw)
}

/// Reads one cell's bytes (and, where applicable, validity byte) for
/// `attr` out of tile `tile_idx`, at local cell position `local`.
fn read_attr_cell(
    ctx: &Context,
    fragment_uri: &Uri,
    attr_idx: u32,
    tile_idx: usize,
    attr: &Attribute,
    tile_index: &AttributeTileIndex,
    local: usize,
) -> Result<(Vec<u8>, Option<u8>)> {
    let bytes = if attr.is_var() {
        let values = read_attr_value_tile(ctx, fragment_uri, attr_idx, tile_idx, attr, tile_index)?;
        let tile_cell_num = tile_index.var_tile_sizes.len().max(tile_index.tile_sizes.len());
        let _ = tile_cell_num;
        let offsets = read_attr_offsets_tile(ctx, fragment_uri, attr_idx, tile_idx, attr, tile_index)?;
        #[allow(clippy::indexing_slicing)]
        let start = offsets[local] as usize;
        let end = if local + 1 < offsets.len() {
            #[allow(clippy::indexing_slicing)]
            {
                offsets[local + 1] as usize
            }
        } else {
            values.len()
        };
        values.get(start..end).unwrap_or_default().to_vec()
    } else {
        let per_cell = attr.datatype.byte_width() * attr.cell_val_num.max(1) as usize;
        let values = read_attr_value_tile(ctx, fragment_uri, attr_idx, tile_idx, attr, tile_index)?;
        let start = local * per_cell;
        values.get(start..start + per_cell).unwrap_or_default().to_vec()
    };

    let validity = if attr.nullable {
        let bitmap = read_attr_validity_tile(ctx, fragment_uri, attr_idx, tile_idx, attr, tile_index)?;
        Some(bitmap.get(local).copied().unwrap_or(1))
    } else {
        None
    };

    Ok((bytes, validity))
}

#[allow(clippy::too_many_arguments)]
fn read_sparse_fragment(
    ctx: &Context,
    schema: &Schema,
    attrs: &[Attribute],
    fragment_uri: &Uri,
    metadata: &FragmentMetadata,
    bbox: &[(i64, i64)],
    effective_ranges: &[Vec<(i64, i64)>],
    merged: &mut BTreeMap<Vec<i64>, CellValues>,
) -> Result<()> {
    if metadata.cell_num == 0 {
        return Ok(());
    }
    let dim_num = schema.domain.dim_num();
    let rtree = metadata.build_rtree();
    let tile_hits = rtree.search(bbox);
    if tile_hits.is_empty() {
        return Ok(());
    }

    let raw = ctx.vfs.read_all(&fragment_uri.join(names::COORDS))?;
    let decoded = schema.coords_filters.decode(8, &raw)?;
    let flat_coords: Vec<i64> = decoded
        .chunks_exact(8)
        .map(|c| {
            #[allow(clippy::expect_used)]
            i64::from_le_bytes(c.try_into().expect("chunks_exact(8) yields 8-byte slices"))
        })
        .collect();

    let mut prefix = Vec::with_capacity(metadata.tile_cell_nums.len() + 1);
    prefix.push(0u64);
    for &n in &metadata.tile_cell_nums {
        #[allow(clippy::expect_used)]
        prefix.push(prefix.last().expect("prefix seeded with one element").saturating_add(n));
    }

    let per_tile: Vec<Result<Vec<(Vec<i64>, CellValues)>>> = tile_hits
        .par_iter()
        .map(|&tile_idx| -> Result<Vec<(Vec<i64>, CellValues)>> {
            #[allow(clippy::indexing_slicing)]
            let (start, end) = (prefix[tile_idx] as usize, prefix[tile_idx + 1] as usize);
            #[allow(clippy::indexing_slicing)]
            let tile_coords = &flat_coords[start * dim_num..end * dim_num];
            let mut out = Vec::new();
            for local in 0..(end - start) {
                #[allow(clippy::indexing_slicing)]
                let coords = &tile_coords[local * dim_num..(local + 1) * dim_num];
                if !cell_in_ranges(coords, effective_ranges) {
                    continue;
                }
                let mut cell = CellValues::default();
                for (attr_idx, attr) in attrs.iter().enumerate() {
                    let Some(tile_index) = metadata.attribute_tiles.get(attr_idx) else {
                        continue;
                    };
                    let has_tile = if attr.is_var() {
                        tile_idx < tile_index.var_tile_offsets.len()
                    } else {
                        tile_idx < tile_index.tile_offsets.len()
                    };
                    if !has_tile {
                        continue;
                    }
                    let (bytes, validity) = read_attr_cell(ctx, fragment_uri, attr_idx as u32, tile_idx, attr, tile_index, local)?;
                    cell.values.insert(attr.name.clone(), bytes);
                    if let Some(v) = validity {
                        cell.validity.insert(attr.name.clone(), v);
                    }
                }
                out.push((coords.to_vec(), cell));
            }
            Ok(out)
        })
        .collect();

    for result in per_tile {
        for (coords, cell) in result? {
            merged.insert(coords, cell);
        }
    }
    Ok(())
}

/// Recomputes, in ascending tile-id order, the rectangular box each tile of
/// a dense fragment covers. Dense fragments do not persist per-cell
/// coordinates or per-tile MBRs (§3), so this assumes — as the writer does
/// not itself enforce, see `DESIGN.md` — that a dense write covers whole,
/// tile-aligned rectangular subarrays.
fn enumerate_dense_tiles(domain: &Domain, written: &Mbr, tile_order: Order) -> Result<Vec<Vec<(i64, i64)>>> {
    let mut tile_index_ranges: Vec<Vec<i64>> = Vec::with_capacity(domain.dim_num());
    for (dim, &(mlo, mhi)) in domain.dimensions.iter().zip(&written.bounds) {
        let lo = dim.lo.as_i64();
        let ext = dim.tile_extent.as_i64().max(1);
        let tlo = (mlo - lo).div_euclid(ext);
        let thi = (mhi - lo).div_euclid(ext);
        tile_index_ranges.push((tlo..=thi).collect());
    }

    let mut combos = vec![Vec::new()];
    for values in &tile_index_ranges {
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for &v in values {
                let mut extended = combo.clone();
                extended.push(v);
                next.push(extended);
            }
        }
        combos = next;
    }

    let mut tiles: Vec<(u64, Vec<(i64, i64)>)> = Vec::with_capacity(combos.len());
    for combo in combos {
        let mut representative = Vec::with_capacity(combo.len());
        let mut bounds = Vec::with_capacity(combo.len());
        for (dim, &idx) in domain.dimensions.iter().zip(&combo) {
            let lo = dim.lo.as_i64() + idx * dim.tile_extent.as_i64();
            let hi = (lo + dim.tile_extent.as_i64() - 1).min(dim.hi.as_i64());
            representative.push(lo);
            bounds.push((lo, hi));
        }
        let tile_id = domain.tile_id(&representative, tile_order)?;
        tiles.push((tile_id, bounds));
    }
    tiles.sort_by_key(|(id, _)| *id);
    Ok(tiles.into_iter().map(|(_, bounds)| bounds).collect())
}

/// Enumerates every coordinate in `box_bounds`, in `order` (last dimension
/// fastest for row-major, first dimension fastest for column-major) — the
/// same raster order [`crate::writer::Writer::finalize`] sorts cells into,
/// so a full tile's cells come out in the order they were written.
fn iterate_box(box_bounds: &[(i64, i64)], order: Order) -> Vec<Vec<i64>> {
    let dim_num = box_bounds.len();
    let axis_order: Vec<usize> = match order {
        Order::RowMajor => (0..dim_num).collect(),
        Order::ColMajor => (0..dim_num).rev().collect(),
    };
    let mut results = Vec::new();
    let mut current = vec![0i64; dim_num];
    iterate_box_rec(0, &axis_order, box_bounds, &mut current, &mut results);
    results
}

fn iterate_box_rec(depth: usize, axis_order: &[usize], box_bounds: &[(i64, i64)], current: &mut Vec<i64>, out: &mut Vec<Vec<i64>>) {
    if depth == axis_order.len() {
        out.push(current.clone());
        return;
    }
    #[allow(clippy::indexing_slicing)]
    let axis = axis_order[depth];
    #[allow(clippy::indexing_slicing)]
    let (lo, hi) = box_bounds[axis];
    for v in lo..=hi {
        #[allow(clippy::indexing_slicing)]
        {
            current[axis] = v;
        }
        iterate_box_rec(depth + 1, axis_order, box_bounds, current, out);
    }
}

#[allow(clippy::too_many_arguments)]
fn read_dense_fragment(
    ctx: &Context,
    schema: &Schema,
    attrs: &[Attribute],
    fragment_uri: &Uri,
    metadata: &FragmentMetadata,
    bbox: &[(i64, i64)],
    effective_ranges: &[Vec<(i64, i64)>],
    merged: &mut BTreeMap<Vec<i64>, CellValues>,
) -> Result<()> {
    let Some(non_empty) = &metadata.non_empty_domain else {
        return Ok(());
    };
    if !non_empty.intersects(bbox) {
        return Ok(());
    }
    let tile_boxes = enumerate_dense_tiles(&schema.domain, non_empty, schema.tile_order)?;

    let per_tile: Vec<Result<Vec<(Vec<i64>, CellValues)>>> = tile_boxes
        .par_iter()
        .enumerate()
        .map(|(tile_idx, box_bounds)| -> Result<Vec<(Vec<i64>, CellValues)>> {
            let Some(&cell_num) = metadata.tile_cell_nums.get(tile_idx) else {
                return Ok(Vec::new());
            };
            if cell_num == 0 || !box_intersects(box_bounds, bbox) {
                return Ok(Vec::new());
            }
            let cells = iterate_box(box_bounds, schema.cell_order);
            let mut out = Vec::new();
            for (local, coords) in cells.iter().enumerate().take(cell_num as usize) {
                if !cell_in_ranges(coords, effective_ranges) {
                    continue;
                }
                let mut cell = CellValues::default();
                for (attr_idx, attr) in attrs.iter().enumerate() {
                    let Some(tile_index) = metadata.attribute_tiles.get(attr_idx) else {
                        continue;
                    };
                    let has_tile = if attr.is_var() {
                        tile_idx < tile_index.var_tile_offsets.len()
                    } else {
                        tile_idx < tile_index.tile_offsets.len()
                    };
                    if !has_tile {
                        continue;
                    }
                    let (bytes, validity) = read_attr_cell(ctx, fragment_uri, attr_idx as u32, tile_idx, attr, tile_index, local)?;
                    cell.values.insert(attr.name.clone(), bytes);
                    if let Some(v) = validity {
                        cell.validity.insert(attr.name.clone(), v);
                    }
                }
                out.push((coords.clone(), cell));
            }
            Ok(out)
        })
        .collect();

    for result in per_tile {
        for (coords, cell) in result? {
            merged.insert(coords, cell);
        }
    }
    Ok(())
}

fn box_intersects(box_bounds: &[(i64, i64)], ranges: &[(i64, i64)]) -> bool {
    box_bounds
        .iter()
        .zip(ranges)
        .all(|(&(lo, hi), &(qlo, qhi))| lo <= qhi && qlo <= hi)
}

/// Assigns every cell in the requested subarray that no fragment wrote a
/// blank entry, so [`assemble_result`] fills its attributes' fill values
/// (§3: dense arrays have no notion of "missing" cells within their
/// domain).
fn fill_dense_gaps(effective_ranges: &[Vec<(i64, i64)>], merged: &mut BTreeMap<Vec<i64>, CellValues>) {
    let value_lists: Vec<Vec<i64>> = effective_ranges
        .iter()
        .map(|dim_ranges| {
            let mut values: Vec<i64> = dim_ranges.iter().flat_map(|&(lo, hi)| lo..=hi).collect();
            values.sort_unstable();
            values.dedup();
            values
        })
        .collect();

    let dim_num = value_lists.len();
    let mut combos = vec![Vec::new()];
    for values in &value_lists {
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for &v in values {
                let mut extended: Vec<i64> = combo.clone();
                extended.push(v);
                next.push(extended);
            }
        }
        combos = next;
    }

    for coords in combos {
        if coords.len() != dim_num {
            continue;
        }
        merged.entry(coords).or_insert_with(CellValues::default);
    }
}

/// Orders the merged result keys per `layout`.
fn order_keys(merged: &BTreeMap<Vec<i64>, CellValues>, schema: &Schema, layout: Layout) -> Result<Vec<Vec<i64>>> {
    let mut keys: Vec<Vec<i64>> = merged.keys().cloned().collect();
    match layout {
        // `BTreeMap<Vec<i64>, _>` already iterates in row-major order
        // (`Vec<i64>`'s `Ord` compares element by element, dimension 0 first).
        Layout::RowMajor | Layout::Unordered => {}
        Layout::ColMajor => keys.sort_by(|a, b| compare_coords(a, b, Order::ColMajor)),
        Layout::GlobalOrder => {
            let mut err = None;
            keys.sort_by(|a, b| {
                let ids = (schema.domain.tile_id(a, schema.tile_order), schema.domain.tile_id(b, schema.tile_order));
                match ids {
                    (Ok(ta), Ok(tb)) => match ta.cmp(&tb) {
                        std::cmp::Ordering::Equal => compare_coords(a, b, schema.cell_order),
                        other => other,
                    },
                    _ => {
                        err = Some(crate::Error::Query("failed to compute tile id while ordering results".into()));
                        std::cmp::Ordering::Equal
                    }
                }
            });
            if let Some(e) = err {
                return Err(e);
            }
        }
    }
    Ok(keys)
}
