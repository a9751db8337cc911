// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Fragment metadata and the per-fragment static tile index (§3, §4.6).
//!
//! A fragment is an immutable, timestamped directory of tile files plus
//! one metadata blob describing, per attribute, where each tile lives and
//! (for sparse arrays) the minimum bounding rectangle each tile's cells
//! occupy. [`RTree`] is a bulk-loaded, read-only index over those MBRs:
//! built once when the fragment is finalized, queried many times by
//! range reads, never mutated — the same shape as a sparse array's R-tree
//! in the source, generalized to a fixed fanout instead of a disk page
//! size.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::domain::Mbr;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Children per internal node of the bulk-loaded R-tree (§4.6).
pub const RTREE_FANOUT: usize = 16;

/// A bulk-loaded, static R-tree over per-tile MBRs.
///
/// Built bottom-up from leaf MBRs in tile order: level 0 holds the leaf
/// MBRs themselves, each higher level holds the union MBR of up to
/// [`RTREE_FANOUT`] consecutive nodes from the level below, until one
/// level has a single root entry. Node `i` at level `L` always covers
/// leaf indices `[i * fanout^L, (i+1) * fanout^L)`, so search descends
/// without storing explicit child pointers.
#[derive(Clone, Debug, PartialEq)]
pub struct RTree {
    levels: Vec<Vec<Mbr>>,
}

impl RTree {
    /// Bulk-loads an R-tree over `leaves`, in tile order.
    #[must_use]
    pub fn build(leaves: Vec<Mbr>) -> Self {
        if leaves.is_empty() {
            return Self { levels: vec![] };
        }
        let mut levels = vec![leaves];
        while levels.last().expect("levels never empty here").len() > 1 {
            #[allow(clippy::indexing_slicing)]
            let prev = &levels[levels.len() - 1];
            let mut next = Vec::with_capacity(prev.len().div_ceil(RTREE_FANOUT));
            for chunk in prev.chunks(RTREE_FANOUT) {
                #[allow(clippy::indexing_slicing)]
                let mut merged = chunk[0].clone();
                for m in &chunk[1..] {
                    merged.merge(m);
                }
                next.push(merged);
            }
            levels.push(next);
        }
        Self { levels }
    }

    /// Number of leaf (tile) MBRs.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.levels.first().map_or(0, Vec::len)
    }

    /// Returns the tile indices whose MBR overlaps `ranges` (one
    /// `(lo, hi)` pair per dimension), in ascending tile order.
    #[must_use]
    pub fn search(&self, ranges: &[(i64, i64)]) -> Vec<usize> {
        let mut results = Vec::new();
        if let Some(top) = self.levels.len().checked_sub(1) {
            self.search_node(top, 0, ranges, &mut results);
        }
        results
    }

    fn search_node(&self, level: usize, idx: usize, ranges: &[(i64, i64)], results: &mut Vec<usize>) {
        let Some(node) = self.levels.get(level).and_then(|l| l.get(idx)) else {
            return;
        };
        if !node.intersects(ranges) {
            return;
        }
        if level == 0 {
            results.push(idx);
            return;
        }
        let base = idx * RTREE_FANOUT;
        for child in 0..RTREE_FANOUT {
            self.search_node(level - 1, base + child, ranges, results);
        }
    }
}

impl Encode for RTree {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        let leaves = self.levels.first().cloned().unwrap_or_default();
        writer.write_u32::<LittleEndian>(u32::try_from(leaves.len()).map_err(bad_len)?)?;
        for mbr in &leaves {
            mbr.encode_into(writer)?;
        }
        Ok(())
    }
}

impl Decode for RTree {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let n = reader.read_u32::<LittleEndian>()? as usize;
        let mut leaves = Vec::with_capacity(n);
        for _ in 0..n {
            leaves.push(Mbr::decode_from(reader)?);
        }
        Ok(Self::build(leaves))
    }
}

/// Per-attribute tile placement within a fragment's value/offsets/validity
/// files (§3).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttributeTileIndex {
    /// Byte offset of each tile within the attribute's values file.
    pub tile_offsets: Vec<u64>,
    /// Byte size of each tile within the attribute's values file.
    pub tile_sizes: Vec<u64>,
    /// Byte offset of each tile within the attribute's offsets file, for
    /// variable-length attributes.
    pub var_tile_offsets: Vec<u64>,
    /// Byte size of each tile within the attribute's offsets file.
    pub var_tile_sizes: Vec<u64>,
    /// Byte offset of each tile within the attribute's validity file, for
    /// nullable attributes.
    pub validity_tile_offsets: Vec<u64>,
    /// Byte size of each tile within the attribute's validity file.
    pub validity_tile_sizes: Vec<u64>,
}

impl Encode for AttributeTileIndex {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        write_u64_vec(writer, &self.tile_offsets)?;
        write_u64_vec(writer, &self.tile_sizes)?;
        write_u64_vec(writer, &self.var_tile_offsets)?;
        write_u64_vec(writer, &self.var_tile_sizes)?;
        write_u64_vec(writer, &self.validity_tile_offsets)?;
        write_u64_vec(writer, &self.validity_tile_sizes)?;
        Ok(())
    }
}

impl Decode for AttributeTileIndex {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        Ok(Self {
            tile_offsets: read_u64_vec(reader)?,
            tile_sizes: read_u64_vec(reader)?,
            var_tile_offsets: read_u64_vec(reader)?,
            var_tile_sizes: read_u64_vec(reader)?,
            validity_tile_offsets: read_u64_vec(reader)?,
            validity_tile_sizes: read_u64_vec(reader)?,
        })
    }
}

fn write_u64_vec<W: Write>(writer: &mut W, values: &[u64]) -> std::result::Result<(), EncodeError> {
    writer.write_u32::<LittleEndian>(u32::try_from(values.len()).map_err(bad_len)?)?;
    for &v in values {
        writer.write_u64::<LittleEndian>(v)?;
    }
    Ok(())
}

fn read_u64_vec<R: Read>(reader: &mut R) -> std::result::Result<Vec<u64>, DecodeError> {
    let n = reader.read_u32::<LittleEndian>()? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(reader.read_u64::<LittleEndian>()?);
    }
    Ok(out)
}

fn bad_len(_: std::num::TryFromIntError) -> EncodeError {
    EncodeError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "field too long"))
}

/// Decoded `__fragment_metadata.tdb` contents (§3).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FragmentMetadata {
    /// Milliseconds since epoch the writer that produced this fragment
    /// started at (the fragment directory name's first component).
    pub timestamp_ms: u64,
    /// Total number of cells written across all tiles.
    pub cell_num: u64,
    /// Number of cells in each tile, in global order.
    pub tile_cell_nums: Vec<u64>,
    /// The union MBR of every cell written (both array types: for dense
    /// arrays this is the written subarray's bound in domain coordinates).
    pub non_empty_domain: Option<Mbr>,
    /// Per-tile MBRs, in global order; populated for sparse arrays only.
    pub tile_mbrs: Vec<Mbr>,
    /// Per-attribute tile placement, indexed as in the schema's attribute
    /// list (plus one trailing entry for the coordinates, sparse only).
    pub attribute_tiles: Vec<AttributeTileIndex>,
}

impl FragmentMetadata {
    /// Builds the static R-tree over [`Self::tile_mbrs`] (sparse arrays).
    #[must_use]
    pub fn build_rtree(&self) -> RTree {
        RTree::build(self.tile_mbrs.clone())
    }
}

impl Encode for FragmentMetadata {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u64::<LittleEndian>(self.timestamp_ms)?;
        writer.write_u64::<LittleEndian>(self.cell_num)?;
        write_u64_vec(writer, &self.tile_cell_nums)?;
        match &self.non_empty_domain {
            Some(mbr) => {
                writer.write_u8(1)?;
                mbr.encode_into(writer)?;
            }
            None => writer.write_u8(0)?,
        }
        writer.write_u32::<LittleEndian>(u32::try_from(self.tile_mbrs.len()).map_err(bad_len)?)?;
        for mbr in &self.tile_mbrs {
            mbr.encode_into(writer)?;
        }
        writer.write_u32::<LittleEndian>(u32::try_from(self.attribute_tiles.len()).map_err(bad_len)?)?;
        for attr in &self.attribute_tiles {
            attr.encode_into(writer)?;
        }
        Ok(())
    }
}

impl Decode for FragmentMetadata {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let timestamp_ms = reader.read_u64::<LittleEndian>()?;
        let cell_num = reader.read_u64::<LittleEndian>()?;
        let tile_cell_nums = read_u64_vec(reader)?;
        let non_empty_domain = match reader.read_u8()? {
            0 => None,
            1 => Some(Mbr::decode_from(reader)?),
            tag => return Err(DecodeError::InvalidTag(("FragmentMetadata::non_empty_domain", tag))),
        };
        let mbr_num = reader.read_u32::<LittleEndian>()? as usize;
        let mut tile_mbrs = Vec::with_capacity(mbr_num);
        for _ in 0..mbr_num {
            tile_mbrs.push(Mbr::decode_from(reader)?);
        }
        let attr_num = reader.read_u32::<LittleEndian>()? as usize;
        let mut attribute_tiles = Vec::with_capacity(attr_num);
        for _ in 0..attr_num {
            attribute_tiles.push(AttributeTileIndex::decode_from(reader)?);
        }
        Ok(Self {
            timestamp_ms,
            cell_num,
            tile_cell_nums,
            non_empty_domain,
            tile_mbrs,
            attribute_tiles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn point_mbr(x: i64, y: i64) -> Mbr {
        Mbr::from_point(&[x, y])
    }

    #[test]
    fn rtree_search_finds_overlapping_leaves_only() {
        let leaves = vec![point_mbr(0, 0), point_mbr(5, 5), point_mbr(9, 9), point_mbr(2, 8)];
        let tree = RTree::build(leaves);
        let hits = tree.search(&[(4, 6), (4, 6)]);
        assert_eq!(hits, vec![1]);
    }

    #[test]
    fn rtree_search_handles_many_leaves_across_levels() {
        let leaves: Vec<Mbr> = (0..100).map(|i| point_mbr(i, i)).collect();
        let tree = RTree::build(leaves);
        assert!(tree.levels.len() > 1);
        let mut hits = tree.search(&[(40, 42), (40, 42)]);
        hits.sort_unstable();
        assert_eq!(hits, vec![40, 41, 42]);
    }

    #[test]
    fn rtree_empty_is_empty() {
        let tree = RTree::build(vec![]);
        assert_eq!(tree.leaf_count(), 0);
        assert!(tree.search(&[(0, 10)]).is_empty());
    }

    #[test]
    fn fragment_metadata_roundtrip() {
        let meta = FragmentMetadata {
            timestamp_ms: 12345,
            cell_num: 4,
            tile_cell_nums: vec![4],
            non_empty_domain: Some(point_mbr(0, 3)),
            tile_mbrs: vec![point_mbr(0, 0), point_mbr(3, 3)],
            attribute_tiles: vec![AttributeTileIndex {
                tile_offsets: vec![0, 16],
                tile_sizes: vec![16, 16],
                ..Default::default()
            }],
        };
        let bytes = meta.encode_into_vec();
        let decoded = FragmentMetadata::decode_from(&mut std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(decoded, meta);
        assert_eq!(decoded.build_rtree().leaf_count(), 2);
    }
}
