// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Domain, dimensions, and the tile-space arithmetic that turns a
//! coordinate tuple into a tile id or a total Hilbert order (§4.4).
//!
//! Tile-id and Hilbert arithmetic here work over `i64`/`u64`, the common
//! representation integral dimensions share with the double-delta filter
//! (§4.3) and the source's comparator templates (`core/include/misc/comparators.h`).
//! Floating-point dimension domains are accepted by the schema (§3) but
//! tile-space arithmetic is defined only for integral dimensions; calling
//! it on a non-integral domain is a [`crate::Error::Schema`].

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::datatype::{Datatype, Scalar};
use crate::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::cmp::Ordering;
use std::io::{Read, Write};

/// Ordering of space tiles, or of cells within a tile (§3, §4.4).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Order {
    /// Row-major (last dimension varies fastest).
    RowMajor,
    /// Column-major (first dimension varies fastest).
    ColMajor,
}

impl Encode for Order {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u8(match self {
            Self::RowMajor => 0,
            Self::ColMajor => 1,
        })?;
        Ok(())
    }
}

impl Decode for Order {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        Ok(match reader.read_u8()? {
            0 => Self::RowMajor,
            1 => Self::ColMajor,
            tag => return Err(DecodeError::InvalidTag(("Order", tag))),
        })
    }
}

/// One dimension of a [`Domain`]: name, datatype, `[lo, hi]` bound, and
/// tile extent (§3).
#[derive(Clone, Debug, PartialEq)]
pub struct Dimension {
    /// Dimension name, unique within the domain.
    pub name: String,
    /// Scalar datatype shared by `lo`, `hi`, and `tile_extent`.
    pub datatype: Datatype,
    /// Inclusive lower bound.
    pub lo: Scalar,
    /// Inclusive upper bound.
    pub hi: Scalar,
    /// Tile extent along this dimension.
    pub tile_extent: Scalar,
}

impl Dimension {
    /// Builds an integral dimension.
    ///
    /// # Panics
    ///
    /// Panics if `datatype` is not integral (see [`Datatype::is_integral`]).
    #[must_use]
    pub fn new_integral(name: impl Into<String>, datatype: Datatype, lo: i64, hi: i64, tile_extent: i64) -> Self {
        assert!(datatype.is_integral(), "Dimension::new_integral requires an integral datatype");
        Self {
            name: name.into(),
            datatype,
            lo: to_scalar(datatype, lo),
            hi: to_scalar(datatype, hi),
            tile_extent: to_scalar(datatype, tile_extent),
        }
    }

    fn lo_i64(&self) -> Result<i64> {
        if !self.datatype.is_integral() {
            return Err(Error::Schema(format!("dimension {} is not integral", self.name)));
        }
        Ok(self.lo.as_i64())
    }

    fn hi_i64(&self) -> Result<i64> {
        if !self.datatype.is_integral() {
            return Err(Error::Schema(format!("dimension {} is not integral", self.name)));
        }
        Ok(self.hi.as_i64())
    }

    fn extent_i64(&self) -> Result<i64> {
        if !self.datatype.is_integral() {
            return Err(Error::Schema(format!("dimension {} is not integral", self.name)));
        }
        let extent = self.tile_extent.as_i64();
        if extent <= 0 {
            return Err(Error::Schema(format!("dimension {} has non-positive tile extent", self.name)));
        }
        Ok(extent)
    }

    /// Number of space tiles along this dimension, after domain expansion
    /// (§3: `hi - lo + 1` need not be a multiple of the extent).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] if the dimension is not integral or has a
    /// non-positive extent.
    pub fn tile_count(&self) -> Result<u64> {
        let (lo, hi, ext) = (self.lo_i64()?, self.hi_i64()?, self.extent_i64()?);
        let span = hi
            .checked_sub(lo)
            .and_then(|d| d.checked_add(1))
            .ok_or_else(|| Error::Schema(format!("dimension {} domain overflows i64", self.name)))?;
        Ok((span as u64).div_ceil(ext as u64))
    }

    /// Expanded upper bound: `lo + tile_count() * extent - 1` (§3).
    ///
    /// # Errors
    ///
    /// Propagates [`Self::tile_count`]'s errors.
    pub fn expanded_hi(&self) -> Result<i64> {
        let (lo, ext) = (self.lo_i64()?, self.extent_i64()?);
        let tiles = self.tile_count()?;
        Ok(lo + (tiles as i64) * ext - 1)
    }
}

fn to_scalar(datatype: Datatype, v: i64) -> Scalar {
    match datatype {
        Datatype::Int8 => Scalar::Int8(v as i8),
        Datatype::Uint8 => Scalar::Uint8(v as u8),
        Datatype::Int16 => Scalar::Int16(v as i16),
        Datatype::Uint16 => Scalar::Uint16(v as u16),
        Datatype::Int32 => Scalar::Int32(v as i32),
        Datatype::Uint32 => Scalar::Uint32(v as u32),
        Datatype::Int64 => Scalar::Int64(v),
        Datatype::Uint64 => Scalar::Uint64(v as u64),
        Datatype::Float32 | Datatype::Float64 | Datatype::StringAscii => {
            unreachable!("to_scalar called with a non-integral datatype")
        }
    }
}

impl Encode for Dimension {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        let name_bytes = self.name.as_bytes();
        writer.write_u32::<LittleEndian>(u32::try_from(name_bytes.len()).map_err(bad_len)?)?;
        writer.write_all(name_bytes)?;
        self.datatype.encode_into(writer)?;
        writer.write_i64::<LittleEndian>(self.lo.as_i64())?;
        writer.write_i64::<LittleEndian>(self.hi.as_i64())?;
        writer.write_i64::<LittleEndian>(self.tile_extent.as_i64())?;
        Ok(())
    }
}

impl Decode for Dimension {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let name_len = reader.read_u32::<LittleEndian>()? as usize;
        let mut name_buf = vec![0u8; name_len];
        reader.read_exact(&mut name_buf)?;
        let name = String::from_utf8_lossy(&name_buf).into_owned();
        let datatype = Datatype::decode_from(reader)?;
        let lo = reader.read_i64::<LittleEndian>()?;
        let hi = reader.read_i64::<LittleEndian>()?;
        let extent = reader.read_i64::<LittleEndian>()?;
        Ok(Self {
            name,
            datatype,
            lo: to_scalar(datatype, lo),
            hi: to_scalar(datatype, hi),
            tile_extent: to_scalar(datatype, extent),
        })
    }
}

fn bad_len(_: std::num::TryFromIntError) -> EncodeError {
    EncodeError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "field too long"))
}

/// The ordered sequence of typed dimensions making up an array's logical
/// coordinate space (§3).
#[derive(Clone, Debug, PartialEq)]
pub struct Domain {
    /// Dimensions, in declaration order.
    pub dimensions: Vec<Dimension>,
}

impl Domain {
    /// Builds a domain from an ordered dimension list.
    #[must_use]
    pub fn new(dimensions: Vec<Dimension>) -> Self {
        Self { dimensions }
    }

    /// Number of dimensions.
    #[must_use]
    pub fn dim_num(&self) -> usize {
        self.dimensions.len()
    }

    /// The expanded per-dimension tile counts (§3 domain expansion).
    ///
    /// # Errors
    ///
    /// Propagates [`Dimension::tile_count`]'s errors.
    pub fn tile_counts(&self) -> Result<Vec<u64>> {
        self.dimensions.iter().map(Dimension::tile_count).collect()
    }

    /// Total number of space tiles in the (expanded) domain.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::tile_counts`]'s errors.
    pub fn total_tile_count(&self) -> Result<u64> {
        Ok(self.tile_counts()?.into_iter().product())
    }

    /// Computes the tile id of the space tile containing `coords`, per
    /// `tile_order` (§4.4): `Σ_i ⌊(c_i - lo_i)/ext_i⌋ · Π_{j after i} tile_count_j`,
    /// with "after" meaning `j > i` for row-major and `j < i` for col-major.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] if a dimension is non-integral, or
    /// [`Error::Query`] if `coords.len()` does not match the domain's
    /// dimensionality.
    pub fn tile_id(&self, coords: &[i64], tile_order: Order) -> Result<u64> {
        if coords.len() != self.dim_num() {
            return Err(Error::Query(format!(
                "expected {} coordinates, got {}",
                self.dim_num(),
                coords.len()
            )));
        }
        let tile_counts = self.tile_counts()?;
        let dim_num = self.dim_num();

        let mut id: u64 = 0;
        match tile_order {
            Order::RowMajor => {
                for i in 0..dim_num {
                    let tile_idx = self.tile_index(i, coords[i])?;
                    let suffix_product: u64 = tile_counts[i + 1..].iter().product();
                    id += tile_idx * suffix_product;
                }
            }
            Order::ColMajor => {
                for i in 0..dim_num {
                    let tile_idx = self.tile_index(i, coords[i])?;
                    let prefix_product: u64 = tile_counts[..i].iter().product();
                    id += tile_idx * prefix_product;
                }
            }
        }
        Ok(id)
    }

    fn tile_index(&self, dim: usize, coord: i64) -> Result<u64> {
        let dimension = &self.dimensions[dim];
        let (lo, ext) = (dimension.lo_i64()?, dimension.extent_i64()?);
        if coord < lo {
            return Err(Error::Query(format!(
                "coordinate {coord} is below dimension {}'s lower bound {lo}",
                dimension.name
            )));
        }
        Ok(((coord - lo) as u64) / (ext as u64))
    }

    /// Computes a Hilbert-curve total order index over domain-normalized,
    /// bit-interleaved coordinates (§4.4). Uses the standard axes<->index
    /// transform (Skilling's algorithm); the only contract is a total
    /// order, not bit-exact interop with any other implementation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] for non-integral dimensions.
    pub fn cell_id_hilbert(&self, coords: &[i64]) -> Result<u128> {
        const BITS: u32 = 16;
        let mut normalized = Vec::with_capacity(self.dim_num());
        for (dim, &c) in self.dimensions.iter().zip(coords) {
            let lo = dim.lo_i64()?;
            let span = (dim.expanded_hi()? - lo).max(1) as u64;
            let offset = (c - lo).max(0) as u64;
            let scaled = (offset.saturating_mul((1u64 << BITS) - 1)) / span;
            normalized.push(scaled.min((1u64 << BITS) - 1));
        }
        Ok(hilbert_index(&normalized, BITS))
    }
}

/// Skilling's axes-to-index Hilbert curve transform, generalized to `n`
/// dimensions and `bits` bits per axis.
fn hilbert_index(coords: &[u64], bits: u32) -> u128 {
    let n = coords.len();
    let mut x = coords.to_vec();
    let m = 1u64 << (bits - 1);

    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }
    for i in 1..n {
        x[i] ^= x[i - 1];
    }
    let mut t = 0u64;
    q = m;
    while q > 1 {
        if x[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for v in &mut x {
        *v ^= t;
    }

    let mut index: u128 = 0;
    for b in (0..bits).rev() {
        for &v in &x {
            index = (index << 1) | u128::from((v >> b) & 1);
        }
    }
    index
}

/// Compares two coordinate tuples lexicographically in the given order
/// (§4.4): row-major compares dimension 0 first, column-major compares
/// the last dimension first. Used as the tie-break after tile id in
/// [`CellOrderComparator`].
#[must_use]
pub fn compare_coords(a: &[i64], b: &[i64], order: Order) -> Ordering {
    match order {
        Order::RowMajor => {
            for i in 0..a.len() {
                match a[i].cmp(&b[i]) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
        }
        Order::ColMajor => {
            for i in (0..a.len()).rev() {
                match a[i].cmp(&b[i]) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
        }
    }
    Ordering::Equal
}

/// Sorts cell positions by `(tile_id, coordinate tuple)` without per-call
/// allocation (§4.4): compares by reference into a contiguous coordinate
/// buffer laid out `cell_idx * dim_num + dim_idx`, mirroring the source's
/// `SmallerIdRow`/`SmallerIdCol` comparators.
pub struct CellOrderComparator<'a> {
    domain: &'a Domain,
    coords: &'a [i64],
    tile_order: Order,
    cell_order: Order,
}

impl<'a> CellOrderComparator<'a> {
    /// Builds a comparator over `coords`, a flat buffer of `dim_num *
    /// cell_count` coordinates in cell-major layout.
    #[must_use]
    pub fn new(domain: &'a Domain, coords: &'a [i64], tile_order: Order, cell_order: Order) -> Self {
        Self {
            domain,
            coords,
            tile_order,
            cell_order,
        }
    }

    fn coords_of(&self, cell: usize) -> &[i64] {
        let dim_num = self.domain.dim_num();
        &self.coords[cell * dim_num..(cell + 1) * dim_num]
    }

    /// Compares cell positions `a` and `b` by global order.
    ///
    /// # Errors
    ///
    /// Propagates [`Domain::tile_id`]'s errors.
    pub fn compare(&self, a: usize, b: usize) -> Result<Ordering> {
        let tile_a = self.domain.tile_id(self.coords_of(a), self.tile_order)?;
        let tile_b = self.domain.tile_id(self.coords_of(b), self.tile_order)?;
        Ok(match tile_a.cmp(&tile_b) {
            Ordering::Equal => compare_coords(self.coords_of(a), self.coords_of(b), self.cell_order),
            other => other,
        })
    }
}

/// Minimum bounding rectangle of cell coordinates in a sparse tile (§3):
/// `2 ×` domain-type coordinates per dimension.
#[derive(Clone, Debug, PartialEq)]
pub struct Mbr {
    /// `(min, max)` inclusive bound per dimension.
    pub bounds: Vec<(i64, i64)>,
}

impl Mbr {
    /// An MBR containing a single coordinate tuple.
    #[must_use]
    pub fn from_point(coords: &[i64]) -> Self {
        Self {
            bounds: coords.iter().map(|&c| (c, c)).collect(),
        }
    }

    /// Expands this MBR to also contain `coords`.
    pub fn expand(&mut self, coords: &[i64]) {
        for (bound, &c) in self.bounds.iter_mut().zip(coords) {
            bound.0 = bound.0.min(c);
            bound.1 = bound.1.max(c);
        }
    }

    /// Expands this MBR to also contain `other`.
    pub fn merge(&mut self, other: &Mbr) {
        for (bound, other_bound) in self.bounds.iter_mut().zip(&other.bounds) {
            bound.0 = bound.0.min(other_bound.0);
            bound.1 = bound.1.max(other_bound.1);
        }
    }

    /// Whether this MBR overlaps the axis-aligned range `[ranges[i].0, ranges[i].1]`
    /// per dimension (used for subarray range search, including multi-range).
    #[must_use]
    pub fn intersects(&self, ranges: &[(i64, i64)]) -> bool {
        self.bounds
            .iter()
            .zip(ranges)
            .all(|(&(lo, hi), &(qlo, qhi))| lo <= qhi && qlo <= hi)
    }
}

impl Encode for Mbr {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u32::<LittleEndian>(u32::try_from(self.bounds.len()).map_err(bad_len)?)?;
        for &(lo, hi) in &self.bounds {
            writer.write_i64::<LittleEndian>(lo)?;
            writer.write_i64::<LittleEndian>(hi)?;
        }
        Ok(())
    }
}

impl Decode for Mbr {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let n = reader.read_u32::<LittleEndian>()? as usize;
        let mut bounds = Vec::with_capacity(n);
        for _ in 0..n {
            let lo = reader.read_i64::<LittleEndian>()?;
            let hi = reader.read_i64::<LittleEndian>()?;
            bounds.push((lo, hi));
        }
        Ok(Self { bounds })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn dense_4x4() -> Domain {
        Domain::new(vec![
            Dimension::new_integral("x", Datatype::Int32, 1, 4, 2),
            Dimension::new_integral("y", Datatype::Int32, 1, 4, 2),
        ])
    }

    #[test]
    fn tile_count_handles_non_dividing_extent() {
        let dim = Dimension::new_integral("d", Datatype::Int32, 1, 10, 3);
        assert_eq!(dim.tile_count().unwrap(), 4);
        assert_eq!(dim.expanded_hi().unwrap(), 12);
    }

    #[test]
    fn tile_id_row_major_matches_grid_layout() {
        let domain = dense_4x4();
        // 2x2 space tiles; tile (0,0) at coords (1,1), tile (1,1) at (3,3).
        assert_eq!(domain.tile_id(&[1, 1], Order::RowMajor).unwrap(), 0);
        assert_eq!(domain.tile_id(&[1, 3], Order::RowMajor).unwrap(), 1);
        assert_eq!(domain.tile_id(&[3, 1], Order::RowMajor).unwrap(), 2);
        assert_eq!(domain.tile_id(&[3, 3], Order::RowMajor).unwrap(), 3);
    }

    #[test]
    fn tile_id_col_major_is_transposed_row_major() {
        let domain = dense_4x4();
        assert_eq!(domain.tile_id(&[1, 1], Order::ColMajor).unwrap(), 0);
        assert_eq!(domain.tile_id(&[3, 1], Order::ColMajor).unwrap(), 1);
        assert_eq!(domain.tile_id(&[1, 3], Order::ColMajor).unwrap(), 2);
    }

    #[test]
    fn comparator_orders_by_tile_then_coordinate() {
        let domain = dense_4x4();
        // Cells: (2,4), (1,1), (2,3) laid out flat.
        let coords: Vec<i64> = vec![2, 4, 1, 1, 2, 3];
        let cmp = CellOrderComparator::new(&domain, &coords, Order::RowMajor, Order::RowMajor);
        let mut order = vec![0usize, 1, 2];
        order.sort_by(|&a, &b| cmp.compare(a, b).unwrap());
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn hilbert_index_is_a_total_order_preserving_locality() {
        let domain = Domain::new(vec![
            Dimension::new_integral("x", Datatype::Int32, 0, 15, 1),
            Dimension::new_integral("y", Datatype::Int32, 0, 15, 1),
        ]);
        let a = domain.cell_id_hilbert(&[0, 0]).unwrap();
        let b = domain.cell_id_hilbert(&[0, 1]).unwrap();
        let c = domain.cell_id_hilbert(&[15, 15]).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn mbr_expand_and_intersects() {
        let mut mbr = Mbr::from_point(&[2, 4]);
        mbr.expand(&[2, 3]);
        assert_eq!(mbr.bounds, vec![(2, 2), (3, 4)]);
        assert!(mbr.intersects(&[(1, 2), (2, 4)]));
        assert!(!mbr.intersects(&[(0, 1), (0, 1)]));
    }

    #[test]
    fn mbr_serde_roundtrip() {
        let mbr = Mbr::from_point(&[1, -2]);
        let bytes = mbr.encode_into_vec();
        let decoded = Mbr::decode_from(&mut std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(decoded, mbr);
    }
}
