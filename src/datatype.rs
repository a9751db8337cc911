// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Scalar datatype tag used by dimensions and attributes.
//!
//! The C++ source monomorphizes tiles/comparators over a `<T>` template
//! parameter per numeric type; here a tag enum plus per-tag helpers keeps
//! the hot paths (sort comparators, MBR expansion, tile-id arithmetic)
//! monomorphized without generating a distinct struct per type.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Scalar datatype of a dimension or attribute.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Datatype {
    /// 8-bit signed integer
    Int8,
    /// 8-bit unsigned integer
    Uint8,
    /// 16-bit signed integer
    Int16,
    /// 16-bit unsigned integer
    Uint16,
    /// 32-bit signed integer
    Int32,
    /// 32-bit unsigned integer
    Uint32,
    /// 64-bit signed integer
    Int64,
    /// 64-bit unsigned integer
    Uint64,
    /// 32-bit IEEE float
    Float32,
    /// 64-bit IEEE float
    Float64,
    /// Fixed-width ASCII string cell (byte-for-byte comparison)
    StringAscii,
}

impl Datatype {
    /// Byte width of one scalar value of this type.
    ///
    /// # Panics
    ///
    /// Panics for [`Datatype::StringAscii`], which has no fixed width.
    #[must_use]
    pub fn byte_width(self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Int64 | Self::Uint64 | Self::Float64 => 8,
            Self::StringAscii => panic!("StringAscii has no fixed byte width"),
        }
    }

    /// Whether this type is a floating-point type.
    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    /// Whether this type is an integral type eligible for integer-only
    /// filters (RLE, double-delta, bit-width reduction).
    #[must_use]
    pub fn is_integral(self) -> bool {
        !self.is_float() && !matches!(self, Self::StringAscii)
    }
}

impl Encode for Datatype {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        let tag: u8 = match self {
            Self::Int8 => 0,
            Self::Uint8 => 1,
            Self::Int16 => 2,
            Self::Uint16 => 3,
            Self::Int32 => 4,
            Self::Uint32 => 5,
            Self::Int64 => 6,
            Self::Uint64 => 7,
            Self::Float32 => 8,
            Self::Float64 => 9,
            Self::StringAscii => 10,
        };
        writer.write_u8(tag)?;
        Ok(())
    }
}

impl Decode for Datatype {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;
        Ok(match tag {
            0 => Self::Int8,
            1 => Self::Uint8,
            2 => Self::Int16,
            3 => Self::Uint16,
            4 => Self::Int32,
            5 => Self::Uint32,
            6 => Self::Int64,
            7 => Self::Uint64,
            8 => Self::Float32,
            9 => Self::Float64,
            10 => Self::StringAscii,
            tag => return Err(DecodeError::InvalidTag(("Datatype", tag))),
        })
    }
}

/// A single scalar coordinate or attribute value, tagged by datatype.
///
/// Used where the schema's generic datatype must carry a concrete value
/// (fill values, domain bounds, tile extents).
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Scalar {
    /// 8-bit signed
    Int8(i8),
    /// 8-bit unsigned
    Uint8(u8),
    /// 16-bit signed
    Int16(i16),
    /// 16-bit unsigned
    Uint16(u16),
    /// 32-bit signed
    Int32(i32),
    /// 32-bit unsigned
    Uint32(u32),
    /// 64-bit signed
    Int64(i64),
    /// 64-bit unsigned
    Uint64(u64),
    /// 32-bit float
    Float32(f32),
    /// 64-bit float
    Float64(f64),
}

impl Scalar {
    /// The datatype tag of this scalar.
    #[must_use]
    pub fn datatype(self) -> Datatype {
        match self {
            Self::Int8(_) => Datatype::Int8,
            Self::Uint8(_) => Datatype::Uint8,
            Self::Int16(_) => Datatype::Int16,
            Self::Uint16(_) => Datatype::Uint16,
            Self::Int32(_) => Datatype::Int32,
            Self::Uint32(_) => Datatype::Uint32,
            Self::Int64(_) => Datatype::Int64,
            Self::Uint64(_) => Datatype::Uint64,
            Self::Float32(_) => Datatype::Float32,
            Self::Float64(_) => Datatype::Float64,
        }
    }

    /// Converts to `i64`, the common representation used by integral
    /// tile-id arithmetic and the double-delta filter.
    ///
    /// # Panics
    ///
    /// Panics for floating-point scalars.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Int8(v) => i64::from(v),
            Self::Uint8(v) => i64::from(v),
            Self::Int16(v) => i64::from(v),
            Self::Uint16(v) => i64::from(v),
            Self::Int32(v) => i64::from(v),
            Self::Uint32(v) => i64::from(v),
            Self::Int64(v) => v,
            Self::Uint64(v) => v as i64,
            Self::Float32(_) | Self::Float64(_) => panic!("Scalar::as_i64 on a float scalar"),
        }
    }

    /// Converts to `f64`.
    #[must_use]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int8(v) => f64::from(v),
            Self::Uint8(v) => f64::from(v),
            Self::Int16(v) => f64::from(v),
            Self::Uint16(v) => f64::from(v),
            Self::Int32(v) => f64::from(v),
            Self::Uint32(v) => f64::from(v),
            Self::Int64(v) => v as f64,
            Self::Uint64(v) => v as f64,
            Self::Float32(v) => f64::from(v),
            Self::Float64(v) => v,
        }
    }
}
