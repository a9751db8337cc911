// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The per-attribute codec pipeline (§4.3).
//!
//! Each [`Filter`] is a tagged variant with an `apply_forward`/
//! `apply_backward` pair (design notes §9: no virtual dispatch needed
//! across the pipeline, unlike the source's polymorphic filter classes).
//! A [`FilterPipeline`] is an ordered list; forward application runs
//! stage 0 first, backward application reverses the list so stage 0
//! undoes last, mirroring how the schema persists it (§4.4).
//!
//! Every stage writes a small self-describing header so that
//! `apply_backward` never needs out-of-band parameters beyond the
//! attribute's scalar byte width.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::datatype::Datatype;
use crate::{Error, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

const RLE_MAX_RUN: u32 = 65535;
const BWR_WINDOW: usize = 512;
const BWR_WIDTHS: [usize; 4] = [1, 2, 4, 8];
const DD_BITSIZES: [u32; 7] = [1, 2, 4, 8, 16, 32, 64];

/// One stage of a per-attribute filter pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    /// No-op; the identity filter (`NO_COMPRESSION`).
    Passthrough,
    /// GZIP, header = uncompressed size.
    #[cfg(feature = "gzip")]
    Gzip { level: u32 },
    /// ZSTD, header = uncompressed size.
    #[cfg(feature = "zstd")]
    Zstd { level: i32 },
    /// LZ4, header = uncompressed size.
    #[cfg(feature = "lz4")]
    Lz4,
    /// BZIP2, header = uncompressed size.
    #[cfg(feature = "bzip2")]
    Bzip2 { level: u32 },
    /// Run-length encoding over fixed-width elements (§4.3).
    Rle,
    /// Double-delta over a signed/unsigned integer or time sequence (§4.3).
    DoubleDelta,
    /// Lossy float quantization: `q = round((x - offset) / scale)` (§4.3).
    FloatScale { byte_width: u8, scale: f64, offset: f64 },
    /// Per-window narrowest-integer-width packing (§4.3).
    BitWidthReduction,
}

impl Filter {
    fn tag(&self) -> u8 {
        match self {
            Self::Passthrough => 0,
            #[cfg(feature = "gzip")]
            Self::Gzip { .. } => 1,
            #[cfg(feature = "zstd")]
            Self::Zstd { .. } => 2,
            #[cfg(feature = "lz4")]
            Self::Lz4 => 3,
            #[cfg(feature = "bzip2")]
            Self::Bzip2 { .. } => 4,
            Self::Rle => 5,
            Self::DoubleDelta => 6,
            Self::FloatScale { .. } => 7,
            Self::BitWidthReduction => 8,
        }
    }

    /// Runs this stage forward (write path): `input -> encoded`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compression`] on output overflow or malformed
    /// input (e.g. a length that is not a multiple of `type_size`).
    pub fn apply_forward(&self, type_size: usize, input: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Passthrough => Ok(input.to_vec()),
            #[cfg(feature = "gzip")]
            Self::Gzip { level } => gzip_compress(*level, input),
            #[cfg(feature = "zstd")]
            Self::Zstd { level } => zstd_compress(*level, input),
            #[cfg(feature = "lz4")]
            Self::Lz4 => lz4_compress(input),
            #[cfg(feature = "bzip2")]
            Self::Bzip2 { level } => bzip2_compress(*level, input),
            Self::Rle => rle_compress(type_size, input),
            Self::DoubleDelta => double_delta_compress(input),
            Self::FloatScale {
                byte_width,
                scale,
                offset,
            } => float_scale_compress(type_size, *byte_width, *scale, *offset, input),
            Self::BitWidthReduction => bit_width_reduction_compress(type_size, input),
        }
    }

    /// Runs this stage backward (read path): `encoded -> input`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Compression`] or [`Error::Format`] if the header
    /// is malformed or truncated.
    pub fn apply_backward(&self, type_size: usize, input: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Passthrough => Ok(input.to_vec()),
            #[cfg(feature = "gzip")]
            Self::Gzip { .. } => gzip_decompress(input),
            #[cfg(feature = "zstd")]
            Self::Zstd { .. } => zstd_decompress(input),
            #[cfg(feature = "lz4")]
            Self::Lz4 => lz4_decompress(input),
            #[cfg(feature = "bzip2")]
            Self::Bzip2 { .. } => bzip2_decompress(input),
            Self::Rle => rle_decompress(type_size, input),
            Self::DoubleDelta => double_delta_decompress(input),
            Self::FloatScale { .. } => float_scale_decompress(type_size, input),
            Self::BitWidthReduction => bit_width_reduction_decompress(input),
        }
    }
}

impl Encode for Filter {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u8(self.tag())?;
        match self {
            Self::Passthrough | Self::Rle | Self::DoubleDelta | Self::BitWidthReduction => {}
            #[cfg(feature = "gzip")]
            Self::Gzip { level } => writer.write_u32::<LittleEndian>(*level)?,
            #[cfg(feature = "zstd")]
            Self::Zstd { level } => writer.write_i32::<LittleEndian>(*level)?,
            #[cfg(feature = "lz4")]
            Self::Lz4 => {}
            #[cfg(feature = "bzip2")]
            Self::Bzip2 { level } => writer.write_u32::<LittleEndian>(*level)?,
            Self::FloatScale {
                byte_width,
                scale,
                offset,
            } => {
                writer.write_u8(*byte_width)?;
                writer.write_f64::<LittleEndian>(*scale)?;
                writer.write_f64::<LittleEndian>(*offset)?;
            }
        }
        Ok(())
    }
}

impl Decode for Filter {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let tag = reader.read_u8()?;
        Ok(match tag {
            0 => Self::Passthrough,
            #[cfg(feature = "gzip")]
            1 => Self::Gzip {
                level: reader.read_u32::<LittleEndian>()?,
            },
            #[cfg(feature = "zstd")]
            2 => Self::Zstd {
                level: reader.read_i32::<LittleEndian>()?,
            },
            #[cfg(feature = "lz4")]
            3 => Self::Lz4,
            #[cfg(feature = "bzip2")]
            4 => Self::Bzip2 {
                level: reader.read_u32::<LittleEndian>()?,
            },
            5 => Self::Rle,
            6 => Self::DoubleDelta,
            7 => Self::FloatScale {
                byte_width: reader.read_u8()?,
                scale: reader.read_f64::<LittleEndian>()?,
                offset: reader.read_f64::<LittleEndian>()?,
            },
            8 => Self::BitWidthReduction,
            tag => return Err(DecodeError::InvalidTag(("Filter", tag))),
        })
    }
}

/// An ordered codec pipeline applied per attribute (§4.3).
///
/// Forward runs stage 0 first; backward reverses the list so each stage
/// undoes exactly the transform it applied on write.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterPipeline(pub Vec<Filter>);

impl FilterPipeline {
    /// An empty pipeline (equivalent to a single [`Filter::Passthrough`]).
    #[must_use]
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Builds a pipeline from an explicit stage list.
    #[must_use]
    pub fn new(filters: Vec<Filter>) -> Self {
        Self(filters)
    }

    /// Applies every stage forward, in order.
    ///
    /// # Errors
    ///
    /// Propagates the first stage failure.
    pub fn encode(&self, type_size: usize, input: &[u8]) -> Result<Vec<u8>> {
        let mut buf = input.to_vec();
        for filter in &self.0 {
            buf = filter.apply_forward(type_size, &buf)?;
        }
        Ok(buf)
    }

    /// Applies every stage backward, in reverse order.
    ///
    /// # Errors
    ///
    /// Propagates the first stage failure.
    pub fn decode(&self, type_size: usize, input: &[u8]) -> Result<Vec<u8>> {
        let mut buf = input.to_vec();
        for filter in self.0.iter().rev() {
            buf = filter.apply_backward(type_size, &buf)?;
        }
        Ok(buf)
    }
}

impl Encode for FilterPipeline {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u32::<LittleEndian>(
            u32::try_from(self.0.len()).map_err(|_| EncodeError::Io(io_too_long()))?,
        )?;
        for filter in &self.0 {
            filter.encode_into(writer)?;
        }
        Ok(())
    }
}

impl Decode for FilterPipeline {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let n = reader.read_u32::<LittleEndian>()?;
        let mut filters = Vec::with_capacity(n as usize);
        for _ in 0..n {
            filters.push(Filter::decode_from(reader)?);
        }
        Ok(Self(filters))
    }
}

fn io_too_long() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, "filter list too long")
}

fn compression_err(msg: impl Into<String>) -> Error {
    Error::Compression(msg.into())
}

// ------------------------------------------------------------------
// Standard-library compressor wrappers (header = uncompressed size).
// ------------------------------------------------------------------

#[cfg(feature = "gzip")]
fn gzip_compress(level: u32, input: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    let mut out = Vec::new();
    out.write_u64::<LittleEndian>(input.len() as u64)
        .map_err(|e| compression_err(e.to_string()))?;
    let mut enc = GzEncoder::new(&mut out, Compression::new(level));
    enc.write_all(input)
        .map_err(|e| compression_err(e.to_string()))?;
    enc.finish().map_err(|e| compression_err(e.to_string()))?;
    Ok(out)
}

#[cfg(feature = "gzip")]
fn gzip_decompress(input: &[u8]) -> Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    let mut cursor = std::io::Cursor::new(input);
    let uncompressed_size = cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| Error::Format("gzip header truncated".into()))?;
    let mut out = Vec::with_capacity(uncompressed_size as usize);
    GzDecoder::new(&input[8..])
        .read_to_end(&mut out)
        .map_err(|e| compression_err(e.to_string()))?;
    Ok(out)
}

#[cfg(feature = "zstd")]
fn zstd_compress(level: i32, input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.write_u64::<LittleEndian>(input.len() as u64)
        .map_err(|e| compression_err(e.to_string()))?;
    let compressed =
        zstd::bulk::compress(input, level).map_err(|e| compression_err(e.to_string()))?;
    out.extend_from_slice(&compressed);
    Ok(out)
}

#[cfg(feature = "zstd")]
fn zstd_decompress(input: &[u8]) -> Result<Vec<u8>> {
    if input.len() < 8 {
        return Err(Error::Format("zstd header truncated".into()));
    }
    let uncompressed_size = LittleEndian::read_u64(&input[..8]) as usize;
    zstd::bulk::decompress(&input[8..], uncompressed_size)
        .map_err(|e| compression_err(e.to_string()))
}

#[cfg(feature = "lz4")]
fn lz4_compress(input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.write_u64::<LittleEndian>(input.len() as u64)
        .map_err(|e| compression_err(e.to_string()))?;
    out.extend_from_slice(&lz4_flex::compress(input));
    Ok(out)
}

#[cfg(feature = "lz4")]
fn lz4_decompress(input: &[u8]) -> Result<Vec<u8>> {
    if input.len() < 8 {
        return Err(Error::Format("lz4 header truncated".into()));
    }
    let uncompressed_size = LittleEndian::read_u64(&input[..8]) as usize;
    lz4_flex::decompress(&input[8..], uncompressed_size).map_err(|e| compression_err(e.to_string()))
}

#[cfg(feature = "bzip2")]
fn bzip2_compress(level: u32, input: &[u8]) -> Result<Vec<u8>> {
    use bzip2::write::BzEncoder;
    use bzip2::Compression;
    let mut out = Vec::new();
    out.write_u64::<LittleEndian>(input.len() as u64)
        .map_err(|e| compression_err(e.to_string()))?;
    let mut enc = BzEncoder::new(&mut out, Compression::new(level));
    enc.write_all(input)
        .map_err(|e| compression_err(e.to_string()))?;
    enc.finish().map_err(|e| compression_err(e.to_string()))?;
    Ok(out)
}

#[cfg(feature = "bzip2")]
fn bzip2_decompress(input: &[u8]) -> Result<Vec<u8>> {
    use bzip2::read::BzDecoder;
    if input.len() < 8 {
        return Err(Error::Format("bzip2 header truncated".into()));
    }
    let uncompressed_size = LittleEndian::read_u64(&input[..8]) as usize;
    let mut out = Vec::with_capacity(uncompressed_size);
    BzDecoder::new(&input[8..])
        .read_to_end(&mut out)
        .map_err(|e| compression_err(e.to_string()))?;
    Ok(out)
}

// ------------------------------------------------------------------
// RLE (§4.3, §8 scenario 3).
// ------------------------------------------------------------------

fn rle_compress(type_size: usize, input: &[u8]) -> Result<Vec<u8>> {
    if type_size == 0 || input.len() % type_size != 0 {
        return Err(compression_err("RLE input length not a multiple of type_size"));
    }
    let value_num = input.len() / type_size;
    let mut out = Vec::with_capacity(input.len());
    if value_num == 0 {
        return Ok(out);
    }

    let mut run_start = 0usize;
    let mut run_len: u32 = 1;
    for i in 1..value_num {
        let prev = &input[run_start * type_size..run_start * type_size + type_size];
        let cur = &input[i * type_size..i * type_size + type_size];
        if cur == prev && run_len < RLE_MAX_RUN {
            run_len += 1;
        } else {
            out.extend_from_slice(prev);
            out.write_u16::<byteorder::BigEndian>(u16::try_from(run_len).expect("bounded by RLE_MAX_RUN"))
                .expect("write to Vec cannot fail");
            run_start = i;
            run_len = 1;
        }
    }
    let last = &input[run_start * type_size..run_start * type_size + type_size];
    out.extend_from_slice(last);
    out.write_u16::<byteorder::BigEndian>(u16::try_from(run_len).expect("bounded by RLE_MAX_RUN"))
        .expect("write to Vec cannot fail");

    Ok(out)
}

fn rle_decompress(type_size: usize, input: &[u8]) -> Result<Vec<u8>> {
    if type_size == 0 {
        return Err(compression_err("RLE type_size must be nonzero"));
    }
    let run_size = type_size + 2;
    if input.len() % run_size != 0 {
        return Err(compression_err("RLE input is not a multiple of the run size"));
    }
    let mut out = Vec::new();
    let mut cursor = 0usize;
    while cursor < input.len() {
        let value = &input[cursor..cursor + type_size];
        let run_len = byteorder::BigEndian::read_u16(&input[cursor + type_size..cursor + run_size]);
        for _ in 0..run_len {
            out.extend_from_slice(value);
        }
        cursor += run_size;
    }
    Ok(out)
}

// ------------------------------------------------------------------
// Double-delta (§4.3, §8 scenario 4).
// ------------------------------------------------------------------

struct BitWriter {
    chunk: u64,
    bit_in_chunk: u32,
    out: Vec<u8>,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            chunk: 0,
            bit_in_chunk: 0,
            out: Vec::new(),
        }
    }

    fn write_bits(&mut self, value: u64, nbits: u32) {
        let mut bits_left = nbits;
        while bits_left > 0 {
            let space = 64 - self.bit_in_chunk;
            let take = bits_left.min(space);
            let shift = bits_left - take;
            let mask = if take == 64 { u64::MAX } else { (1u64 << take) - 1 };
            let piece = (value >> shift) & mask;
            self.chunk |= piece << (space - take);
            self.bit_in_chunk += take;
            bits_left -= take;
            if self.bit_in_chunk == 64 {
                self.out.extend_from_slice(&self.chunk.to_be_bytes());
                self.chunk = 0;
                self.bit_in_chunk = 0;
            }
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.bit_in_chunk > 0 {
            self.out.extend_from_slice(&self.chunk.to_be_bytes());
        }
        self.out
    }
}

struct BitReader<'a> {
    data: &'a [u8],
    chunk: u64,
    bit_in_chunk: u32,
    byte_pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            chunk: 0,
            bit_in_chunk: 0,
            byte_pos: 0,
        }
    }

    fn read_bits(&mut self, nbits: u32) -> Result<u64> {
        let mut bits_left = nbits;
        let mut value: u64 = 0;
        while bits_left > 0 {
            if self.bit_in_chunk == 0 {
                if self.byte_pos + 8 > self.data.len() {
                    return Err(Error::Format("double-delta stream truncated".into()));
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.data[self.byte_pos..self.byte_pos + 8]);
                self.chunk = u64::from_be_bytes(raw);
                self.byte_pos += 8;
                self.bit_in_chunk = 64;
            }
            let take = bits_left.min(self.bit_in_chunk);
            let shift = self.bit_in_chunk - take;
            let mask = if take == 64 { u64::MAX } else { (1u64 << take) - 1 };
            let piece = (self.chunk >> shift) & mask;
            value = (value << take) | piece;
            self.bit_in_chunk -= take;
            bits_left -= take;
        }
        Ok(value)
    }
}

fn dd_bitsize(max_abs: u64) -> u32 {
    let required = if max_abs == 0 { 0 } else { 64 - max_abs.leading_zeros() };
    for candidate in DD_BITSIZES {
        if required <= candidate {
            return candidate;
        }
    }
    64
}

fn double_delta_compress(input: &[u8]) -> Result<Vec<u8>> {
    if input.len() % 8 != 0 {
        return Err(compression_err("double-delta input must be a multiple of 8 bytes"));
    }
    let n = input.len() / 8;
    let values: Vec<i64> = (0..n).map(|i| LittleEndian::read_i64(&input[i * 8..i * 8 + 8])).collect();

    let mut out = Vec::new();
    out.write_u64::<LittleEndian>(n as u64).expect("write to Vec cannot fail");

    if n == 0 {
        let mut header = vec![0u8];
        header.extend_from_slice(&out);
        return Ok(header);
    }
    if n == 1 {
        let mut header = vec![0u8];
        header.extend_from_slice(&out);
        header.write_i64::<LittleEndian>(values[0]).expect("write to Vec cannot fail");
        return Ok(header);
    }

    let mut dds = Vec::with_capacity(n - 2);
    let mut max_abs: u64 = 0;
    for i in 2..n {
        let delta_cur = values[i]
            .checked_sub(values[i - 1])
            .ok_or_else(|| compression_err("double-delta overflow"))?;
        let delta_prev = values[i - 1]
            .checked_sub(values[i - 2])
            .ok_or_else(|| compression_err("double-delta overflow"))?;
        let dd = delta_cur
            .checked_sub(delta_prev)
            .ok_or_else(|| compression_err("double-delta overflow"))?;
        max_abs = max_abs.max(dd.unsigned_abs());
        dds.push(dd);
    }

    let bitsize = dd_bitsize(max_abs);

    let mut header = Vec::new();
    if bitsize >= 64 {
        // Packing would not save space over a raw i64 copy; fall back.
        header.push(64);
        header.extend_from_slice(&out);
        header.write_i64::<LittleEndian>(values[0]).expect("write to Vec cannot fail");
        header.write_i64::<LittleEndian>(values[1]).expect("write to Vec cannot fail");
        for &v in &values[2..] {
            header.write_i64::<LittleEndian>(v).expect("write to Vec cannot fail");
        }
        return Ok(header);
    }

    header.push(u8::try_from(bitsize).expect("bitsize is at most 64"));
    header.extend_from_slice(&out);
    header.write_i64::<LittleEndian>(values[0]).expect("write to Vec cannot fail");
    header.write_i64::<LittleEndian>(values[1]).expect("write to Vec cannot fail");

    let mut bw = BitWriter::new();
    for dd in dds {
        let sign = u64::from(dd < 0);
        let magnitude = dd.unsigned_abs();
        bw.write_bits(sign, 1);
        bw.write_bits(magnitude, bitsize);
    }
    header.extend_from_slice(&bw.finish());

    Ok(header)
}

fn double_delta_decompress(input: &[u8]) -> Result<Vec<u8>> {
    if input.len() < 9 {
        return Err(Error::Format("double-delta header truncated".into()));
    }
    let bitsize = input[0];
    let n = LittleEndian::read_u64(&input[1..9]) as usize;
    let mut cursor = 9usize;

    let mut out = Vec::with_capacity(n * 8);
    if n == 0 {
        return Ok(out);
    }

    let read_i64 = |input: &[u8], at: usize| -> Result<i64> {
        input
            .get(at..at + 8)
            .map(LittleEndian::read_i64)
            .ok_or_else(|| Error::Format("double-delta stream truncated".into()))
    };

    if n == 1 {
        let v0 = read_i64(input, cursor)?;
        out.write_i64::<LittleEndian>(v0).expect("write to Vec cannot fail");
        return Ok(out);
    }

    let v0 = read_i64(input, cursor)?;
    cursor += 8;
    let v1 = read_i64(input, cursor)?;
    cursor += 8;
    out.write_i64::<LittleEndian>(v0).expect("write to Vec cannot fail");
    out.write_i64::<LittleEndian>(v1).expect("write to Vec cannot fail");

    if bitsize >= 64 {
        for _ in 2..n {
            let v = read_i64(input, cursor)?;
            cursor += 8;
            out.write_i64::<LittleEndian>(v).expect("write to Vec cannot fail");
        }
        return Ok(out);
    }

    let mut br = BitReader::new(&input[cursor..]);
    let mut delta_prev = v1 - v0;
    let mut prev = v1;
    for _ in 2..n {
        let sign = br.read_bits(1)?;
        let magnitude = br.read_bits(u32::from(bitsize))?;
        let dd = if sign == 1 { -(magnitude as i64) } else { magnitude as i64 };
        let delta_cur = delta_prev + dd;
        let value = prev + delta_cur;
        out.write_i64::<LittleEndian>(value).expect("write to Vec cannot fail");
        delta_prev = delta_cur;
        prev = value;
    }

    Ok(out)
}

// ------------------------------------------------------------------
// Float-scale (§4.3, §8 scenario 5).
// ------------------------------------------------------------------

fn float_scale_compress(type_size: usize, byte_width: u8, scale: f64, offset: f64, input: &[u8]) -> Result<Vec<u8>> {
    if type_size != 4 && type_size != 8 {
        return Err(compression_err("float-scale requires a 4- or 8-byte float type"));
    }
    if input.len() % type_size != 0 {
        return Err(compression_err("float-scale input length not a multiple of type_size"));
    }
    let n = input.len() / type_size;

    let mut header = Vec::new();
    header.push(byte_width);
    header.write_f64::<LittleEndian>(scale).expect("write to Vec cannot fail");
    header.write_f64::<LittleEndian>(offset).expect("write to Vec cannot fail");
    header.write_u64::<LittleEndian>(n as u64).expect("write to Vec cannot fail");

    for i in 0..n {
        let x = if type_size == 4 {
            f64::from(LittleEndian::read_f32(&input[i * 4..i * 4 + 4]))
        } else {
            LittleEndian::read_f64(&input[i * 8..i * 8 + 8])
        };
        let q = ((x - offset) / scale).round() as i64;
        match byte_width {
            1 => header.push(q as i8 as u8),
            2 => header
                .write_i16::<LittleEndian>(q as i16)
                .expect("write to Vec cannot fail"),
            4 => header
                .write_i32::<LittleEndian>(q as i32)
                .expect("write to Vec cannot fail"),
            8 => header
                .write_i64::<LittleEndian>(q)
                .expect("write to Vec cannot fail"),
            w => return Err(compression_err(format!("unsupported float-scale byte_width {w}"))),
        }
    }
    Ok(header)
}

fn float_scale_decompress(type_size: usize, input: &[u8]) -> Result<Vec<u8>> {
    if type_size != 4 && type_size != 8 {
        return Err(compression_err("float-scale requires a 4- or 8-byte float type"));
    }
    if input.len() < 17 {
        return Err(Error::Format("float-scale header truncated".into()));
    }
    let byte_width = input[0];
    let scale = LittleEndian::read_f64(&input[1..9]);
    let offset = LittleEndian::read_f64(&input[9..17]);
    let n = LittleEndian::read_u64(&input[17..25]) as usize;
    let body = &input[25..];

    let mut out = Vec::with_capacity(n * type_size);
    for i in 0..n {
        let q: i64 = match byte_width {
            1 => {
                let v = *body.get(i).ok_or_else(|| Error::Format("float-scale body truncated".into()))?;
                i64::from(v as i8)
            }
            2 => i64::from(
                body.get(i * 2..i * 2 + 2)
                    .map(LittleEndian::read_i16)
                    .ok_or_else(|| Error::Format("float-scale body truncated".into()))?,
            ),
            4 => i64::from(
                body.get(i * 4..i * 4 + 4)
                    .map(LittleEndian::read_i32)
                    .ok_or_else(|| Error::Format("float-scale body truncated".into()))?,
            ),
            8 => body
                .get(i * 8..i * 8 + 8)
                .map(LittleEndian::read_i64)
                .ok_or_else(|| Error::Format("float-scale body truncated".into()))?,
            w => return Err(Error::Format(format!("unsupported float-scale byte_width {w}"))),
        };
        let x = offset + scale * q as f64;
        if type_size == 4 {
            out.write_f32::<LittleEndian>(x as f32).expect("write to Vec cannot fail");
        } else {
            out.write_f64::<LittleEndian>(x).expect("write to Vec cannot fail");
        }
    }
    Ok(out)
}

// ------------------------------------------------------------------
// Bit-width reduction (§4.3): per-window narrowest byte width.
// ------------------------------------------------------------------

fn narrowest_width(range: u64) -> usize {
    for &w in &BWR_WIDTHS {
        let max = if w == 8 { u64::MAX } else { (1u64 << (w * 8)) - 1 };
        if range <= max {
            return w;
        }
    }
    8
}

fn bit_width_reduction_compress(type_size: usize, input: &[u8]) -> Result<Vec<u8>> {
    if !(1..=8).contains(&type_size) || input.len() % type_size != 0 {
        return Err(compression_err("bit-width reduction requires a 1..=8 byte integer type"));
    }
    let n = input.len() / type_size;
    let mut out = Vec::new();
    out.write_u8(u8::try_from(type_size).expect("checked above"))
        .expect("write to Vec cannot fail");
    out.write_u64::<LittleEndian>(n as u64).expect("write to Vec cannot fail");

    let read_elem = |idx: usize| -> u64 {
        let bytes = &input[idx * type_size..idx * type_size + type_size];
        let mut buf = [0u8; 8];
        buf[..type_size].copy_from_slice(bytes);
        LittleEndian::read_u64(&buf)
    };

    let mut start = 0usize;
    while start < n {
        let end = (start + BWR_WINDOW).min(n);
        let mut min = u64::MAX;
        let mut max = 0u64;
        for i in start..end {
            let v = read_elem(i);
            min = min.min(v);
            max = max.max(v);
        }
        let range = max - min;
        let width = narrowest_width(range);

        out.write_u32::<LittleEndian>(u32::try_from(end - start).expect("window capped at BWR_WINDOW"))
            .expect("write to Vec cannot fail");
        out.write_u64::<LittleEndian>(min).expect("write to Vec cannot fail");
        out.write_u8(u8::try_from(width).expect("width is 1, 2, 4, or 8"))
            .expect("write to Vec cannot fail");
        for i in start..end {
            let reduced = read_elem(i) - min;
            out.extend_from_slice(&reduced.to_le_bytes()[..width]);
        }
        start = end;
    }
    Ok(out)
}

fn bit_width_reduction_decompress(input: &[u8]) -> Result<Vec<u8>> {
    if input.len() < 9 {
        return Err(Error::Format("bit-width-reduction header truncated".into()));
    }
    let type_size = input[0] as usize;
    let n = LittleEndian::read_u64(&input[1..9]) as usize;
    let mut cursor = 9usize;

    let mut out = Vec::with_capacity(n * type_size);
    let mut remaining = n;
    while remaining > 0 {
        if cursor + 13 > input.len() {
            return Err(Error::Format("bit-width-reduction window header truncated".into()));
        }
        let window_len = LittleEndian::read_u32(&input[cursor..cursor + 4]) as usize;
        let min = LittleEndian::read_u64(&input[cursor + 4..cursor + 12]);
        let width = input[cursor + 12] as usize;
        cursor += 13;

        for _ in 0..window_len {
            if cursor + width > input.len() {
                return Err(Error::Format("bit-width-reduction body truncated".into()));
            }
            let mut buf = [0u8; 8];
            buf[..width].copy_from_slice(&input[cursor..cursor + width]);
            cursor += width;
            let value = min + LittleEndian::read_u64(&buf);
            out.extend_from_slice(&value.to_le_bytes()[..type_size]);
        }
        remaining -= window_len;
    }
    Ok(out)
}

/// Picks a default filter list for a datatype when none is configured
/// explicitly.
#[must_use]
pub fn default_filter_list(datatype: Datatype) -> FilterPipeline {
    let _ = datatype;
    FilterPipeline::empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn rle_matches_worked_example() {
        let input: Vec<u32> = vec![5, 5, 5, 5, 7, 7, 9];
        let bytes: Vec<u8> = input.iter().flat_map(|v| v.to_le_bytes()).collect();
        let encoded = rle_compress(4, &bytes).unwrap();
        let expected: Vec<u8> = vec![
            5, 0, 0, 0, 0, 4, //
            7, 0, 0, 0, 0, 2, //
            9, 0, 0, 0, 0, 1,
        ];
        assert_eq!(encoded, expected);
        let decoded = rle_decompress(4, &encoded).unwrap();
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn rle_caps_run_at_65535() {
        let bytes = vec![0xABu8, 0, 0, 0].repeat(70_000);
        let encoded = rle_compress(4, &bytes).unwrap();
        // Two runs: 65535 + 4465.
        assert_eq!(encoded.len(), 12);
        let decoded = rle_decompress(4, &encoded).unwrap();
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn rle_rejects_non_multiple_length() {
        assert!(rle_compress(4, &[1, 2, 3]).is_err());
    }

    #[test]
    fn double_delta_matches_worked_example() {
        let input: Vec<i64> = vec![100, 200, 305, 415];
        let bytes: Vec<u8> = input.iter().flat_map(|v| v.to_le_bytes()).collect();
        let encoded = double_delta_compress(&bytes).unwrap();
        assert_eq!(encoded[0], 4, "bitsize should be 4 per the worked example");
        let decoded = double_delta_decompress(&encoded).unwrap();
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn double_delta_roundtrips_negative_and_mixed_values() {
        let input: Vec<i64> = vec![-100, -50, 0, 50, 40, 1000, -1000, -1000];
        let bytes: Vec<u8> = input.iter().flat_map(|v| v.to_le_bytes()).collect();
        let encoded = double_delta_compress(&bytes).unwrap();
        let decoded = double_delta_decompress(&encoded).unwrap();
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn double_delta_handles_small_n() {
        for input in [vec![], vec![42i64], vec![1i64, 2]] {
            let bytes: Vec<u8> = input.iter().flat_map(|v| v.to_le_bytes()).collect();
            let encoded = double_delta_compress(&bytes).unwrap();
            let decoded = double_delta_decompress(&encoded).unwrap();
            assert_eq!(decoded, bytes);
        }
    }

    #[test]
    fn float_scale_within_error_bound() {
        let input: Vec<f64> = vec![0.3, 0.7, 1.2];
        let bytes: Vec<u8> = input.iter().flat_map(|v| v.to_le_bytes()).collect();
        let encoded = float_scale_compress(8, 1, 0.1, 0.0, &bytes).unwrap();
        let decoded_bytes = float_scale_decompress(8, &encoded).unwrap();
        let decoded: Vec<f64> = decoded_bytes
            .chunks_exact(8)
            .map(LittleEndian::read_f64)
            .collect();
        for (a, b) in input.iter().zip(decoded.iter()) {
            assert!((a - b).abs() < 0.05 + 1e-9, "{a} vs {b}");
        }
    }

    #[test]
    fn float_scale_roundtrips_float32_output_width() {
        let input: Vec<f32> = vec![0.3, 0.7, 1.2];
        let bytes: Vec<u8> = input.iter().flat_map(|v| v.to_le_bytes()).collect();
        let encoded = float_scale_compress(4, 1, 0.1, 0.0, &bytes).unwrap();
        let decoded_bytes = float_scale_decompress(4, &encoded).unwrap();
        assert_eq!(decoded_bytes.len(), bytes.len(), "decompress must emit 4-byte elements for a Float32 attribute");
        let decoded: Vec<f32> = decoded_bytes
            .chunks_exact(4)
            .map(LittleEndian::read_f32)
            .collect();
        for (a, b) in input.iter().zip(decoded.iter()) {
            assert!((a - b).abs() < 0.05 + 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn bit_width_reduction_roundtrips() {
        let input: Vec<i32> = (0..2000).map(|i| 1_000_000 + (i % 7)).collect();
        let bytes: Vec<u8> = input.iter().flat_map(|v| v.to_le_bytes()).collect();
        let encoded = bit_width_reduction_compress(4, &bytes).unwrap();
        // Values fit in a single byte of range per window, much smaller than source.
        assert!(encoded.len() < bytes.len());
        let decoded = bit_width_reduction_decompress(&encoded).unwrap();
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn pipeline_composes_stages_in_order() {
        let pipeline = FilterPipeline::new(vec![Filter::DoubleDelta, Filter::Rle]);
        let input: Vec<i64> = vec![10, 20, 30, 40, 50];
        let bytes: Vec<u8> = input.iter().flat_map(|v| v.to_le_bytes()).collect();
        let encoded = pipeline.encode(8, &bytes).unwrap();
        let decoded = pipeline.decode(8, &encoded).unwrap();
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn filter_list_serde_roundtrip() {
        let pipeline = FilterPipeline::new(vec![Filter::Rle, Filter::DoubleDelta]);
        let bytes = pipeline.encode_into_vec();
        let decoded = FilterPipeline::decode_from(&mut std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(decoded, pipeline);
    }
}
