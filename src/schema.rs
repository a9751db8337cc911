// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Array schema: attributes, domain, cell/tile order, capacity, and the
//! versioned on-disk blob layout (§3, §4.4).
//!
//! Also covers schema evolution and current-domain (SPEC_FULL §F.3, §F.4),
//! both absent from the distilled spec but present in the source and
//! implied by the attribute/fragment machinery it does require.

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use crate::datatype::Datatype;
use crate::domain::{Domain, Order};
use crate::filter::{default_filter_list, FilterPipeline};
use crate::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashSet;
use std::io::{Read, Write};

/// The on-disk schema blob version this build writes and the newest
/// version it can read (§4.4's "versioned" layout).
pub const SCHEMA_FORMAT_VERSION: u32 = 1;

/// Whether an array has a fixed dense grid or an unordered sparse coordinate
/// space (§3).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ArrayType {
    /// Every cell in the (expanded) domain exists; writes fill by position.
    Dense,
    /// Only written coordinates exist; writes carry explicit coordinates.
    Sparse,
}

impl Encode for ArrayType {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u8(match self {
            Self::Dense => 0,
            Self::Sparse => 1,
        })?;
        Ok(())
    }
}

impl Decode for ArrayType {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        Ok(match reader.read_u8()? {
            0 => Self::Dense,
            1 => Self::Sparse,
            tag => return Err(DecodeError::InvalidTag(("ArrayType", tag))),
        })
    }
}

/// A typed, filtered, optionally-nullable attribute (§3).
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    /// Attribute name, unique within the schema and distinct from the
    /// reserved `__coords`/`__key` names.
    pub name: String,
    /// Scalar datatype of one attribute cell value.
    pub datatype: Datatype,
    /// Number of scalar values per cell; `u32::MAX` marks a variable-length
    /// ("var") attribute whose offsets live in a separate file.
    pub cell_val_num: u32,
    /// Whether cells may be marked missing via a validity bitmap.
    pub nullable: bool,
    /// Per-attribute filter pipeline (§4.3) applied to its values tiles.
    pub filters: FilterPipeline,
    /// Bytes written in place of an unset cell in a dense write, or an
    /// absent attribute's cells when reading through an evolved schema.
    pub fill_value: Vec<u8>,
}

/// Sentinel `cell_val_num` marking a variable-length attribute.
pub const VAR_NUM: u32 = u32::MAX;

impl Attribute {
    /// Builds a fixed-size, non-nullable attribute with the default
    /// filter pipeline for its datatype and a zeroed fill value.
    #[must_use]
    pub fn new(name: impl Into<String>, datatype: Datatype, cell_val_num: u32) -> Self {
        let fill_value = vec![0u8; datatype.byte_width().saturating_mul(cell_val_num.max(1) as usize)];
        Self {
            name: name.into(),
            datatype,
            cell_val_num,
            nullable: false,
            filters: default_filter_list(datatype),
            fill_value,
        }
    }

    /// Marks the attribute nullable.
    #[must_use]
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Overrides the filter pipeline.
    #[must_use]
    pub fn filters(mut self, filters: FilterPipeline) -> Self {
        self.filters = filters;
        self
    }

    /// Overrides the fill value used for unset dense cells.
    #[must_use]
    pub fn fill_value(mut self, fill_value: Vec<u8>) -> Self {
        self.fill_value = fill_value;
        self
    }

    /// Whether this attribute is variable-length.
    #[must_use]
    pub fn is_var(&self) -> bool {
        self.cell_val_num == VAR_NUM
    }
}

impl Encode for Attribute {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        write_string(writer, &self.name)?;
        self.datatype.encode_into(writer)?;
        writer.write_u32::<LittleEndian>(self.cell_val_num)?;
        writer.write_u8(u8::from(self.nullable))?;
        self.filters.encode_into(writer)?;
        writer.write_u32::<LittleEndian>(u32::try_from(self.fill_value.len()).map_err(bad_len)?)?;
        writer.write_all(&self.fill_value)?;
        Ok(())
    }
}

impl Decode for Attribute {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let name = read_string(reader)?;
        let datatype = Datatype::decode_from(reader)?;
        let cell_val_num = reader.read_u32::<LittleEndian>()?;
        let nullable = reader.read_u8()? != 0;
        let filters = FilterPipeline::decode_from(reader)?;
        let fill_len = reader.read_u32::<LittleEndian>()? as usize;
        let mut fill_value = vec![0u8; fill_len];
        reader.read_exact(&mut fill_value)?;
        Ok(Self {
            name,
            datatype,
            cell_val_num,
            nullable,
            filters,
            fill_value,
        })
    }
}

/// An optional secondary bound narrower than the domain (SPEC_FULL §F.4).
/// Queries clip subarrays against it; writes outside it fail with
/// [`Error::Query`].
#[derive(Clone, Debug, PartialEq)]
pub struct NdRectangle {
    /// `(lo, hi)` inclusive bound per dimension, in domain order.
    pub bounds: Vec<(i64, i64)>,
}

impl NdRectangle {
    /// Whether `coords` fall within every dimension's bound.
    #[must_use]
    pub fn contains(&self, coords: &[i64]) -> bool {
        self.bounds
            .iter()
            .zip(coords)
            .all(|(&(lo, hi), &c)| c >= lo && c <= hi)
    }
}

impl Encode for NdRectangle {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u32::<LittleEndian>(u32::try_from(self.bounds.len()).map_err(bad_len)?)?;
        for &(lo, hi) in &self.bounds {
            writer.write_i64::<LittleEndian>(lo)?;
            writer.write_i64::<LittleEndian>(hi)?;
        }
        Ok(())
    }
}

impl Decode for NdRectangle {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let n = reader.read_u32::<LittleEndian>()? as usize;
        let mut bounds = Vec::with_capacity(n);
        for _ in 0..n {
            bounds.push((reader.read_i64::<LittleEndian>()?, reader.read_i64::<LittleEndian>()?));
        }
        Ok(Self { bounds })
    }
}

/// One step in a schema's evolution chain (SPEC_FULL §F.3): an attribute
/// added or dropped at a point in time, together with the resulting
/// attribute list.
#[derive(Clone, Debug, PartialEq)]
pub struct SchemaVersion {
    /// Milliseconds since epoch this version became effective.
    pub timestamp_ms: u64,
    /// Full attribute list after applying this version's change.
    pub attributes: Vec<Attribute>,
}

/// The full array schema (§3): domain, attributes, layout, capacity, and
/// the evolution chain/current-domain supplements (SPEC_FULL §F.3, §F.4).
#[derive(Clone, Debug, PartialEq)]
pub struct Schema {
    /// Dense or sparse.
    pub array_type: ArrayType,
    /// Coordinate space.
    pub domain: Domain,
    /// Order cells are written/read within a tile.
    pub cell_order: Order,
    /// Order tiles are written/read within the array.
    pub tile_order: Order,
    /// Target number of cells per (sparse) tile.
    pub capacity: u64,
    /// Filter pipeline applied to the coordinates tile (sparse arrays) or
    /// dimension tiles (dense arrays).
    pub coords_filters: FilterPipeline,
    /// Attributes, in declaration order.
    pub attributes: Vec<Attribute>,
    /// Evolution steps applied after the schema's initial creation,
    /// ordered by `timestamp_ms` (SPEC_FULL §F.3).
    pub evolution: Vec<SchemaVersion>,
    /// Optional narrower bound clipping queries and writes (SPEC_FULL §F.4).
    pub current_domain: Option<NdRectangle>,
}

impl Schema {
    /// Builds a schema, validating attribute/dimension name uniqueness and
    /// the reserved-name invariant (§3).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] if two attributes or dimensions share a
    /// name, or an attribute uses a reserved name (`__coords`, `__key`).
    pub fn new(
        array_type: ArrayType,
        domain: Domain,
        cell_order: Order,
        tile_order: Order,
        capacity: u64,
        attributes: Vec<Attribute>,
    ) -> Result<Self> {
        let schema = Self {
            array_type,
            domain,
            cell_order,
            tile_order,
            capacity,
            coords_filters: FilterPipeline::empty(),
            attributes,
            evolution: Vec::new(),
            current_domain: None,
        };
        schema.validate()?;
        Ok(schema)
    }

    fn validate(&self) -> Result<()> {
        use crate::uri::names::{COORDS_ATTR, KEY_ATTR};

        let mut seen = HashSet::new();
        for dim in &self.domain.dimensions {
            if !seen.insert(dim.name.clone()) {
                return Err(Error::Schema(format!("duplicate dimension name: {}", dim.name)));
            }
        }
        for attr in &self.attributes {
            if attr.name == COORDS_ATTR || attr.name == KEY_ATTR {
                return Err(Error::Schema(format!("attribute name {} is reserved", attr.name)));
            }
            if seen.contains(&attr.name) {
                return Err(Error::Schema(format!(
                    "attribute name {} collides with a dimension",
                    attr.name
                )));
            }
            if !seen.insert(attr.name.clone()) {
                return Err(Error::Schema(format!("duplicate attribute name: {}", attr.name)));
            }
        }
        if self.domain.dim_num() == 0 {
            return Err(Error::Schema("domain must have at least one dimension".into()));
        }
        Ok(())
    }

    /// Overrides the coordinate filter pipeline.
    #[must_use]
    pub fn coords_filters(mut self, filters: FilterPipeline) -> Self {
        self.coords_filters = filters;
        self
    }

    /// Sets the current-domain bound (SPEC_FULL §F.4).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] if `bound`'s dimensionality does not
    /// match the domain, or it is not contained in the domain's bounds.
    pub fn set_current_domain(&mut self, bound: NdRectangle) -> Result<()> {
        if bound.bounds.len() != self.domain.dim_num() {
            return Err(Error::Schema("current domain dimensionality mismatch".into()));
        }
        for (dim, &(lo, hi)) in self.domain.dimensions.iter().zip(&bound.bounds) {
            let (dim_lo, dim_hi) = (
                dim.lo.as_i64(),
                dim.hi.as_i64(),
            );
            if lo < dim_lo || hi > dim_hi || lo > hi {
                return Err(Error::Schema(format!(
                    "current domain bound for {} is outside the domain",
                    dim.name
                )));
            }
        }
        self.current_domain = Some(bound);
        Ok(())
    }

    /// Finds an attribute by name.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Applies a schema evolution step: adds `added` attributes and drops
    /// attributes named in `dropped`, recording the resulting full
    /// attribute list as a new [`SchemaVersion`] (SPEC_FULL §F.3).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Schema`] if an added attribute collides with an
    /// existing name, `timestamp_ms` does not strictly increase over the
    /// prior version, or a name is both added and dropped.
    pub fn evolve(&mut self, timestamp_ms: u64, added: Vec<Attribute>, dropped: &[String]) -> Result<()> {
        if let Some(last) = self.evolution.last() {
            if timestamp_ms <= last.timestamp_ms {
                return Err(Error::Schema("evolution timestamp must strictly increase".into()));
            }
        }
        let mut current: Vec<Attribute> = self
            .evolution
            .last()
            .map(|v| v.attributes.clone())
            .unwrap_or_else(|| self.attributes.clone());

        for name in dropped {
            if added.iter().any(|a| &a.name == name) {
                return Err(Error::Schema(format!("{name} is both added and dropped")));
            }
            let before = current.len();
            current.retain(|a| &a.name != name);
            if current.len() == before {
                return Err(Error::Schema(format!("cannot drop unknown attribute {name}")));
            }
        }
        for attr in added {
            if current.iter().any(|a| a.name == attr.name) {
                return Err(Error::Schema(format!("attribute {} already exists", attr.name)));
            }
            current.push(attr);
        }

        self.evolution.push(SchemaVersion {
            timestamp_ms,
            attributes: current,
        });
        Ok(())
    }

    /// The attribute list effective at `timestamp_ms`: the base schema's
    /// attributes, with every evolution step up to and including
    /// `timestamp_ms` applied in order.
    #[must_use]
    pub fn attributes_as_of(&self, timestamp_ms: u64) -> &[Attribute] {
        self.evolution
            .iter()
            .rev()
            .find(|v| v.timestamp_ms <= timestamp_ms)
            .map_or(&self.attributes, |v| &v.attributes)
    }
}

impl Encode for Schema {
    fn encode_into<W: Write>(&self, writer: &mut W) -> std::result::Result<(), EncodeError> {
        writer.write_u32::<LittleEndian>(SCHEMA_FORMAT_VERSION)?;
        self.array_type.encode_into(writer)?;
        writer.write_u32::<LittleEndian>(u32::try_from(self.domain.dimensions.len()).map_err(bad_len)?)?;
        for dim in &self.domain.dimensions {
            dim.encode_into(writer)?;
        }
        self.cell_order.encode_into(writer)?;
        self.tile_order.encode_into(writer)?;
        writer.write_u64::<LittleEndian>(self.capacity)?;
        self.coords_filters.encode_into(writer)?;
        writer.write_u32::<LittleEndian>(u32::try_from(self.attributes.len()).map_err(bad_len)?)?;
        for attr in &self.attributes {
            attr.encode_into(writer)?;
        }
        writer.write_u32::<LittleEndian>(u32::try_from(self.evolution.len()).map_err(bad_len)?)?;
        for version in &self.evolution {
            writer.write_u64::<LittleEndian>(version.timestamp_ms)?;
            writer.write_u32::<LittleEndian>(u32::try_from(version.attributes.len()).map_err(bad_len)?)?;
            for attr in &version.attributes {
                attr.encode_into(writer)?;
            }
        }
        match &self.current_domain {
            Some(nd) => {
                writer.write_u8(1)?;
                nd.encode_into(writer)?;
            }
            None => writer.write_u8(0)?,
        }
        Ok(())
    }
}

impl Decode for Schema {
    fn decode_from<R: Read>(reader: &mut R) -> std::result::Result<Self, DecodeError> {
        let version = reader.read_u32::<LittleEndian>()?;
        if version > SCHEMA_FORMAT_VERSION {
            return Err(DecodeError::InvalidVersion(version));
        }
        let array_type = ArrayType::decode_from(reader)?;
        let dim_num = reader.read_u32::<LittleEndian>()? as usize;
        let mut dimensions = Vec::with_capacity(dim_num);
        for _ in 0..dim_num {
            dimensions.push(crate::domain::Dimension::decode_from(reader)?);
        }
        let cell_order = Order::decode_from(reader)?;
        let tile_order = Order::decode_from(reader)?;
        let capacity = reader.read_u64::<LittleEndian>()?;
        let coords_filters = FilterPipeline::decode_from(reader)?;
        let attr_num = reader.read_u32::<LittleEndian>()? as usize;
        let mut attributes = Vec::with_capacity(attr_num);
        for _ in 0..attr_num {
            attributes.push(Attribute::decode_from(reader)?);
        }
        let evo_num = reader.read_u32::<LittleEndian>()? as usize;
        let mut evolution = Vec::with_capacity(evo_num);
        for _ in 0..evo_num {
            let timestamp_ms = reader.read_u64::<LittleEndian>()?;
            let n = reader.read_u32::<LittleEndian>()? as usize;
            let mut attrs = Vec::with_capacity(n);
            for _ in 0..n {
                attrs.push(Attribute::decode_from(reader)?);
            }
            evolution.push(SchemaVersion {
                timestamp_ms,
                attributes: attrs,
            });
        }
        let current_domain = match reader.read_u8()? {
            0 => None,
            1 => Some(NdRectangle::decode_from(reader)?),
            tag => return Err(DecodeError::InvalidTag(("Schema::current_domain", tag))),
        };
        Ok(Self {
            array_type,
            domain: Domain::new(dimensions),
            cell_order,
            tile_order,
            capacity,
            coords_filters,
            attributes,
            evolution,
            current_domain,
        })
    }
}

fn write_string<W: Write>(writer: &mut W, s: &str) -> std::result::Result<(), EncodeError> {
    let bytes = s.as_bytes();
    writer.write_u32::<LittleEndian>(u32::try_from(bytes.len()).map_err(bad_len)?)?;
    writer.write_all(bytes)?;
    Ok(())
}

fn read_string<R: Read>(reader: &mut R) -> std::result::Result<String, DecodeError> {
    let len = reader.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn bad_len(_: std::num::TryFromIntError) -> EncodeError {
    EncodeError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, "field too long"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Dimension;
    use test_log::test;

    fn int_domain() -> Domain {
        Domain::new(vec![
            Dimension::new_integral("x", Datatype::Int32, 1, 8, 2),
            Dimension::new_integral("y", Datatype::Int32, 1, 8, 2),
        ])
    }

    fn basic_schema() -> Schema {
        Schema::new(
            ArrayType::Dense,
            int_domain(),
            Order::RowMajor,
            Order::RowMajor,
            1000,
            vec![Attribute::new("a", Datatype::Int32, 1)],
        )
        .unwrap()
    }

    #[test]
    fn rejects_duplicate_attribute_names() {
        let err = Schema::new(
            ArrayType::Dense,
            int_domain(),
            Order::RowMajor,
            Order::RowMajor,
            1000,
            vec![
                Attribute::new("a", Datatype::Int32, 1),
                Attribute::new("a", Datatype::Float64, 1),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn rejects_reserved_attribute_name() {
        let err = Schema::new(
            ArrayType::Sparse,
            int_domain(),
            Order::RowMajor,
            Order::RowMajor,
            1000,
            vec![Attribute::new("__coords", Datatype::Int32, 1)],
        )
        .unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn schema_blob_roundtrip() {
        let schema = basic_schema();
        let bytes = schema.encode_into_vec();
        let decoded = Schema::decode_from(&mut std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(decoded, schema);
    }

    #[test]
    fn evolution_adds_and_drops_attributes_in_order() {
        let mut schema = basic_schema();
        schema
            .evolve(100, vec![Attribute::new("b", Datatype::Float64, 1)], &[])
            .unwrap();
        schema.evolve(200, vec![], &["a".to_string()]).unwrap();

        let names_at = |ts: u64| -> Vec<&str> {
            schema
                .attributes_as_of(ts)
                .iter()
                .map(|a| a.name.as_str())
                .collect()
        };
        assert_eq!(names_at(0), vec!["a"]);
        assert_eq!(names_at(100), vec!["a", "b"]);
        assert_eq!(names_at(200), vec!["b"]);
    }

    #[test]
    fn evolution_rejects_non_increasing_timestamp() {
        let mut schema = basic_schema();
        schema.evolve(100, vec![], &[]).unwrap();
        assert!(schema.evolve(100, vec![], &[]).is_err());
        assert!(schema.evolve(50, vec![], &[]).is_err());
    }

    #[test]
    fn current_domain_clips_and_validates() {
        let mut schema = basic_schema();
        schema
            .set_current_domain(NdRectangle {
                bounds: vec![(1, 4), (1, 4)],
            })
            .unwrap();
        let nd = schema.current_domain.as_ref().unwrap();
        assert!(nd.contains(&[2, 2]));
        assert!(!nd.contains(&[5, 5]));

        let mut oob = schema;
        assert!(oob
            .set_current_domain(NdRectangle {
                bounds: vec![(0, 4), (1, 4)],
            })
            .is_err());
    }
}
