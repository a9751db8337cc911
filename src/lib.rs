// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A sparse/dense multi-dimensional array storage engine.
//!
//! ##### About
//!
//! This crate implements the core array storage model described in
//! `SPEC_FULL.md`: typed, filtered attributes over a dense or sparse
//! coordinate domain, immutable timestamped fragments with a bulk-loaded
//! R-tree index for sparse range search, a strict-LRU tile cache, and
//! consolidation/vacuum to bound fragment count over time.
//!
//! # Example usage
//!
//! ```
//! use tiledb_core::array::{Array, QueryType};
//! use tiledb_core::config::Config;
//! use tiledb_core::context::Context;
//! use tiledb_core::datatype::Datatype;
//! use tiledb_core::domain::{Dimension, Domain, Order};
//! use tiledb_core::query::{Layout, Query};
//! use tiledb_core::schema::{ArrayType, Attribute, Schema};
//! use tiledb_core::uri::Uri;
//! use tiledb_core::writer::CellBatch;
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! # let dir = tempfile::tempdir()?;
//! let ctx = Arc::new(Context::new(Config::new()));
//! let uri = Uri::new(dir.path().join("my_array"));
//!
//! let schema = Schema::new(
//!     ArrayType::Sparse,
//!     Domain::new(vec![Dimension::new_integral("x", Datatype::Int32, 1, 100, 10)]),
//!     Order::RowMajor,
//!     Order::RowMajor,
//!     1000,
//!     vec![Attribute::new("a", Datatype::Int32, 1)],
//! )?;
//! Array::create(&ctx, &uri, &schema)?;
//!
//! let array = Array::open(ctx.clone(), &uri, QueryType::Write)?;
//! let mut query = Query::new(&array);
//! let mut attrs = HashMap::new();
//! attrs.insert("a".to_string(), 7i32.to_le_bytes().to_vec());
//! query.set_data(CellBatch { coords: vec![1], attributes: attrs })?;
//! query.finalize()?;
//! array.close()?;
//!
//! let array = Array::open(ctx, &uri, QueryType::Read)?;
//! let mut query = Query::new(&array);
//! query.set_layout(Layout::RowMajor)?;
//! query.submit()?;
//! assert_eq!(query.result_coords, vec![1]);
//! #
//! # Ok::<(), tiledb_core::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

pub mod array;
pub mod buffer;
pub mod cache;
pub mod checksum;
pub mod coding;
pub mod config;
pub mod consolidator;
pub mod context;
pub mod datatype;
pub mod domain;
mod error;
pub mod filter;
pub mod fragment;
pub mod locking;
pub mod metadata_cache;
mod path;
pub mod query;
pub mod reader;
pub mod schema;
pub mod stats;
pub mod time;
pub mod uri;
pub mod vfs;
pub mod writer;

pub use error::{Error, Result};
