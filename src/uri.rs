// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! URIs identify arrays, fragments, and the files inside them.
//!
//! Only the local-filesystem scheme is implemented (§1 excludes S3/HDFS
//! backends beyond the abstract interface); `Uri` still carries a scheme
//! tag so callers and the [`crate::vfs::Vfs`] trait are not hard-coded to
//! paths, matching the contract an object-store backend would need.

use crate::path::absolute_path;
use std::path::{Path, PathBuf};

/// A storage location understood by the [`crate::vfs::Vfs`] layer.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Uri {
    path: PathBuf,
}

impl Uri {
    /// Builds a URI from a local filesystem path, canonicalizing it to an
    /// absolute path so two `Uri`s that name the same file compare equal.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: absolute_path(path),
        }
    }

    /// Returns the underlying path.
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// Joins a path component onto this URI, e.g. an array URI joined
    /// with a fragment directory name.
    #[must_use]
    pub fn join(&self, component: &str) -> Self {
        Self {
            path: self.path.join(component),
        }
    }

    /// Returns the final path component (e.g. the fragment directory name).
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|s| s.to_str())
    }
}

impl std::fmt::Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl<P: AsRef<Path>> From<P> for Uri {
    fn from(value: P) -> Self {
        Self::new(value)
    }
}

/// Reserved fragment directory / file names from the on-disk layout (§6).
pub mod names {
    /// Array schema blob.
    pub const ARRAY_SCHEMA: &str = "__array_schema.tdb";
    /// Filelock sentinel file.
    pub const LOCK: &str = "__lock.tdb";
    /// Fragment publication sentinel; presence makes a fragment visible.
    pub const FRAGMENT_SENTINEL: &str = "__tiledb_fragment.tdb";
    /// Fragment metadata blob (R-tree, offsets, MBRs).
    pub const FRAGMENT_METADATA: &str = "__fragment_metadata.tdb";
    /// Coordinate tile file (sparse arrays only).
    pub const COORDS: &str = "__coords.tdb";
    /// Reserved coordinate attribute name.
    pub const COORDS_ATTR: &str = "__coords";
    /// Reserved key attribute name (key-value overlay; out of scope, still
    /// reserved so user attribute names can never collide with it).
    pub const KEY_ATTR: &str = "__key";
}

/// Builds the fixed-value attribute file name for `attr`.
#[must_use]
pub fn attr_file_name(attr: &str) -> String {
    format!("{attr}.tdb")
}

/// Builds the variable-length offsets file name for `attr`.
#[must_use]
pub fn attr_var_file_name(attr: &str) -> String {
    format!("{attr}_var.tdb")
}

/// Builds the validity bitmap file name for `attr`.
#[must_use]
pub fn attr_validity_file_name(attr: &str) -> String {
    format!("{attr}_validity.tdb")
}

/// Builds a fragment directory name: `__<pid>_<ms>[_<extra>]`.
#[must_use]
pub fn fragment_dir_name(pid: u32, timestamp_ms: u64, extra: u32) -> String {
    format!("__{pid}_{timestamp_ms}_{extra}")
}
