// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Storage-manager configuration (§6, SPEC_FULL §D).
//!
//! The source has two `Config` classes (`storage_manager` and `config`);
//! they are treated here as one logical [`Config`] struct.

/// Consolidation/vacuum granularity.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConsolidationMode {
    /// Merge fragment data files.
    Fragment,
    /// Merge only fragment metadata, leaving data files untouched.
    FragmentMeta,
    /// Consolidate the commit log (array-level metadata writes).
    Commits,
}

/// Alias; vacuum recognizes the same granularity as consolidation.
pub type VacuumMode = ConsolidationMode;

impl ConsolidationMode {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "fragment" => Some(Self::Fragment),
            "fragment_meta" => Some(Self::FragmentMeta),
            "commits" => Some(Self::Commits),
            _ => None,
        }
    }
}

/// I/O method for reads. Only `Posix` is implemented; `Mmap`/`Mpi` are
/// accepted for API compatibility (§Non-goals: MPI transport is out of
/// scope) but behave identically to `Posix`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IoMethod {
    /// Plain positional read/write through the VFS.
    Posix,
    /// Memory-mapped reads (accepted, not implemented differently).
    Mmap,
    /// MPI-IO transport (accepted, not implemented differently).
    Mpi,
}

impl IoMethod {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "posix" => Some(Self::Posix),
            "mmap" => Some(Self::Mmap),
            "mpi" => Some(Self::Mpi),
            _ => None,
        }
    }
}

/// S3 backend options. Stored and round-tripped but inert: the S3 backend
/// itself is out of scope (§1) beyond the abstract VFS interface.
#[derive(Clone, Debug, Default)]
pub struct S3Config {
    /// AWS region.
    pub region: Option<String>,
    /// URI scheme (`http` / `https`).
    pub scheme: Option<String>,
    /// Custom endpoint, for S3-compatible stores.
    pub endpoint_override: Option<String>,
    /// Whether to use virtual-hosted-style addressing.
    pub use_virtual_addressing: Option<bool>,
    /// Per-request buffer size in bytes.
    pub file_buffer_size: Option<usize>,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: Option<u64>,
    /// Request timeout in milliseconds.
    pub request_timeout_ms: Option<u64>,
}

/// Storage-manager configuration.
///
/// Built with the consuming-builder pattern: each setter takes `self` by
/// value and returns it, so calls chain (`Config::new().tile_cache_size(..)`).
#[derive(Clone, Debug)]
pub struct Config {
    /// Tile cache capacity in bytes.
    pub tile_cache_size: usize,
    /// Array-schema metadata cache capacity in bytes.
    pub array_metadata_cache_size: usize,
    /// Fragment-metadata cache capacity in bytes.
    pub fragment_metadata_cache_size: usize,
    /// Minimum number of fragments a consolidation step may merge.
    pub consolidation_step_min_frags: u32,
    /// Maximum number of fragments a consolidation step may merge.
    pub consolidation_step_max_frags: u32,
    /// Consolidation granularity.
    pub consolidation_mode: ConsolidationMode,
    /// Vacuum granularity.
    pub vacuum_mode: VacuumMode,
    /// Read I/O method.
    pub io_method_read: IoMethod,
    /// Write I/O method.
    pub io_method_write: IoMethod,
    /// Whether writers may submit attributes to a query in separate calls.
    pub allow_separate_attribute_writes: bool,
    /// Buffer size used when streaming cells through a consolidation pass.
    pub consolidation_buffer_size: usize,
    /// Soft memory budget for fixed-size attribute buffers, in bytes.
    pub memory_budget: usize,
    /// Soft memory budget for variable-length attribute buffers, in bytes.
    pub memory_budget_var: usize,
    /// S3 backend options (inert; see [`S3Config`]).
    pub s3: S3Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tile_cache_size: 64 * 1_024 * 1_024,
            array_metadata_cache_size: 8 * 1_024 * 1_024,
            fragment_metadata_cache_size: 8 * 1_024 * 1_024,
            consolidation_step_min_frags: 3,
            consolidation_step_max_frags: 10,
            consolidation_mode: ConsolidationMode::Fragment,
            vacuum_mode: VacuumMode::Fragment,
            io_method_read: IoMethod::Posix,
            io_method_write: IoMethod::Posix,
            allow_separate_attribute_writes: false,
            consolidation_buffer_size: 10 * 1_024 * 1_024,
            memory_budget: 5 * 1_024 * 1_024 * 1_024,
            memory_budget_var: 10 * 1_024 * 1_024 * 1_024,
            s3: S3Config::default(),
        }
    }
}

impl Config {
    /// Initializes a config with documented defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the tile cache capacity in bytes. Default 64 MiB.
    #[must_use]
    pub fn tile_cache_size(mut self, bytes: usize) -> Self {
        self.tile_cache_size = bytes;
        self
    }

    /// Sets the array-metadata cache capacity in bytes. Default 8 MiB.
    #[must_use]
    pub fn array_metadata_cache_size(mut self, bytes: usize) -> Self {
        self.array_metadata_cache_size = bytes;
        self
    }

    /// Sets the fragment-metadata cache capacity in bytes. Default 8 MiB.
    #[must_use]
    pub fn fragment_metadata_cache_size(mut self, bytes: usize) -> Self {
        self.fragment_metadata_cache_size = bytes;
        self
    }

    /// Sets the consolidation step window (min/max fragments per step).
    ///
    /// # Panics
    ///
    /// Panics if `min` is 0 or greater than `max`.
    #[must_use]
    pub fn consolidation_step(mut self, min: u32, max: u32) -> Self {
        assert!(min > 0 && min <= max, "invalid consolidation step window");
        self.consolidation_step_min_frags = min;
        self.consolidation_step_max_frags = max;
        self
    }

    /// Sets the consolidation granularity. Default [`ConsolidationMode::Fragment`].
    #[must_use]
    pub fn consolidation_mode(mut self, mode: ConsolidationMode) -> Self {
        self.consolidation_mode = mode;
        self
    }

    /// Sets the vacuum granularity. Default [`VacuumMode::Fragment`].
    #[must_use]
    pub fn vacuum_mode(mut self, mode: VacuumMode) -> Self {
        self.vacuum_mode = mode;
        self
    }

    /// Sets the consolidation streaming buffer size in bytes. Default 10 MB.
    #[must_use]
    pub fn consolidation_buffer_size(mut self, bytes: usize) -> Self {
        self.consolidation_buffer_size = bytes;
        self
    }

    /// Sets the S3 backend options (stored, inert; see [`S3Config`]).
    #[must_use]
    pub fn s3(mut self, s3: S3Config) -> Self {
        self.s3 = s3;
        self
    }

    /// Sets a configuration option by its string key, matching the
    /// language-agnostic key surface in §6. Returns `ConfigError` for
    /// unrecognized keys or malformed values.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if `key` is unrecognized or `value`
    /// cannot be parsed for that key.
    pub fn set(&mut self, key: &str, value: &str) -> crate::Result<()> {
        let parse_usize = |v: &str| {
            v.parse::<usize>()
                .map_err(|_| crate::Error::Config(format!("not a valid integer: {v}")))
        };
        let parse_u32 = |v: &str| {
            v.parse::<u32>()
                .map_err(|_| crate::Error::Config(format!("not a valid integer: {v}")))
        };
        let parse_bool = |v: &str| {
            v.parse::<bool>()
                .map_err(|_| crate::Error::Config(format!("not a valid bool: {v}")))
        };

        match key {
            "sm.tile_cache_size" => self.tile_cache_size = parse_usize(value)?,
            "sm.array_metadata_cache_size" => {
                self.array_metadata_cache_size = parse_usize(value)?;
            }
            "sm.fragment_metadata_cache_size" => {
                self.fragment_metadata_cache_size = parse_usize(value)?;
            }
            "sm.consolidation.step_min_frags" => {
                self.consolidation_step_min_frags = parse_u32(value)?;
            }
            "sm.consolidation.step_max_frags" => {
                self.consolidation_step_max_frags = parse_u32(value)?;
            }
            "sm.consolidation.mode" => {
                self.consolidation_mode = ConsolidationMode::parse(value)
                    .ok_or_else(|| crate::Error::Config(format!("invalid mode: {value}")))?;
            }
            "sm.vacuum.mode" => {
                self.vacuum_mode = VacuumMode::parse(value)
                    .ok_or_else(|| crate::Error::Config(format!("invalid mode: {value}")))?;
            }
            "sm.io_method.read" => {
                self.io_method_read = IoMethod::parse(value)
                    .ok_or_else(|| crate::Error::Config(format!("invalid io method: {value}")))?;
            }
            "sm.io_method.write" => {
                self.io_method_write = IoMethod::parse(value)
                    .ok_or_else(|| crate::Error::Config(format!("invalid io method: {value}")))?;
            }
            "sm.allow_separate_attribute_writes" => {
                self.allow_separate_attribute_writes = parse_bool(value)?;
            }
            "sm.consolidation.buffer_size" => {
                self.consolidation_buffer_size = parse_usize(value)?;
            }
            "sm.memory_budget" => self.memory_budget = parse_usize(value)?,
            "sm.memory_budget_var" => self.memory_budget_var = parse_usize(value)?,
            "vfs.s3.region" => self.s3.region = Some(value.to_string()),
            "vfs.s3.scheme" => self.s3.scheme = Some(value.to_string()),
            "vfs.s3.endpoint_override" => self.s3.endpoint_override = Some(value.to_string()),
            "vfs.s3.use_virtual_addressing" => {
                self.s3.use_virtual_addressing = Some(parse_bool(value)?);
            }
            "vfs.s3.file_buffer_size" => self.s3.file_buffer_size = Some(parse_usize(value)?),
            "vfs.s3.connect_timeout_ms" => {
                self.s3.connect_timeout_ms = Some(value.parse().map_err(|_| {
                    crate::Error::Config(format!("not a valid integer: {value}"))
                })?);
            }
            "vfs.s3.request_timeout_ms" => {
                self.s3.request_timeout_ms = Some(value.parse().map_err(|_| {
                    crate::Error::Config(format!("not a valid integer: {value}"))
                })?);
            }
            _ => return Err(crate::Error::Config(format!("unrecognized key: {key}"))),
        }

        Ok(())
    }
}
