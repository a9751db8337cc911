// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Distinguishes the kind of failure at the public API boundary.
///
/// Every variant corresponds to one of the error kinds a caller needs to
/// branch on: I/O and format failures are usually unrecoverable corruption,
/// while config/query errors are caller mistakes.
#[derive(Debug)]
pub enum Error {
    /// Filesystem or network failure: not-found, permission, transport.
    Io(std::io::Error),

    /// Serialization failed.
    Encode(EncodeError),

    /// Deserialization failed.
    Decode(DecodeError),

    /// Malformed fragment metadata, schema blob, or filter header.
    Format(String),

    /// A filter stage failed: output overflow, bounds violation, or an
    /// underlying compression library error.
    Compression(String),

    /// Duplicate names or incompatible attribute/dimension constraints.
    Schema(String),

    /// Invalid layout for the array type, out-of-bounds range, or
    /// finalize-without-submit.
    Query(String),

    /// Unknown configuration key or malformed value.
    Config(String),

    /// Filelock contention under non-blocking mode.
    Lock(String),

    /// Fragment set concurrently deleted, or fragment rename failure.
    Consolidation(String),

    /// Key mismatch or AEAD tag verification failure.
    Encryption(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Encode(e) => write!(f, "encode error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::Format(msg) => write!(f, "format error: {msg}"),
            Self::Compression(msg) => write!(f, "compression error: {msg}"),
            Self::Schema(msg) => write!(f, "schema error: {msg}"),
            Self::Query(msg) => write!(f, "query error: {msg}"),
            Self::Config(msg) => write!(f, "config error: {msg}"),
            Self::Lock(msg) => write!(f, "lock error: {msg}"),
            Self::Consolidation(msg) => write!(f, "consolidation error: {msg}"),
            Self::Encryption(msg) => write!(f, "encryption error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
