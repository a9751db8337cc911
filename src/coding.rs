// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::io::{Read, Write};

/// Error during serialization.
#[derive(Debug)]
pub enum EncodeError {
    /// I/O error
    Io(std::io::Error),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EncodeError({})",
            match self {
                Self::Io(e) => e.to_string(),
            }
        )
    }
}

impl From<std::io::Error> for EncodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
        }
    }
}

/// Error during deserialization.
#[derive(Debug)]
pub enum DecodeError {
    /// I/O error
    Io(std::io::Error),

    /// An enum tag byte did not match any known variant of `what`.
    InvalidTag((&'static str, u8)),

    /// A version field was newer than anything this build understands.
    InvalidVersion(u32),

    /// A length-prefixed field's length did not fit the remaining buffer.
    InvalidLength((&'static str, u64)),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "DecodeError::Io({e})"),
            Self::InvalidTag((what, tag)) => write!(f, "DecodeError::InvalidTag({what}, {tag})"),
            Self::InvalidVersion(v) => write!(f, "DecodeError::InvalidVersion({v})"),
            Self::InvalidLength((what, len)) => {
                write!(f, "DecodeError::InvalidLength({what}, {len})")
            }
        }
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Trait to serialize stuff.
pub trait Encode {
    /// Serializes into a writer.
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    /// Serializes into a freshly allocated vector.
    fn encode_into_vec(&self) -> Vec<u8> {
        let mut v = vec![];
        self.encode_into(&mut v)
            .expect("cannot fail writing to a Vec");
        v
    }
}

/// Trait to deserialize stuff.
pub trait Decode {
    /// Deserializes from a reader.
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError>
    where
        Self: Sized;
}
