// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// A 128-bit checksum, used for tile and fragment-metadata integrity checks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Checksum(u128);

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Checksum {
    /// Wraps a raw checksum value.
    #[must_use]
    pub fn from_raw(value: u128) -> Self {
        Self(value)
    }

    /// Returns the raw 128-bit integer.
    #[must_use]
    pub fn into_u128(self) -> u128 {
        self.0
    }

    /// Computes the checksum of a byte slice in one shot.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        use xxhash_rust::xxh3::Xxh3Default;
        let mut hasher = Xxh3Default::new();
        hasher.update(bytes);
        Self(hasher.digest128())
    }

    pub(crate) fn check(&self, expected: Self) -> crate::Result<()> {
        if self.0 == expected.0 {
            Ok(())
        } else {
            Err(crate::Error::Format(format!(
                "checksum mismatch: expected {expected}, got {self}"
            )))
        }
    }
}

/// A `Write` adapter that folds every byte written into a running xxh3 checksum.
pub struct ChecksummedWriter<W: std::io::Write> {
    inner: W,
    hasher: xxhash_rust::xxh3::Xxh3Default,
}

impl<W: std::io::Write + std::io::Seek> std::io::Seek for ChecksummedWriter<W> {
    fn seek(&mut self, pos: std::io::SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl<W: std::io::Write> ChecksummedWriter<W> {
    /// Wraps `writer`, starting a fresh checksum.
    pub fn new(writer: W) -> Self {
        Self {
            inner: writer,
            hasher: xxhash_rust::xxh3::Xxh3Default::new(),
        }
    }

    /// Returns the checksum of all bytes written so far.
    pub fn checksum(&self) -> Checksum {
        Checksum::from_raw(self.hasher.digest128())
    }

    /// Borrows the wrapped writer.
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: std::io::Write> std::io::Write for ChecksummedWriter<W> {
    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.hasher.update(buf);
        self.inner.write(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn checksum_matches_direct_hash() {
        let data = b"tiledb";
        let mut w = ChecksummedWriter::new(Vec::new());
        std::io::Write::write_all(&mut w, data).unwrap();
        assert_eq!(w.checksum(), Checksum::of(data));
    }

    #[test]
    fn checksum_mismatch_is_detected() {
        let a = Checksum::of(b"a");
        let b = Checksum::of(b"b");
        assert!(a.check(b).is_err());
        assert!(a.check(a).is_ok());
    }
}
