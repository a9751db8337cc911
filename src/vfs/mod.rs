// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Virtual filesystem abstraction (§4.1).
//!
//! `Vfs` is the sole authority that performs I/O; every other component
//! (schema, fragment, cache, consolidator) consumes it by reference
//! rather than touching `std::fs` directly, so a future S3/HDFS backend
//! only has to implement this trait (§1: those backends are out of
//! scope here, beyond this interface).

use crate::uri::Uri;
use crate::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

/// Whether a filelock is taken in shared (reader) or exclusive (writer) mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockKind {
    /// Shared/reader lock; multiple holders may coalesce.
    Shared,
    /// Exclusive/writer lock; at most one holder.
    Exclusive,
}

/// An opaque handle to an acquired OS-level filelock.
///
/// Holding this open keeps the lock held; dropping it without calling
/// [`Vfs::filelock_unlock`] still releases the OS lock (the underlying
/// file handle closes), but callers should prefer the explicit API so
/// the RAII discipline lives in `locking.rs`, not in `Drop`.
pub struct LockHandle {
    file: File,
    kind: LockKind,
}

/// Uniform filesystem contract (§4.1). All paths are absolute [`Uri`]s.
pub trait Vfs: Send + Sync {
    /// Creates a directory and all missing parents. Idempotent.
    fn create_dir(&self, uri: &Uri) -> Result<()>;

    /// Creates an empty file, truncating if it exists. Idempotent.
    fn create_file(&self, uri: &Uri) -> Result<()>;

    /// True if `uri` names an existing directory.
    fn is_dir(&self, uri: &Uri) -> Result<bool>;

    /// True if `uri` names an existing file.
    fn is_file(&self, uri: &Uri) -> Result<bool>;

    /// Removes a path. Recursive on directories; idempotent on absent paths.
    fn remove_path(&self, uri: &Uri) -> Result<()>;

    /// Moves `from` to `to`. Atomic where the backend supports it;
    /// otherwise falls back to copy-then-delete.
    fn move_path(&self, from: &Uri, to: &Uri) -> Result<()>;

    /// Positional read of `buf.len()` bytes starting at `offset`. Fails
    /// if the range exceeds the file's current size.
    fn read(&self, uri: &Uri, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Reads the whole file into memory.
    fn read_all(&self, uri: &Uri) -> Result<Vec<u8>>;

    /// Appends bytes to the file, creating it if absent.
    fn write(&self, uri: &Uri, buf: &[u8]) -> Result<()>;

    /// Makes preceding writes durable and visible to subsequent readers.
    fn flush(&self, uri: &Uri) -> Result<()>;

    /// One-level directory listing.
    fn ls(&self, uri: &Uri) -> Result<Vec<Uri>>;

    /// Size of the file in bytes. Fails if the path is absent.
    fn file_size(&self, uri: &Uri) -> Result<u64>;

    /// Acquires a filelock on `uri`, creating the lock file if needed.
    /// Blocks until acquired.
    fn filelock_lock(&self, uri: &Uri, kind: LockKind) -> Result<LockHandle>;

    /// Releases a previously acquired filelock. Idempotent for a given handle.
    fn filelock_unlock(&self, handle: LockHandle) -> Result<()>;
}

/// Local POSIX/Windows filesystem backend.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalVfs;

fn io_err(e: std::io::Error) -> Error {
    Error::Io(e)
}

impl Vfs for LocalVfs {
    fn create_dir(&self, uri: &Uri) -> Result<()> {
        fs::create_dir_all(uri.as_path()).map_err(io_err)
    }

    fn create_file(&self, uri: &Uri) -> Result<()> {
        File::create(uri.as_path()).map_err(io_err)?;
        Ok(())
    }

    fn is_dir(&self, uri: &Uri) -> Result<bool> {
        Ok(uri.as_path().is_dir())
    }

    fn is_file(&self, uri: &Uri) -> Result<bool> {
        Ok(uri.as_path().is_file())
    }

    fn remove_path(&self, uri: &Uri) -> Result<()> {
        let path = uri.as_path();
        if path.is_dir() {
            match fs::remove_dir_all(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_err(e)),
            }
        } else {
            match fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_err(e)),
            }
        }
    }

    fn move_path(&self, from: &Uri, to: &Uri) -> Result<()> {
        match fs::rename(from.as_path(), to.as_path()) {
            Ok(()) => Ok(()),
            Err(_) => {
                fs::copy(from.as_path(), to.as_path()).map_err(io_err)?;
                fs::remove_file(from.as_path()).map_err(io_err)
            }
        }
    }

    fn read(&self, uri: &Uri, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = File::open(uri.as_path()).map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();
        if offset + buf.len() as u64 > len {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read range exceeds file size for {uri}"),
            )));
        }
        file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
        file.read_exact(buf).map_err(io_err)
    }

    fn read_all(&self, uri: &Uri) -> Result<Vec<u8>> {
        fs::read(uri.as_path()).map_err(io_err)
    }

    fn write(&self, uri: &Uri, buf: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(uri.as_path())
            .map_err(io_err)?;
        file.write_all(buf).map_err(io_err)
    }

    fn flush(&self, uri: &Uri) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(uri.as_path())
            .map_err(io_err)?;
        file.sync_all().map_err(io_err)
    }

    fn ls(&self, uri: &Uri) -> Result<Vec<Uri>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(uri.as_path()).map_err(io_err)? {
            out.push(Uri::new(entry.map_err(io_err)?.path()));
        }
        Ok(out)
    }

    fn file_size(&self, uri: &Uri) -> Result<u64> {
        Ok(fs::metadata(uri.as_path()).map_err(io_err)?.len())
    }

    fn filelock_lock(&self, uri: &Uri, kind: LockKind) -> Result<LockHandle> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(uri.as_path())
            .map_err(io_err)?;
        match kind {
            LockKind::Shared => file.lock_shared().map_err(io_err)?,
            LockKind::Exclusive => file.lock_exclusive().map_err(io_err)?,
        }
        Ok(LockHandle { file, kind })
    }

    fn filelock_unlock(&self, handle: LockHandle) -> Result<()> {
        FileExt::unlock(&handle.file).map_err(io_err)
    }
}

impl LockHandle {
    /// The mode this handle was acquired in.
    #[must_use]
    pub fn kind(&self) -> LockKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn create_read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = LocalVfs;
        let uri = Uri::new(dir.path().join("f.tdb"));

        vfs.write(&uri, b"hello").unwrap();
        vfs.write(&uri, b" world").unwrap();
        assert_eq!(vfs.read_all(&uri).unwrap(), b"hello world");
        assert_eq!(vfs.file_size(&uri).unwrap(), 11);

        let mut buf = [0u8; 5];
        vfs.read(&uri, 6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn read_past_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = LocalVfs;
        let uri = Uri::new(dir.path().join("f.tdb"));
        vfs.write(&uri, b"abc").unwrap();

        let mut buf = [0u8; 4];
        assert!(vfs.read(&uri, 0, &mut buf).is_err());
    }

    #[test]
    fn remove_path_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = LocalVfs;
        let uri = Uri::new(dir.path().join("missing"));
        vfs.remove_path(&uri).unwrap();
        vfs.remove_path(&uri).unwrap();
    }

    #[test]
    fn ls_lists_directory_contents() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = LocalVfs;
        let base = Uri::new(dir.path());
        vfs.write(&base.join("a.tdb"), b"x").unwrap();
        vfs.write(&base.join("b.tdb"), b"y").unwrap();

        let mut names: Vec<_> = vfs
            .ls(&base)
            .unwrap()
            .iter()
            .filter_map(|u| u.file_name().map(str::to_owned))
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.tdb".to_string(), "b.tdb".to_string()]);
    }

    #[test]
    fn filelock_shared_then_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = LocalVfs;
        let uri = Uri::new(dir.path().join("__lock.tdb"));

        let h1 = vfs.filelock_lock(&uri, LockKind::Shared).unwrap();
        vfs.filelock_unlock(h1).unwrap();

        let h2 = vfs.filelock_lock(&uri, LockKind::Exclusive).unwrap();
        vfs.filelock_unlock(h2).unwrap();
    }
}
