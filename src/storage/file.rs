//! Database file handle
//!
//! Wraps the single database file: positional reads/writes, the advisory
//! lock, and the durable-flush primitive. The lock is released when the
//! handle is dropped, including on error paths during open.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::config::{OpenMode, DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::error::{HashKvError, Result};

use super::bucket::{Bucket, BucketStore};

/// Kind of advisory lock held on the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// The open database file
pub struct DbFile {
    file: File,
    path: PathBuf,
    /// Size of a bucket page; 0 until the header is known
    bucket_size: u32,
    locked: bool,
}

impl DbFile {
    /// Open `path` according to `mode`. Never truncates; callers that want a
    /// fresh file truncate after taking the lock.
    pub fn open(path: &Path, mode: OpenMode, permissions: u32) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(mode.is_writable()).create(mode.creates());

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(permissions);
        }
        #[cfg(not(unix))]
        let _ = permissions;

        let file = options
            .open(path)
            .map_err(|e| HashKvError::from_open(e, path))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            bucket_size: 0,
            locked: false,
        })
    }

    /// Take the advisory lock without blocking
    pub fn lock(&mut self, kind: LockKind) -> Result<()> {
        let res = match kind {
            LockKind::Shared => FileExt::try_lock_shared(&self.file),
            LockKind::Exclusive => FileExt::try_lock_exclusive(&self.file),
        };

        match res {
            Ok(()) => {
                self.locked = true;
                debug!(path = %self.path.display(), ?kind, "acquired file lock");
                Ok(())
            }
            Err(e) if is_contended(&e) => Err(HashKvError::LockConflict(self.path.clone())),
            Err(e) => Err(HashKvError::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_bucket_size(&mut self, size: u32) {
        self.bucket_size = size;
    }

    pub fn bucket_size(&self) -> u32 {
        self.bucket_size
    }

    /// Current physical length of the file
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        Ok(())
    }

    /// Block size reported by the filesystem for this file
    pub fn preferred_block_size(&self) -> u32 {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if let Ok(meta) = self.file.metadata() {
                let size = meta.blksize();
                if size >= MIN_BLOCK_SIZE as u64 && size <= u32::MAX as u64 {
                    return size as u32;
                }
            }
        }
        DEFAULT_BLOCK_SIZE
    }

    /// Read exactly `buf.len()` bytes at `offset`
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Write all of `buf` at `offset`, growing the file if needed
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    /// Make previously written bytes durable
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl BucketStore for DbFile {
    fn read_bucket(&mut self, offset: u64) -> Result<Bucket> {
        let mut page = vec![0u8; self.bucket_size as usize];
        self.read_at(offset, &mut page)?;
        Bucket::decode(&page).map_err(|e| match e {
            HashKvError::Corrupt(msg) => {
                HashKvError::Corrupt(format!("bucket at offset {}: {}", offset, msg))
            }
            other => other,
        })
    }

    fn write_bucket(&mut self, offset: u64, bucket: &Bucket) -> Result<()> {
        let page = bucket.encode(self.bucket_size as usize)?;
        self.write_at(offset, &page)
    }
}

impl Drop for DbFile {
    fn drop(&mut self) {
        if self.locked {
            let _ = FileExt::unlock(&self.file);
        }
    }
}

fn is_contended(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    let contended = fs2::lock_contended_error();
    err.raw_os_error().is_some() && err.raw_os_error() == contended.raw_os_error()
}
