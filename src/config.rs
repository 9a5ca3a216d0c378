//! Configuration for HashKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{HashKvError, Result};

/// Smallest block size accepted for new databases
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Block size used when the filesystem doesn't report one
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Default number of buckets kept in memory
pub const DEFAULT_CACHE_SIZE: usize = 100;

/// Default permission bits for newly created files (before umask)
pub const DEFAULT_PERMISSIONS: u32 = 0o666;

/// How a database file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only access; the file must exist. Takes a shared lock.
    ReadOnly,

    /// Read-write access; the file must exist. Takes an exclusive lock.
    ReadWrite,

    /// Read-write access, creating the file if it doesn't exist.
    ReadWriteCreate,

    /// Read-write access, always starting from an empty database.
    ReadWriteCreateForce,
}

impl OpenMode {
    /// Whether this mode allows mutations
    pub fn is_writable(self) -> bool {
        !matches!(self, OpenMode::ReadOnly)
    }

    /// Whether this mode may create a missing file
    pub fn creates(self) -> bool {
        matches!(self, OpenMode::ReadWriteCreate | OpenMode::ReadWriteCreateForce)
    }
}

/// Main configuration for a HashKV database
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // File Configuration
    // -------------------------------------------------------------------------
    /// Path of the single database file
    pub path: PathBuf,

    /// How to open the file
    pub mode: OpenMode,

    /// Permission bits applied when the file is created (Unix only)
    pub permissions: u32,

    /// Size of a single disk transfer, used as the bucket page size.
    /// `None` picks the filesystem block size. Only consulted when a new
    /// database is created; existing files keep their recorded size.
    pub block_size: Option<u32>,

    // -------------------------------------------------------------------------
    // Cache Configuration
    // -------------------------------------------------------------------------
    /// Number of bucket pages held in memory
    pub cache_size: usize,

    // -------------------------------------------------------------------------
    // Durability / Locking
    // -------------------------------------------------------------------------
    /// Sync the file after every mutation
    pub sync_writes: bool,

    /// Skip advisory file locking
    pub no_lock: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./hashkv.db"),
            mode: OpenMode::ReadWriteCreate,
            permissions: DEFAULT_PERMISSIONS,
            block_size: None,
            cache_size: DEFAULT_CACHE_SIZE,
            sync_writes: false,
            no_lock: false,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the values that can be rejected without touching the filesystem
    pub fn validate(&self) -> Result<()> {
        if let Some(size) = self.block_size {
            if size < MIN_BLOCK_SIZE {
                return Err(HashKvError::InvalidArgument(format!(
                    "block size {} is below the minimum of {}",
                    size, MIN_BLOCK_SIZE
                )));
            }
        }
        if self.cache_size == 0 {
            return Err(HashKvError::InvalidArgument(
                "cache size must be at least 1 bucket".to_string(),
            ));
        }
        if self.path.as_os_str().is_empty() {
            return Err(HashKvError::InvalidArgument("empty database path".to_string()));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the database file path
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Set the open mode
    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Set the permission bits for a newly created file
    pub fn permissions(mut self, mode: u32) -> Self {
        self.config.permissions = mode;
        self
    }

    /// Set the block size used when creating a database
    pub fn block_size(mut self, size: u32) -> Self {
        self.config.block_size = Some(size);
        self
    }

    /// Set the number of cached buckets
    pub fn cache_size(mut self, buckets: usize) -> Self {
        self.config.cache_size = buckets;
        self
    }

    /// Sync to disk after every store/delete
    pub fn sync_writes(mut self, enabled: bool) -> Self {
        self.config.sync_writes = enabled;
        self
    }

    /// Disable advisory locking
    pub fn no_lock(mut self, enabled: bool) -> Self {
        self.config.no_lock = enabled;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
