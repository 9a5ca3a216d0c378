//! Error types for HashKV
//!
//! Provides a unified error type for all operations. Errors are returned
//! by value from the call that produced them; nothing is kept in global state.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type alias using HashKvError
pub type Result<T> = std::result::Result<T, HashKvError>;

/// Unified error type for HashKV operations
#[derive(Debug, Error)]
pub enum HashKvError {
    // -------------------------------------------------------------------------
    // Open Errors
    // -------------------------------------------------------------------------
    #[error("Database file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("Database is locked by another handle: {}", .0.display())]
    LockConflict(PathBuf),

    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // -------------------------------------------------------------------------
    // Structural Errors
    // -------------------------------------------------------------------------
    #[error("Database corrupted: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Usage Errors
    // -------------------------------------------------------------------------
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Database was opened read-only")]
    ReadOnly,
}

impl HashKvError {
    /// Translate an error raised while opening `path` into the open-time
    /// error kinds callers match on.
    pub(crate) fn from_open(err: io::Error, path: &Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => HashKvError::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => HashKvError::PermissionDenied(path.to_path_buf()),
            _ => HashKvError::Io(err),
        }
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        HashKvError::Corrupt(msg.into())
    }
}
