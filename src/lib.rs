//! # HashKV
//!
//! An embedded, single-file key-value store with:
//! - Extendible hashing (directory + fixed-size bucket pages)
//! - Best-fit reuse of freed file space
//! - A bounded write-back cache of bucket pages
//! - Advisory file locking (one writer or many readers)
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Engine (fetch / store / delete / iterate)      │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ xxh3(key) → top `depth` bits
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                      Directory                              │
//! │              (2^depth bucket offsets, in memory)            │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │ BucketCache │          │  FreeSpace  │
//!   │    (LRU)    │          │ (best fit)  │
//!   └──────┬──────┘          └──────┬──────┘
//!          │                        │
//!          ▼                        ▼
//!   ┌─────────────────────────────────────┐
//!   │        DbFile (one locked file)     │
//!   └─────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use hashkv::{Config, Engine, OpenMode};
//!
//! # fn main() -> hashkv::Result<()> {
//! let config = Config::builder()
//!     .path("data.db")
//!     .mode(OpenMode::ReadWriteCreate)
//!     .build();
//! let mut db = Engine::open(config)?;
//!
//! db.store(b"apple", b"red")?;
//! assert_eq!(db.fetch(b"apple")?.unwrap(), b"red");
//!
//! db.delete(b"apple")?;
//! db.close()?;
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod datum;
pub mod hash;

pub mod storage;
pub mod directory;
pub mod cache;
pub mod engine;
pub mod iter;
pub mod shared;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{HashKvError, Result};
pub use config::{Config, OpenMode};
pub use datum::{Datum, StoreValue};
pub use engine::{Engine, Stats};
pub use iter::{Entries, Keys};
pub use shared::SharedEngine;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of HashKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
