//! Storage Module
//!
//! On-disk layout of a HashKV database: one file, addressed by byte offset.
//!
//! ## Responsibilities
//! - Own the file handle, its advisory lock and durable flush
//! - Encode/decode the header, bucket pages and free-list blocks
//! - Allocate and reclaim regions of the file
//!
//! ## File Format
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │ Header block (offset 0, block_size bytes)              │
//! │   bincode(Header) ++ CRC32                             │
//! ├────────────────────────────────────────────────────────┤
//! │ Allocated regions (8-byte aligned, any order)          │
//! │   Directory   : 2^depth × u64 bucket offsets           │
//! │   Bucket page : bucket_size bytes, sorted slots        │
//! │   Data extent : key bytes ++ value bytes               │
//! │   Free block  : chained (offset, length) records       │
//! ├────────────────────────────────────────────────────────┤
//! │ Unused tail (≥ high_water)                             │
//! └────────────────────────────────────────────────────────┘
//! ```

pub mod bucket;
pub mod file;
pub mod freelist;
pub mod header;

pub use bucket::{Bucket, BucketStore, Slot};
pub use file::{DbFile, LockKind};
pub use freelist::FreeSpace;
pub use header::Header;

// =============================================================================
// Shared Constants
// =============================================================================

/// Magic bytes identifying a HashKV database file
pub const MAGIC: &[u8; 4] = b"HKVD";

/// Current file format version
pub const FORMAT_VERSION: u16 = 1;
