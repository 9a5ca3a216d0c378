//! Directory Module
//!
//! Extendible-hashing directory: `2^depth` bucket offsets indexed by the top
//! `depth` bits of a key's hash. A bucket with local depth `l` is referenced
//! by the `2^(depth - l)` consecutive entries sharing its `l`-bit prefix.
//!
//! The directory only grows. It is held in memory and written to a freshly
//! allocated region on sync whenever it changed.

use std::ops::Range;

use tracing::debug;

use crate::error::{HashKvError, Result};
use crate::hash::{prefix, MAX_DEPTH};

/// In-memory directory
#[derive(Debug, Clone, PartialEq)]
pub struct Directory {
    depth: u32,
    entries: Vec<u64>,
    /// Region currently holding the directory on disk
    offset: u64,
    dirty: bool,
}

impl Directory {
    /// A depth-0 directory with a single entry and no bucket yet
    pub fn new() -> Self {
        Self {
            depth: 0,
            entries: vec![0],
            offset: 0,
            dirty: true,
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[u64] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> u64 {
        self.entries[index]
    }

    /// Size of the on-disk form in bytes
    pub fn byte_len(&self) -> u64 {
        8 * self.entries.len() as u64
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Record where the directory now lives on disk
    pub fn mark_written(&mut self, offset: u64) {
        self.offset = offset;
        self.dirty = false;
    }

    /// Directory index for a hash
    pub fn index_of(&self, hash: u64) -> usize {
        prefix(hash, self.depth)
    }

    /// Offset of the bucket owning `hash`, 0 if none exists yet
    pub fn bucket_for(&self, hash: u64) -> u64 {
        self.entries[self.index_of(hash)]
    }

    /// Entries referencing the bucket with `local_depth` that owns `hash`
    pub fn range_of(&self, hash: u64, local_depth: u32) -> Range<usize> {
        let span = 1usize << (self.depth - local_depth);
        let start = prefix(hash, local_depth) << (self.depth - local_depth);
        start..start + span
    }

    /// Point every entry in `range` at `offset`
    pub fn set_range(&mut self, range: Range<usize>, offset: u64) {
        for entry in &mut self.entries[range] {
            *entry = offset;
        }
        self.dirty = true;
    }

    /// Double the directory; every bucket keeps its hash range
    pub fn double(&mut self) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(HashKvError::corrupt(format!(
                "directory depth would exceed {}",
                MAX_DEPTH
            )));
        }
        let mut doubled = Vec::with_capacity(self.entries.len() * 2);
        for &offset in &self.entries {
            doubled.push(offset);
            doubled.push(offset);
        }
        self.entries = doubled;
        self.depth += 1;
        self.dirty = true;
        debug!(depth = self.depth, entries = self.entries.len(), "directory doubled");
        Ok(())
    }

    /// Serialize as little-endian u64 offsets
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.entries.len() * 8);
        for offset in &self.entries {
            buf.extend_from_slice(&offset.to_le_bytes());
        }
        buf
    }

    /// Parse a directory read from `offset`, checking that every entry
    /// points at a whole bucket page inside `lower..upper`
    pub fn decode(
        buf: &[u8],
        depth: u32,
        offset: u64,
        lower: u64,
        upper: u64,
        bucket_size: u32,
    ) -> Result<Self> {
        let expected = 8usize << depth;
        if buf.len() != expected {
            return Err(HashKvError::corrupt(format!(
                "directory of {} bytes, expected {}",
                buf.len(),
                expected
            )));
        }

        let entries: Vec<u64> = buf
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                u64::from_le_bytes(b)
            })
            .collect();

        for (i, &bucket) in entries.iter().enumerate() {
            let empty_root = bucket == 0 && depth == 0;
            if !empty_root && (bucket < lower || bucket.saturating_add(bucket_size as u64) > upper) {
                return Err(HashKvError::corrupt(format!(
                    "directory entry {} points outside the file ({})",
                    i, bucket
                )));
            }
        }

        Ok(Self {
            depth,
            entries,
            offset,
            dirty: false,
        })
    }

    /// Index of the first entry of the next bucket range after the one
    /// starting at `index` for a bucket of `local_depth`
    pub fn next_range_start(&self, index: usize, local_depth: u32) -> usize {
        let span = 1usize << (self.depth.saturating_sub(local_depth));
        (index - index % span) + span
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}
