//! Free space allocator
//!
//! Tracks reclaimed regions of the file and hands them back out best-fit.
//! Every byte below `high_water` is either live (referenced by the header,
//! directory, a bucket, or the on-disk free chain), free, or pending; bytes
//! at or above `high_water` are the unused tail.
//!
//! Released regions first go to a pending list and only become reusable
//! once the next sync has made a layout that no longer references them
//! durable. Regions that were allocated and never referenced can be handed
//! back immediately with [`FreeSpace::reclaim`].
//!
//! ## On-disk chain
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ BodyLen u32 | bincode(FreeBlock { next, extents }) | CRC u32 │
//! │ zero padding up to block_size                              │
//! └────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HashKvError, Result};

use super::file::DbFile;

/// Allocation granularity
pub const ALIGN: u64 = 8;

/// BodyLen (4) + CRC (4)
const FRAME_OVERHEAD: usize = 8;

/// bincode: next (8) + vec length (8)
const BLOCK_FIXED_SIZE: usize = 16;

/// bincode: offset (8) + length (8)
const EXTENT_SIZE: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct FreeBlock {
    next: u64,
    extents: Vec<(u64, u64)>,
}

/// Best-fit allocator over the database file
#[derive(Debug)]
pub struct FreeSpace {
    /// offset → length
    by_offset: BTreeMap<u64, u64>,
    /// (length, offset), for best-fit lookups
    by_size: BTreeSet<(u64, u64)>,
    /// Released since the last sync; not reusable yet
    pending: Vec<(u64, u64)>,
    high_water: u64,
    /// Blocks currently holding the on-disk free list
    chain: Vec<u64>,
    block_size: u32,
    dirty: bool,
}

/// Round a length up to the allocation granularity
pub fn align(len: u64) -> u64 {
    (len + ALIGN - 1) & !(ALIGN - 1)
}

impl FreeSpace {
    pub fn new(high_water: u64, block_size: u32) -> Self {
        Self {
            by_offset: BTreeMap::new(),
            by_size: BTreeSet::new(),
            pending: Vec::new(),
            high_water,
            chain: Vec::new(),
            block_size,
            dirty: false,
        }
    }

    /// Allocate `len` bytes, reusing the smallest free region that fits.
    /// A zero-length request returns offset 0 and allocates nothing.
    pub fn allocate(&mut self, len: u64) -> u64 {
        if len == 0 {
            return 0;
        }
        let len = align(len);

        let found = self.by_size.range((len, 0)..).next().copied();
        match found {
            Some((free_len, offset)) => {
                self.remove(offset, free_len);
                if free_len > len {
                    self.add(offset + len, free_len - len);
                }
                self.dirty = true;
                offset
            }
            None => self.extend(len),
        }
    }

    /// Allocate at the end of the file, never reusing free regions
    pub fn extend(&mut self, len: u64) -> u64 {
        let offset = self.high_water;
        self.high_water += align(len);
        self.dirty = true;
        offset
    }

    /// Release a region that may still be referenced by the last durable
    /// layout. It becomes reusable after the next [`commit`](Self::commit).
    pub fn release(&mut self, offset: u64, len: u64) {
        if len == 0 || offset == 0 {
            return;
        }
        self.pending.push((offset, align(len)));
        self.dirty = true;
    }

    /// Return a region nothing ever referenced; reusable immediately
    pub fn reclaim(&mut self, offset: u64, len: u64) {
        if len == 0 || offset == 0 {
            return;
        }
        self.insert(offset, align(len));
        self.dirty = true;
    }

    /// Make pending regions reusable. Call once the layout that stopped
    /// referencing them is durable.
    pub fn commit(&mut self) {
        for (offset, len) in std::mem::take(&mut self.pending) {
            self.insert(offset, len);
        }
    }

    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    /// Free plus pending bytes
    pub fn free_bytes(&self) -> u64 {
        self.by_offset.values().sum::<u64>() + self.pending.iter().map(|(_, l)| l).sum::<u64>()
    }

    /// Number of reusable regions
    pub fn extent_count(&self) -> usize {
        self.by_offset.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Reusable regions in offset order
    pub fn extents(&self) -> Vec<(u64, u64)> {
        self.by_offset.iter().map(|(&o, &l)| (o, l)).collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Number of extents one free-list block holds
    pub fn extents_per_block(block_size: u32) -> usize {
        (block_size as usize - FRAME_OVERHEAD - BLOCK_FIXED_SIZE) / EXTENT_SIZE
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Read the free chain starting at `head`
    pub fn load(file: &mut DbFile, head: u64, high_water: u64, block_size: u32) -> Result<Self> {
        let mut space = Self::new(high_water, block_size);
        let bs = block_size as u64;
        let max_blocks = high_water / bs + 1;

        let mut next = head;
        while next != 0 {
            if space.chain.len() as u64 >= max_blocks {
                return Err(HashKvError::corrupt("free-list chain contains a cycle"));
            }
            if next < bs || next + bs > high_water {
                return Err(HashKvError::corrupt(format!(
                    "free-list block {} out of bounds",
                    next
                )));
            }

            let mut buf = vec![0u8; block_size as usize];
            file.read_at(next, &mut buf)?;
            let block = decode_block(&buf)
                .map_err(|e| HashKvError::corrupt(format!("free-list block {}: {}", next, e)))?;

            for (offset, len) in block.extents {
                space.insert_loaded(offset, len)?;
            }
            space.chain.push(next);
            next = block.next;
        }

        debug!(
            blocks = space.chain.len(),
            extents = space.by_offset.len(),
            "loaded free list"
        );
        Ok(space)
    }

    /// Write the free list (free and pending regions, plus the blocks of the
    /// chain being replaced) into new blocks at the end of the file and
    /// return the new head. Nothing here becomes reusable until
    /// [`commit`](Self::commit).
    pub fn persist(&mut self, file: &mut DbFile) -> Result<u64> {
        let bs = self.block_size as u64;
        let old_chain = std::mem::take(&mut self.chain);
        self.pending.extend(old_chain.iter().map(|&off| (off, align(bs))));

        let mut extents: Vec<(u64, u64)> = self
            .by_offset
            .iter()
            .map(|(&o, &l)| (o, l))
            .chain(self.pending.iter().copied())
            .collect();
        extents.sort_unstable();

        let per_block = Self::extents_per_block(self.block_size);
        let block_count = extents.len().div_ceil(per_block);
        let blocks: Vec<u64> = (0..block_count).map(|_| self.extend(bs)).collect();

        if let Err(e) = Self::write_chain(file, &blocks, &extents, per_block, self.block_size) {
            for &off in &blocks {
                self.reclaim(off, bs);
            }
            return Err(e);
        }

        self.chain = blocks;
        self.dirty = false;
        Ok(self.chain.first().copied().unwrap_or(0))
    }

    fn write_chain(
        file: &mut DbFile,
        blocks: &[u64],
        extents: &[(u64, u64)],
        per_block: usize,
        block_size: u32,
    ) -> Result<()> {
        for (i, chunk) in extents.chunks(per_block).enumerate() {
            let block = FreeBlock {
                next: blocks.get(i + 1).copied().unwrap_or(0),
                extents: chunk.to_vec(),
            };
            let buf = encode_block(&block, block_size)?;
            file.write_at(blocks[i], &buf)?;
        }
        Ok(())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Insert a free region, merging with neighbours and giving it back to
    /// the unused tail when it ends at the high-water mark
    fn insert(&mut self, mut offset: u64, mut len: u64) {
        if let Some((&prev_off, &prev_len)) = self.by_offset.range(..offset).next_back() {
            if prev_off + prev_len == offset {
                self.remove(prev_off, prev_len);
                offset = prev_off;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.by_offset.get(&(offset + len)) {
            self.remove(offset + len, next_len);
            len += next_len;
        }

        if offset + len == self.high_water {
            self.high_water = offset;
        } else {
            self.add(offset, len);
        }
    }

    fn insert_loaded(&mut self, offset: u64, len: u64) -> Result<()> {
        let bs = self.block_size as u64;
        if len == 0 || offset < bs || offset + len > self.high_water {
            return Err(HashKvError::corrupt(format!(
                "free extent {}+{} out of bounds",
                offset, len
            )));
        }
        let overlaps_prev = self
            .by_offset
            .range(..offset + len)
            .next_back()
            .map_or(false, |(&o, &l)| o + l > offset);
        if overlaps_prev {
            return Err(HashKvError::corrupt(format!(
                "free extent {}+{} overlaps another",
                offset, len
            )));
        }
        self.insert(offset, len);
        Ok(())
    }

    fn add(&mut self, offset: u64, len: u64) {
        self.by_offset.insert(offset, len);
        self.by_size.insert((len, offset));
    }

    fn remove(&mut self, offset: u64, len: u64) {
        self.by_offset.remove(&offset);
        self.by_size.remove(&(len, offset));
    }
}

fn encode_block(block: &FreeBlock, block_size: u32) -> Result<Vec<u8>> {
    let body = bincode::serialize(block)
        .map_err(|e| HashKvError::Serialization(format!("free-list block: {}", e)))?;
    if body.len() + FRAME_OVERHEAD > block_size as usize {
        return Err(HashKvError::Serialization(format!(
            "free-list block of {} bytes exceeds block size {}",
            body.len(),
            block_size
        )));
    }

    let mut buf = vec![0u8; block_size as usize];
    buf[0..4].copy_from_slice(&(body.len() as u32).to_le_bytes());
    buf[4..4 + body.len()].copy_from_slice(&body);
    let crc = crc32fast::hash(&body);
    buf[4 + body.len()..8 + body.len()].copy_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

fn decode_block(buf: &[u8]) -> std::result::Result<FreeBlock, String> {
    if buf.len() < FRAME_OVERHEAD {
        return Err("block too short".to_string());
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&buf[0..4]);
    let body_len = u32::from_le_bytes(len_bytes) as usize;
    if body_len + FRAME_OVERHEAD > buf.len() {
        return Err(format!("body length {} exceeds block", body_len));
    }

    let body = &buf[4..4 + body_len];
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&buf[4 + body_len..8 + body_len]);
    if u32::from_le_bytes(crc_bytes) != crc32fast::hash(body) {
        return Err("checksum mismatch".to_string());
    }

    bincode::deserialize(body).map_err(|e| e.to_string())
}
