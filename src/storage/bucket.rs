//! Bucket pages
//!
//! A bucket is one fixed-size page holding up to `capacity` slots sorted by
//! key hash. A slot points at a data extent holding `key ++ value`; the
//! bytes themselves live outside the page so entries of any size fit.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ LocalDepth u32 | Count u32 | Overflow u64 | CRC u32 | Rsvd u32 │
//! ├──────────────────────────────────────────────────────────────┤
//! │ [Hash u64][KeyLen u32][ValLen u32][DataOffset u64]  × Count    │
//! ├──────────────────────────────────────────────────────────────┤
//! │ zero padding up to the bucket size                           │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::ops::Range;

use crate::error::{HashKvError, Result};
use crate::hash::MAX_DEPTH;

/// LocalDepth (4) + Count (4) + Overflow (8) + CRC (4) + Reserved (4)
pub const BUCKET_HEADER_SIZE: usize = 24;

/// Hash (8) + KeyLen (4) + ValLen (4) + DataOffset (8)
pub const SLOT_SIZE: usize = 24;

/// Byte range of the header covered by the checksum (everything before CRC)
const CRC_COVERED_HEADER: usize = 16;

/// One entry of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub hash: u64,
    pub key_len: u32,
    pub value_len: u32,
    /// Start of the `key ++ value` extent; 0 when both are empty
    pub data_offset: u64,
}

impl Slot {
    /// Length of the data extent this slot owns
    pub fn data_len(&self) -> u64 {
        self.key_len as u64 + self.value_len as u64
    }
}

/// In-memory form of a bucket page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bucket {
    /// Number of leading hash bits shared by every key in this bucket
    pub local_depth: u32,
    /// Offset of the next page in the overflow chain, 0 for none
    pub overflow: u64,
    slots: Vec<Slot>,
}

impl Bucket {
    pub fn new(local_depth: u32) -> Self {
        Self {
            local_depth,
            overflow: 0,
            slots: Vec::new(),
        }
    }

    /// Build a bucket from arbitrary slots (sorted here)
    pub fn with_slots(local_depth: u32, mut slots: Vec<Slot>) -> Self {
        slots.sort_by_key(|s| s.hash);
        Self {
            local_depth,
            overflow: 0,
            slots,
        }
    }

    /// Number of slots that fit in a page of `bucket_size` bytes
    pub fn capacity(bucket_size: usize) -> usize {
        bucket_size.saturating_sub(BUCKET_HEADER_SIZE) / SLOT_SIZE
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn into_slots(self) -> Vec<Slot> {
        self.slots
    }

    /// Indices of the slots whose hash equals `hash`
    pub fn candidates(&self, hash: u64) -> Range<usize> {
        let start = self.slots.partition_point(|s| s.hash < hash);
        let end = self.slots.partition_point(|s| s.hash <= hash);
        start..end
    }

    /// Insert keeping hash order
    pub fn insert(&mut self, slot: Slot) {
        let pos = self.slots.partition_point(|s| s.hash <= slot.hash);
        self.slots.insert(pos, slot);
    }

    /// Replace the slot at `idx`; the hash must not change
    pub fn replace(&mut self, idx: usize, slot: Slot) -> Slot {
        debug_assert_eq!(self.slots[idx].hash, slot.hash);
        std::mem::replace(&mut self.slots[idx], slot)
    }

    pub fn remove(&mut self, idx: usize) -> Slot {
        self.slots.remove(idx)
    }

    /// Serialize into a page of exactly `bucket_size` bytes
    pub fn encode(&self, bucket_size: usize) -> Result<Vec<u8>> {
        if self.slots.len() > Self::capacity(bucket_size) {
            return Err(HashKvError::InvalidArgument(format!(
                "{} slots exceed bucket capacity {}",
                self.slots.len(),
                Self::capacity(bucket_size)
            )));
        }

        let mut page = vec![0u8; bucket_size];
        page[0..4].copy_from_slice(&self.local_depth.to_le_bytes());
        page[4..8].copy_from_slice(&(self.slots.len() as u32).to_le_bytes());
        page[8..16].copy_from_slice(&self.overflow.to_le_bytes());

        let mut pos = BUCKET_HEADER_SIZE;
        for slot in &self.slots {
            page[pos..pos + 8].copy_from_slice(&slot.hash.to_le_bytes());
            page[pos + 8..pos + 12].copy_from_slice(&slot.key_len.to_le_bytes());
            page[pos + 12..pos + 16].copy_from_slice(&slot.value_len.to_le_bytes());
            page[pos + 16..pos + 24].copy_from_slice(&slot.data_offset.to_le_bytes());
            pos += SLOT_SIZE;
        }

        let crc = page_crc(&page, self.slots.len());
        page[16..20].copy_from_slice(&crc.to_le_bytes());
        Ok(page)
    }

    /// Parse and validate a page
    pub fn decode(page: &[u8]) -> Result<Self> {
        if page.len() < BUCKET_HEADER_SIZE {
            return Err(HashKvError::corrupt(format!(
                "page of {} bytes is shorter than the bucket header",
                page.len()
            )));
        }

        let local_depth = read_u32(page, 0);
        let count = read_u32(page, 4) as usize;
        let overflow = read_u64(page, 8);
        let stored_crc = read_u32(page, 16);

        if count > Self::capacity(page.len()) {
            return Err(HashKvError::corrupt(format!(
                "slot count {} exceeds capacity {}",
                count,
                Self::capacity(page.len())
            )));
        }

        let crc = page_crc(page, count);
        if crc != stored_crc {
            return Err(HashKvError::corrupt(format!(
                "checksum mismatch: expected {:#010x}, got {:#010x}",
                stored_crc, crc
            )));
        }

        if local_depth > MAX_DEPTH {
            return Err(HashKvError::corrupt(format!(
                "local depth {} exceeds maximum {}",
                local_depth, MAX_DEPTH
            )));
        }

        let mut slots = Vec::with_capacity(count);
        let mut pos = BUCKET_HEADER_SIZE;
        for _ in 0..count {
            slots.push(Slot {
                hash: read_u64(page, pos),
                key_len: read_u32(page, pos + 8),
                value_len: read_u32(page, pos + 12),
                data_offset: read_u64(page, pos + 16),
            });
            pos += SLOT_SIZE;
        }

        if slots.windows(2).any(|w| w[0].hash > w[1].hash) {
            return Err(HashKvError::corrupt("slots are not in hash order"));
        }

        Ok(Self {
            local_depth,
            overflow,
            slots,
        })
    }
}

/// Where bucket pages are loaded from and written back to
pub trait BucketStore {
    fn read_bucket(&mut self, offset: u64) -> Result<Bucket>;
    fn write_bucket(&mut self, offset: u64, bucket: &Bucket) -> Result<()>;
}

fn page_crc(page: &[u8], count: usize) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page[..CRC_COVERED_HEADER]);
    hasher.update(&page[BUCKET_HEADER_SIZE..BUCKET_HEADER_SIZE + count * SLOT_SIZE]);
    hasher.finalize()
}

fn read_u32(buf: &[u8], pos: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[pos..pos + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(buf: &[u8], pos: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[pos..pos + 8]);
    u64::from_le_bytes(b)
}
