//! File header
//!
//! The header sits at offset 0 and occupies the first block. It is encoded
//! with bincode and followed by a CRC32 of the encoded bytes; the rest of
//! the block is zero.

use serde::{Deserialize, Serialize};

use crate::config::MIN_BLOCK_SIZE;
use crate::error::{HashKvError, Result};
use crate::hash::MAX_DEPTH;

use super::{FORMAT_VERSION, MAGIC};

/// Bytes read before the block size is known; the encoded header is far
/// smaller than the minimum block size
pub const HEADER_PROBE_SIZE: usize = MIN_BLOCK_SIZE as usize;

/// File prologue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub magic: [u8; 4],
    pub version: u16,
    /// Disk transfer size; also the size of free-list blocks
    pub block_size: u32,
    /// Size of one bucket page
    pub bucket_size: u32,
    /// Start of the directory region
    pub dir_offset: u64,
    /// log2 of the number of directory entries
    pub dir_depth: u32,
    /// End of the allocated region of the file
    pub high_water: u64,
    /// First free-list block, 0 when the free list is empty
    pub free_head: u64,
    /// Number of live keys
    pub entry_count: u64,
}

impl Header {
    /// Header for a brand-new file
    pub fn new(block_size: u32) -> Self {
        Self {
            magic: *MAGIC,
            version: FORMAT_VERSION,
            block_size,
            bucket_size: block_size,
            dir_offset: 0,
            dir_depth: 0,
            high_water: block_size as u64,
            free_head: 0,
            entry_count: 0,
        }
    }

    /// Encode into a full block
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)
            .map_err(|e| HashKvError::Serialization(format!("header: {}", e)))?;
        let crc = crc32fast::hash(&body);

        let mut block = vec![0u8; self.block_size as usize];
        block[..body.len()].copy_from_slice(&body);
        block[body.len()..body.len() + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(block)
    }

    /// Decode from the leading bytes of the file and validate every field
    /// that doesn't need the rest of the file.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 4 || &buf[0..4] != MAGIC {
            return Err(HashKvError::corrupt("bad magic number, not a hashkv file"));
        }

        let header: Header = bincode::deserialize(buf)
            .map_err(|e| HashKvError::corrupt(format!("undecodable header: {}", e)))?;

        let body_len = bincode::serialized_size(&header)
            .map_err(|e| HashKvError::Serialization(format!("header: {}", e)))?
            as usize;
        if buf.len() < body_len + 4 {
            return Err(HashKvError::corrupt("truncated header"));
        }
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&buf[body_len..body_len + 4]);
        if u32::from_le_bytes(crc_bytes) != crc32fast::hash(&buf[..body_len]) {
            return Err(HashKvError::corrupt("header checksum mismatch"));
        }

        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if self.version != FORMAT_VERSION {
            return Err(HashKvError::corrupt(format!(
                "unsupported format version {}",
                self.version
            )));
        }
        if self.block_size < MIN_BLOCK_SIZE || self.bucket_size < MIN_BLOCK_SIZE {
            return Err(HashKvError::corrupt(format!(
                "block size {} / bucket size {} below minimum",
                self.block_size, self.bucket_size
            )));
        }
        if self.dir_depth > MAX_DEPTH {
            return Err(HashKvError::corrupt(format!(
                "directory depth {} exceeds maximum {}",
                self.dir_depth, MAX_DEPTH
            )));
        }
        let dir_end = self.dir_offset.saturating_add(8u64 << self.dir_depth);
        if self.dir_offset < self.block_size as u64 || dir_end > self.high_water {
            return Err(HashKvError::corrupt(format!(
                "directory region {}..{} outside the allocated file (high water {})",
                self.dir_offset, dir_end, self.high_water
            )));
        }
        if self.free_head != 0
            && (self.free_head < self.block_size as u64
                || self.free_head + self.block_size as u64 > self.high_water)
        {
            return Err(HashKvError::corrupt(format!(
                "free-list head {} out of bounds",
                self.free_head
            )));
        }
        Ok(())
    }
}
