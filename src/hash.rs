//! Key hashing
//!
//! The directory is indexed by the top bits of a 64-bit xxh3 hash. A bucket
//! at local depth `l` holds keys sharing the top `l` bits; splitting it
//! separates them on bit `l` (counted from the most significant bit).

use xxhash_rust::xxh3::xxh3_64;

/// Deepest directory supported (2^20 entries, 8 MiB on disk)
pub const MAX_DEPTH: u32 = 20;

/// Hash a key
pub fn hash_key(key: &[u8]) -> u64 {
    xxh3_64(key)
}

/// Top `depth` bits of `hash` as a directory index
pub fn prefix(hash: u64, depth: u32) -> usize {
    if depth == 0 {
        0
    } else {
        (hash >> (64 - depth)) as usize
    }
}

/// The bit that decides which half a hash goes to when a bucket at
/// `local_depth` splits
pub fn split_bit(hash: u64, local_depth: u32) -> bool {
    debug_assert!(local_depth < 64);
    (hash >> (63 - local_depth)) & 1 == 1
}
