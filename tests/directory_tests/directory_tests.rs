//! Tests for Directory
//!
//! These tests verify:
//! - Index computation from hash prefixes
//! - Doubling preserves every bucket's range
//! - Range arithmetic used by splits and iteration
//! - Decode validation of on-disk entries

use hashkv::directory::Directory;
use hashkv::hash::MAX_DEPTH;
use hashkv::HashKvError;

const TOP_BIT: u64 = 1 << 63;

// =============================================================================
// Construction Tests
// =============================================================================

#[test]
fn test_new_directory() {
    let dir = Directory::new();

    assert_eq!(dir.depth(), 0);
    assert_eq!(dir.len(), 1);
    assert_eq!(dir.bucket_for(u64::MAX), 0);
    assert!(dir.is_dirty());
}

// =============================================================================
// Doubling Tests
// =============================================================================

#[test]
fn test_double_keeps_mapping() {
    let mut dir = Directory::new();
    dir.set_range(0..1, 4096);

    dir.double().unwrap();

    assert_eq!(dir.depth(), 1);
    assert_eq!(dir.entries(), &[4096, 4096]);
    assert_eq!(dir.bucket_for(0), 4096);
    assert_eq!(dir.bucket_for(TOP_BIT), 4096);
}

#[test]
fn test_double_interleaves_entries() {
    let mut dir = Directory::new();
    dir.set_range(0..1, 4096);
    dir.double().unwrap();
    dir.set_range(1..2, 8192);

    dir.double().unwrap();

    assert_eq!(dir.entries(), &[4096, 4096, 8192, 8192]);
}

#[test]
fn test_double_stops_at_max_depth() {
    let mut dir = Directory::new();
    for _ in 0..MAX_DEPTH {
        dir.double().unwrap();
    }

    assert_eq!(dir.len(), 1 << MAX_DEPTH);
    assert!(matches!(dir.double(), Err(HashKvError::Corrupt(_))));
}

// =============================================================================
// Range Tests
// =============================================================================

#[test]
fn test_index_uses_top_bits() {
    let mut dir = Directory::new();
    dir.double().unwrap();
    dir.double().unwrap();

    assert_eq!(dir.index_of(0), 0);
    assert_eq!(dir.index_of(0b01 << 62), 1);
    assert_eq!(dir.index_of(0b10 << 62), 2);
    assert_eq!(dir.index_of(u64::MAX), 3);
}

#[test]
fn test_range_of_shallow_bucket() {
    let mut dir = Directory::new();
    for _ in 0..3 {
        dir.double().unwrap();
    }

    // local depth 1: the upper half of the directory
    assert_eq!(dir.range_of(TOP_BIT, 1), 4..8);
    assert_eq!(dir.range_of(0, 1), 0..4);
    // full depth: a single entry
    assert_eq!(dir.range_of(u64::MAX, 3), 7..8);
    assert_eq!(dir.range_of(12345, 0), 0..8);
}

#[test]
fn test_next_range_start() {
    let mut dir = Directory::new();
    for _ in 0..3 {
        dir.double().unwrap();
    }

    assert_eq!(dir.next_range_start(0, 1), 4);
    assert_eq!(dir.next_range_start(4, 2), 6);
    assert_eq!(dir.next_range_start(6, 3), 7);
    assert_eq!(dir.next_range_start(0, 0), 8);
}

#[test]
fn test_set_range_marks_dirty() {
    let mut dir = Directory::new();
    dir.mark_written(4096);
    assert!(!dir.is_dirty());

    dir.set_range(0..1, 8192);

    assert!(dir.is_dirty());
    assert_eq!(dir.offset(), 4096);
}

// =============================================================================
// Encode / Decode Tests
// =============================================================================

#[test]
fn test_encode_decode() {
    let mut dir = Directory::new();
    dir.set_range(0..1, 4096);
    dir.double().unwrap();
    dir.set_range(1..2, 8192);

    let buf = dir.encode();
    let back = Directory::decode(&buf, 1, 512, 4096, 16384, 4096).unwrap();

    assert_eq!(back.entries(), dir.entries());
    assert_eq!(back.offset(), 512);
    assert!(!back.is_dirty());
    assert_eq!(dir.byte_len(), buf.len() as u64);
}

#[test]
fn test_decode_rejects_wrong_length() {
    let buf = vec![0u8; 24];

    assert!(Directory::decode(&buf, 2, 512, 512, 8192, 512).is_err());
}

#[test]
fn test_decode_rejects_out_of_bounds_entry() {
    let mut dir = Directory::new();
    dir.set_range(0..1, 1 << 40);

    let result = Directory::decode(&dir.encode(), 0, 512, 512, 8192, 512);

    assert!(matches!(result, Err(HashKvError::Corrupt(_))));
}

#[test]
fn test_decode_allows_empty_root_only_at_depth_zero() {
    assert!(Directory::decode(&[0u8; 8], 0, 512, 512, 8192, 512).is_ok());
    assert!(Directory::decode(&[0u8; 16], 1, 512, 512, 8192, 512).is_err());
}
