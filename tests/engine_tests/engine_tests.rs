//! Tests for Engine
//!
//! These tests verify:
//! - Basic fetch/store/delete/exists operations
//! - Empty values vs absent keys, tombstones
//! - Bucket splits and directory growth
//! - Overflow chains for keys sharing a deep hash prefix
//! - Iteration and cancellation
//! - Open modes, validation and locking
//! - Shared access from several threads

use std::collections::HashSet;
use std::thread;

use hashkv::hash::{hash_key, prefix, MAX_DEPTH};
use hashkv::{Config, Datum, Engine, HashKvError, OpenMode, SharedEngine, StoreValue};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_engine() -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .path(temp_dir.path().join("test.db"))
        .build();
    let engine = Engine::open(config).unwrap();
    (temp_dir, engine)
}

/// Small pages (20 slots each) so a few hundred keys force splits
fn setup_small_block_engine(cache_size: usize) -> (TempDir, Engine) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .path(temp_dir.path().join("small.db"))
        .block_size(512)
        .cache_size(cache_size)
        .build();
    let engine = Engine::open(config).unwrap();
    (temp_dir, engine)
}

fn key(i: usize) -> Vec<u8> {
    format!("key_{:05}", i).into_bytes()
}

fn value(i: usize) -> Vec<u8> {
    format!("value_{}", i).into_bytes()
}

/// Keys whose hashes share the top `MAX_DEPTH` bits, so no split can
/// separate them (about a million hashes per key)
fn colliding_keys(count: usize) -> Vec<Vec<u8>> {
    let target = prefix(hash_key(&0u64.to_be_bytes()), MAX_DEPTH);
    (0u64..)
        .map(|i| i.to_be_bytes())
        .filter(|k| prefix(hash_key(k), MAX_DEPTH) == target)
        .take(count)
        .map(|k| k.to_vec())
        .collect()
}

fn collect_keys(engine: &mut Engine) -> Vec<Vec<u8>> {
    engine.keys().map(|k| k.unwrap().to_vec()).collect()
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_store_fetch() {
    let (_temp, mut engine) = setup_temp_engine();

    engine.store(b"hello", b"world").unwrap();
    let result = engine.fetch(b"hello").unwrap();

    assert_eq!(result.unwrap(), b"world");
}

#[test]
fn test_fetch_nonexistent_key() {
    let (_temp, mut engine) = setup_temp_engine();

    assert!(engine.fetch(b"nonexistent").unwrap().is_none());
    assert!(!engine.exists(b"nonexistent").unwrap());
}

#[test]
fn test_store_overwrites() {
    let (_temp, mut engine) = setup_temp_engine();

    engine.store(b"key", b"value1").unwrap();
    engine.store(b"key", b"value2").unwrap();

    assert_eq!(engine.fetch(b"key").unwrap().unwrap(), b"value2");
    assert_eq!(engine.count(), 1);
}

#[test]
fn test_store_same_value_twice_is_idempotent() {
    let (_temp, mut engine) = setup_temp_engine();

    engine.store(b"key", b"same").unwrap();
    engine.store(b"key", b"same").unwrap();

    assert_eq!(engine.fetch(b"key").unwrap().unwrap(), b"same");
    assert_eq!(engine.count(), 1);
    assert_eq!(collect_keys(&mut engine), vec![b"key".to_vec()]);
}

#[test]
fn test_empty_value_is_not_absent() {
    let (_temp, mut engine) = setup_temp_engine();

    engine.store(b"empty", b"").unwrap();

    let result = engine.fetch(b"empty").unwrap();
    assert!(result.is_some());
    assert!(result.unwrap().is_empty());
    assert!(engine.exists(b"empty").unwrap());
}

#[test]
fn test_empty_key() {
    let (_temp, mut engine) = setup_temp_engine();

    engine.store(b"", b"v").unwrap();
    engine.store(b"x", b"").unwrap();

    assert_eq!(engine.fetch(b"").unwrap().unwrap(), b"v");
    assert!(engine.fetch(b"x").unwrap().unwrap().is_empty());

    engine.store(b"", b"").unwrap();
    assert!(engine.fetch(b"").unwrap().unwrap().is_empty());
    assert_eq!(engine.count(), 2);
}

#[test]
fn test_large_value() {
    let (_temp, mut engine) = setup_temp_engine();
    let big = vec![0xABu8; 100_000];

    engine.store(b"big", &big[..]).unwrap();

    assert_eq!(engine.fetch(b"big").unwrap().unwrap(), big);
}

#[test]
fn test_binary_keys_and_values() {
    let (_temp, mut engine) = setup_temp_engine();
    let key = [0u8, 255, 1, 254, 0];
    let value = [0xFFu8; 33];

    engine.store(&key, &value).unwrap();

    assert_eq!(engine.fetch(&key).unwrap().unwrap(), &value);
    assert!(engine.fetch(&key[..4]).unwrap().is_none());
}

// =============================================================================
// Delete / Tombstone Tests
// =============================================================================

#[test]
fn test_delete() {
    let (_temp, mut engine) = setup_temp_engine();

    engine.store(b"key", b"value").unwrap();
    engine.delete(b"key").unwrap();

    assert!(engine.fetch(b"key").unwrap().is_none());
    assert!(!engine.exists(b"key").unwrap());
    assert_eq!(engine.count(), 0);
}

#[test]
fn test_delete_absent_is_noop() {
    let (_temp, mut engine) = setup_temp_engine();

    engine.store(b"keep", b"1").unwrap();
    engine.delete(b"never_stored").unwrap();
    engine.delete(b"never_stored").unwrap();

    assert_eq!(engine.count(), 1);
    assert_eq!(engine.fetch(b"keep").unwrap().unwrap(), b"1");
}

#[test]
fn test_store_tombstone() {
    let (_temp, mut engine) = setup_temp_engine();

    engine.store(b"key", b"value").unwrap();
    engine.store(b"key", StoreValue::Tombstone).unwrap();

    assert!(engine.fetch(b"key").unwrap().is_none());
}

#[test]
fn test_store_none_is_tombstone() {
    let (_temp, mut engine) = setup_temp_engine();

    engine.store(b"key", b"value").unwrap();
    engine.store(b"key", None::<&[u8]>).unwrap();

    assert!(!engine.exists(b"key").unwrap());
}

#[test]
fn test_store_after_delete() {
    let (_temp, mut engine) = setup_temp_engine();

    engine.store(b"key", b"v1").unwrap();
    engine.delete(b"key").unwrap();
    engine.store(b"key", b"v2").unwrap();

    assert_eq!(engine.fetch(b"key").unwrap().unwrap(), b"v2");
    assert_eq!(engine.count(), 1);
}

#[test]
fn test_abc_scenario() {
    let (_temp, mut engine) = setup_temp_engine();

    engine.store(b"a", b"1").unwrap();
    engine.store(b"b", b"2").unwrap();
    engine.store(b"c", b"3").unwrap();
    assert!(engine.exists(b"b").unwrap());

    engine.store(b"b", StoreValue::Tombstone).unwrap();
    assert!(!engine.exists(b"b").unwrap());

    let keys: HashSet<Vec<u8>> = collect_keys(&mut engine).into_iter().collect();
    let expected: HashSet<Vec<u8>> = [b"a".to_vec(), b"c".to_vec()].into_iter().collect();
    assert_eq!(keys, expected);
}

// =============================================================================
// Split / Growth Tests
// =============================================================================

#[test]
fn test_many_keys_force_splits() {
    let (_temp, mut engine) = setup_small_block_engine(64);

    for i in 0..2000 {
        engine.store(&key(i), &value(i)).unwrap();
    }

    assert_eq!(engine.count(), 2000);
    assert!(engine.directory_depth() > 0);
    for i in 0..2000 {
        assert_eq!(engine.fetch(&key(i)).unwrap().unwrap(), value(i), "key {}", i);
    }

    let stats = engine.stats().unwrap();
    assert!(stats.bucket_count > 1);
    assert_eq!(stats.entry_count, 2000);
}

#[test]
fn test_tiny_cache_keeps_every_write() {
    let (_temp, mut engine) = setup_small_block_engine(1);

    for i in 0..500 {
        engine.store(&key(i), &value(i)).unwrap();
    }
    for i in (0..500).step_by(3) {
        engine.delete(&key(i)).unwrap();
    }

    for i in 0..500 {
        let found = engine.fetch(&key(i)).unwrap();
        if i % 3 == 0 {
            assert!(found.is_none(), "key {} should be gone", i);
        } else {
            assert_eq!(found.unwrap(), value(i));
        }
    }
    assert!(engine.stats().unwrap().cache_len <= 1);
}

#[test]
fn test_replaced_values_reuse_space() {
    let (_temp, mut engine) = setup_small_block_engine(16);
    let padded = |round: usize, i: usize| format!("{:0>400}", round * 1000 + i);

    for i in 0..100 {
        engine.store(&key(i), padded(0, i).as_bytes()).unwrap();
    }
    engine.sync().unwrap();
    let first = engine.stats().unwrap().file_size;

    for round in 1..=10 {
        for i in 0..100 {
            engine.store(&key(i), padded(round, i).as_bytes()).unwrap();
        }
        engine.sync().unwrap();
    }

    // ten rounds without reuse would add roughly 400 KiB
    let last = engine.stats().unwrap().file_size;
    assert!(last < first + 2 * 100 * 408, "grew from {} to {}", first, last);
    assert_eq!(engine.fetch(&key(7)).unwrap().unwrap(), padded(10, 7).into_bytes());
}

#[test]
fn test_delete_everything_then_refill() {
    let (_temp, mut engine) = setup_small_block_engine(8);

    for i in 0..300 {
        engine.store(&key(i), &value(i)).unwrap();
    }
    for i in 0..300 {
        engine.delete(&key(i)).unwrap();
    }
    assert_eq!(engine.count(), 0);
    assert!(collect_keys(&mut engine).is_empty());

    for i in 0..300 {
        engine.store(&key(i), &value(i)).unwrap();
    }
    assert_eq!(engine.count(), 300);
    assert_eq!(collect_keys(&mut engine).len(), 300);
}

#[test]
fn test_colliding_prefixes_use_overflow_pages() {
    let (temp, mut engine) = setup_small_block_engine(8);
    let colliding = colliding_keys(24);

    // 20 fill the first page, the last 4 land in one overflow page
    for (i, k) in colliding.iter().enumerate() {
        engine.store(k, &value(i)).unwrap();
    }
    let stats = engine.stats().unwrap();
    assert_eq!(stats.overflow_pages, 1);
    assert_eq!(stats.bucket_count, 1);
    assert_eq!(engine.directory_depth(), 0);

    // emptying the overflow page unlinks it
    for k in &colliding[20..] {
        engine.delete(k).unwrap();
    }
    assert_eq!(engine.stats().unwrap().overflow_pages, 0);
    assert_eq!(engine.count(), 20);
    for (i, k) in colliding.iter().enumerate() {
        let found = engine.fetch(k).unwrap();
        if i < 20 {
            assert_eq!(found.unwrap(), value(i));
        } else {
            assert!(found.is_none());
        }
    }

    for (i, k) in colliding.iter().enumerate().skip(20) {
        engine.store(k, &value(i)).unwrap();
    }
    // ordinary keys fill the chain and force splits that repack it
    for i in 0..300 {
        engine.store(&key(i), &value(i)).unwrap();
    }
    assert!(engine.directory_depth() > 0);
    assert!(engine.stats().unwrap().overflow_pages >= 1);
    assert_eq!(engine.count(), 324);
    assert_eq!(engine.iterate(|_| true).unwrap(), 324);

    let path = temp.path().join("small.db");
    engine.close().unwrap();
    let config = Config::builder().path(&path).mode(OpenMode::ReadWrite).build();
    let mut engine = Engine::open(config).unwrap();

    for (i, k) in colliding.iter().enumerate() {
        assert_eq!(engine.fetch(k).unwrap().unwrap(), value(i), "colliding key {}", i);
    }
    for i in 0..300 {
        assert_eq!(engine.fetch(&key(i)).unwrap().unwrap(), value(i));
    }

    engine.reorganize().unwrap();

    assert_eq!(engine.count(), 324);
    assert!(engine.stats().unwrap().overflow_pages >= 1);
    let keys: HashSet<Vec<u8>> = collect_keys(&mut engine).into_iter().collect();
    assert_eq!(keys.len(), 324);
    assert!(colliding.iter().all(|k| keys.contains(k)));
}

// =============================================================================
// Iteration Tests
// =============================================================================

#[test]
fn test_iterate_empty() {
    let (_temp, mut engine) = setup_temp_engine();

    let visited = engine.iterate(|_| true).unwrap();

    assert_eq!(visited, 0);
    assert!(engine.keys().next().is_none());
}

#[test]
fn test_iterate_visits_every_key_once() {
    let (_temp, mut engine) = setup_small_block_engine(32);
    for i in 0..700 {
        engine.store(&key(i), &value(i)).unwrap();
    }

    let mut seen = HashSet::new();
    let visited = engine
        .iterate(|k| {
            assert!(seen.insert(k.to_vec()), "duplicate key {:?}", k);
            true
        })
        .unwrap();

    assert_eq!(visited, 700);
    let expected: HashSet<Vec<u8>> = (0..700).map(key).collect();
    assert_eq!(seen, expected);
}

#[test]
fn test_iterate_cancel_after_n() {
    let (_temp, mut engine) = setup_small_block_engine(32);
    for i in 0..100 {
        engine.store(&key(i), &value(i)).unwrap();
    }

    let mut yielded = 0;
    let visited = engine
        .iterate(|_| {
            yielded += 1;
            yielded < 10
        })
        .unwrap();

    assert_eq!(visited, 10);
    assert_eq!(yielded, 10);
}

#[test]
fn test_iteration_order_is_stable() {
    let (_temp, mut engine) = setup_small_block_engine(32);
    for i in 0..200 {
        engine.store(&key(i), &value(i)).unwrap();
    }

    let first = collect_keys(&mut engine);
    let second = collect_keys(&mut engine);

    assert_eq!(first, second);
}

#[test]
fn test_entries_pair_keys_with_values() {
    let (_temp, mut engine) = setup_small_block_engine(32);
    for i in 0..150 {
        engine.store(&key(i), &value(i)).unwrap();
    }

    let mut count = 0;
    for entry in engine.entries() {
        let (k, v): (Datum, Datum) = entry.unwrap();
        let i: usize = std::str::from_utf8(&k[4..]).unwrap().parse().unwrap();
        assert_eq!(v, value(i));
        count += 1;
    }
    assert_eq!(count, 150);
}

// =============================================================================
// Mode / Validation Tests
// =============================================================================

#[test]
fn test_open_missing_file_in_read_write_mode() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .path(temp_dir.path().join("missing.db"))
        .mode(OpenMode::ReadWrite)
        .build();

    let result = Engine::open(config);

    assert!(matches!(result, Err(HashKvError::NotFound(_))));
}

#[test]
fn test_open_missing_file_in_read_only_mode() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .path(temp_dir.path().join("missing.db"))
        .mode(OpenMode::ReadOnly)
        .build();

    assert!(matches!(Engine::open(config), Err(HashKvError::NotFound(_))));
}

#[test]
fn test_open_empty_file_without_create_is_corrupt() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("empty.db");
    std::fs::File::create(&path).unwrap();

    let config = Config::builder().path(&path).mode(OpenMode::ReadWrite).build();

    assert!(matches!(Engine::open(config), Err(HashKvError::Corrupt(_))));
}

#[test]
fn test_open_rejects_small_block_size() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .path(temp_dir.path().join("test.db"))
        .block_size(100)
        .build();

    assert!(matches!(
        Engine::open(config),
        Err(HashKvError::InvalidArgument(_))
    ));
    assert!(!temp_dir.path().join("test.db").exists());
}

#[test]
fn test_open_rejects_zero_cache() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .path(temp_dir.path().join("test.db"))
        .cache_size(0)
        .build();

    assert!(matches!(
        Engine::open(config),
        Err(HashKvError::InvalidArgument(_))
    ));
}

#[test]
fn test_read_only_rejects_writes() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("test.db");
    {
        let mut engine = Engine::open_path(&path).unwrap();
        engine.store(b"key", b"value").unwrap();
        engine.close().unwrap();
    }

    let config = Config::builder().path(&path).mode(OpenMode::ReadOnly).build();
    let mut reader = Engine::open(config).unwrap();

    assert_eq!(reader.fetch(b"key").unwrap().unwrap(), b"value");
    assert!(matches!(reader.store(b"k", b"v"), Err(HashKvError::ReadOnly)));
    assert!(matches!(reader.delete(b"key"), Err(HashKvError::ReadOnly)));
    assert!(matches!(reader.reorganize(), Err(HashKvError::ReadOnly)));
    reader.sync().unwrap();
    assert_eq!(reader.mode(), OpenMode::ReadOnly);
}

#[test]
fn test_block_size_is_recorded() {
    let (_temp, engine) = setup_small_block_engine(4);

    assert_eq!(engine.block_size(), 512);
    assert_eq!(engine.directory_depth(), 0);
}

// =============================================================================
// Locking Tests
// =============================================================================

#[test]
fn test_second_writer_conflicts() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("test.db");
    let _writer = Engine::open_path(&path).unwrap();

    let result = Engine::open_path(&path);

    assert!(matches!(result, Err(HashKvError::LockConflict(_))));
}

#[test]
fn test_reader_conflicts_with_writer() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("test.db");
    let _writer = Engine::open_path(&path).unwrap();

    let config = Config::builder().path(&path).mode(OpenMode::ReadOnly).build();

    assert!(matches!(
        Engine::open(config),
        Err(HashKvError::LockConflict(_))
    ));
}

#[test]
fn test_many_readers_share_the_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("test.db");
    Engine::open_path(&path).unwrap().close().unwrap();

    let config = Config::builder().path(&path).mode(OpenMode::ReadOnly).build();
    let _r1 = Engine::open(config.clone()).unwrap();
    let _r2 = Engine::open(config).unwrap();
}

#[test]
fn test_no_lock_skips_locking() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("test.db");
    let _writer = Engine::open_path(&path).unwrap();

    let config = Config::builder()
        .path(&path)
        .mode(OpenMode::ReadOnly)
        .no_lock(true)
        .build();

    assert!(Engine::open(config).is_ok());
}

#[test]
fn test_lock_released_on_close() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("test.db");

    let writer = Engine::open_path(&path).unwrap();
    writer.close().unwrap();

    assert!(Engine::open_path(&path).is_ok());
}

// =============================================================================
// Shared Access Tests
// =============================================================================

#[test]
fn test_shared_engine_across_threads() {
    let (_temp, engine) = setup_small_block_engine(16);
    let shared = SharedEngine::new(engine);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let shared = shared.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    let k = format!("t{}_{}", t, i);
                    shared.store(k.as_bytes(), k.as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(shared.count(), 400);
    for t in 0..4 {
        for i in 0..100 {
            let k = format!("t{}_{}", t, i);
            assert_eq!(shared.fetch(k.as_bytes()).unwrap().unwrap(), k.as_bytes());
        }
    }

    let visited = shared.with(|engine| engine.iterate(|_| true)).unwrap();
    assert_eq!(visited, 400);
}

#[test]
fn test_shared_engine_delete_and_exists() {
    let (_temp, engine) = setup_temp_engine();
    let shared = SharedEngine::from(engine);

    shared.store(b"key", b"value").unwrap();
    assert!(shared.exists(b"key").unwrap());

    shared.delete(b"key").unwrap();
    assert!(!shared.exists(b"key").unwrap());
    shared.sync().unwrap();
}
