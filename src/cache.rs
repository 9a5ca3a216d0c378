//! Bucket Cache
//!
//! Bounded LRU map from page offset to decoded bucket. Writes are staged in
//! the cache and written back when the page is evicted or on an explicit
//! flush. A dirty page is always written out before its slot is reused.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::error::{HashKvError, Result};
use crate::storage::{Bucket, BucketStore};

struct CachedBucket {
    bucket: Bucket,
    dirty: bool,
}

/// Write-back cache of bucket pages
pub struct BucketCache {
    entries: LruCache<u64, CachedBucket>,
    hits: u64,
    misses: u64,
}

impl BucketCache {
    /// Create a cache holding at most `capacity` pages
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| {
            HashKvError::InvalidArgument("cache size must be at least 1 bucket".to_string())
        })?;
        Ok(Self {
            entries: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.entries.contains(&offset)
    }

    pub fn is_dirty(&self, offset: u64) -> bool {
        self.entries.peek(&offset).map_or(false, |e| e.dirty)
    }

    pub fn dirty_count(&self) -> usize {
        self.entries.iter().filter(|(_, e)| e.dirty).count()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Get the page at `offset`, reading it from `store` on a miss
    pub fn load<S: BucketStore>(&mut self, offset: u64, store: &mut S) -> Result<&Bucket> {
        if self.entries.contains(&offset) {
            self.hits += 1;
        } else {
            self.misses += 1;
            let bucket = store.read_bucket(offset)?;
            self.make_room(1, &[], store)?;
            self.entries.put(
                offset,
                CachedBucket {
                    bucket,
                    dirty: false,
                },
            );
        }

        self.entries
            .get(&offset)
            .map(|e| &e.bucket)
            .ok_or_else(|| HashKvError::corrupt(format!("bucket {} missing from cache", offset)))
    }

    /// Install modified pages as dirty.
    ///
    /// Room is made before anything is replaced, so a failed write-back
    /// leaves the cached state as it was. When more pages arrive than the
    /// cache holds, the surplus is written straight to `store`.
    pub fn commit<S: BucketStore>(
        &mut self,
        mut pages: Vec<(u64, Bucket)>,
        store: &mut S,
    ) -> Result<()> {
        let surplus = if pages.len() > self.capacity() {
            pages.split_off(self.capacity())
        } else {
            Vec::new()
        };

        for (offset, bucket) in &surplus {
            store.write_bucket(*offset, bucket)?;
        }

        let keep: Vec<u64> = pages.iter().map(|(offset, _)| *offset).collect();
        let incoming = keep.iter().filter(|o| !self.entries.contains(o)).count();
        self.make_room(incoming, &keep, store)?;

        for (offset, _) in &surplus {
            self.entries.pop(offset);
        }
        for (offset, bucket) in pages {
            self.entries.put(
                offset,
                CachedBucket {
                    bucket,
                    dirty: true,
                },
            );
        }
        Ok(())
    }

    /// Write every dirty page, lowest offset first. Returns how many were written.
    pub fn flush<S: BucketStore>(&mut self, store: &mut S) -> Result<usize> {
        let mut dirty: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.dirty)
            .map(|(offset, _)| *offset)
            .collect();
        dirty.sort_unstable();

        for &offset in &dirty {
            if let Some(entry) = self.entries.peek_mut(&offset) {
                store.write_bucket(offset, &entry.bucket)?;
                entry.dirty = false;
            }
        }
        Ok(dirty.len())
    }

    /// Forget a page without writing it (the page was released)
    pub fn discard(&mut self, offset: u64) {
        self.entries.pop(&offset);
    }

    /// Forget every page without writing
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Evict least-recently-used pages not in `keep` until `incoming` more fit
    fn make_room<S: BucketStore>(
        &mut self,
        incoming: usize,
        keep: &[u64],
        store: &mut S,
    ) -> Result<()> {
        while self.entries.len() + incoming > self.capacity() {
            let victim = self
                .entries
                .iter()
                .rev()
                .map(|(offset, _)| *offset)
                .find(|offset| !keep.contains(offset));

            let Some(victim) = victim else {
                break;
            };

            if let Some(entry) = self.entries.peek(&victim) {
                if entry.dirty {
                    store.write_bucket(victim, &entry.bucket)?;
                }
            }
            self.entries.pop(&victim);
        }
        Ok(())
    }
}
