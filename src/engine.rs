//! Engine Module
//!
//! The storage engine that coordinates all components.
//!
//! ## Responsibilities
//! - Open, create, validate and lock the database file
//! - Route fetch/store/delete through directory → cache → bucket pages
//! - Split buckets (growing the directory) and chain overflow pages
//! - Flush dirty state in a crash-safe order on sync/close
//! - Rebuild the file on reorganize

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::cache::BucketCache;
use crate::config::{Config, OpenMode};
use crate::datum::{Datum, StoreValue};
use crate::directory::Directory;
use crate::error::{HashKvError, Result};
use crate::hash::{hash_key, prefix, split_bit, MAX_DEPTH};
use crate::iter::{Entries, Keys};
use crate::storage::header::HEADER_PROBE_SIZE;
use crate::storage::{Bucket, BucketStore, DbFile, FreeSpace, Header, LockKind, Slot};

/// Where `locate` found a key
struct Location {
    /// Pages walked from the primary bucket up to the one holding the slot
    chain: Vec<u64>,
    /// Index of the slot within the last page of `chain`
    index: usize,
    slot: Slot,
}

/// Point-in-time description of a database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub block_size: u32,
    pub bucket_size: u32,
    pub directory_depth: u32,
    /// Distinct primary buckets referenced by the directory
    pub bucket_count: usize,
    pub overflow_pages: usize,
    pub entry_count: u64,
    pub free_extents: usize,
    /// Free bytes, including regions waiting for the next sync
    pub free_bytes: u64,
    /// End of the allocated region of the file
    pub file_size: u64,
    pub cache_len: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// A single-file hashed key-value database
///
/// ## Concurrency Model
/// Every operation takes `&mut self` and runs to completion before
/// returning. The engine holds no internal lock; share it across threads
/// through [`SharedEngine`](crate::shared::SharedEngine) or your own mutex.
/// Across processes the advisory file lock admits one writer or many readers.
pub struct Engine {
    config: Config,
    file: DbFile,
    header: Header,
    directory: Directory,
    free: FreeSpace,
    cache: BucketCache,
    /// In-memory state differs from what was last synced
    dirty: bool,
    /// Set once close() has run so Drop doesn't flush again
    closed: bool,
}

impl Engine {
    /// Suffix of the scratch file used by `reorganize`
    const REORG_SUFFIX: &'static str = ".reorg";

    /// Open or create a database
    ///
    /// Steps:
    /// 1. Validate the config
    /// 2. Open the file and take the advisory lock
    /// 3. Create a fresh layout, or load and validate the existing one
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let mut file = DbFile::open(&config.path, config.mode, config.permissions)?;

        if !config.no_lock {
            let kind = if config.mode.is_writable() {
                LockKind::Exclusive
            } else {
                LockKind::Shared
            };
            file.lock(kind)?;
        }

        if config.mode == OpenMode::ReadWriteCreateForce {
            file.truncate()?;
        }

        let cache = BucketCache::new(config.cache_size)?;

        if file.is_empty()? {
            if !config.mode.creates() {
                return Err(HashKvError::corrupt(format!(
                    "{} is empty",
                    config.path.display()
                )));
            }
            return Self::create(config, file, cache);
        }

        Self::load(config, file, cache)
    }

    /// Open with a path (convenience method)
    ///
    /// Creates the file if needed; default options otherwise.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(Config::builder().path(path.as_ref()).build())
    }

    fn create(config: Config, mut file: DbFile, cache: BucketCache) -> Result<Self> {
        let block_size = config
            .block_size
            .unwrap_or_else(|| file.preferred_block_size());
        let header = Header::new(block_size);
        file.set_bucket_size(header.bucket_size);

        let mut engine = Self {
            free: FreeSpace::new(header.high_water, block_size),
            directory: Directory::new(),
            config,
            file,
            header,
            cache,
            dirty: true,
            closed: false,
        };

        if let Err(e) = engine.flush() {
            engine.closed = true;
            return Err(e);
        }

        info!(
            path = %engine.config.path.display(),
            block_size,
            "created database"
        );
        Ok(engine)
    }

    fn load(config: Config, mut file: DbFile, cache: BucketCache) -> Result<Self> {
        let file_len = file.len()?;
        if file_len < HEADER_PROBE_SIZE as u64 {
            return Err(HashKvError::corrupt(format!(
                "file of {} bytes is too short for a header",
                file_len
            )));
        }

        let mut probe = vec![0u8; HEADER_PROBE_SIZE];
        file.read_at(0, &mut probe)?;
        let header = Header::decode(&probe)?;

        if header.high_water > file_len {
            return Err(HashKvError::corrupt(format!(
                "file truncated: allocated up to {} but only {} bytes present",
                header.high_water, file_len
            )));
        }
        file.set_bucket_size(header.bucket_size);

        let mut dir_buf = vec![0u8; 8usize << header.dir_depth];
        file.read_at(header.dir_offset, &mut dir_buf)?;
        let directory = Directory::decode(
            &dir_buf,
            header.dir_depth,
            header.dir_offset,
            header.block_size as u64,
            header.high_water,
            header.bucket_size,
        )?;

        let free = FreeSpace::load(
            &mut file,
            header.free_head,
            header.high_water,
            header.block_size,
        )?;

        debug!(
            path = %config.path.display(),
            block_size = header.block_size,
            depth = header.dir_depth,
            entries = header.entry_count,
            "opened database"
        );

        Ok(Self {
            config,
            file,
            header,
            directory,
            free,
            cache,
            dirty: false,
            closed: false,
        })
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    /// Get the value stored for `key`
    ///
    /// Returns `Ok(None)` when the key is absent; an empty value is
    /// `Ok(Some(..))` with a zero-length datum.
    pub fn fetch(&mut self, key: &[u8]) -> Result<Option<Datum>> {
        let hash = hash_key(key);
        match self.locate(key, hash)? {
            Some(loc) => Ok(Some(self.read_value(&loc.slot)?)),
            None => Ok(None),
        }
    }

    /// Whether `key` is present
    pub fn exists(&mut self, key: &[u8]) -> Result<bool> {
        let hash = hash_key(key);
        Ok(self.locate(key, hash)?.is_some())
    }

    /// Insert or replace `key`, or remove it when given a tombstone
    ///
    /// On error nothing visible changes: the old value (or absence) remains.
    pub fn store<'v>(&mut self, key: &[u8], value: impl Into<StoreValue<'v>>) -> Result<()> {
        self.ensure_writable()?;

        match value.into() {
            StoreValue::Value(value) => self.put(key, value)?,
            StoreValue::Tombstone => self.remove(key)?,
        }

        if self.config.sync_writes {
            self.flush()?;
        }
        Ok(())
    }

    /// Remove `key`; removing an absent key is a no-op
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.store(key, StoreValue::Tombstone)
    }

    /// Number of live keys
    pub fn count(&self) -> u64 {
        self.header.entry_count
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Lazily walk every key in directory/bucket order
    ///
    /// Each call starts a fresh traversal. The borrow keeps the database
    /// unchanged while the iterator lives; drop it to stop early.
    pub fn keys(&mut self) -> Keys<'_> {
        Keys::new(self)
    }

    /// Like [`keys`](Self::keys) but yields `(key, value)` pairs
    pub fn entries(&mut self) -> Entries<'_> {
        Entries::new(self)
    }

    /// Call `callback` with every key until it returns `false`
    ///
    /// Returns how many keys were delivered.
    pub fn iterate<F>(&mut self, mut callback: F) -> Result<usize>
    where
        F: FnMut(&Datum) -> bool,
    {
        let mut delivered = 0;
        for key in self.keys() {
            let key = key?;
            delivered += 1;
            if !callback(&key) {
                break;
            }
        }
        Ok(delivered)
    }

    // =========================================================================
    // Durability / Maintenance
    // =========================================================================

    /// Write all cached changes and the header, then fsync
    pub fn sync(&mut self) -> Result<()> {
        if !self.config.mode.is_writable() {
            return Ok(());
        }
        self.flush()
    }

    /// Rebuild the file without free space
    ///
    /// Copies every entry into `<file>.reorg`, reopens it with the lock the
    /// database needs, then renames it over the database. Requires exclusive
    /// access.
    pub fn reorganize(&mut self) -> Result<()> {
        self.ensure_writable()?;
        self.flush()?;

        let before = self.free.high_water();
        let tmp_path = Self::reorg_path(&self.config.path);
        info!(
            path = %self.config.path.display(),
            entries = self.header.entry_count,
            "reorganizing database"
        );

        // locked before the rename; `self` stays as it was until then
        let mut reopened = match self.rebuild_into(&tmp_path) {
            Ok(engine) => engine,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&tmp_path, &self.config.path) {
            reopened.closed = true;
            drop(reopened);
            let _ = fs::remove_file(&tmp_path);
            return Err(HashKvError::Io(e));
        }
        reopened.config = self.config.clone();

        let mut old = std::mem::replace(self, reopened);
        old.closed = true;
        drop(old);

        info!(
            path = %self.config.path.display(),
            before,
            after = self.free.high_water(),
            "reorganize complete"
        );
        Ok(())
    }

    /// Flush everything and release the file and its lock
    pub fn close(mut self) -> Result<()> {
        let res = if self.config.mode.is_writable() {
            self.flush()
        } else {
            Ok(())
        };
        self.closed = true;
        res
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn mode(&self) -> OpenMode {
        self.config.mode
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn block_size(&self) -> u32 {
        self.header.block_size
    }

    pub fn directory_depth(&self) -> u32 {
        self.directory.depth()
    }

    /// Collect statistics; walks every bucket chain
    pub fn stats(&mut self) -> Result<Stats> {
        let primaries: BTreeSet<u64> = self
            .directory
            .entries()
            .iter()
            .copied()
            .filter(|&o| o != 0)
            .collect();

        let mut overflow_pages = 0;
        for &primary in &primaries {
            overflow_pages += self.load_chain(primary)?.len() - 1;
        }

        Ok(Stats {
            block_size: self.header.block_size,
            bucket_size: self.header.bucket_size,
            directory_depth: self.directory.depth(),
            bucket_count: primaries.len(),
            overflow_pages,
            entry_count: self.header.entry_count,
            free_extents: self.free.extent_count(),
            free_bytes: self.free.free_bytes(),
            file_size: self.free.high_water(),
            cache_len: self.cache.len(),
            cache_hits: self.cache.hits(),
            cache_misses: self.cache.misses(),
        })
    }

    // =========================================================================
    // Crate-internal helpers (used by iterators)
    // =========================================================================

    pub(crate) fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Slots, overflow link and local depth of the page at `offset`
    pub(crate) fn page_contents(&mut self, offset: u64) -> Result<(Vec<Slot>, u64, u32)> {
        let page = self.cache.load(offset, &mut self.file)?;
        Ok((page.slots().to_vec(), page.overflow, page.local_depth))
    }

    /// Fail if a chain has grown past the number of pages the file can hold
    pub(crate) fn check_chain_len(&self, len: usize, page: u64) -> Result<()> {
        if len > self.max_chain_len() {
            return Err(HashKvError::corrupt(format!(
                "overflow chain loops at page {}",
                page
            )));
        }
        Ok(())
    }

    pub(crate) fn read_key(&mut self, slot: &Slot) -> Result<Datum> {
        let buf = self.read_data(slot.data_offset, slot.key_len as u64)?;
        Ok(Datum::from(buf))
    }

    pub(crate) fn read_value(&mut self, slot: &Slot) -> Result<Datum> {
        let offset = slot.data_offset.saturating_add(slot.key_len as u64);
        let buf = self.read_data(offset, slot.value_len as u64)?;
        Ok(Datum::from(buf))
    }

    /// Key and value read in one go, sharing one buffer
    pub(crate) fn read_entry(&mut self, slot: &Slot) -> Result<(Datum, Datum)> {
        let buf = self.read_data(slot.data_offset, slot.data_len())?;
        let mut value = Bytes::from(buf);
        let key = value.split_to(slot.key_len as usize);
        Ok((Datum::new(key), Datum::new(value)))
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ensure_writable(&self) -> Result<()> {
        if self.config.mode.is_writable() {
            Ok(())
        } else {
            Err(HashKvError::ReadOnly)
        }
    }

    fn bucket_capacity(&self) -> usize {
        Bucket::capacity(self.header.bucket_size as usize)
    }

    fn page_len(&self) -> u64 {
        self.header.bucket_size as u64
    }

    /// Upper bound on pages in one chain, for cycle detection
    fn max_chain_len(&self) -> usize {
        (self.free.high_water() / self.page_len()) as usize + 1
    }

    /// Read `len` bytes of a data extent, checked against the allocated
    /// region before any buffer is sized
    fn read_data(&mut self, offset: u64, len: u64) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let end = offset.saturating_add(len);
        if offset < self.header.block_size as u64 || end > self.free.high_water() {
            return Err(HashKvError::corrupt(format!(
                "data extent {}..{} outside the allocated file",
                offset, end
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.file.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Find the slot holding `key`. Equal hashes are told apart by
    /// comparing the stored key bytes.
    fn locate(&mut self, key: &[u8], hash: u64) -> Result<Option<Location>> {
        let max_chain = self.max_chain_len();
        let mut offset = self.directory.bucket_for(hash);
        let mut chain = Vec::new();

        while offset != 0 {
            if chain.len() >= max_chain {
                return Err(HashKvError::corrupt(format!(
                    "overflow chain from bucket {} loops",
                    chain[0]
                )));
            }
            chain.push(offset);

            let page = self.cache.load(offset, &mut self.file)?;
            let next = page.overflow;
            let candidates: Vec<(usize, Slot)> = page
                .candidates(hash)
                .map(|i| (i, page.slots()[i]))
                .filter(|(_, s)| s.key_len as usize == key.len())
                .collect();

            for (index, slot) in candidates {
                if self.read_key(&slot)? == key {
                    return Ok(Some(Location { chain, index, slot }));
                }
            }
            offset = next;
        }
        Ok(None)
    }

    /// All pages of the chain starting at `primary`
    fn load_chain(&mut self, primary: u64) -> Result<Vec<(u64, Bucket)>> {
        let max_chain = self.max_chain_len();
        let mut chain = Vec::new();
        let mut offset = primary;
        while offset != 0 {
            if chain.len() >= max_chain {
                return Err(HashKvError::corrupt(format!(
                    "overflow chain from bucket {} loops",
                    primary
                )));
            }
            let page = self.cache.load(offset, &mut self.file)?.clone();
            let next = page.overflow;
            chain.push((offset, page));
            offset = next;
        }
        Ok(chain)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let key_len = u32::try_from(key.len())
            .map_err(|_| HashKvError::InvalidArgument("key longer than 4 GiB".to_string()))?;
        let value_len = u32::try_from(value.len())
            .map_err(|_| HashKvError::InvalidArgument("value longer than 4 GiB".to_string()))?;

        let hash = hash_key(key);
        let existing = self.locate(key, hash)?;

        let data_len = key.len() as u64 + value.len() as u64;
        let data_offset = self.free.allocate(data_len);
        if let Err(e) = self.write_data(data_offset, key, value) {
            self.free.reclaim(data_offset, data_len);
            return Err(e);
        }

        let slot = Slot {
            hash,
            key_len,
            value_len,
            data_offset,
        };

        let res = match &existing {
            Some(loc) => self.replace_slot(loc, slot),
            None => self.insert_slot(slot),
        };
        if let Err(e) = res {
            self.free.reclaim(data_offset, data_len);
            return Err(e);
        }

        match existing {
            Some(loc) => self.free.release(loc.slot.data_offset, loc.slot.data_len()),
            None => self.header.entry_count += 1,
        }
        self.dirty = true;
        Ok(())
    }

    fn write_data(&mut self, offset: u64, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() && value.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(key.len() + value.len());
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        self.file.write_at(offset, &buf)
    }

    fn replace_slot(&mut self, loc: &Location, slot: Slot) -> Result<()> {
        let offset = loc.chain[loc.chain.len() - 1];
        let mut page = self.cache.load(offset, &mut self.file)?.clone();
        page.replace(loc.index, slot);
        self.cache.commit(vec![(offset, page)], &mut self.file)
    }

    /// Place a new slot, splitting or chaining as needed
    fn insert_slot(&mut self, slot: Slot) -> Result<()> {
        let capacity = self.bucket_capacity();

        // every pass either inserts or splits once, raising a local depth
        for _ in 0..=MAX_DEPTH + 1 {
            let primary = self.directory.bucket_for(slot.hash);
            if primary == 0 {
                return self.create_first_bucket(slot);
            }

            let mut chain = self.load_chain(primary)?;
            if let Some(pos) = chain.iter().position(|(_, p)| p.len() < capacity) {
                let (offset, mut page) = chain.swap_remove(pos);
                page.insert(slot);
                return self.cache.commit(vec![(offset, page)], &mut self.file);
            }

            if Self::can_split(&chain, slot.hash) {
                self.split(chain, slot.hash)?;
            } else {
                return self.append_overflow(chain, slot);
            }
        }

        Err(HashKvError::corrupt(format!(
            "bucket split for hash {:#018x} did not converge",
            slot.hash
        )))
    }

    fn create_first_bucket(&mut self, slot: Slot) -> Result<()> {
        let depth = self.directory.depth();
        let offset = self.free.allocate(self.page_len());
        let bucket = Bucket::with_slots(depth, vec![slot]);

        if let Err(e) = self.cache.commit(vec![(offset, bucket)], &mut self.file) {
            self.free.reclaim(offset, self.page_len());
            return Err(e);
        }
        let range = self.directory.range_of(slot.hash, depth);
        self.directory.set_range(range, offset);
        Ok(())
    }

    /// A split helps only if some entry differs from the incoming hash
    /// within the deepest supported prefix
    fn can_split(chain: &[(u64, Bucket)], hash: u64) -> bool {
        let local_depth = chain[0].1.local_depth;
        if local_depth >= MAX_DEPTH {
            return false;
        }
        let target = prefix(hash, MAX_DEPTH);
        chain
            .iter()
            .flat_map(|(_, p)| p.slots())
            .any(|s| prefix(s.hash, MAX_DEPTH) != target)
    }

    /// Split the bucket owning `hash` on its next hash bit
    ///
    /// Both halves go to fresh pages. The old chain is released, never
    /// rewritten: the last synced directory may still point at it.
    fn split(&mut self, chain: Vec<(u64, Bucket)>, hash: u64) -> Result<()> {
        let primary = chain[0].0;
        let local_depth = chain[0].1.local_depth;
        let old_pages: Vec<u64> = chain.iter().map(|(o, _)| *o).collect();

        let mut low = Vec::new();
        let mut high = Vec::new();
        for (_, page) in chain {
            for slot in page.into_slots() {
                if split_bit(slot.hash, local_depth) {
                    high.push(slot);
                } else {
                    low.push(slot);
                }
            }
        }

        if local_depth == self.directory.depth() {
            self.directory.double()?;
        }

        let lower = self.free.allocate(self.page_len());
        let upper = self.free.allocate(self.page_len());
        let mut allocated = vec![lower, upper];
        let mut pages = self.pack(lower, local_depth + 1, low, &mut allocated);
        pages.extend(self.pack(upper, local_depth + 1, high, &mut allocated));

        if let Err(e) = self.cache.commit(pages, &mut self.file) {
            for offset in allocated {
                self.free.reclaim(offset, self.page_len());
            }
            return Err(e);
        }

        for offset in old_pages {
            self.cache.discard(offset);
            self.free.release(offset, self.page_len());
        }

        let range = self.directory.range_of(hash, local_depth);
        let mid = range.start + (range.end - range.start) / 2;
        self.directory.set_range(range.start..mid, lower);
        self.directory.set_range(mid..range.end, upper);

        debug!(
            bucket = primary,
            lower,
            upper,
            local_depth = local_depth + 1,
            "bucket split"
        );
        Ok(())
    }

    /// Lay out `slots` as a chain starting at `first`, allocating
    /// overflow pages as needed (recorded in `allocated`)
    fn pack(
        &mut self,
        first: u64,
        local_depth: u32,
        slots: Vec<Slot>,
        allocated: &mut Vec<u64>,
    ) -> Vec<(u64, Bucket)> {
        let capacity = self.bucket_capacity();
        let mut sorted = slots;
        sorted.sort_by_key(|s| s.hash);

        let mut pages: Vec<(u64, Bucket)> = Vec::new();
        let mut chunks = sorted.chunks(capacity).peekable();
        if chunks.peek().is_none() {
            return vec![(first, Bucket::new(local_depth))];
        }

        let mut offset = first;
        while let Some(chunk) = chunks.next() {
            let mut page = Bucket::with_slots(local_depth, chunk.to_vec());
            let next = if chunks.peek().is_some() {
                let next = self.free.allocate(self.page_len());
                allocated.push(next);
                next
            } else {
                0
            };
            page.overflow = next;
            pages.push((offset, page));
            offset = next;
        }
        pages
    }

    fn append_overflow(&mut self, mut chain: Vec<(u64, Bucket)>, slot: Slot) -> Result<()> {
        let primary = chain[0].0;
        let pages = chain.len() + 1;
        let (last_offset, mut last) = match chain.pop() {
            Some(tail) => tail,
            None => return Err(HashKvError::corrupt("empty bucket chain")),
        };

        let offset = self.free.allocate(self.page_len());
        let page = Bucket::with_slots(last.local_depth, vec![slot]);
        last.overflow = offset;

        // the new page is on disk before any write of the link to it
        let res = match self.file.write_bucket(offset, &page) {
            Ok(()) => self
                .cache
                .commit(vec![(offset, page), (last_offset, last)], &mut self.file),
            Err(e) => Err(e),
        };
        if let Err(e) = res {
            self.free.reclaim(offset, self.page_len());
            return Err(e);
        }

        debug!(bucket = primary, pages, "overflow page chained");
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> Result<()> {
        let hash = hash_key(key);
        let Some(loc) = self.locate(key, hash)? else {
            return Ok(());
        };
        let remaining = self.header.entry_count.checked_sub(1).ok_or_else(|| {
            HashKvError::corrupt("entry count is zero but a key was found")
        })?;

        let depth = loc.chain.len();
        let offset = loc.chain[depth - 1];
        let mut page = self.cache.load(offset, &mut self.file)?.clone();
        page.remove(loc.index);

        if page.is_empty() && depth > 1 {
            // unlink the emptied overflow page
            let prev_offset = loc.chain[depth - 2];
            let mut prev = self.cache.load(prev_offset, &mut self.file)?.clone();
            prev.overflow = page.overflow;
            self.cache.commit(vec![(prev_offset, prev)], &mut self.file)?;
            self.cache.discard(offset);
            self.free.release(offset, self.page_len());
        } else {
            self.cache.commit(vec![(offset, page)], &mut self.file)?;
        }

        self.free.release(loc.slot.data_offset, loc.slot.data_len());
        self.header.entry_count = remaining;
        self.dirty = true;
        Ok(())
    }

    /// Write buckets, directory, free list and header, then fsync
    fn flush(&mut self) -> Result<()> {
        let written = self.cache.flush(&mut self.file)?;
        if !self.dirty && written == 0 && !self.directory.is_dirty() && !self.free.is_dirty() {
            return Ok(());
        }

        if self.directory.is_dirty() {
            let len = self.directory.byte_len();
            let offset = self.free.allocate(len);
            if let Err(e) = self.file.write_at(offset, &self.directory.encode()) {
                self.free.reclaim(offset, len);
                return Err(e);
            }
            let (old_offset, old_len) = (self.directory.offset(), self.header_dir_len());
            self.free.release(old_offset, old_len);
            self.directory.mark_written(offset);
        }

        if self.free.is_dirty() {
            self.header.free_head = self.free.persist(&mut self.file)?;
        }

        self.header.dir_offset = self.directory.offset();
        self.header.dir_depth = self.directory.depth();
        self.header.high_water = self.free.high_water();
        self.file.write_at(0, &self.header.encode()?)?;
        self.file.sync()?;

        self.free.commit();
        self.dirty = false;
        Ok(())
    }

    /// Length of the directory region the header currently points at
    fn header_dir_len(&self) -> u64 {
        if self.header.dir_offset == 0 {
            0
        } else {
            8u64 << self.header.dir_depth
        }
    }

    /// Copy every entry into a fresh file at `tmp_path` and return it
    /// reopened read-write
    fn rebuild_into(&mut self, tmp_path: &Path) -> Result<Engine> {
        let config = Config::builder()
            .path(tmp_path)
            .mode(OpenMode::ReadWriteCreateForce)
            .block_size(self.header.block_size)
            .cache_size(self.config.cache_size)
            .permissions(self.config.permissions)
            .no_lock(true)
            .build();
        let mut fresh = Engine::open(config)?;

        for entry in self.entries() {
            let (key, value) = entry?;
            fresh.store(&key, StoreValue::Value(&value))?;
        }
        fresh.close()?;

        let permissions = fs::metadata(&self.config.path)?.permissions();
        fs::set_permissions(tmp_path, permissions)?;

        let mut reopen = self.config.clone();
        reopen.path = tmp_path.to_path_buf();
        reopen.mode = OpenMode::ReadWrite;
        Engine::open(reopen)
    }

    fn reorg_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(Self::REORG_SUFFIX);
        PathBuf::from(name)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.closed || !self.config.mode.is_writable() {
            return;
        }
        if let Err(e) = self.flush() {
            warn!(
                path = %self.config.path.display(),
                error = %e,
                "failed to flush database on drop"
            );
        }
    }
}
