//! Key and entry iterators
//!
//! Both walk the directory in index order, visiting each bucket once (at the
//! first entry of its range), then its overflow chain, then its slots in
//! hash order. The order is stable as long as the database is unchanged.
//!
//! After an error the iterator yields that error once and then ends.

use crate::datum::Datum;
use crate::engine::Engine;
use crate::error::Result;
use crate::storage::Slot;

/// Position in a full traversal
struct Cursor {
    /// Next directory entry to visit once the current chain is exhausted
    dir_index: usize,
    /// Next page of the current chain, 0 at the end
    next_page: u64,
    slots: Vec<Slot>,
    pos: usize,
    /// Pages read from the current chain, for cycle detection
    chain_len: usize,
}

impl Cursor {
    fn new() -> Self {
        Self {
            dir_index: 0,
            next_page: 0,
            slots: Vec::new(),
            pos: 0,
            chain_len: 0,
        }
    }

    fn next_slot(&mut self, engine: &mut Engine) -> Result<Option<Slot>> {
        loop {
            if let Some(&slot) = self.slots.get(self.pos) {
                self.pos += 1;
                return Ok(Some(slot));
            }

            if self.next_page != 0 {
                self.chain_len += 1;
                engine.check_chain_len(self.chain_len, self.next_page)?;
                let (slots, overflow, _) = engine.page_contents(self.next_page)?;
                self.slots = slots;
                self.pos = 0;
                self.next_page = overflow;
                continue;
            }

            let directory = engine.directory();
            if self.dir_index >= directory.len() {
                return Ok(None);
            }
            let primary = directory.get(self.dir_index);
            if primary == 0 {
                self.dir_index += 1;
                continue;
            }

            let (slots, overflow, local_depth) = engine.page_contents(primary)?;
            self.dir_index = engine
                .directory()
                .next_range_start(self.dir_index, local_depth);
            self.slots = slots;
            self.pos = 0;
            self.next_page = overflow;
            self.chain_len = 1;
        }
    }
}

/// Iterator over every key, created by [`Engine::keys`]
pub struct Keys<'a> {
    engine: &'a mut Engine,
    cursor: Cursor,
    done: bool,
}

impl<'a> Keys<'a> {
    pub(crate) fn new(engine: &'a mut Engine) -> Self {
        Self {
            engine,
            cursor: Cursor::new(),
            done: false,
        }
    }
}

impl Iterator for Keys<'_> {
    type Item = Result<Datum>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let res = match self.cursor.next_slot(self.engine) {
            Ok(Some(slot)) => self.engine.read_key(&slot),
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(e) => Err(e),
        };
        if res.is_err() {
            self.done = true;
        }
        Some(res)
    }
}

/// Iterator over every `(key, value)` pair, created by [`Engine::entries`]
pub struct Entries<'a> {
    engine: &'a mut Engine,
    cursor: Cursor,
    done: bool,
}

impl<'a> Entries<'a> {
    pub(crate) fn new(engine: &'a mut Engine) -> Self {
        Self {
            engine,
            cursor: Cursor::new(),
            done: false,
        }
    }
}

impl Iterator for Entries<'_> {
    type Item = Result<(Datum, Datum)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let res = match self.cursor.next_slot(self.engine) {
            Ok(Some(slot)) => self.engine.read_entry(&slot),
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(e) => Err(e),
        };
        if res.is_err() {
            self.done = true;
        }
        Some(res)
    }
}

impl std::iter::FusedIterator for Keys<'_> {}
impl std::iter::FusedIterator for Entries<'_> {}
