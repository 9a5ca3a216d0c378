//! Shared handle
//!
//! An [`Engine`] is a single-threaded object. `SharedEngine` wraps one in an
//! `Arc<Mutex<_>>` so several threads can use the same open database; each
//! call holds the lock for the whole operation.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::datum::{Datum, StoreValue};
use crate::engine::Engine;
use crate::error::Result;

/// Cloneable, thread-safe handle to one open database
#[derive(Clone)]
pub struct SharedEngine {
    inner: Arc<Mutex<Engine>>,
}

impl SharedEngine {
    pub fn new(engine: Engine) -> Self {
        Self {
            inner: Arc::new(Mutex::new(engine)),
        }
    }

    pub fn open(config: Config) -> Result<Self> {
        Ok(Self::new(Engine::open(config)?))
    }

    pub fn fetch(&self, key: &[u8]) -> Result<Option<Datum>> {
        self.inner.lock().fetch(key)
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        self.inner.lock().exists(key)
    }

    pub fn store<'v>(&self, key: &[u8], value: impl Into<StoreValue<'v>>) -> Result<()> {
        self.inner.lock().store(key, value)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.lock().delete(key)
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.lock().sync()
    }

    pub fn count(&self) -> u64 {
        self.inner.lock().count()
    }

    /// Run `f` with exclusive access, e.g. to iterate or reorganize
    pub fn with<R>(&self, f: impl FnOnce(&mut Engine) -> R) -> R {
        let mut engine = self.inner.lock();
        f(&mut engine)
    }
}

impl From<Engine> for SharedEngine {
    fn from(engine: Engine) -> Self {
        Self::new(engine)
    }
}
