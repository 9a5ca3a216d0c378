//! Datum Module
//!
//! Byte views handed across the public API. Keys and values are opaque;
//! a zero-length datum is a real value and is distinct from "absent".

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use bytes::Bytes;

/// An immutable view over a key or value.
///
/// Backed by [`Bytes`], so a fetched key and value can share the buffer
/// they were read into.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Datum(Bytes);

impl Datum {
    pub fn new(bytes: Bytes) -> Self {
        Datum(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl Deref for Datum {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Datum {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8]> for Datum {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "Datum({:?})", s),
            Err(_) => write!(f, "Datum({:?})", &self.0[..]),
        }
    }
}

impl From<Bytes> for Datum {
    fn from(bytes: Bytes) -> Self {
        Datum(bytes)
    }
}

impl From<Vec<u8>> for Datum {
    fn from(v: Vec<u8>) -> Self {
        Datum(Bytes::from(v))
    }
}

impl From<&'static [u8]> for Datum {
    fn from(v: &'static [u8]) -> Self {
        Datum(Bytes::from_static(v))
    }
}

impl From<&'static str> for Datum {
    fn from(s: &'static str) -> Self {
        Datum(Bytes::from_static(s.as_bytes()))
    }
}

impl PartialEq<[u8]> for Datum {
    fn eq(&self, other: &[u8]) -> bool {
        self.0 == other
    }
}

impl PartialEq<&[u8]> for Datum {
    fn eq(&self, other: &&[u8]) -> bool {
        self.0 == *other
    }
}

impl<const N: usize> PartialEq<&[u8; N]> for Datum {
    fn eq(&self, other: &&[u8; N]) -> bool {
        self.0 == other[..]
    }
}

impl PartialEq<Vec<u8>> for Datum {
    fn eq(&self, other: &Vec<u8>) -> bool {
        self.0 == other[..]
    }
}

/// What to write for a key: a value, or a tombstone that removes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreValue<'a> {
    /// Insert or replace the value (may be empty)
    Value(&'a [u8]),

    /// Remove the key if present
    Tombstone,
}

impl<'a> From<&'a [u8]> for StoreValue<'a> {
    fn from(v: &'a [u8]) -> Self {
        StoreValue::Value(v)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for StoreValue<'a> {
    fn from(v: &'a [u8; N]) -> Self {
        StoreValue::Value(v)
    }
}

impl<'a> From<&'a Vec<u8>> for StoreValue<'a> {
    fn from(v: &'a Vec<u8>) -> Self {
        StoreValue::Value(v)
    }
}

impl<'a> From<&'a Datum> for StoreValue<'a> {
    fn from(v: &'a Datum) -> Self {
        StoreValue::Value(v.as_bytes())
    }
}

/// `None` is a tombstone, `Some(v)` a value.
impl<'a> From<Option<&'a [u8]>> for StoreValue<'a> {
    fn from(v: Option<&'a [u8]>) -> Self {
        match v {
            Some(v) => StoreValue::Value(v),
            None => StoreValue::Tombstone,
        }
    }
}
