//! # Memtable
//!
//! An in-memory, sorted, mutable write buffer for the kvctl storage engine.
//!
//! Every committed write transaction lands here after it has been framed into
//! the WAL. Entries are kept in a `BTreeMap` so that prefix scans and SSTable
//! flushes see keys in ascending byte order.
//!
//! ## Key properties
//! - **Sorted order**: entries are always in ascending key order.
//! - **Version gated**: a write whose version is not newer than the stored one
//!   is dropped, which makes WAL replay idempotent.
//! - **Tombstones**: deletes are kept as `ValueEntry { value: None }` so they
//!   shadow older values in SSTables.
//! - **Entry metadata**: each entry carries the engine's `user_meta` byte and
//!   an absolute expiry (`expires_at`, unix seconds, `0` = never).
//!
//! ## Example
//! ```rust
//! use memtable::{Memtable, ValueEntry};
//!
//! let mut m = Memtable::new();
//! m.put(b"user:1".to_vec(), b"alice".to_vec(), 1);
//! m.apply(b"user:2".to_vec(), ValueEntry::live(2, b"bob".to_vec()).expiring_at(60));
//!
//! let keys: Vec<_> = m.scan_prefix(b"user:").map(|(k, _)| k.to_vec()).collect();
//! assert_eq!(keys, vec![b"user:1".to_vec(), b"user:2".to_vec()]);
//! ```

use std::collections::BTreeMap;
use std::ops::Bound;

/// A versioned entry in the memtable.
///
/// - `value == Some(bytes)`: the key holds a live value.
/// - `value == None`: the key has been deleted (tombstone).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueEntry {
    /// Commit version of the transaction that wrote this entry.
    pub seq: u64,
    /// `Some(bytes)` for live values, `None` for tombstones.
    pub value: Option<Vec<u8>>,
    /// Opaque byte kept alongside the entry.
    pub user_meta: u8,
    /// Absolute expiry in unix seconds; `0` means the entry never expires.
    pub expires_at: u64,
}

impl ValueEntry {
    /// A live entry with no metadata and no expiry.
    pub fn live(seq: u64, value: Vec<u8>) -> Self {
        Self {
            seq,
            value: Some(value),
            user_meta: 0,
            expires_at: 0,
        }
    }

    /// A delete marker.
    pub fn tombstone(seq: u64) -> Self {
        Self {
            seq,
            value: None,
            user_meta: 0,
            expires_at: 0,
        }
    }

    pub fn expiring_at(mut self, expires_at: u64) -> Self {
        self.expires_at = expires_at;
        self
    }

    pub fn with_user_meta(mut self, user_meta: u8) -> Self {
        self.user_meta = user_meta;
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Returns `true` once `now` (unix seconds) has reached `expires_at`.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at != 0 && self.expires_at <= now
    }

    /// Returns `true` if the entry holds a value that is visible at `now`.
    pub fn is_visible(&self, now: u64) -> bool {
        !self.is_tombstone() && !self.is_expired(now)
    }

    fn value_len(&self) -> usize {
        self.value.as_ref().map_or(0, Vec::len)
    }
}

/// An ordered, in-memory write buffer backed by a `BTreeMap`.
///
/// The memtable tracks an approximate byte size (keys + values) so the engine
/// can decide when to flush to an SSTable.
#[derive(Debug, Default)]
pub struct Memtable {
    map: BTreeMap<Vec<u8>, ValueEntry>,
    approx_size: usize,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `entry` under `key` unless the key already holds an entry with a
    /// newer or equal version. Returns `true` if the entry was stored.
    pub fn apply(&mut self, key: Vec<u8>, entry: ValueEntry) -> bool {
        match self.map.get(&key) {
            Some(old) if old.seq >= entry.seq => return false,
            Some(old) => {
                // key bytes were counted when the key first appeared
                self.approx_size = self.approx_size.saturating_sub(old.value_len());
            }
            None => {
                self.approx_size = self.approx_size.saturating_add(key.len());
            }
        }

        self.approx_size = self.approx_size.saturating_add(entry.value_len());
        self.map.insert(key, entry);
        true
    }

    /// Inserts a live value with no expiry.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>, seq: u64) -> bool {
        self.apply(key, ValueEntry::live(seq, value))
    }

    /// Records a tombstone for `key`.
    pub fn delete(&mut self, key: Vec<u8>, seq: u64) -> bool {
        self.apply(key, ValueEntry::tombstone(seq))
    }

    /// Returns the raw entry for `key` together with the stored key,
    /// tombstones included.
    ///
    /// A tombstone means "deleted here", which must stop the engine from
    /// falling through to older SSTables.
    pub fn get_key_value(&self, key: &[u8]) -> Option<(&[u8], &ValueEntry)> {
        self.map.get_key_value(key).map(|(k, e)| (k.as_slice(), e))
    }

    /// Iterates every entry whose key starts with `prefix`, in ascending order.
    /// An empty prefix yields the whole memtable.
    pub fn scan_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> impl Iterator<Item = (&'a [u8], &'a ValueEntry)> + 'a {
        self.map
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_slice(), v))
    }

    /// Iterates all entries (tombstones included) in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &ValueEntry)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Approximate byte size of stored keys and values, excluding map overhead.
    pub fn approx_size(&self) -> usize {
        self.approx_size
    }
}
