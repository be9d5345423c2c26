//! Capabilities the store access layer needs from a storage engine.
//!
//! A backend hands out read transactions (shared borrow, consistent snapshot)
//! and write transactions (exclusive borrow, atomic commit). The LSM
//! [`Engine`](crate::engine::Engine) implements these, and tests use an
//! in-memory fake.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use crate::error::EngineError;

/// Default number of items an iterator batches when no hint is given.
pub const DEFAULT_PREFETCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterOptions {
    /// Load value bytes while iterating. Listings leave this off.
    pub prefetch_values: bool,
    /// Items resolved per batch. With `prefetch_values` the values of one
    /// batch are read together. Zero is treated as one.
    pub prefetch_size: usize,
}

impl Default for IterOptions {
    fn default() -> Self {
        Self {
            prefetch_values: true,
            prefetch_size: DEFAULT_PREFETCH_SIZE,
        }
    }
}

/// Storage that can produce value bytes an item did not load up front.
pub trait ValueSource {
    fn load_value(&self, key: &[u8], offset: u64) -> Result<Vec<u8>, EngineError>;
}

/// Where an item's value bytes are.
#[derive(Clone)]
pub enum ItemValue<'t> {
    Loaded(Cow<'t, [u8]>),
    /// Still in storage at `offset`; read by [`Item::value_copy`].
    Deferred {
        source: &'t dyn ValueSource,
        offset: u64,
    },
}

impl fmt::Debug for ItemValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemValue::Loaded(v) => f.debug_tuple("Loaded").field(&v.len()).finish(),
            ItemValue::Deferred { offset, .. } => {
                f.debug_struct("Deferred").field("offset", offset).finish()
            }
        }
    }
}

/// A visible entry as seen by one read transaction.
///
/// Key and value may borrow engine memory for the lifetime of the
/// transaction; [`value_copy`](Item::value_copy) keeps the value past it.
#[derive(Debug, Clone)]
pub struct Item<'t> {
    pub key: Cow<'t, [u8]>,
    pub version: u64,
    pub user_meta: u8,
    /// Unix seconds, `0` = never.
    pub expires_at: u64,
    /// Encoded size of the entry as reported by the engine.
    pub estimated_size: i64,
    pub value: ItemValue<'t>,
}

impl Item<'_> {
    pub fn is_loaded(&self) -> bool {
        matches!(self.value, ItemValue::Loaded(_))
    }

    /// Copies the value out, reading it from storage if it was not loaded.
    pub fn value_copy(&self) -> Result<Vec<u8>, EngineError> {
        match &self.value {
            ItemValue::Loaded(v) => Ok(v.to_vec()),
            ItemValue::Deferred { source, offset } => source.load_value(&self.key, *offset),
        }
    }
}

pub type ItemIter<'t> = Box<dyn Iterator<Item = Result<Item<'t>, EngineError>> + 't>;

pub trait ReadTxn {
    /// Looks up a visible entry.
    fn get(&self, key: &[u8]) -> Result<Option<Item<'_>>, EngineError>;

    /// Visible entries whose key starts with `prefix`, ascending byte order.
    fn iter<'a>(&'a self, prefix: &'a [u8], opts: IterOptions) -> ItemIter<'a>;
}

/// Buffered mutations. Dropping without [`commit`](WriteTxn::commit) discards
/// them.
pub trait WriteTxn {
    /// Stages `key -> value`. A `ttl` of `None` or zero never expires.
    fn set(&mut self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> Result<(), EngineError>;

    fn delete(&mut self, key: &[u8]) -> Result<(), EngineError>;

    /// Applies every staged mutation atomically.
    fn commit(self) -> Result<(), EngineError>;
}

pub trait Backend {
    type Reader<'a>: ReadTxn
    where
        Self: 'a;
    type Writer<'a>: WriteTxn
    where
        Self: 'a;

    fn read_txn(&self) -> Self::Reader<'_>;

    fn write_txn(&mut self) -> Self::Writer<'_>;

    /// Releases the handle, making pending state durable.
    fn close(self) -> Result<(), EngineError>
    where
        Self: Sized,
    {
        Ok(())
    }
}

/// Absolute expiry for a write made at `now` with the given `ttl`.
///
/// Sub-second remainders round up so a short TTL never expires on write.
pub fn expires_at(now: u64, ttl: Option<Duration>) -> u64 {
    match ttl {
        Some(ttl) if !ttl.is_zero() => {
            let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
            now.saturating_add(secs)
        }
        _ => 0,
    }
}
