//! In-memory [`Backend`] used to test the store access layer in isolation.

use std::borrow::Cow;
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::ops::Bound;
use std::rc::Rc;
use std::time::Duration;

use crate::backend::{self, Backend, Item, ItemIter, ItemValue, IterOptions, ReadTxn, WriteTxn};
use crate::error::EngineError;

#[derive(Debug, Clone)]
struct Stored {
    value: Vec<u8>,
    version: u64,
    user_meta: u8,
    expires_at: u64,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: BTreeMap<Vec<u8>, Stored>,
    version: u64,
    now: u64,
    failing: BTreeSet<Vec<u8>>,
    last_iter: Cell<Option<IterOptions>>,
    closed: Rc<Cell<bool>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            now: 1_000,
            ..Default::default()
        }
    }

    /// Writes an entry directly, bypassing transactions. Lets tests seed
    /// metadata the write path never produces.
    pub fn insert_raw(&mut self, key: &[u8], value: &[u8], user_meta: u8, expires_at: u64) {
        self.version += 1;
        self.entries.insert(
            key.to_vec(),
            Stored {
                value: value.to_vec(),
                version: self.version,
                user_meta,
                expires_at,
            },
        );
    }

    /// Any staged write or delete of `key` fails from now on.
    pub fn fail_on(&mut self, key: &[u8]) {
        self.failing.insert(key.to_vec());
    }

    pub fn advance_clock(&mut self, secs: u64) {
        self.now += secs;
    }

    pub fn last_iter_options(&self) -> Option<IterOptions> {
        self.last_iter.get()
    }

    /// Flips to `true` once the backend is closed.
    pub fn closed_flag(&self) -> Rc<Cell<bool>> {
        Rc::clone(&self.closed)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    fn check(&self, key: &[u8]) -> Result<(), EngineError> {
        if key.is_empty() {
            return Err(EngineError::EmptyKey);
        }
        if self.failing.contains(key) {
            return Err(EngineError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected failure",
            )));
        }
        Ok(())
    }
}

impl Backend for MemoryBackend {
    type Reader<'a> = MemoryRead<'a>;
    type Writer<'a> = MemoryWrite<'a>;

    fn read_txn(&self) -> MemoryRead<'_> {
        MemoryRead { backend: self }
    }

    fn write_txn(&mut self) -> MemoryWrite<'_> {
        MemoryWrite {
            backend: self,
            staged: Vec::new(),
        }
    }

    fn close(self) -> Result<(), EngineError> {
        self.closed.set(true);
        Ok(())
    }
}

pub struct MemoryRead<'a> {
    backend: &'a MemoryBackend,
}

fn item<'a>(key: &'a [u8], stored: &'a Stored) -> Item<'a> {
    Item {
        key: Cow::Borrowed(key),
        version: stored.version,
        user_meta: stored.user_meta,
        expires_at: stored.expires_at,
        estimated_size: (key.len() + stored.value.len()) as i64,
        value: ItemValue::Loaded(Cow::Borrowed(stored.value.as_slice())),
    }
}

impl ReadTxn for MemoryRead<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Item<'_>>, EngineError> {
        let now = self.backend.now;
        Ok(self
            .backend
            .entries
            .get_key_value(key)
            .filter(|(_, s)| s.expires_at == 0 || s.expires_at > now)
            .map(|(k, s)| item(k, s)))
    }

    fn iter<'b>(&'b self, prefix: &'b [u8], opts: IterOptions) -> ItemIter<'b> {
        self.backend.last_iter.set(Some(opts));
        let now = self.backend.now;
        Box::new(
            self.backend
                .entries
                .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
                .take_while(move |(k, _)| k.starts_with(prefix))
                .filter(move |(_, s)| s.expires_at == 0 || s.expires_at > now)
                .map(|(k, s)| Ok(item(k, s))),
        )
    }
}

pub struct MemoryWrite<'a> {
    backend: &'a mut MemoryBackend,
    staged: Vec<(Vec<u8>, Option<(Vec<u8>, u64)>)>,
}

impl WriteTxn for MemoryWrite<'_> {
    fn set(&mut self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> Result<(), EngineError> {
        self.backend.check(key)?;
        let expires_at = backend::expires_at(self.backend.now, ttl);
        self.staged
            .push((key.to_vec(), Some((value.to_vec(), expires_at))));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), EngineError> {
        self.backend.check(key)?;
        self.staged.push((key.to_vec(), None));
        Ok(())
    }

    fn commit(self) -> Result<(), EngineError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        self.backend.version += 1;
        let version = self.backend.version;
        for (key, op) in self.staged {
            match op {
                Some((value, expires_at)) => {
                    self.backend.entries.insert(
                        key,
                        Stored {
                            value,
                            version,
                            user_meta: 0,
                            expires_at,
                        },
                    );
                }
                None => {
                    self.backend.entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}
