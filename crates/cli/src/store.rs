//! Store access layer: the four operations the command line exposes, each run
//! as a single transaction or iteration against a [`Backend`].

use std::fmt;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::backend::{Backend, IterOptions, ReadTxn, WriteTxn, DEFAULT_PREFETCH_SIZE};
use crate::codec::{self, Format};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::StoreError;

/// Per-write options. Only used for the duration of one `set`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryOptions {
    /// Zero means the entry never expires.
    pub ttl: Duration,
}

impl EntryOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl }
    }
}

/// Metadata of one listed key. Never carries the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListResult {
    pub key: String,
    pub size: i64,
    pub version: u64,
    pub meta: u8,
}

struct Meta(u8);

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = if self.0.is_ascii_graphic() {
            char::from(self.0).to_string()
        } else {
            format!("{:#04x}", self.0)
        };
        f.pad(&rendered)
    }
}

impl fmt::Display for ListResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<30} {:>10} {:>10} {:>5}",
            self.key,
            self.size,
            self.version,
            Meta(self.meta)
        )
    }
}

pub struct Store<B> {
    backend: B,
}

impl Store<Engine> {
    /// Opens (or creates) the on-disk store described by `config`.
    pub fn open(config: &EngineConfig) -> Result<Self, StoreError> {
        let engine = Engine::open(config).map_err(StoreError::storage(format!(
            "open store at {}",
            config.dir.display()
        )))?;
        Ok(Self::new(engine))
    }
}

impl<B: Backend> Store<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Reads `key` and renders its value in `format`.
    #[instrument(skip(self), level = "debug")]
    pub fn get(&self, key: &str, format: Format) -> Result<String, StoreError> {
        let raw = {
            let txn = self.backend.read_txn();
            let item = txn
                .get(key.as_bytes())
                .map_err(StoreError::storage(format!("get {key}")))?
                .ok_or_else(|| StoreError::NotFound {
                    key: key.to_string(),
                })?;
            item.value_copy()
                .map_err(StoreError::storage(format!("copy value of {key}")))?
        };

        codec::decode(&raw, format).map_err(|source| StoreError::Decode {
            key: key.to_string(),
            source,
        })
    }

    /// Pages through keys starting with `prefix`.
    ///
    /// Returns at most `limit` results after skipping `offset` matches, plus
    /// the total number of matches in the snapshot. A `limit` of zero
    /// collects nothing but still counts.
    #[instrument(skip(self), level = "debug")]
    pub fn list(
        &self,
        prefix: &str,
        limit: usize,
        offset: usize,
    ) -> Result<(Vec<ListResult>, usize), StoreError> {
        let opts = IterOptions {
            prefetch_values: false,
            prefetch_size: if limit > 0 { limit } else { DEFAULT_PREFETCH_SIZE },
        };

        let txn = self.backend.read_txn();
        let mut results = Vec::with_capacity(limit.min(DEFAULT_PREFETCH_SIZE));
        let mut total = 0usize;

        for item in txn.iter(prefix.as_bytes(), opts) {
            let item = item.map_err(StoreError::storage(format!("list prefix {prefix:?}")))?;
            let position = total;
            total += 1;
            if position < offset || results.len() >= limit {
                continue;
            }
            results.push(ListResult {
                key: String::from_utf8_lossy(&item.key).into_owned(),
                size: item.estimated_size,
                version: item.version,
                meta: item.user_meta,
            });
        }

        debug!(returned = results.len(), total, "listed keys");
        Ok((results, total))
    }

    /// Writes `key -> value` in one transaction, with an optional TTL.
    #[instrument(skip(self, value), fields(value_len = value.len()), level = "debug")]
    pub fn set(
        &mut self,
        key: &str,
        value: &str,
        opts: Option<&EntryOptions>,
    ) -> Result<(), StoreError> {
        let ttl = opts.map(|o| o.ttl).filter(|ttl| !ttl.is_zero());
        let context = || format!("set {key}");

        let mut txn = self.backend.write_txn();
        txn.set(key.as_bytes(), value.as_bytes(), ttl)
            .map_err(StoreError::storage(context()))?;
        txn.commit().map_err(StoreError::storage(context()))
    }

    /// Deletes every key in one transaction. Either all are deleted or none.
    #[instrument(skip_all, fields(count = keys.len()), level = "debug")]
    pub fn delete<K: AsRef<str>>(&mut self, keys: &[K]) -> Result<(), StoreError> {
        let mut txn = self.backend.write_txn();
        for key in keys {
            let key = key.as_ref();
            txn.delete(key.as_bytes())
                .map_err(StoreError::storage(format!("delete {key}")))?;
        }
        txn.commit()
            .map_err(StoreError::storage(format!("delete {} keys", keys.len())))
    }

    /// Releases the backend.
    pub fn close(self) -> Result<(), StoreError> {
        self.backend
            .close()
            .map_err(StoreError::storage("close store"))
    }
}
