//! Engine configuration.

use std::path::PathBuf;

/// Memtable size that triggers a flush to a new SSTable.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 4 * 1024 * 1024;

pub const DEFAULT_MAX_KEY_SIZE: usize = 65_000;

pub const DEFAULT_MAX_VALUE_SIZE: usize = 64 * 1024 * 1024;

/// Everything needed to open an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Store directory. Holds `wal.log` and the `sst/` table directory.
    pub dir: PathBuf,
    pub flush_threshold: usize,
    /// fsync the WAL after every committed transaction.
    pub sync_writes: bool,
    pub max_key_size: usize,
    pub max_value_size: usize,
}

impl EngineConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            sync_writes: false,
            max_key_size: DEFAULT_MAX_KEY_SIZE,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
        }
    }

    pub fn with_flush_threshold(mut self, flush_threshold: usize) -> Self {
        self.flush_threshold = flush_threshold;
        self
    }

    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    pub fn wal_path(&self) -> PathBuf {
        self.dir.join("wal.log")
    }

    pub fn sst_dir(&self) -> PathBuf {
        self.dir.join("sst")
    }
}
