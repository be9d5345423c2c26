//! Error types for the engine and the store access layer.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use wal::WalError;

use crate::codec::CodecError;

/// Failures raised by a storage backend.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("wal: {0}")]
    Wal(#[from] WalError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("sstable: {0:#}")]
    Table(#[from] anyhow::Error),

    #[error("key cannot be empty")]
    EmptyKey,

    #[error("key is {size} bytes, limit is {max}")]
    KeyTooLarge { size: usize, max: usize },

    #[error("value is {size} bytes, limit is {max}")]
    ValueTooLarge { size: usize, max: usize },

    /// Another handle holds the store directory.
    #[error("store is already open elsewhere (lock file {})", path.display())]
    Locked { path: PathBuf },
}

/// Errors returned by [`Store`](crate::store::Store) operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key {key} not found")]
    NotFound { key: String },

    #[error("cannot decode value of key {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: CodecError,
    },

    #[error("{context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: EngineError,
    },
}

impl StoreError {
    pub(crate) fn storage(context: impl Into<String>) -> impl FnOnce(EngineError) -> Self {
        let context = context.into();
        move |source| StoreError::Storage { context, source }
    }
}
