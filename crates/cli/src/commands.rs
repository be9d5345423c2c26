//! Command-line surface and command dispatch.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use crate::backend::Backend;
use crate::codec::Format;
use crate::config::{EngineConfig, DEFAULT_FLUSH_THRESHOLD};
use crate::store::{EntryOptions, Store};

#[derive(Debug, Parser)]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect and mutate an embedded key-value store")]
pub struct Cli {
    /// Store directory, created if missing.
    #[arg(long, global = true, env = "KVCTL_DIR")]
    pub dir: Option<PathBuf>,

    /// fsync the write-ahead log on every commit.
    #[arg(long, global = true)]
    pub sync_writes: bool,

    /// Memtable size in bytes that triggers a flush to disk.
    #[arg(long, global = true, default_value_t = DEFAULT_FLUSH_THRESHOLD)]
    pub flush_threshold: usize,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let dir = self.dir.clone().context("--dir is required")?;
        Ok(EngineConfig::new(dir)
            .with_flush_threshold(self.flush_threshold)
            .with_sync_writes(self.sync_writes))
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the value stored under a key.
    Get {
        key: String,
        /// Rendering of the value: string, int64AsBytes or json.
        #[arg(long, default_value_t = Format::String)]
        fmt: Format,
    },
    /// List keys with their size, version and meta byte.
    List {
        #[arg(long, default_value = "")]
        prefix: String,
        /// Rows to print; 0 prints only the total.
        #[arg(long, default_value_t = 100)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Store a value under a key.
    Set {
        key: String,
        value: String,
        /// Time to live, e.g. `30s` or `1h 15m`. Zero never expires.
        #[arg(long, value_parser = humantime::parse_duration)]
        ttl: Option<Duration>,
    },
    /// Delete one or more keys atomically.
    Delete {
        #[arg(required = true)]
        keys: Vec<String>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "get",
            Command::List { .. } => "list",
            Command::Set { .. } => "set",
            Command::Delete { .. } => "delete",
        }
    }
}

/// Runs `command` against `store`, writing user-facing output to `out`.
pub fn run<B: Backend>(command: &Command, store: &mut Store<B>, out: &mut impl Write) -> Result<()> {
    match command {
        Command::Get { key, fmt } => {
            let value = store.get(key, *fmt)?;
            writeln!(out, "{value}")?;
        }
        Command::List {
            prefix,
            limit,
            offset,
        } => {
            let (rows, total) = store.list(prefix, *limit, *offset)?;
            for row in &rows {
                writeln!(out, "{row}")?;
            }
            writeln!(out, "total: {total}")?;
        }
        Command::Set { key, value, ttl } => {
            let opts = ttl.map(EntryOptions::with_ttl);
            store.set(key, value, opts.as_ref())?;
            info!(key = %key, "set");
        }
        Command::Delete { keys } => {
            store.delete(keys.as_slice())?;
            info!(count = keys.len(), "deleted");
        }
    }
    Ok(())
}

/// Runs `command` and closes `store` whatever the outcome, so the write-ahead
/// log is synced and the directory lock released even when the command fails.
/// A command error takes precedence over a close error.
pub fn run_and_close<B: Backend>(
    command: &Command,
    mut store: Store<B>,
    out: &mut impl Write,
) -> Result<()> {
    let outcome = run(command, &mut store, out).and_then(|()| out.flush().context("flush output"));
    let closed = store.close().context("close store");

    outcome.with_context(|| format!("{} failed", command.name()))?;
    closed
}

/// Opens the store named by `cli` and runs its command against it.
pub fn execute(cli: &Cli, out: &mut impl Write) -> Result<()> {
    let config = cli.engine_config()?;
    debug!(dir = %config.dir.display(), command = cli.command.name(), "opening store");

    let store = Store::open(&config)?;
    run_and_close(&cli.command, store, out)
}
