//! Storage engine that ties together the Memtable, WAL, and SSTable layers.

use std::borrow::Cow;
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use memtable::{Memtable, ValueEntry};
use sstable::{IndexEntry, SSTableReader, SSTableWriter, RECORD_OVERHEAD};
use tracing::{debug, warn};
use wal::{WalFrame, WalOp, WalReader, WalWriter};

use crate::backend::{
    self, Backend, Item, ItemIter, ItemValue, IterOptions, ReadTxn, ValueSource, WriteTxn,
};
use crate::config::EngineConfig;
use crate::error::EngineError;

/// Replays a WAL file into the given memtable, returning the highest commit
/// version encountered.
///
/// A missing WAL file is a fresh start and yields `Ok(0)`. A torn final
/// frame is cut off so later appends start on a frame boundary.
///
/// # Errors
///
/// Propagates I/O and corruption errors from [`WalReader::replay`].
pub fn replay_wal_and_build(path: &Path, mem: &mut Memtable) -> Result<u64, EngineError> {
    let mut reader = match WalReader::open(path) {
        Ok(reader) => reader,
        Err(wal::WalError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut max_seq = 0u64;
    let frames = reader.replay(|frame| {
        max_seq = max_seq.max(frame.seq);
        apply_frame(mem, frame);
    })?;

    let valid_len = reader.valid_len();
    let file = OpenOptions::new().write(true).open(path)?;
    let file_len = file.metadata()?.len();
    if file_len > valid_len {
        warn!(
            path = %path.display(),
            dropped = file_len - valid_len,
            "truncating torn wal tail"
        );
        file.set_len(valid_len)?;
        file.sync_all()?;
    }

    debug!(frames, max_seq, path = %path.display(), "replayed wal");
    Ok(max_seq)
}

/// Name of the lock file inside the store directory.
pub const LOCK_FILE: &str = "LOCK";

/// Exclusive claim on a store directory. The file holds the owner's pid and
/// is removed when the claim is dropped.
#[derive(Debug)]
struct DirLock {
    path: PathBuf,
}

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self, EngineError> {
        let path = dir.join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(EngineError::Locked { path });
            }
            Err(e) => return Err(e.into()),
        };
        let lock = Self { path };
        writeln!(file, "{}", std::process::id())?;
        Ok(lock)
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release store lock");
        }
    }
}

/// Applies every operation of a committed frame at the frame's version.
fn apply_frame(mem: &mut Memtable, frame: WalFrame) {
    let seq = frame.seq;
    for op in frame.ops {
        match op {
            WalOp::Put {
                key,
                value,
                user_meta,
                expires_at,
            } => {
                mem.apply(
                    key,
                    ValueEntry::live(seq, value)
                        .with_user_meta(user_meta)
                        .expiring_at(expires_at),
                );
            }
            WalOp::Del { key } => {
                mem.delete(key, seq);
            }
        }
    }
}

/// The central storage engine orchestrating Memtable, WAL, and SSTables.
///
/// # Write Path
///
/// A [`EngineWriteTxn`] stages mutations in memory. On commit:
///
/// 1. Assign the next commit version to the whole transaction.
/// 2. Append all of its operations as one WAL frame.
/// 3. Apply them to the Memtable.
/// 4. If `approx_size >= flush_threshold`, flush the Memtable to a new SSTable,
///    truncate the WAL, and reset the Memtable. The commit is durable once the
///    WAL append succeeds, so a failed flush is logged and retried on the next
///    commit instead of being reported.
///
/// # Read Path
///
/// 1. Check the Memtable (freshest data, includes tombstones).
/// 2. Check SSTables from newest to oldest.
/// 3. First match wins; tombstones and expired entries hide the key.
///
/// Read transactions borrow the engine immutably, so no write can interleave
/// with a snapshot.
///
/// # Recovery
///
/// [`Engine::open`] replays the WAL into a fresh Memtable and loads every
/// existing `.sst` file from the SST directory. Only one engine may hold a
/// directory at a time; see [`LOCK_FILE`].
pub struct Engine {
    mem: Memtable,
    sstables: Vec<SSTableReader>,
    sst_dir: PathBuf,
    wal_writer: WalWriter,
    config: EngineConfig,

    /// Version of the last committed transaction.
    pub seq: u64,

    // dropped last, after the WAL handle is closed
    _lock: DirLock,
}

impl Engine {
    /// Opens (or creates) the store rooted at `config.dir`.
    ///
    /// # Recovery Steps
    ///
    /// 1. Create the store and SST directories if they do not exist.
    /// 2. Take the directory lock, failing with [`EngineError::Locked`] if
    ///    another handle has it.
    /// 3. Replay the WAL into a fresh Memtable.
    /// 4. Open every `.sst` file, newest first.
    /// 5. Resume versioning after the highest version seen anywhere.
    /// 6. Open the WAL writer in append mode.
    pub fn open(config: &EngineConfig) -> Result<Self, EngineError> {
        let wal_path = config.wal_path();
        let sst_dir = config.sst_dir();
        fs::create_dir_all(&sst_dir)?;
        let lock = DirLock::acquire(&config.dir)?;

        let mut mem = Memtable::new();
        let mut seq = replay_wal_and_build(&wal_path, &mut mem)?;

        let mut paths: Vec<_> = fs::read_dir(&sst_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "sst").unwrap_or(false))
            .collect();

        // names embed a zero-padded version, so lexical order is age order
        paths.sort();
        paths.reverse();

        let mut sstables = Vec::with_capacity(paths.len());
        for path in paths {
            let table = SSTableReader::open(&path)?;
            seq = seq.max(table.max_seq());
            sstables.push(table);
        }

        let wal_writer = WalWriter::create(&wal_path, config.sync_writes)?;

        debug!(
            dir = %config.dir.display(),
            sstables = sstables.len(),
            memtable_entries = mem.len(),
            seq,
            "opened engine"
        );

        Ok(Self {
            mem,
            sstables,
            sst_dir,
            wal_writer,
            config: config.clone(),
            seq,
            _lock: lock,
        })
    }

    /// Number of SSTables currently on disk.
    pub fn sstable_count(&self) -> usize {
        self.sstables.len()
    }

    /// Syncs the WAL and releases the handle and the directory lock.
    pub fn close(mut self) -> Result<(), EngineError> {
        self.wal_writer.sync()?;
        debug!(seq = self.seq, "closed engine");
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> Result<(), EngineError> {
        if key.is_empty() {
            return Err(EngineError::EmptyKey);
        }
        if key.len() > self.config.max_key_size {
            return Err(EngineError::KeyTooLarge {
                size: key.len(),
                max: self.config.max_key_size,
            });
        }
        Ok(())
    }

    fn commit_frame(&mut self, ops: Vec<WalOp>) -> Result<(), EngineError> {
        if ops.is_empty() {
            return Ok(());
        }

        let seq = self.seq.saturating_add(1);
        let frame = WalFrame { seq, ops };

        // WAL first: if this fails nothing has been applied
        self.wal_writer.append(&frame)?;
        self.seq = seq;

        let count = frame.ops.len();
        apply_frame(&mut self.mem, frame);
        debug!(seq, ops = count, "committed transaction");

        if self.mem.approx_size() >= self.config.flush_threshold {
            if let Err(e) = self.flush() {
                warn!(seq, error = %e, "flush failed; memtable kept for the next commit");
            }
        }
        Ok(())
    }

    /// Flushes the current Memtable to a new SSTable, truncates the WAL, and
    /// resets the Memtable.
    ///
    /// # Steps
    ///
    /// 1. Name the table `sst-{seq:020}.sst` so lexical order is age order.
    /// 2. Write it via [`SSTableWriter::write_from_memtable`] (temp + rename).
    /// 3. Open the new SSTable.
    /// 4. Truncate the WAL in place.
    /// 5. Insert the table at position 0 (newest) and reset the Memtable.
    ///
    /// An error before step 5 leaves the Memtable and the WAL holding every
    /// entry, so the flush can simply be attempted again.
    fn flush(&mut self) -> Result<(), EngineError> {
        let sst_path = self.sst_dir.join(format!("sst-{:020}.sst", self.seq));
        SSTableWriter::write_from_memtable(&sst_path, &self.mem)?;
        let reader = SSTableReader::open(&sst_path)?;

        // the table is synced; the WAL contents are now redundant
        self.wal_writer.reset()?;

        let entries = self.mem.len();
        self.mem = Memtable::new();
        self.sstables.insert(0, reader);

        debug!(path = %sst_path.display(), entries, "flushed memtable");
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn estimated_size(key: &[u8], value_len: usize) -> i64 {
    (key.len() as u64 + value_len as u64 + RECORD_OVERHEAD) as i64
}

impl Backend for Engine {
    type Reader<'a> = EngineReadTxn<'a>;
    type Writer<'a> = EngineWriteTxn<'a>;

    fn read_txn(&self) -> EngineReadTxn<'_> {
        EngineReadTxn {
            engine: self,
            now: unix_now(),
        }
    }

    fn write_txn(&mut self) -> EngineWriteTxn<'_> {
        EngineWriteTxn {
            engine: self,
            now: unix_now(),
            pending: BTreeMap::new(),
        }
    }

    fn close(self) -> Result<(), EngineError> {
        Engine::close(self)
    }
}

/// A consistent view of the engine. Expiry is judged against the clock
/// reading taken when the transaction started.
pub struct EngineReadTxn<'a> {
    engine: &'a Engine,
    now: u64,
}

impl ValueSource for SSTableReader {
    fn load_value(&self, key: &[u8], offset: u64) -> Result<Vec<u8>, EngineError> {
        self.read_value(key, offset)?.ok_or_else(|| {
            EngineError::Table(anyhow::anyhow!("no value at offset {offset}"))
        })
    }
}

fn mem_item<'a>(key: &'a [u8], entry: &'a ValueEntry, now: u64) -> Option<Item<'a>> {
    if !entry.is_visible(now) {
        return None;
    }
    let value = entry.value.as_deref()?;
    Some(Item {
        key: Cow::Borrowed(key),
        version: entry.seq,
        user_meta: entry.user_meta,
        expires_at: entry.expires_at,
        estimated_size: estimated_size(key, value.len()),
        value: ItemValue::Loaded(Cow::Borrowed(value)),
    })
}

/// Builds an item from index metadata alone; the value stays on disk.
fn table_item<'a>(
    table: &'a SSTableReader,
    key: &'a [u8],
    meta: &IndexEntry,
    now: u64,
) -> Option<Item<'a>> {
    let value_len = meta.value_len?;
    if meta.is_expired(now) {
        return None;
    }
    Some(Item {
        key: Cow::Borrowed(key),
        version: meta.seq,
        user_meta: meta.user_meta,
        expires_at: meta.expires_at,
        estimated_size: estimated_size(key, value_len as usize),
        value: ItemValue::Deferred {
            source: table,
            offset: meta.offset,
        },
    })
}

impl<'a> ReadTxn for EngineReadTxn<'a> {
    fn get(&self, key: &[u8]) -> Result<Option<Item<'_>>, EngineError> {
        let engine = self.engine;

        // memtable first; a tombstone here hides every older table
        if let Some((k, entry)) = engine.mem.get_key_value(key) {
            return Ok(mem_item(k, entry, self.now));
        }

        for table in &engine.sstables {
            if let Some((k, meta)) = table.entry_key_value(key) {
                return Ok(table_item(table, k, meta, self.now));
            }
        }

        Ok(None)
    }

    fn iter<'b>(&'b self, prefix: &'b [u8], opts: IterOptions) -> ItemIter<'b> {
        let engine: &'b Engine = self.engine;

        let mut sources: Vec<Source<'b>> = Vec::with_capacity(engine.sstables.len() + 1);
        sources.push(Box::new(
            engine
                .mem
                .scan_prefix(prefix)
                .map(|(k, e)| (k, Candidate::Mem(e))),
        ));
        for table in &engine.sstables {
            sources.push(Box::new(
                table
                    .scan_prefix(prefix)
                    .map(move |(k, meta)| (k, Candidate::Table(table, meta))),
            ));
        }

        Box::new(PrefixIter {
            now: self.now,
            sources: sources.into_iter().map(Iterator::peekable).collect(),
            prefetch_values: opts.prefetch_values,
            batch_size: opts.prefetch_size.max(1),
            ready: VecDeque::new(),
            failed: false,
        })
    }
}

enum Candidate<'a> {
    Mem(&'a ValueEntry),
    Table(&'a SSTableReader, &'a IndexEntry),
}

type Source<'a> = Box<dyn Iterator<Item = (&'a [u8], Candidate<'a>)> + 'a>;

/// K-way merge over the memtable and every SSTable.
///
/// `sources` is ordered newest first; when several sources hold the same key
/// the newest one wins and the others are skipped past it. Visible items are
/// resolved `batch_size` at a time. With value prefetching each batch costs
/// one sequential read per table it touches.
struct PrefixIter<'a> {
    now: u64,
    sources: Vec<Peekable<Source<'a>>>,
    prefetch_values: bool,
    batch_size: usize,
    ready: VecDeque<Item<'a>>,
    failed: bool,
}

/// Items of one batch that live in the same table, as (batch index, offset).
type TableBatch<'a> = (&'a SSTableReader, Vec<(usize, u64)>);

impl<'a> PrefixIter<'a> {
    /// Next visible item in key order, plus the table and record offset its
    /// value lives at when it came from disk.
    fn next_visible(&mut self) -> Option<(Item<'a>, Option<(&'a SSTableReader, u64)>)> {
        loop {
            let mut smallest: Option<&'a [u8]> = None;
            for source in self.sources.iter_mut() {
                if let Some((k, _)) = source.peek() {
                    if smallest.map_or(true, |s| *k < s) {
                        smallest = Some(*k);
                    }
                }
            }
            let key = smallest?;

            let mut winner = None;
            for source in self.sources.iter_mut() {
                if let Some((_, candidate)) = source.next_if(|(k, _)| *k == key) {
                    winner.get_or_insert(candidate);
                }
            }

            match winner? {
                Candidate::Mem(entry) => {
                    if let Some(item) = mem_item(key, entry, self.now) {
                        return Some((item, None));
                    }
                }
                Candidate::Table(table, meta) => {
                    if let Some(item) = table_item(table, key, meta, self.now) {
                        return Some((item, Some((table, meta.offset))));
                    }
                }
            }
        }
    }

    fn refill(&mut self) -> Result<(), EngineError> {
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut tables: Vec<TableBatch<'a>> = Vec::new();

        while batch.len() < self.batch_size {
            let Some((item, origin)) = self.next_visible() else {
                break;
            };
            if let (true, Some((table, offset))) = (self.prefetch_values, origin) {
                let at = (batch.len(), offset);
                match tables.iter_mut().find(|(t, _)| std::ptr::eq(*t, table)) {
                    Some((_, wanted)) => wanted.push(at),
                    None => tables.push((table, vec![at])),
                }
            }
            batch.push(item);
        }

        for (table, wanted) in tables {
            let requests: Vec<(&[u8], u64)> = wanted
                .iter()
                .map(|&(i, offset)| (batch[i].key.as_ref(), offset))
                .collect();
            let values = table.read_values(&requests)?;
            for ((i, _), value) in wanted.into_iter().zip(values) {
                batch[i].value = ItemValue::Loaded(Cow::Owned(value));
            }
        }

        self.ready.extend(batch);
        Ok(())
    }
}

impl<'a> Iterator for PrefixIter<'a> {
    type Item = Result<Item<'a>, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.ready.is_empty() && !self.failed {
            if let Err(e) = self.refill() {
                self.failed = true;
                return Some(Err(e));
            }
        }
        self.ready.pop_front().map(Ok)
    }
}

enum Pending {
    Put {
        value: Vec<u8>,
        expires_at: u64,
    },
    Del,
}

/// Staged mutations against an exclusively borrowed engine. The last
/// operation staged for a key wins.
pub struct EngineWriteTxn<'a> {
    engine: &'a mut Engine,
    now: u64,
    pending: BTreeMap<Vec<u8>, Pending>,
}

impl WriteTxn for EngineWriteTxn<'_> {
    fn set(&mut self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> Result<(), EngineError> {
        self.engine.check_key(key)?;
        if value.len() > self.engine.config.max_value_size {
            return Err(EngineError::ValueTooLarge {
                size: value.len(),
                max: self.engine.config.max_value_size,
            });
        }
        self.pending.insert(
            key.to_vec(),
            Pending::Put {
                value: value.to_vec(),
                expires_at: backend::expires_at(self.now, ttl),
            },
        );
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), EngineError> {
        self.engine.check_key(key)?;
        self.pending.insert(key.to_vec(), Pending::Del);
        Ok(())
    }

    fn commit(self) -> Result<(), EngineError> {
        let ops = self
            .pending
            .into_iter()
            .map(|(key, op)| match op {
                Pending::Put { value, expires_at } => WalOp::Put {
                    key,
                    value,
                    user_meta: 0,
                    expires_at,
                },
                Pending::Del => WalOp::Del { key },
            })
            .collect();
        self.engine.commit_frame(ops)
    }
}
