use anyhow::{bail, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use memtable::Memtable;
use std::fs::{rename, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::format::write_footer;

/// Writes a [`Memtable`] to disk as an immutable SSTable file.
///
/// The table is encoded in memory, written to a temporary file, fsynced and
/// then renamed over the final path, so a crash never leaves a half-written
/// `.sst` behind.
pub struct SSTableWriter {}

impl SSTableWriter {
    /// Flushes `mem` to a new SSTable file at `path`, tombstones included.
    ///
    /// # Errors
    ///
    /// Fails if the memtable is empty or on any I/O failure.
    pub fn write_from_memtable(path: &Path, mem: &Memtable) -> Result<()> {
        if mem.is_empty() {
            bail!("refusing to write an empty sstable");
        }

        let mut buf = Vec::with_capacity(mem.approx_size() + mem.len() * 48);
        let mut offsets = Vec::with_capacity(mem.len());

        // DATA
        for (key, entry) in mem.iter() {
            offsets.push(buf.len() as u64);

            buf.write_u32::<LittleEndian>(key.len() as u32)?;
            buf.extend_from_slice(key);
            match &entry.value {
                Some(v) => {
                    buf.write_u8(1)?;
                    buf.write_u32::<LittleEndian>(v.len() as u32)?;
                    buf.extend_from_slice(v);
                }
                None => buf.write_u8(0)?,
            }
        }

        // INDEX
        let index_offset = buf.len() as u64;
        for ((key, entry), data_offset) in mem.iter().zip(offsets) {
            buf.write_u32::<LittleEndian>(key.len() as u32)?;
            buf.extend_from_slice(key);
            buf.write_u64::<LittleEndian>(data_offset)?;
            buf.write_u64::<LittleEndian>(entry.seq)?;
            buf.write_u8(entry.user_meta)?;
            buf.write_u64::<LittleEndian>(entry.expires_at)?;
            let value_len = entry.value.as_ref().map(|v| v.len() as u32);
            buf.write_u8(value_len.is_some() as u8)?;
            buf.write_u32::<LittleEndian>(value_len.unwrap_or(0))?;
        }

        write_footer(&mut buf, index_offset)?;

        let tmp_path = path.with_extension("sst.tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        rename(tmp_path, path)?;

        Ok(())
    }
}
