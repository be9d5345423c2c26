use anyhow::{bail, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::ops::Bound;
use std::path::{Path, PathBuf};

use crate::format::{read_footer, FOOTER_BYTES, SSTABLE_MAGIC};

/// Everything the index knows about one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Byte offset of the record in the data section.
    pub offset: u64,
    pub seq: u64,
    pub user_meta: u8,
    /// Unix seconds, `0` = never.
    pub expires_at: u64,
    /// `None` for tombstones.
    pub value_len: Option<u32>,
}

impl IndexEntry {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at != 0 && self.expires_at <= now
    }
}

/// Reads an SSTable for point lookups and metadata-only prefix scans.
///
/// [`open`](SSTableReader::open) loads the whole index into memory. The data
/// file is not held open: each value read (or batch of reads) opens, seeks
/// and closes it.
pub struct SSTableReader {
    path: PathBuf,
    index: BTreeMap<Vec<u8>, IndexEntry>,
}

impl SSTableReader {
    /// Opens an SSTable file and loads its index.
    ///
    /// # Errors
    ///
    /// Fails if the file is smaller than the footer, the magic is not "SST2",
    /// the index offset points outside the file, or on any I/O failure.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let mut f = File::open(&path_buf)?;
        let filesize = f.metadata()?.len();

        if filesize < FOOTER_BYTES {
            bail!("sstable file too small");
        }

        let (index_offset, magic) = read_footer(&mut f)?;
        if magic != SSTABLE_MAGIC {
            bail!("invalid sstable magic: {:x}", magic);
        }
        let index_end = filesize - FOOTER_BYTES;
        if index_offset > index_end {
            bail!("invalid index_offset");
        }

        f.seek(SeekFrom::Start(index_offset))?;
        let mut r = BufReader::new(f).take(index_end - index_offset);
        let mut index = BTreeMap::new();

        while r.limit() > 0 {
            let key_len = r.read_u32::<LittleEndian>()? as usize;
            let mut key = vec![0u8; key_len];
            r.read_exact(&mut key)?;
            let offset = r.read_u64::<LittleEndian>()?;
            let seq = r.read_u64::<LittleEndian>()?;
            let user_meta = r.read_u8()?;
            let expires_at = r.read_u64::<LittleEndian>()?;
            let present = r.read_u8()?;
            let val_len = r.read_u32::<LittleEndian>()?;
            if offset >= index_offset {
                bail!("index entry points past the data section");
            }
            index.insert(
                key,
                IndexEntry {
                    offset,
                    seq,
                    user_meta,
                    expires_at,
                    value_len: (present == 1).then_some(val_len),
                },
            );
        }

        Ok(Self {
            path: path_buf,
            index,
        })
    }

    /// Index metadata for `key` together with the stored key.
    pub fn entry_key_value(&self, key: &[u8]) -> Option<(&[u8], &IndexEntry)> {
        self.index.get_key_value(key).map(|(k, e)| (k.as_slice(), e))
    }

    /// Reads the value of the record at `offset`, `None` for a tombstone.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or when the record at `offset` does not carry
    /// `key`.
    pub fn read_value(&self, key: &[u8], offset: u64) -> Result<Option<Vec<u8>>> {
        let mut f = File::open(&self.path)?;
        f.seek(SeekFrom::Start(offset))?;
        let (value, _) = read_record(&mut f, key, offset)?;
        Ok(value)
    }

    /// Reads several live values through one buffered handle.
    ///
    /// `requests` are `(key, offset)` pairs; ascending offsets are read
    /// without seeking. Every requested record must hold a value.
    pub fn read_values(&self, requests: &[(&[u8], u64)]) -> Result<Vec<Vec<u8>>> {
        let mut r = BufReader::new(File::open(&self.path)?);
        let mut pos = 0u64;
        let mut values = Vec::with_capacity(requests.len());

        for &(key, offset) in requests {
            if offset != pos {
                r.seek_relative(offset as i64 - pos as i64)?;
            }
            let (value, consumed) = read_record(&mut r, key, offset)?;
            pos = offset + consumed;
            match value {
                Some(v) => values.push(v),
                None => bail!("record at offset {offset} is a tombstone"),
            }
        }
        Ok(values)
    }

    /// Index entries whose key starts with `prefix`, in ascending key order.
    pub fn scan_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> impl Iterator<Item = (&'a [u8], &'a IndexEntry)> + 'a {
        self.index
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.as_slice(), e))
    }

    /// Highest version stored in this table.
    pub fn max_seq(&self) -> u64 {
        self.index.values().map(|e| e.seq).max().unwrap_or(0)
    }
}

/// Reads one data record positioned at the current offset. Returns the value
/// and the number of bytes consumed.
fn read_record<R: Read>(r: &mut R, key: &[u8], offset: u64) -> Result<(Option<Vec<u8>>, u64)> {
    let key_len = r.read_u32::<LittleEndian>()? as usize;
    let mut key_buf = vec![0u8; key_len];
    r.read_exact(&mut key_buf)?;
    if key_buf.as_slice() != key {
        bail!("index pointed to mismatching key at offset {offset}");
    }

    let mut consumed = 4 + key_len as u64 + 1;
    if r.read_u8()? == 1 {
        let val_len = r.read_u32::<LittleEndian>()? as usize;
        let mut val = vec![0u8; val_len];
        r.read_exact(&mut val)?;
        consumed += 4 + val_len as u64;
        Ok((Some(val), consumed))
    } else {
        Ok((None, consumed))
    }
}
