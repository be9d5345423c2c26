//! SSTable binary format constants and footer read/write helpers.
//!
//! The footer is always the **last 12 bytes** of an SSTable file:
//!
//! ```text
//! [index_offset: u64 LE][magic: u32 LE = 0x5353_5432]
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Result as IoResult, Seek, SeekFrom, Write};

/// Magic number identifying SSTable v2 files (ASCII "SST2").
pub const SSTABLE_MAGIC: u32 = 0x5353_5432;

/// Size of the footer in bytes: 8 (`index_offset`) + 4 (`magic`).
pub const FOOTER_BYTES: u64 = 8 + 4;

/// Fixed bytes spent per entry besides key and value: the data record header
/// plus the index entry, excluding the key copy held by the index.
pub const RECORD_OVERHEAD: u64 = (4 + 1 + 4) + (4 + 8 + 8 + 1 + 8 + 1 + 4);

/// Byte offset where the footer starts. Saturates to 0 for tiny files.
pub fn footer_pos(filesize: u64) -> u64 {
    filesize.saturating_sub(FOOTER_BYTES)
}

pub fn write_footer<W: Write>(w: &mut W, index_offset: u64) -> IoResult<()> {
    w.write_u64::<LittleEndian>(index_offset)?;
    w.write_u32::<LittleEndian>(SSTABLE_MAGIC)?;
    Ok(())
}

/// Reads `(index_offset, magic)`. Leaves the cursor at the end of the file.
pub fn read_footer<R: Read + Seek>(r: &mut R) -> IoResult<(u64, u32)> {
    let filesize = r.seek(SeekFrom::End(0))?;
    r.seek(SeekFrom::Start(footer_pos(filesize)))?;
    let index_offset = r.read_u64::<LittleEndian>()?;
    let magic = r.read_u32::<LittleEndian>()?;
    Ok((index_offset, magic))
}
