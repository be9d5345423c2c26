//! Write-ahead log made of transaction frames.
//!
//! A frame is the unit of atomicity: every operation of one committed write
//! transaction is encoded into a single CRC-protected frame, so replay either
//! sees the whole transaction or none of it.
//!
//! ```text
//! frame: frame_len(u32) | crc(u32) | body
//! body:  seq(u64) | op_count(u32) | op...
//! op:    kind(u8) | key_len(u32) | key | [user_meta(u8) | expires_at(u64) | val_len(u32) | val]
//! ```
//!
//! All integers are little-endian. `frame_len` counts the crc and the body.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use thiserror::Error;

const OP_PUT: u8 = 0;
const OP_DEL: u8 = 1;

/// Upper bound on `frame_len`. Larger headers are rejected on both sides
/// instead of being trusted for an allocation.
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalOp {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        user_meta: u8,
        expires_at: u64,
    },
    Del {
        key: Vec<u8>,
    },
}

/// All operations committed by one write transaction at version `seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalFrame {
    pub seq: u64,
    pub ops: Vec<WalOp>,
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt frame")]
    Corrupt,
    #[error("frame of {0} bytes exceeds the {} byte limit", MAX_FRAME_LEN)]
    FrameTooLarge(usize),
}

/// Appends frames to the log and optionally fsyncs after each one.
pub struct WalWriter {
    file: File,
    sync: bool,
    /// End of the last fully written frame.
    len: u64,
    /// A failed append may have left bytes past `len`.
    torn: bool,
}

impl WalWriter {
    pub fn create<P: AsRef<Path>>(path: P, sync: bool) -> Result<Self, WalError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            sync,
            len,
            torn: false,
        })
    }

    /// Appends one frame with a single `write_all` so a crash can only leave a
    /// torn tail, never an interleaved frame.
    ///
    /// A failed write is cut back to the previous frame boundary so later
    /// appends stay readable.
    pub fn append(&mut self, frame: &WalFrame) -> Result<(), WalError> {
        let body = encode_body(frame)?;
        if body.len() + 4 > MAX_FRAME_LEN as usize {
            return Err(WalError::FrameTooLarge(body.len() + 4));
        }
        if self.torn {
            self.file.set_len(self.len)?;
            self.torn = false;
        }

        let mut hasher = Crc32::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let mut buf = Vec::with_capacity(body.len() + 8);
        buf.write_u32::<LittleEndian>(body.len() as u32 + 4)?;
        buf.write_u32::<LittleEndian>(crc)?;
        buf.extend_from_slice(&body);

        if let Err(e) = self.file.write_all(&buf).and_then(|()| self.file.flush()) {
            self.torn = self.file.set_len(self.len).is_err();
            return Err(e.into());
        }
        self.len += buf.len() as u64;

        if self.sync {
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Forces everything appended so far to stable storage.
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Empties the log in place once its frames are persisted elsewhere.
    pub fn reset(&mut self) -> Result<(), WalError> {
        self.file.set_len(0)?;
        self.len = 0;
        self.torn = false;
        if self.sync {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

fn encode_body(frame: &WalFrame) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_u64::<LittleEndian>(frame.seq)?;
    buf.write_u32::<LittleEndian>(frame.ops.len() as u32)?;
    for op in &frame.ops {
        match op {
            WalOp::Put {
                key,
                value,
                user_meta,
                expires_at,
            } => {
                buf.write_u8(OP_PUT)?;
                buf.write_u32::<LittleEndian>(key.len() as u32)?;
                buf.extend_from_slice(key);
                buf.write_u8(*user_meta)?;
                buf.write_u64::<LittleEndian>(*expires_at)?;
                buf.write_u32::<LittleEndian>(value.len() as u32)?;
                buf.extend_from_slice(value);
            }
            WalOp::Del { key } => {
                buf.write_u8(OP_DEL)?;
                buf.write_u32::<LittleEndian>(key.len() as u32)?;
                buf.extend_from_slice(key);
            }
        }
    }
    Ok(buf)
}

fn decode_body(mut br: &[u8]) -> Result<WalFrame, WalError> {
    // any short read inside a checksummed body means the body itself is bad
    let corrupt = |_: io::Error| WalError::Corrupt;

    let seq = br.read_u64::<LittleEndian>().map_err(corrupt)?;
    let count = br.read_u32::<LittleEndian>().map_err(corrupt)?;
    let mut ops = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let kind = br.read_u8().map_err(corrupt)?;
        let key = read_bytes(&mut br).map_err(corrupt)?;
        match kind {
            OP_PUT => {
                let user_meta = br.read_u8().map_err(corrupt)?;
                let expires_at = br.read_u64::<LittleEndian>().map_err(corrupt)?;
                let value = read_bytes(&mut br).map_err(corrupt)?;
                ops.push(WalOp::Put {
                    key,
                    value,
                    user_meta,
                    expires_at,
                });
            }
            OP_DEL => ops.push(WalOp::Del { key }),
            _ => return Err(WalError::Corrupt),
        }
    }
    if !br.is_empty() {
        return Err(WalError::Corrupt);
    }
    Ok(WalFrame { seq, ops })
}

fn read_bytes(br: &mut &[u8]) -> io::Result<Vec<u8>> {
    let len = br.read_u32::<LittleEndian>()? as usize;
    if len > br.len() {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    let (bytes, rest) = br.split_at(len);
    *br = rest;
    Ok(bytes.to_vec())
}

/// Yields committed frames in log order.
pub struct WalReader<R: Read> {
    rdr: BufReader<R>,
    valid_len: u64,
}

impl WalReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<WalReader<File>, WalError> {
        let f = File::open(path)?;
        Ok(WalReader::from_reader(f))
    }
}

impl<R: Read> WalReader<R> {
    pub fn from_reader(reader: R) -> Self {
        WalReader {
            rdr: BufReader::new(reader),
            valid_len: 0,
        }
    }

    /// Bytes covered by the frames replayed so far. Anything past this offset
    /// is a torn tail and can be truncated before appending.
    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    /// Calls `apply` for every complete frame and returns how many were applied.
    ///
    /// A frame cut short by EOF was never acknowledged as committed, so it ends
    /// the replay without an error. A checksum mismatch is reported as
    /// [`WalError::Corrupt`].
    pub fn replay<F>(&mut self, mut apply: F) -> Result<usize, WalError>
    where
        F: FnMut(WalFrame),
    {
        let mut applied = 0;
        loop {
            let frame_len = match self.rdr.read_u32::<LittleEndian>() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(applied),
                Err(e) => return Err(WalError::Io(e)),
            };
            if !(4..=MAX_FRAME_LEN).contains(&frame_len) {
                return Err(WalError::Corrupt);
            }

            let mut rest = vec![0u8; frame_len as usize];
            match self.rdr.read_exact(&mut rest) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(applied),
                Err(e) => return Err(WalError::Io(e)),
            }

            let crc = (&rest[..4]).read_u32::<LittleEndian>()?;
            let body = &rest[4..];
            let mut hasher = Crc32::new();
            hasher.update(body);
            if hasher.finalize() != crc {
                return Err(WalError::Corrupt);
            }

            apply(decode_body(body)?);
            applied += 1;
            self.valid_len += 4 + u64::from(frame_len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn put(key: &[u8], value: &[u8]) -> WalOp {
        WalOp::Put {
            key: key.to_vec(),
            value: value.to_vec(),
            user_meta: 0,
            expires_at: 0,
        }
    }

    fn read_all(path: &Path) -> Result<Vec<WalFrame>, WalError> {
        let mut frames = Vec::new();
        WalReader::open(path)?.replay(|f| frames.push(f))?;
        Ok(frames)
    }

    #[test]
    fn frames_replay_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        let frames = vec![
            WalFrame {
                seq: 1,
                ops: vec![put(b"k", b"v1"), put(b"k2", b"v2")],
            },
            WalFrame {
                seq: 2,
                ops: vec![
                    WalOp::Del { key: b"k".to_vec() },
                    WalOp::Put {
                        key: b"ttl".to_vec(),
                        value: b"x".to_vec(),
                        user_meta: 3,
                        expires_at: 1_700_000_000,
                    },
                ],
            },
        ];

        {
            let mut w = WalWriter::create(&path, true).unwrap();
            for f in &frames {
                w.append(f).unwrap();
            }
        }

        assert_eq!(read_all(&path).unwrap(), frames);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn torn_tail_drops_only_the_last_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");

        {
            let mut w = WalWriter::create(&path, false).unwrap();
            w.append(&WalFrame {
                seq: 1,
                ops: vec![put(b"a", b"1")],
            })
            .unwrap();
            w.append(&WalFrame {
                seq: 2,
                ops: vec![put(b"b", b"2"), put(b"c", b"3")],
            })
            .unwrap();
        }

        // chop a few bytes off the second frame
        let len = fs::metadata(&path).unwrap().len();
        let f = OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(len - 3).unwrap();

        let mut reader = WalReader::open(&path).unwrap();
        let mut frames = Vec::new();
        reader.replay(|f| frames.push(f)).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].seq, 1);

        // seq(8) + count(4) + op(1 + 4 + 1 + 1 + 8 + 4 + 1), plus len and crc
        assert_eq!(reader.valid_len(), 8 + 32);
        assert!(reader.valid_len() < len - 3);
    }

    #[test]
    fn flipped_byte_is_reported_as_corrupt() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let mut w = WalWriter::create(&path, false).unwrap();
            w.append(&WalFrame {
                seq: 9,
                ops: vec![put(b"key", b"value")],
            })
            .unwrap();
        }

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(read_all(&path), Err(WalError::Corrupt)));
    }

    #[test]
    fn oversized_length_header_is_corrupt() {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(u32::MAX).unwrap();
        bytes.extend_from_slice(&[0u8; 16]);
        let mut reader = WalReader::from_reader(bytes.as_slice());
        assert!(matches!(reader.replay(|_| {}), Err(WalError::Corrupt)));
    }

    #[test]
    fn append_after_failed_write_cuts_the_partial_frame() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut w = WalWriter::create(&path, false).unwrap();
        w.append(&WalFrame {
            seq: 1,
            ops: vec![put(b"a", b"1")],
        })
        .unwrap();

        // half a frame left behind by a write that failed and could not be
        // rolled back at the time
        let mut other = OpenOptions::new().append(true).open(&path).unwrap();
        other.write_all(&[40, 0, 0, 0, 0xAB, 0xCD]).unwrap();
        w.torn = true;

        w.append(&WalFrame {
            seq: 2,
            ops: vec![put(b"b", b"2")],
        })
        .unwrap();

        let frames = read_all(&path).unwrap();
        assert_eq!(frames.iter().map(|f| f.seq).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn writer_resumes_at_existing_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let frame = WalFrame {
            seq: 1,
            ops: vec![put(b"a", b"1")],
        };
        WalWriter::create(&path, false).unwrap().append(&frame).unwrap();

        let w = WalWriter::create(&path, false).unwrap();
        assert_eq!(w.len, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn reset_empties_the_log_and_keeps_appending() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let mut w = WalWriter::create(&path, true).unwrap();
        for seq in 1..=3 {
            w.append(&WalFrame {
                seq,
                ops: vec![put(b"k", b"v")],
            })
            .unwrap();
        }

        w.reset().unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);

        w.append(&WalFrame {
            seq: 4,
            ops: vec![put(b"k", b"after")],
        })
        .unwrap();
        drop(w);

        let mut seqs = Vec::new();
        WalReader::open(&path)
            .unwrap()
            .replay(|f| seqs.push(f.seq))
            .unwrap();
        assert_eq!(seqs, vec![4]);
    }

    #[test]
    fn empty_log_replays_nothing() {
        let reader = &mut WalReader::from_reader(io::empty());
        assert_eq!(reader.replay(|_| panic!("no frames expected")).unwrap(), 0);
    }
}
