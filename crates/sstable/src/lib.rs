//! # SSTable — Sorted String Table
//!
//! Immutable, on-disk tables for the kvctl storage engine.
//!
//! When the in-memory [`memtable::Memtable`] crosses its flush threshold the
//! engine writes it out as an SSTable. Tables are write-once, read-many.
//!
//! ## File layout (v2)
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │ DATA SECTION (sorted records)                          │
//! │                                                        │
//! │ key_len (u32) | key | present (u8) | [val_len | val]   │
//! ├────────────────────────────────────────────────────────┤
//! │ INDEX SECTION (one entry per key)                      │
//! │                                                        │
//! │ key_len (u32) | key | data_offset (u64) | seq (u64)    │
//! │ user_meta (u8) | expires_at (u64) | present (u8)       │
//! │ val_len (u32)                                          │
//! ├────────────────────────────────────────────────────────┤
//! │ FOOTER (always last 12 bytes)                          │
//! │                                                        │
//! │ index_offset (u64 LE) | magic (u32 LE) "SST2"          │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! The index repeats every piece of entry metadata so that key listings can be
//! served from memory without touching the data section. Value bytes are read
//! on demand, one record at a time or in offset-ordered batches.

mod format;
mod reader;
mod writer;

pub use format::{FOOTER_BYTES, RECORD_OVERHEAD, SSTABLE_MAGIC};
pub use reader::{IndexEntry, SSTableReader};
pub use writer::SSTableWriter;
