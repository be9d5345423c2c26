//! `kvctl`: command-line access to an embedded LSM key-value store.
//!
//! The [`engine`] persists data as a write-ahead log plus immutable sorted
//! tables. [`store`] runs the get, list, set and delete operations on top of
//! any [`backend::Backend`], and [`commands`] maps them onto the command line.

pub mod backend;
pub mod codec;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod store;

#[cfg(test)]
mod memory;
