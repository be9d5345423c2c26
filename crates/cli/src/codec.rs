//! Display encodings for stored values.
//!
//! Values are written as raw bytes; the codec only runs on the read path and
//! turns those bytes into something printable.

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};
use thiserror::Error;

/// How raw value bytes should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Bytes as text; invalid UTF-8 sequences become U+FFFD.
    #[default]
    String,
    /// An 8-byte big-endian unsigned integer, rendered in decimal.
    Int64AsBytes,
    /// A JSON array of objects, re-indented with two spaces.
    Json,
}

impl Format {
    pub const ALL: [Format; 3] = [Format::String, Format::Int64AsBytes, Format::Json];

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::String => "string",
            Format::Int64AsBytes => "int64AsBytes",
            Format::Json => "json",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Format::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| CodecError::UnsupportedFormat(s.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("int64AsBytes needs exactly 8 bytes, got {0}")]
    Length(usize),

    #[error("not a JSON array of objects: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported format {0:?} (expected string, int64AsBytes or json)")]
    UnsupportedFormat(String),
}

/// Renders `raw` in the requested format.
pub fn decode(raw: &[u8], format: Format) -> Result<String, CodecError> {
    match format {
        Format::String => Ok(String::from_utf8_lossy(raw).into_owned()),
        Format::Int64AsBytes => {
            let bytes: [u8; 8] = raw.try_into().map_err(|_| CodecError::Length(raw.len()))?;
            Ok(u64::from_be_bytes(bytes).to_string())
        }
        Format::Json => {
            let doc: Vec<Map<String, Value>> = serde_json::from_slice(raw)?;
            Ok(serde_json::to_string_pretty(&doc)?)
        }
    }
}
