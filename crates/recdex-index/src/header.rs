//! Index file header and offset encodings.
//!
//! Layout (16 bytes, at offset 0 of the index file):
//!
//! ```text
//! magic     [u8; 4]  "IDV1"
//! tag       [u8; 4]  offset encoding identifier, left-justified, space padded
//! data_size u64 LE   byte length of the data stream when the header was written
//! ```

use recdex_error::{RecdexError, Result};
use serde::{Deserialize, Serialize};

/// Magic bytes opening every index file.
pub const INDEX_MAGIC: [u8; 4] = *b"IDV1";

/// Serialized header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// How each offset is stored in the index file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetEncoding {
    /// Unsigned 64-bit little-endian.
    #[default]
    U64,
    /// Unsigned 32-bit little-endian.
    U32,
    /// Unsigned 64-bit big-endian.
    U64Be,
    /// Unsigned 32-bit big-endian.
    U32Be,
}

impl OffsetEncoding {
    pub const ALL: [Self; 4] = [Self::U64, Self::U32, Self::U64Be, Self::U32Be];

    /// Bytes per stored offset.
    #[must_use]
    pub const fn width(self) -> usize {
        match self {
            Self::U64 | Self::U64Be => 8,
            Self::U32 | Self::U32Be => 4,
        }
    }

    /// Header tag, space padded to four bytes.
    #[must_use]
    pub const fn tag(self) -> [u8; 4] {
        match self {
            Self::U64 => *b"Q   ",
            Self::U32 => *b"I   ",
            Self::U64Be => *b">Q  ",
            Self::U32Be => *b">I  ",
        }
    }

    /// Inverse of [`OffsetEncoding::tag`]. Trailing spaces and NULs are ignored.
    #[must_use]
    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        let trimmed = trim_tag(tag);
        Self::ALL
            .into_iter()
            .find(|encoding| trim_tag(&encoding.tag()) == trimmed)
    }

    /// Largest offset this encoding can hold.
    #[must_use]
    pub const fn max_value(self) -> u64 {
        match self {
            Self::U64 | Self::U64Be => u64::MAX,
            Self::U32 | Self::U32Be => u32::MAX as u64,
        }
    }

    /// Serialize `value` into `out[..self.width()]`.
    pub fn encode(self, value: u64, out: &mut [u8]) -> Result<()> {
        if value > self.max_value() {
            return Err(RecdexError::invalid_argument(format!(
                "offset {value} does not fit encoding {self:?}"
            )));
        }
        let out = &mut out[..self.width()];
        match self {
            Self::U64 => out.copy_from_slice(&value.to_le_bytes()),
            Self::U64Be => out.copy_from_slice(&value.to_be_bytes()),
            Self::U32 => out.copy_from_slice(&(value as u32).to_le_bytes()),
            Self::U32Be => out.copy_from_slice(&(value as u32).to_be_bytes()),
        }
        Ok(())
    }

    /// Deserialize one offset from exactly `self.width()` bytes.
    #[must_use]
    pub fn decode(self, bytes: &[u8]) -> u64 {
        let mut wide = [0_u8; 8];
        let mut narrow = [0_u8; 4];
        match self {
            Self::U64 => {
                wide.copy_from_slice(&bytes[..8]);
                u64::from_le_bytes(wide)
            }
            Self::U64Be => {
                wide.copy_from_slice(&bytes[..8]);
                u64::from_be_bytes(wide)
            }
            Self::U32 => {
                narrow.copy_from_slice(&bytes[..4]);
                u64::from(u32::from_le_bytes(narrow))
            }
            Self::U32Be => {
                narrow.copy_from_slice(&bytes[..4]);
                u64::from(u32::from_be_bytes(narrow))
            }
        }
    }
}

fn trim_tag(tag: &[u8]) -> &[u8] {
    let end = tag
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map_or(0, |pos| pos + 1);
    &tag[..end]
}

/// Decoded index file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub magic: [u8; 4],
    pub tag: [u8; 4],
    pub data_size: u64,
}

impl IndexHeader {
    #[must_use]
    pub const fn new(encoding: OffsetEncoding, data_size: u64) -> Self {
        Self {
            magic: INDEX_MAGIC,
            tag: encoding.tag(),
            data_size,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0_u8; HEADER_SIZE];
        buf[..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.tag);
        buf[8..].copy_from_slice(&self.data_size.to_le_bytes());
        buf
    }

    /// Parse a header from the first [`HEADER_SIZE`] bytes of `bytes`. Magic
    /// and tag are not checked here; see [`IndexHeader::verdict`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(RecdexError::Format {
                stream: String::new(),
                detail: format!(
                    "index header needs {HEADER_SIZE} bytes, got {}",
                    bytes.len()
                ),
            });
        }
        let mut magic = [0_u8; 4];
        let mut tag = [0_u8; 4];
        let mut size = [0_u8; 8];
        magic.copy_from_slice(&bytes[..4]);
        tag.copy_from_slice(&bytes[4..8]);
        size.copy_from_slice(&bytes[8..HEADER_SIZE]);
        Ok(Self {
            magic,
            tag,
            data_size: u64::from_le_bytes(size),
        })
    }

    /// Compare this header against what a fresh index for `data_size` bytes
    /// encoded with `encoding` would carry.
    #[must_use]
    pub fn verdict(&self, encoding: OffsetEncoding, data_size: u64) -> HeaderVerdict {
        if self.magic != INDEX_MAGIC {
            return HeaderVerdict::BadMagic { found: self.magic };
        }
        if trim_tag(&self.tag) != trim_tag(&encoding.tag()) {
            return HeaderVerdict::TagMismatch { found: self.tag };
        }
        if self.data_size != data_size {
            return HeaderVerdict::SizeMismatch {
                recorded: self.data_size,
                actual: data_size,
            };
        }
        HeaderVerdict::Valid
    }
}

/// Outcome of checking an index header against the current data stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderVerdict {
    Valid,
    /// The index file does not exist.
    Missing,
    /// The index file could not be opened or is shorter than a header.
    Unreadable(String),
    BadMagic { found: [u8; 4] },
    TagMismatch { found: [u8; 4] },
    /// The data stream changed size since the header was written.
    SizeMismatch { recorded: u64, actual: u64 },
}

impl HeaderVerdict {
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}
