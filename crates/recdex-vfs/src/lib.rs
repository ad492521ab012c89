//! Stream-opening layer for recdex.
//!
//! Every data and index stream the store touches is obtained through a
//! [`Vfs`]. A stream always carries an explicit [`StreamInfo`] (display name
//! and access mode) instead of having those attributes probed at runtime.
//!
//! Implementations:
//! - [`LocalVfs`]: `std::fs` backed, accepts plain paths and `file://` URLs.
//! - [`MemoryVfs`]: in-memory files, used by tests and ephemeral pipelines.
//! - [`ShadowStream`]: an independent cursor over a shared stream, for
//!   streams that cannot be reopened by name.

mod local;
mod memory;
mod shadow;

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};

use recdex_error::Result;

pub use local::{LocalStream, LocalVfs};
pub use memory::{MemoryStream, MemoryVfs};
pub use shadow::ShadowStream;

/// How a stream is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Read only; the path must exist.
    Read,
    /// Create or truncate, write only.
    WriteTruncate,
    /// Create if missing, every write lands at the end.
    Append,
    /// Create or truncate, read and write.
    ReadWriteCreate,
    /// Create if missing without truncating, read and write at the cursor.
    ReadWriteAppend,
}

impl AccessMode {
    /// Short mode string in the `fopen` tradition.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "rb",
            Self::WriteTruncate => "wb",
            Self::Append => "ab",
            Self::ReadWriteCreate => "wb+",
            Self::ReadWriteAppend => "rb+",
        }
    }

    #[must_use]
    pub const fn is_readable(self) -> bool {
        matches!(
            self,
            Self::Read | Self::ReadWriteCreate | Self::ReadWriteAppend
        )
    }

    #[must_use]
    pub const fn is_writable(self) -> bool {
        !matches!(self, Self::Read)
    }

    #[must_use]
    pub const fn truncates(self) -> bool {
        matches!(self, Self::WriteTruncate | Self::ReadWriteCreate)
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability record every opened stream carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Human readable name used in every error message.
    pub display_name: String,
    /// Mode the stream was opened with.
    pub access_mode: AccessMode,
    /// Path the stream can be reopened from, if any.
    pub reopen_path: Option<String>,
}

impl StreamInfo {
    pub fn new(display_name: impl Into<String>, access_mode: AccessMode) -> Self {
        Self {
            display_name: display_name.into(),
            access_mode,
            reopen_path: None,
        }
    }

    /// Info for a stream opened from `path`; the path doubles as display name.
    pub fn for_path(path: &str, access_mode: AccessMode) -> Self {
        Self {
            display_name: path.to_owned(),
            access_mode,
            reopen_path: Some(path.to_owned()),
        }
    }
}

/// A seekable byte stream handed out by a [`Vfs`].
pub trait VfsStream: Read + Write + Seek + Send {
    fn info(&self) -> &StreamInfo;

    /// Current byte length of the underlying resource.
    fn content_size(&mut self) -> io::Result<u64>;

    fn display_name(&self) -> &str {
        &self.info().display_name
    }
}

impl fmt::Debug for dyn VfsStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VfsStream")
            .field("display_name", &self.info().display_name)
            .field("access_mode", &self.info().access_mode)
            .finish()
    }
}

/// Opens streams by logical path.
pub trait Vfs: Send + Sync + fmt::Debug {
    fn open(&self, path: &str, mode: AccessMode) -> Result<Box<dyn VfsStream>>;

    fn exists(&self, path: &str) -> Result<bool>;

    fn content_size(&self, path: &str) -> Result<u64>;

    /// Whether opening the same path again yields an independent handle over
    /// the same bytes. When false, readers fall back to [`ShadowStream`].
    fn can_reopen(&self) -> bool {
        true
    }
}

/// Measure a seekable stream by seeking to its end and back.
pub fn seek_content_size<S: Seek + ?Sized>(stream: &mut S) -> io::Result<u64> {
    let position = stream.stream_position()?;
    let end = stream.seek(SeekFrom::End(0))?;
    if position != end {
        stream.seek(SeekFrom::Start(position))?;
    }
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_mode_capabilities() {
        assert!(AccessMode::Read.is_readable());
        assert!(!AccessMode::Read.is_writable());
        assert!(!AccessMode::Append.is_readable());
        assert!(AccessMode::ReadWriteAppend.is_readable());
        assert!(AccessMode::ReadWriteAppend.is_writable());
        assert!(!AccessMode::ReadWriteAppend.truncates());
        assert!(AccessMode::ReadWriteCreate.truncates());
        assert_eq!(AccessMode::ReadWriteAppend.to_string(), "rb+");
    }

    #[test]
    fn seek_content_size_restores_position() {
        let mut cursor = io::Cursor::new(vec![0_u8; 10]);
        cursor.seek(SeekFrom::Start(3)).unwrap();
        assert_eq!(seek_content_size(&mut cursor).unwrap(), 10);
        assert_eq!(cursor.position(), 3);
    }
}
