//! `std::fs` backed [`Vfs`].

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use recdex_error::{RecdexError, Result};
use tracing::trace;

use crate::{AccessMode, StreamInfo, Vfs, VfsStream};

const FILE_SCHEME: &str = "file://";

/// Local filesystem. Plain paths and `file://` URLs are accepted; any other
/// `scheme://` prefix is rejected as unsupported.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalVfs;

impl LocalVfs {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn resolve(path: &str) -> Result<PathBuf> {
        if let Some(stripped) = path.strip_prefix(FILE_SCHEME) {
            return Ok(PathBuf::from(stripped));
        }
        if let Some((scheme, _)) = path.split_once("://") {
            return Err(RecdexError::Unsupported {
                path: path.to_owned(),
                detail: format!("scheme {scheme:?} is not served by the local filesystem"),
            });
        }
        Ok(PathBuf::from(path))
    }

    fn options(mode: AccessMode) -> OpenOptions {
        let mut options = OpenOptions::new();
        match mode {
            AccessMode::Read => {
                options.read(true);
            }
            AccessMode::WriteTruncate => {
                options.write(true).create(true).truncate(true);
            }
            AccessMode::Append => {
                options.append(true).create(true);
            }
            AccessMode::ReadWriteCreate => {
                options.read(true).write(true).create(true).truncate(true);
            }
            AccessMode::ReadWriteAppend => {
                options.read(true).write(true).create(true).truncate(false);
            }
        }
        options
    }
}

impl Vfs for LocalVfs {
    fn open(&self, path: &str, mode: AccessMode) -> Result<Box<dyn VfsStream>> {
        let resolved = Self::resolve(path)?;
        let file = Self::options(mode)
            .open(&resolved)
            .map_err(|err| RecdexError::from_open(path, err))?;
        trace!(path, mode = %mode, "opened local stream");
        Ok(Box::new(LocalStream {
            file,
            info: StreamInfo::for_path(path, mode),
        }))
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let resolved = Self::resolve(path)?;
        Ok(Path::new(&resolved).try_exists()?)
    }

    fn content_size(&self, path: &str) -> Result<u64> {
        let resolved = Self::resolve(path)?;
        let metadata = fs::metadata(&resolved).map_err(|err| RecdexError::from_open(path, err))?;
        Ok(metadata.len())
    }
}

/// An open local file.
#[derive(Debug)]
pub struct LocalStream {
    file: File,
    info: StreamInfo,
}

impl Read for LocalStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for LocalStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for LocalStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl VfsStream for LocalStream {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn content_size(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_foreign_schemes() {
        let err = LocalVfs::new()
            .open("s3://bucket/key", AccessMode::Read)
            .unwrap_err();
        assert!(matches!(err, RecdexError::Unsupported { .. }), "{err}");
        assert!(err.is_index_open_fallback());
    }

    #[test]
    fn file_scheme_is_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        let url = format!("file://{}", path.display());

        let vfs = LocalVfs::new();
        let mut stream = vfs.open(&url, AccessMode::WriteTruncate).unwrap();
        stream.write_all(b"abc").unwrap();
        drop(stream);

        assert!(vfs.exists(&url).unwrap());
        assert_eq!(vfs.content_size(&url).unwrap(), 3);
        assert_eq!(fs::read(&path).unwrap(), b"abc");
    }

    #[test]
    fn append_mode_writes_at_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let path = path.to_str().unwrap();
        let vfs = LocalVfs::new();

        vfs.open(path, AccessMode::WriteTruncate)
            .unwrap()
            .write_all(b"one\n")
            .unwrap();
        let mut stream = vfs.open(path, AccessMode::Append).unwrap();
        stream.write_all(b"two\n").unwrap();
        assert_eq!(stream.content_size().unwrap(), 8);
        assert_eq!(stream.info().access_mode, AccessMode::Append);
        drop(stream);

        assert_eq!(fs::read(path).unwrap(), b"one\ntwo\n");
    }

    #[test]
    fn read_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing");
        let err = LocalVfs::new()
            .open(path.to_str().unwrap(), AccessMode::Read)
            .unwrap_err();
        assert!(matches!(err, RecdexError::NotFound { .. }), "{err}");
    }
}
