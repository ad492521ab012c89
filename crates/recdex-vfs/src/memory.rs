//! In-memory [`Vfs`].
//!
//! Files live in a shared map, so every handle opened on the same path sees
//! the same bytes. Paths can be marked as denied to exercise permission
//! failures.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use recdex_error::{RecdexError, Result};

use crate::{AccessMode, StreamInfo, Vfs, VfsStream};

type SharedFile = Arc<Mutex<Vec<u8>>>;

#[derive(Debug, Default)]
struct MemoryVfsInner {
    files: HashMap<String, SharedFile>,
    denied: HashSet<String>,
}

/// In-memory filesystem. Cloning yields another handle on the same files.
#[derive(Debug, Clone, Default)]
pub struct MemoryVfs {
    inner: Arc<Mutex<MemoryVfsInner>>,
}

impl MemoryVfs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `open` of `path` fail with permission denied.
    pub fn deny(&self, path: &str) {
        self.inner.lock().denied.insert(path.to_owned());
    }

    /// Lift a previous [`MemoryVfs::deny`].
    pub fn allow(&self, path: &str) {
        self.inner.lock().denied.remove(path);
    }

    /// Snapshot of a file's bytes.
    #[must_use]
    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        let file = self.inner.lock().files.get(path).cloned()?;
        let bytes = file.lock().clone();
        Some(bytes)
    }

    /// Replace (or create) a file's bytes.
    pub fn write_file(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        let bytes = bytes.into();
        let mut inner = self.inner.lock();
        match inner.files.get(path) {
            Some(file) => *file.lock() = bytes,
            None => {
                inner
                    .files
                    .insert(path.to_owned(), Arc::new(Mutex::new(bytes)));
            }
        }
    }

    pub fn remove_file(&self, path: &str) -> bool {
        self.inner.lock().files.remove(path).is_some()
    }
}

impl Vfs for MemoryVfs {
    fn open(&self, path: &str, mode: AccessMode) -> Result<Box<dyn VfsStream>> {
        let mut inner = self.inner.lock();
        if inner.denied.contains(path) {
            return Err(RecdexError::PermissionDenied {
                path: path.to_owned(),
            });
        }
        let existing = inner.files.get(path).cloned();
        let file = match (existing, mode) {
            (Some(file), _) => file,
            (None, AccessMode::Read) => {
                return Err(RecdexError::NotFound {
                    path: path.to_owned(),
                });
            }
            (None, _) => {
                let file = SharedFile::default();
                inner.files.insert(path.to_owned(), Arc::clone(&file));
                file
            }
        };
        drop(inner);

        if mode.truncates() {
            file.lock().clear();
        }
        Ok(Box::new(MemoryStream {
            file,
            position: 0,
            info: StreamInfo::for_path(path, mode),
        }))
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.inner.lock().files.contains_key(path))
    }

    fn content_size(&self, path: &str) -> Result<u64> {
        let file = self
            .inner
            .lock()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| RecdexError::NotFound {
                path: path.to_owned(),
            })?;
        let len = file.lock().len();
        Ok(len as u64)
    }
}

/// Cursor over one in-memory file.
#[derive(Debug)]
pub struct MemoryStream {
    file: SharedFile,
    position: u64,
    info: StreamInfo,
}

impl MemoryStream {
    fn refuse(&self, action: &str) -> io::Error {
        io::Error::new(
            io::ErrorKind::Unsupported,
            format!(
                "{} opened with mode {} is not {action}",
                self.info.display_name, self.info.access_mode
            ),
        )
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.info.access_mode.is_readable() {
            return Err(self.refuse("readable"));
        }
        let file = self.file.lock();
        let start = usize::try_from(self.position)
            .unwrap_or(usize::MAX)
            .min(file.len());
        let n = buf.len().min(file.len() - start);
        buf[..n].copy_from_slice(&file[start..start + n]);
        drop(file);
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.info.access_mode.is_writable() {
            return Err(self.refuse("writable"));
        }
        let mut file = self.file.lock();
        if self.info.access_mode == AccessMode::Append {
            self.position = file.len() as u64;
        }
        let start = usize::try_from(self.position)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "position overflow"))?;
        if start > file.len() {
            file.resize(start, 0);
        }
        let overlap = buf.len().min(file.len() - start);
        file[start..start + overlap].copy_from_slice(&buf[..overlap]);
        file.extend_from_slice(&buf[overlap..]);
        drop(file);
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => (self.file.lock().len() as u64).checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )
        })?;
        self.position = target;
        Ok(target)
    }
}

impl VfsStream for MemoryStream {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn content_size(&mut self) -> io::Result<u64> {
        Ok(self.file.lock().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_share_bytes() {
        let vfs = MemoryVfs::new();
        let mut writer = vfs.open("a", AccessMode::WriteTruncate).unwrap();
        writer.write_all(b"hello").unwrap();

        let mut reader = vfs.open("a", AccessMode::Read).unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello");
        assert_eq!(vfs.content_size("a").unwrap(), 5);
    }

    #[test]
    fn read_write_append_keeps_existing_bytes() {
        let vfs = MemoryVfs::new();
        vfs.write_file("a", b"0123456789".to_vec());
        let mut stream = vfs.open("a", AccessMode::ReadWriteAppend).unwrap();
        stream.seek(SeekFrom::Start(2)).unwrap();
        stream.write_all(b"ab").unwrap();
        assert_eq!(vfs.read_file("a").unwrap(), b"01ab456789");

        stream.seek(SeekFrom::End(0)).unwrap();
        stream.write_all(b"xy").unwrap();
        assert_eq!(vfs.read_file("a").unwrap(), b"01ab456789xy");
    }

    #[test]
    fn append_ignores_cursor() {
        let vfs = MemoryVfs::new();
        vfs.write_file("a", b"abc".to_vec());
        let mut stream = vfs.open("a", AccessMode::Append).unwrap();
        stream.seek(SeekFrom::Start(0)).unwrap();
        stream.write_all(b"d").unwrap();
        assert_eq!(vfs.read_file("a").unwrap(), b"abcd");
    }

    #[test]
    fn truncating_modes_clear_file() {
        let vfs = MemoryVfs::new();
        vfs.write_file("a", b"abc".to_vec());
        let _stream = vfs.open("a", AccessMode::ReadWriteCreate).unwrap();
        assert_eq!(vfs.read_file("a").unwrap(), b"");
    }

    #[test]
    fn denied_paths_fail_to_open() {
        let vfs = MemoryVfs::new();
        vfs.deny("secret.idx");
        let err = vfs.open("secret.idx", AccessMode::Read).unwrap_err();
        assert!(matches!(err, RecdexError::PermissionDenied { .. }));
        vfs.allow("secret.idx");
        assert!(vfs.open("secret.idx", AccessMode::WriteTruncate).is_ok());
    }

    #[test]
    fn write_only_stream_refuses_reads() {
        let vfs = MemoryVfs::new();
        let mut stream = vfs.open("a", AccessMode::WriteTruncate).unwrap();
        let mut buf = [0_u8; 1];
        assert!(stream.read(&mut buf).is_err());
    }
}
