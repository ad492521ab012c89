//! Independent cursors over one shared stream.
//!
//! A [`ShadowStream`] keeps its own position and re-seeks the shared stream
//! before every operation, so any number of shadows can interleave reads on a
//! stream that cannot be reopened by name.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{StreamInfo, VfsStream};

/// A duplicate view with its own cursor over a shared stream.
#[derive(Debug)]
pub struct ShadowStream {
    shared: Arc<Mutex<Box<dyn VfsStream>>>,
    position: u64,
    info: StreamInfo,
}

impl ShadowStream {
    /// Wrap `stream` so it can be shadowed. The first view starts at the
    /// stream's current position.
    pub fn share(mut stream: Box<dyn VfsStream>) -> io::Result<Self> {
        let position = stream.stream_position()?;
        let info = stream.info().clone();
        Ok(Self {
            shared: Arc::new(Mutex::new(stream)),
            position,
            info,
        })
    }

    /// Another view over the same stream, starting at this view's position.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            position: self.position,
            info: self.info.clone(),
        }
    }
}

impl Read for ShadowStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut shared = self.shared.lock();
        shared.seek(SeekFrom::Start(self.position))?;
        let n = shared.read(buf)?;
        drop(shared);
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for ShadowStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut shared = self.shared.lock();
        shared.seek(SeekFrom::Start(self.position))?;
        let n = shared.write(buf)?;
        drop(shared);
        self.position += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.shared.lock().flush()
    }
}

impl Seek for ShadowStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.shared.lock().content_size()?.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        self.position = target.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )
        })?;
        Ok(self.position)
    }
}

impl VfsStream for ShadowStream {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn content_size(&mut self) -> io::Result<u64> {
        self.shared.lock().content_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccessMode, MemoryVfs, Vfs};

    #[test]
    fn forks_do_not_share_cursors() {
        let vfs = MemoryVfs::new();
        vfs.write_file("data", b"abcdef".to_vec());
        let stream = vfs.open("data", AccessMode::Read).unwrap();

        let mut first = ShadowStream::share(stream).unwrap();
        let mut second = first.fork();

        let mut buf = [0_u8; 2];
        first.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ab");

        second.seek(SeekFrom::Start(4)).unwrap();
        second.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ef");

        first.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"cd");
        assert_eq!(second.content_size().unwrap(), 6);
        assert_eq!(second.info().display_name, "data");
    }
}
