//! Appending records to an indexed data stream.

use std::borrow::Borrow;
use std::fmt;
use std::io::Write;
use std::sync::Arc;

use recdex_error::{RecdexError, Result};
use recdex_index::{
    IndexRequest, OffsetArray, OffsetLayout, OffsetSink, OffsetStore, OpenMode, ScanObserver,
    acquire_index,
};
use recdex_vfs::{AccessMode, Vfs, VfsStream};
use tracing::{debug, warn};

use crate::config::RecdexConfig;
use crate::format::RecordFormat;

/// How a writer session relates to existing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// The stream was created or truncated.
    Fresh,
    /// The stream continues a previous session.
    Append,
}

/// Single-owner writer that keeps a data stream and its index in step.
///
/// Every [`append`](Self::append) writes one encoded record at the tail and
/// records the tail offset it was written at. The index header is finalized
/// by [`close`](Self::close), which also runs on drop.
pub struct IndexedWriter<F: RecordFormat> {
    format: F,
    name: String,
    vfs: Arc<dyn Vfs>,
    index_path: Option<String>,
    layout: OffsetLayout,
    kind: SessionKind,
    data: Option<Box<dyn VfsStream>>,
    offsets: Option<OffsetStore>,
    tail: u64,
    count: u64,
    scratch: Vec<u8>,
}

impl<F: RecordFormat> IndexedWriter<F> {
    /// Open `path` for writing: `w` truncates, `a` continues existing
    /// content (or starts fresh when there is none).
    pub fn open(
        vfs: Arc<dyn Vfs>,
        path: &str,
        mode: OpenMode,
        format: F,
        config: &RecdexConfig,
        observer: Option<&mut ScanObserver<'_>>,
    ) -> Result<Self> {
        match mode {
            OpenMode::Write => Self::create(vfs, path, format, config),
            OpenMode::Append => Self::append_to(vfs, path, format, config, observer),
            other => Err(RecdexError::invalid_argument(format!(
                "unacceptable mode: {:?}",
                other.as_str()
            ))),
        }
    }

    /// Create or truncate `path` and its index.
    pub fn create(vfs: Arc<dyn Vfs>, path: &str, format: F, config: &RecdexConfig) -> Result<Self> {
        config.validate()?;
        let index_path = config.index_path_for(path);
        let layout = config.layout();

        let mut data = vfs.open(path, AccessMode::WriteTruncate)?;
        let start = format.begin_session(data.as_mut(), false)?;
        let offsets = match index_path.as_deref() {
            None => OffsetStore::Ephemeral(Vec::new()),
            Some(path) => match create_index(vfs.as_ref(), path, layout) {
                Ok(array) => OffsetStore::Persisted(array),
                Err(err) if err.is_index_open_fallback() => {
                    index_unavailable(path, &err);
                    OffsetStore::Ephemeral(Vec::new())
                }
                Err(err) => return Err(err),
            },
        };

        Ok(Self::assemble(
            format,
            vfs,
            index_path,
            layout,
            SessionKind::Fresh,
            data,
            offsets,
            start.tail,
        ))
    }

    /// Continue `path`. The existing index is validated, and rebuilt if
    /// stale, so new offsets extend the existing ones.
    pub fn append_to(
        vfs: Arc<dyn Vfs>,
        path: &str,
        format: F,
        config: &RecdexConfig,
        observer: Option<&mut ScanObserver<'_>>,
    ) -> Result<Self> {
        config.validate()?;
        if !vfs.exists(path)? {
            debug!(target: "recdex.writer", path, "nothing to append to, starting fresh");
            return Self::create(vfs, path, format, config);
        }
        let index_path = config.index_path_for(path);
        let layout = config.layout();

        let acquired = {
            let mut data = vfs.open(path, AccessMode::Read)?;
            let request = IndexRequest {
                vfs: vfs.as_ref(),
                index_path: index_path.as_deref(),
                layout,
                writable: false,
            };
            acquire_index(&request, data.as_mut(), &format, observer)?
        };
        let scanned_end = acquired.scan_summary().map(|scan| scan.end_offset);
        let mut store = acquired.into_store();
        let last = match store.count() {
            0 => None,
            count => Some(store.get_position(count - 1)?),
        };
        let offsets = match store {
            OffsetStore::Persisted(mut existing) => {
                let index_path = index_path
                    .as_deref()
                    .ok_or_else(|| RecdexError::internal("persisted index without a path"))?;
                match OffsetArray::open(vfs.as_ref(), index_path, OpenMode::Append, layout) {
                    Ok(appender) => {
                        existing.close()?;
                        OffsetStore::Persisted(appender)
                    }
                    Err(err) if err.is_index_open_fallback() => {
                        index_unavailable(index_path, &err);
                        let offsets = existing.scan().collect::<Result<Vec<_>>>()?;
                        existing.close()?;
                        OffsetStore::Ephemeral(offsets)
                    }
                    Err(err) => return Err(err),
                }
            }
            ephemeral @ OffsetStore::Ephemeral(_) => ephemeral,
        };

        let mut data = vfs.open(path, AccessMode::ReadWriteAppend)?;
        let start = format.begin_session(data.as_mut(), true)?;
        if let Some(declared) = start.declared_count.filter(|&d| d != offsets.count()) {
            return Err(RecdexError::Consistency {
                stream: data.display_name().to_owned(),
                detail: format!(
                    "stream header declares {declared} records but the index holds {}",
                    offsets.count()
                ),
            });
        }
        format.verify_resume(data.as_mut(), last, scanned_end, start.tail)?;

        Ok(Self::assemble(
            format,
            vfs,
            index_path,
            layout,
            SessionKind::Append,
            data,
            offsets,
            start.tail,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        format: F,
        vfs: Arc<dyn Vfs>,
        index_path: Option<String>,
        layout: OffsetLayout,
        kind: SessionKind,
        data: Box<dyn VfsStream>,
        offsets: OffsetStore,
        tail: u64,
    ) -> Self {
        let name = data.display_name().to_owned();
        let count = offsets.count();
        debug!(
            target: "recdex.writer",
            stream = %name,
            format = F::NAME,
            ?kind,
            records = count,
            tail,
            persisted = offsets.is_persisted(),
            "opened writer"
        );
        Self {
            format,
            name,
            vfs,
            index_path,
            layout,
            kind,
            data: Some(data),
            offsets: Some(offsets),
            tail,
            count,
            scratch: Vec::new(),
        }
    }

    /// Display name of the data stream.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn kind(&self) -> SessionKind {
        self.kind
    }

    /// Records in the stream, including those of earlier sessions.
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Offset the next record will be written at.
    #[must_use]
    pub const fn tail(&self) -> u64 {
        self.tail
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.data.is_none()
    }

    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.offsets.as_ref().is_some_and(OffsetStore::is_persisted)
    }

    /// Append one record.
    pub fn append(&mut self, value: &F::Input) -> Result<()> {
        self.scratch.clear();
        self.format.encode(value, &mut self.scratch)?;
        let (Some(data), Some(offsets)) = (self.data.as_mut(), self.offsets.as_mut()) else {
            return Err(closed_error(&self.name));
        };
        offsets.push_offset(self.tail)?;
        data.write_all(&self.scratch)?;
        self.tail += self.scratch.len() as u64;
        self.count += 1;
        Ok(())
    }

    /// Append every record of `values`, in order.
    pub fn extend<I>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Borrow<F::Input>,
    {
        for value in values {
            self.append(value.borrow())?;
        }
        Ok(())
    }

    /// Flush the data stream and the index without closing either.
    pub fn commit(&mut self) -> Result<()> {
        let (Some(data), Some(offsets)) = (self.data.as_mut(), self.offsets.as_mut()) else {
            return Err(closed_error(&self.name));
        };
        self.format.sync_session(data.as_mut(), self.count)?;
        data.flush()?;
        offsets.commit()
    }

    /// Final commit, then finalize the index header and release both
    /// streams. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut data) = self.data.take() else {
            return Ok(());
        };
        let offsets = self.offsets.take();
        self.format.sync_session(data.as_mut(), self.count)?;
        data.flush()?;
        let data_size = data.content_size()?;
        drop(data);

        if let Some(OffsetStore::Persisted(mut array)) = offsets {
            match self.kind {
                SessionKind::Fresh => {
                    array.write_header(data_size, false)?;
                    array.close()?;
                }
                SessionKind::Append => {
                    // The append-only handle cannot seek back to the header.
                    array.close()?;
                    let path = self
                        .index_path
                        .as_deref()
                        .ok_or_else(|| RecdexError::internal("persisted index without a path"))?;
                    let mut array = OffsetArray::new(
                        self.vfs.open(path, AccessMode::ReadWriteAppend)?,
                        self.layout,
                    )?;
                    array.write_header(data_size, false)?;
                    array.close()?;
                }
            }
        }
        debug!(
            target: "recdex.writer",
            stream = %self.name,
            records = self.count,
            data_size,
            "closed writer"
        );
        Ok(())
    }
}

impl<F: RecordFormat> Drop for IndexedWriter<F> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(
                target: "recdex.writer",
                stream = %self.name,
                error = %err,
                "failed to close writer on drop"
            );
        }
    }
}

impl<F: RecordFormat> fmt::Debug for IndexedWriter<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexedWriter")
            .field("stream", &self.name)
            .field("format", &F::NAME)
            .field("kind", &self.kind)
            .field("count", &self.count)
            .field("tail", &self.tail)
            .field("index_path", &self.index_path)
            .finish_non_exhaustive()
    }
}

fn closed_error(name: &str) -> RecdexError {
    RecdexError::invalid_argument(format!("I/O operation on closed writer: {name}"))
}

/// Truncate the index at `path` and reserve its header.
fn create_index(vfs: &dyn Vfs, path: &str, layout: OffsetLayout) -> Result<OffsetArray> {
    let mut array = OffsetArray::new(vfs.open(path, AccessMode::WriteTruncate)?, layout)?;
    array.write_header(0, true)?;
    Ok(array)
}

fn index_unavailable(path: &str, err: &RecdexError) {
    warn!(
        target: "recdex.writer",
        path,
        error = %err,
        "index path unavailable, offsets of this session are not persisted"
    );
}
