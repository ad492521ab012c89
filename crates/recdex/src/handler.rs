//! Read-write access to one MessagePack array stream.

use std::fmt;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use recdex_error::{RecdexError, Result};
use recdex_index::{
    IndexRequest, IndexSlice, OffsetArray, OffsetLayout, OffsetSink, OffsetStore, OpenMode,
    ScanObserver, acquire_index, normalize_index,
};
use recdex_vfs::{AccessMode, Vfs, VfsStream};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::RecdexConfig;
use crate::format::{DecodeContext, PackedArray, RecordFormat, write_array_header};

/// Interleaved appends and random reads on a MessagePack array stream.
///
/// Opened with `w+` (truncate) or `a+` (continue, or create when missing).
/// On `a+` the count in the array header, the number of indexed values and
/// the physical end of the stream must agree.
pub struct PackedArrayHandler<T> {
    format: PackedArray<T>,
    name: String,
    data: Option<Box<dyn VfsStream>>,
    offsets: Option<OffsetStore>,
    tail: u64,
    count: u64,
    page_size: usize,
    scratch: Vec<u8>,
}

impl<T: Serialize + DeserializeOwned> PackedArrayHandler<T> {
    pub fn open(
        vfs: Arc<dyn Vfs>,
        path: &str,
        mode: OpenMode,
        config: &RecdexConfig,
        observer: Option<&mut ScanObserver<'_>>,
    ) -> Result<Self> {
        config.validate()?;
        let layout = config.layout();
        let index_path = config.index_path_for(path);
        match mode {
            OpenMode::ReadWrite => Self::create(vfs.as_ref(), path, index_path.as_deref(), layout),
            OpenMode::ReadAppend if !vfs.exists(path)? => {
                Self::create(vfs.as_ref(), path, index_path.as_deref(), layout)
            }
            OpenMode::ReadAppend => {
                Self::resume(vfs.as_ref(), path, index_path.as_deref(), layout, observer)
            }
            other => Err(RecdexError::invalid_argument(format!(
                "unacceptable mode: {:?}",
                other.as_str()
            ))),
        }
    }

    fn create(
        vfs: &dyn Vfs,
        path: &str,
        index_path: Option<&str>,
        layout: OffsetLayout,
    ) -> Result<Self> {
        let format = PackedArray::new();
        let mut data = vfs.open(path, AccessMode::ReadWriteCreate)?;
        let start = format.begin_session(data.as_mut(), false)?;
        let offsets = match index_path {
            None => OffsetStore::Ephemeral(Vec::new()),
            Some(index_path) => {
                let created = vfs
                    .open(index_path, AccessMode::ReadWriteCreate)
                    .and_then(|stream| OffsetArray::new(stream, layout))
                    .and_then(|mut array| array.write_header(0, true).map(|()| array));
                match created {
                    Ok(array) => OffsetStore::Persisted(array),
                    Err(err) if err.is_index_open_fallback() => {
                        warn!(
                            target: "recdex.writer",
                            path = index_path,
                            error = %err,
                            "index path unavailable, keeping offsets in memory"
                        );
                        OffsetStore::Ephemeral(Vec::new())
                    }
                    Err(err) => return Err(err),
                }
            }
        };
        Ok(Self::assemble(format, data, offsets, start.tail, layout))
    }

    fn resume(
        vfs: &dyn Vfs,
        path: &str,
        index_path: Option<&str>,
        layout: OffsetLayout,
        observer: Option<&mut ScanObserver<'_>>,
    ) -> Result<Self> {
        let format = PackedArray::new();
        let mut data = vfs.open(path, AccessMode::ReadWriteAppend)?;
        let request = IndexRequest {
            vfs,
            index_path,
            layout,
            writable: true,
        };
        let acquired = acquire_index(&request, data.as_mut(), &format, observer)?;
        let scanned_end = acquired.scan_summary().map(|scan| scan.end_offset);
        let mut offsets = acquired.into_store();

        let start = format.begin_session(data.as_mut(), true)?;
        let declared = start.declared_count.unwrap_or_default();
        let count = offsets.count();
        if declared != count {
            return Err(RecdexError::Consistency {
                stream: data.display_name().to_owned(),
                detail: format!(
                    "array header declares {declared} values but the index holds {count}"
                ),
            });
        }
        let last = match count {
            0 => None,
            count => Some(offsets.get_position(count - 1)?),
        };
        let tail = start.tail;
        format.verify_resume(data.as_mut(), last, scanned_end, tail)?;
        Ok(Self::assemble(format, data, offsets, tail, layout))
    }

    fn assemble(
        format: PackedArray<T>,
        data: Box<dyn VfsStream>,
        offsets: OffsetStore,
        tail: u64,
        layout: OffsetLayout,
    ) -> Self {
        let name = data.display_name().to_owned();
        let count = offsets.count();
        debug!(
            target: "recdex.writer",
            stream = %name,
            records = count,
            tail,
            persisted = offsets.is_persisted(),
            "opened packed array handler"
        );
        Self {
            format,
            name,
            data: Some(data),
            offsets: Some(offsets),
            tail,
            count,
            page_size: layout.page_size,
            scratch: Vec::new(),
        }
    }

    /// Append one value at the end of the array.
    pub fn append(&mut self, value: &T) -> Result<()> {
        self.scratch.clear();
        self.format.encode(value, &mut self.scratch)?;
        let (Some(data), Some(offsets)) = (self.data.as_mut(), self.offsets.as_mut()) else {
            return Err(closed_error(&self.name));
        };
        offsets.push_offset(self.tail)?;
        data.seek(SeekFrom::Start(self.tail))?;
        data.write_all(&self.scratch)?;
        self.tail += self.scratch.len() as u64;
        self.count += 1;
        Ok(())
    }

    /// Decode value `index`; negative indices count from the end.
    pub fn get(&mut self, index: i64) -> Result<T> {
        let offsets = self
            .offsets
            .as_ref()
            .ok_or_else(|| closed_error(&self.name))?;
        let position = normalize_index(index, self.count, &offsets.describe())?;
        self.read_run(position, 1)?
            .pop()
            .ok_or_else(|| RecdexError::internal("bounded read produced no value"))
    }

    /// Decode the values selected by `slice`. Unit-step slices are read with
    /// one bounded sequential read.
    pub fn batch_get(&mut self, slice: impl Into<IndexSlice>) -> Result<Vec<T>> {
        if self.is_closed() {
            return Err(closed_error(&self.name));
        }
        let range = slice.into().resolve(self.count)?;
        match range.first() {
            None => Ok(Vec::new()),
            Some(first) if range.is_contiguous() => self.read_run(first, range.len()),
            Some(_) => range
                .iter()
                .map(|position| {
                    self.read_run(position, 1)?
                        .pop()
                        .ok_or_else(|| RecdexError::internal("bounded read produced no value"))
                })
                .collect(),
        }
    }

    /// Decode `len` consecutive values starting at `first`.
    fn read_run(&mut self, first: u64, len: u64) -> Result<Vec<T>> {
        let (count, tail, page_size, format) = (self.count, self.tail, self.page_size, self.format);
        let name = self.name.as_str();
        let (Some(data), Some(offsets)) = (self.data.as_mut(), self.offsets.as_mut()) else {
            return Err(closed_error(name));
        };

        let start = offsets.get_position(first)?;
        let after = first + len;
        let end = if after < count {
            Some(offsets.get_position(after)?)
        } else {
            None
        };
        let out_of_range = |index: u64, offset: u64| RecdexError::OutOfRange {
            stream: name.to_owned(),
            index,
            start_offset: offset,
            end_offset: end,
        };
        let limit = end
            .unwrap_or(tail)
            .checked_sub(start)
            .ok_or_else(|| out_of_range(first, start))?;

        data.seek(SeekFrom::Start(start))?;
        let capacity = usize::try_from(limit).unwrap_or(usize::MAX).clamp(1, page_size);
        let mut run = BufReader::with_capacity(capacity, Read::take(&mut **data, limit));
        let mut values = Vec::with_capacity(usize::try_from(len).unwrap_or_default());
        for index in first..after {
            let offset = start + (limit - run.get_ref().limit()) - run.buffer().len() as u64;
            let ctx = DecodeContext {
                stream: name,
                index,
                offset,
            };
            match format.decode_next(&mut run, &ctx) {
                Ok(Some(value)) => values.push(value),
                Ok(None) => return Err(out_of_range(index, offset)),
                Err(err) if err.is_out_of_data() => return Err(out_of_range(index, offset)),
                Err(err) => return Err(err),
            }
        }
        Ok(values)
    }
}

impl<T> PackedArrayHandler<T> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.data.is_none()
    }

    /// Patch the array header and flush both streams.
    pub fn commit(&mut self) -> Result<()> {
        let (Some(data), Some(offsets)) = (self.data.as_mut(), self.offsets.as_mut()) else {
            return Err(closed_error(&self.name));
        };
        write_array_header(data.as_mut(), self.count)?;
        data.flush()?;
        offsets.commit()
    }

    /// Patch the array header and the index header, then release both
    /// streams. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut data) = self.data.take() else {
            return Ok(());
        };
        let offsets = self.offsets.take();
        write_array_header(data.as_mut(), self.count)?;
        data.flush()?;
        let data_size = data.content_size()?;
        drop(data);
        if let Some(OffsetStore::Persisted(mut array)) = offsets {
            array.write_header(data_size, false)?;
            array.close()?;
        }
        debug!(
            target: "recdex.writer",
            stream = %self.name,
            records = self.count,
            data_size,
            "closed packed array handler"
        );
        Ok(())
    }
}

fn closed_error(name: &str) -> RecdexError {
    RecdexError::invalid_argument(format!("I/O operation on closed handler: {name}"))
}

impl<T> Drop for PackedArrayHandler<T> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(
                target: "recdex.writer",
                stream = %self.name,
                error = %err,
                "failed to close packed array handler on drop"
            );
        }
    }
}

impl<T> fmt::Debug for PackedArrayHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackedArrayHandler")
            .field("stream", &self.name)
            .field("count", &self.count)
            .field("tail", &self.tail)
            .field("closed", &self.data.is_none())
            .finish_non_exhaustive()
    }
}
