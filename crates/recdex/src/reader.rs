//! Random and slice access over an indexed data stream.
//!
//! An [`IndexedReader`] acquires its offsets once at open (see
//! [`recdex_index::acquire_index`]) and then decodes single records on
//! demand. Reads from different threads use different stream handles; every
//! contiguous iterator owns a private cursor, so iterators never disturb each
//! other or point lookups.

use std::collections::HashMap;
use std::fmt;
use std::io::{BufReader, Read, Seek, SeekFrom, Take};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use recdex_error::{RecdexError, Result};
use recdex_index::{
    IndexRequest, IndexSlice, OffsetStore, ScanObserver, SlicePositions, SliceRange,
    acquire_index, normalize_index,
};
use recdex_vfs::{AccessMode, ShadowStream, Vfs, VfsStream};
use tracing::debug;

use crate::config::RecdexConfig;
use crate::format::{DecodeContext, RecordFormat};

type SharedStream = Arc<Mutex<Box<dyn VfsStream>>>;

/// Where new data stream handles come from.
enum StreamSource {
    /// Open the path again.
    Reopen { vfs: Arc<dyn Vfs>, path: String },
    /// Fork a cursor over a stream that cannot be reopened.
    Shadow(ShadowStream),
}

/// Per-thread data stream handles, created on first use by each thread.
struct ThreadStreams {
    name: String,
    source: Mutex<Option<StreamSource>>,
    handles: Mutex<HashMap<ThreadId, SharedStream>>,
}

impl ThreadStreams {
    fn new(name: String, source: StreamSource) -> Self {
        Self {
            name,
            source: Mutex::new(Some(source)),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// A new handle nobody else uses.
    fn fresh(&self) -> Result<Box<dyn VfsStream>> {
        let source = self.source.lock();
        match source.as_ref() {
            Some(StreamSource::Reopen { vfs, path }) => vfs.open(path, AccessMode::Read),
            Some(StreamSource::Shadow(shadow)) => Ok(Box::new(shadow.fork())),
            None => Err(closed_error(&self.name)),
        }
    }

    /// The calling thread's handle.
    fn current(&self) -> Result<SharedStream> {
        let id = thread::current().id();
        if let Some(stream) = self.handles.lock().get(&id) {
            return Ok(Arc::clone(stream));
        }
        let stream = Arc::new(Mutex::new(self.fresh()?));
        Ok(Arc::clone(self.handles.lock().entry(id).or_insert(stream)))
    }

    /// Hand `stream` to the calling thread.
    fn seed(&self, stream: Box<dyn VfsStream>) {
        self.handles
            .lock()
            .insert(thread::current().id(), Arc::new(Mutex::new(stream)));
    }

    /// Drop every handle and the source; later requests fail.
    fn release(&self) -> usize {
        let released = self.handles.lock().drain().count();
        self.source.lock().take();
        released
    }
}

fn closed_error(name: &str) -> RecdexError {
    RecdexError::invalid_argument(format!("I/O operation on closed reader: {name}"))
}

/// Read-only view of a data stream and its offsets.
pub struct IndexedReader<F: RecordFormat> {
    format: F,
    name: String,
    offsets: Mutex<Option<OffsetStore>>,
    count: u64,
    data_size: u64,
    page_size: usize,
    streams: ThreadStreams,
}

impl<F: RecordFormat> IndexedReader<F> {
    /// Open the stream at `path`, validating or rebuilding its index.
    pub fn open(
        vfs: Arc<dyn Vfs>,
        path: &str,
        format: F,
        config: &RecdexConfig,
        observer: Option<&mut ScanObserver<'_>>,
    ) -> Result<Self> {
        config.validate()?;
        let data = vfs.open(path, AccessMode::Read)?;
        let index_path = config.index_path_for(path);
        let source = vfs.can_reopen().then(|| StreamSource::Reopen {
            vfs: Arc::clone(&vfs),
            path: path.to_owned(),
        });
        Self::assemble(
            vfs.as_ref(),
            data,
            source,
            index_path.as_deref(),
            format,
            config,
            observer,
        )
    }

    /// Read an already opened stream. The stream is shared between threads
    /// through [`ShadowStream`] cursors. The index path comes from the
    /// stream's reopen path, if it has one.
    pub fn from_stream(
        vfs: &dyn Vfs,
        data: Box<dyn VfsStream>,
        format: F,
        config: &RecdexConfig,
        observer: Option<&mut ScanObserver<'_>>,
    ) -> Result<Self> {
        config.validate()?;
        let index_path = match &data.info().reopen_path {
            Some(path) => config.index_path_for(path),
            None => config
                .index_path
                .clone()
                .filter(|_| config.persist_index),
        };
        Self::assemble(
            vfs,
            data,
            None,
            index_path.as_deref(),
            format,
            config,
            observer,
        )
    }

    fn assemble(
        vfs: &dyn Vfs,
        mut data: Box<dyn VfsStream>,
        source: Option<StreamSource>,
        index_path: Option<&str>,
        format: F,
        config: &RecdexConfig,
        observer: Option<&mut ScanObserver<'_>>,
    ) -> Result<Self> {
        let name = data.display_name().to_owned();
        let data_size = data.content_size()?;
        let request = IndexRequest {
            vfs,
            index_path,
            layout: config.layout(),
            writable: false,
        };
        let acquired = acquire_index(&request, data.as_mut(), &format, observer)?;
        let count = acquired.count();
        debug!(
            target: "recdex.reader",
            stream = %name,
            format = F::NAME,
            records = count,
            data_size,
            persisted = acquired.is_persisted(),
            "opened reader"
        );

        let streams = match source {
            Some(source) => {
                let streams = ThreadStreams::new(name.clone(), source);
                streams.seed(data);
                streams
            }
            None => {
                let shadow = ShadowStream::share(data)?;
                let first = shadow.fork();
                let streams = ThreadStreams::new(name.clone(), StreamSource::Shadow(shadow));
                streams.seed(Box::new(first));
                streams
            }
        };

        Ok(Self {
            format,
            name,
            offsets: Mutex::new(Some(acquired.into_store())),
            count,
            data_size,
            page_size: config.page_size,
            streams,
        })
    }

    /// Display name of the data stream.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn format(&self) -> &F {
        &self.format
    }

    /// Number of indexed records.
    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Whether the offsets come from an index file.
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.offsets
            .lock()
            .as_ref()
            .is_some_and(OffsetStore::is_persisted)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.offsets.lock().is_none()
    }

    /// Decode record `index`; negative indices count from the end.
    pub fn get(&self, index: i64) -> Result<F::Record> {
        let position = {
            let guard = self.offsets.lock();
            let store = guard.as_ref().ok_or_else(|| closed_error(&self.name))?;
            normalize_index(index, self.count, &store.describe())?
        };
        self.read_at(position)
    }

    /// Lazy view of the records selected by `slice`.
    pub fn batch_get(&self, slice: impl Into<IndexSlice>) -> Result<RecordSlice<'_, F>> {
        if self.is_closed() {
            return Err(closed_error(&self.name));
        }
        let range = slice.into().resolve(self.count)?;
        Ok(RecordSlice {
            reader: self,
            range,
        })
    }

    /// Every record, in order.
    pub fn iter(&self) -> RecordIter<'_, F> {
        RecordIter::new(self, SliceRange::full(self.count))
    }

    /// Release the index and every stream handle. Later reads fail; closing
    /// again is a no-op.
    pub fn close(&self) -> Result<()> {
        let Some(store) = self.offsets.lock().take() else {
            return Ok(());
        };
        let released = self.streams.release();
        debug!(
            target: "recdex.reader",
            stream = %self.name,
            released,
            "closed reader"
        );
        store.close()
    }

    /// Offset of `position` and, where the format needs it, of the record
    /// after it.
    fn span(&self, position: u64) -> Result<(u64, Option<u64>)> {
        let mut guard = self.offsets.lock();
        let store = guard.as_mut().ok_or_else(|| closed_error(&self.name))?;
        let start = store.get_position(position)?;
        let end = if F::NEEDS_UPPER_BOUND {
            store.bound_after(position)?
        } else {
            None
        };
        Ok((start, end))
    }

    /// Offsets bounding the contiguous run of `len` records at `first`.
    fn run_span(&self, first: u64, len: u64) -> Result<(u64, Option<u64>)> {
        let mut guard = self.offsets.lock();
        let store = guard.as_mut().ok_or_else(|| closed_error(&self.name))?;
        let start = store.get_position(first)?;
        let after = first + len;
        let end = if after < self.count {
            Some(store.get_position(after)?)
        } else {
            None
        };
        Ok((start, end))
    }

    fn out_of_range(&self, index: u64, start: u64, end: Option<u64>) -> RecdexError {
        RecdexError::OutOfRange {
            stream: self.name.clone(),
            index,
            start_offset: start,
            end_offset: end,
        }
    }

    /// Open a bounded buffered run over `[start, end)`, `end` defaulting to
    /// the data size measured at open.
    fn bounded_run<S: Read>(
        &self,
        stream: S,
        start: u64,
        end: Option<u64>,
    ) -> Option<BufReader<Take<S>>> {
        let limit = end.unwrap_or(self.data_size).checked_sub(start)?;
        let capacity = usize::try_from(limit)
            .unwrap_or(usize::MAX)
            .clamp(1, self.page_size);
        Some(BufReader::with_capacity(capacity, stream.take(limit)))
    }

    fn read_at(&self, position: u64) -> Result<F::Record> {
        let (start, end) = self.span(position)?;
        let stream = self.streams.current()?;
        let mut stream = stream.lock();
        stream.seek(SeekFrom::Start(start))?;
        let Some(mut run) = self.bounded_run(&mut **stream, start, end) else {
            return Err(self.out_of_range(position, start, end));
        };
        let ctx = DecodeContext {
            stream: &self.name,
            index: position,
            offset: start,
        };
        match self.format.decode_next(&mut run, &ctx) {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(self.out_of_range(position, start, end)),
            Err(err) if err.is_out_of_data() => Err(self.out_of_range(position, start, end)),
            Err(err) => Err(err),
        }
    }
}

impl<F: RecordFormat> fmt::Debug for IndexedReader<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexedReader")
            .field("stream", &self.name)
            .field("format", &F::NAME)
            .field("count", &self.count)
            .field("data_size", &self.data_size)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<'r, F: RecordFormat> IntoIterator for &'r IndexedReader<F> {
    type Item = Result<F::Record>;
    type IntoIter = RecordIter<'r, F>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Records selected by a slice; nothing is read until iterated or indexed.
pub struct RecordSlice<'r, F: RecordFormat> {
    reader: &'r IndexedReader<F>,
    range: SliceRange,
}

impl<'r, F: RecordFormat> RecordSlice<'r, F> {
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.range.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Record positions this slice selects.
    #[must_use]
    pub const fn range(&self) -> SliceRange {
        self.range
    }

    /// Slice this slice.
    pub fn slice(&self, slice: impl Into<IndexSlice>) -> Result<Self> {
        Ok(Self {
            reader: self.reader,
            range: self.range.slice(&slice.into())?,
        })
    }

    /// Decode the `index`th record of this slice.
    pub fn get(&self, index: i64) -> Result<F::Record> {
        let handler = format!("RecordSlice({:?})", self.reader.name);
        let n = normalize_index(index, self.range.len(), &handler)?;
        let position = self
            .range
            .get(n)
            .ok_or_else(|| RecdexError::internal("normalized slice index outside range"))?;
        self.reader.read_at(position)
    }

    #[must_use]
    pub fn iter(&self) -> RecordIter<'r, F> {
        RecordIter::new(self.reader, self.range)
    }

    /// Decode every selected record.
    pub fn to_vec(&self) -> Result<Vec<F::Record>> {
        self.iter().collect()
    }
}

impl<F: RecordFormat> Clone for RecordSlice<'_, F> {
    fn clone(&self) -> Self {
        Self {
            reader: self.reader,
            range: self.range,
        }
    }
}

impl<F: RecordFormat> fmt::Debug for RecordSlice<'_, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSlice")
            .field("stream", &self.reader.name)
            .field("range", &self.range)
            .finish()
    }
}

impl<'r, F: RecordFormat> IntoIterator for RecordSlice<'r, F> {
    type Item = Result<F::Record>;
    type IntoIter = RecordIter<'r, F>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

enum IterState {
    /// Unit step: one cursor decodes records back to back.
    Contiguous {
        run: Option<ContiguousRun>,
        next: u64,
        remaining: u64,
    },
    /// Any other step: one positioned read per record.
    Strided(SlicePositions),
    Done,
}

struct ContiguousRun {
    reader: BufReader<Take<Box<dyn VfsStream>>>,
    start: u64,
    limit: u64,
    end: Option<u64>,
}

impl ContiguousRun {
    /// Offset of the next undecoded byte.
    fn offset(&self) -> u64 {
        let fetched = self.limit - self.reader.get_ref().limit();
        self.start + fetched - self.reader.buffer().len() as u64
    }
}

impl<F: RecordFormat> IndexedReader<F> {
    /// Private cursor over the `len` records starting at `first`.
    fn open_run(&self, first: u64, len: u64) -> Result<ContiguousRun> {
        let (start, end) = self.run_span(first, len)?;
        let mut stream = self.streams.fresh()?;
        stream.seek(SeekFrom::Start(start))?;
        let limit = end.unwrap_or(self.data_size).saturating_sub(start);
        let reader = self
            .bounded_run(stream, start, end)
            .ok_or_else(|| self.out_of_range(first, start, end))?;
        Ok(ContiguousRun {
            reader,
            start,
            limit,
            end,
        })
    }
}

/// Iterator over decoded records. Stops after the first error.
pub struct RecordIter<'r, F: RecordFormat> {
    reader: &'r IndexedReader<F>,
    state: IterState,
}

impl<'r, F: RecordFormat> RecordIter<'r, F> {
    fn new(reader: &'r IndexedReader<F>, range: SliceRange) -> Self {
        let state = match range.first() {
            None => IterState::Done,
            Some(first) if range.is_contiguous() => IterState::Contiguous {
                run: None,
                next: first,
                remaining: range.len(),
            },
            Some(_) => IterState::Strided(range.iter()),
        };
        Self { reader, state }
    }

    fn next_contiguous(&mut self) -> Option<Result<F::Record>> {
        let reader = self.reader;
        let IterState::Contiguous {
            run,
            next,
            remaining,
        } = &mut self.state
        else {
            return None;
        };
        if *remaining == 0 {
            return None;
        }
        if run.is_none() {
            match reader.open_run(*next, *remaining) {
                Ok(opened) => *run = Some(opened),
                Err(err) => return Some(Err(err)),
            }
        }
        let run = run.as_mut()?;
        let position = *next;
        let offset = run.offset();
        let ctx = DecodeContext {
            stream: &reader.name,
            index: position,
            offset,
        };
        let decoded = match reader.format.decode_next(&mut run.reader, &ctx) {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(reader.out_of_range(position, offset, run.end)),
            Err(err) if err.is_out_of_data() => {
                Err(reader.out_of_range(position, offset, run.end))
            }
            Err(err) => Err(err),
        };
        *next += 1;
        *remaining -= 1;
        Some(decoded)
    }
}

impl<F: RecordFormat> Iterator for RecordIter<'_, F> {
    type Item = Result<F::Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = if let IterState::Strided(positions) = &mut self.state {
            let reader = self.reader;
            positions.next().map(|position| reader.read_at(position))
        } else {
            self.next_contiguous()
        };
        if !matches!(item, Some(Ok(_))) {
            self.state = IterState::Done;
        }
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = match &self.state {
            IterState::Done => 0,
            IterState::Contiguous { remaining, .. } => {
                usize::try_from(*remaining).unwrap_or(usize::MAX)
            }
            IterState::Strided(positions) => positions.len(),
        };
        (0, Some(remaining))
    }
}

impl<F: RecordFormat> fmt::Debug for RecordIter<'_, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordIter")
            .field("stream", &self.reader.name)
            .finish_non_exhaustive()
    }
}
