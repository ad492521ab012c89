//! Fixed-width offset arrays stored in a stream.
//!
//! An [`OffsetArray`] owns one [`VfsStream`] laid out as an optional
//! [`IndexHeader`] followed by `count` offsets of `encoding.width()` bytes
//! each. The handler remembers where the stream cursor is, so sequential
//! reads and appends never issue redundant seeks.

use std::io::{Read, Seek, SeekFrom, Write};

use recdex_error::{RecdexError, Result};
use recdex_vfs::{AccessMode, Vfs, VfsStream};
use tracing::debug;

use crate::header::{HEADER_SIZE, HeaderVerdict, IndexHeader, OffsetEncoding};
use crate::mode::OpenMode;
use crate::slice::{IndexSlice, SlicePositions, SliceRange, normalize_index};

/// Default size of one sequential read.
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Physical layout of an offset array stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetLayout {
    pub encoding: OffsetEncoding,
    /// Whether the stream starts with a 16-byte [`IndexHeader`].
    pub with_header: bool,
    /// Bytes fetched per read during scans and contiguous batch reads.
    pub page_size: usize,
}

impl OffsetLayout {
    /// Layout of an index sidecar file.
    #[must_use]
    pub const fn indexed(encoding: OffsetEncoding) -> Self {
        Self {
            encoding,
            with_header: true,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Bare offsets without a header.
    #[must_use]
    pub const fn headerless(encoding: OffsetEncoding) -> Self {
        Self {
            encoding,
            with_header: false,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub const fn header_size(&self) -> u64 {
        if self.with_header {
            HEADER_SIZE as u64
        } else {
            0
        }
    }

    #[must_use]
    pub const fn width(&self) -> u64 {
        self.encoding.width() as u64
    }

    /// Page size rounded down to whole offsets, never less than one.
    fn page_bytes(&self) -> u64 {
        let width = self.width();
        (self.page_size as u64 / width).max(1) * width
    }
}

impl Default for OffsetLayout {
    fn default() -> Self {
        Self::indexed(OffsetEncoding::default())
    }
}

/// Anything record offsets can be pushed into while scanning a data stream.
pub trait OffsetSink {
    fn push_offset(&mut self, offset: u64) -> Result<()>;

    fn offset_count(&self) -> u64;
}

impl OffsetSink for Vec<u64> {
    fn push_offset(&mut self, offset: u64) -> Result<()> {
        self.push(offset);
        Ok(())
    }

    fn offset_count(&self) -> u64 {
        self.len() as u64
    }
}

/// Random access, append and paged scanning over a stream of offsets.
#[derive(Debug)]
pub struct OffsetArray {
    stream: Box<dyn VfsStream>,
    layout: OffsetLayout,
    content_size: u64,
    /// Known stream position, `None` after a failed operation.
    cursor: Option<u64>,
}

impl OffsetArray {
    /// Wrap an already opened stream. Existing content must be a whole number
    /// of offsets after the header; an empty stream holds zero offsets.
    pub fn new(mut stream: Box<dyn VfsStream>, layout: OffsetLayout) -> Result<Self> {
        if layout.page_size == 0 {
            return Err(RecdexError::invalid_argument("page size must be positive"));
        }
        let size = stream.content_size()?;
        let content_size = if size == 0 {
            0
        } else {
            size.checked_sub(layout.header_size())
                .ok_or_else(|| RecdexError::Format {
                    stream: stream.display_name().to_owned(),
                    detail: format!("{size} bytes is shorter than the index header"),
                })?
        };
        let trailing = content_size % layout.width();
        if trailing != 0 {
            return Err(RecdexError::Format {
                stream: stream.display_name().to_owned(),
                detail: format!(
                    "unexpected trailing data: {trailing} bytes after {} offsets",
                    content_size / layout.width()
                ),
            });
        }
        Ok(Self {
            stream,
            layout,
            content_size,
            cursor: None,
        })
    }

    /// Open a raw offset array file by mode (`r`, `w`, `a`, `w+`, `a+`).
    ///
    /// `a+` continues an existing file read-write and creates it otherwise.
    pub fn open(vfs: &dyn Vfs, path: &str, mode: OpenMode, layout: OffsetLayout) -> Result<Self> {
        let exists = mode == OpenMode::ReadAppend && vfs.exists(path)?;
        let stream = vfs.open(path, mode.access_mode(exists))?;
        Self::new(stream, layout)
    }

    /// Inspect the header of the index file at `path` against the current
    /// data size without modifying anything.
    pub fn header_verdict(
        vfs: &dyn Vfs,
        path: &str,
        encoding: OffsetEncoding,
        data_size: u64,
    ) -> HeaderVerdict {
        let mut stream = match vfs.open(path, AccessMode::Read) {
            Ok(stream) => stream,
            Err(RecdexError::NotFound { .. }) => return HeaderVerdict::Missing,
            Err(err) => return HeaderVerdict::Unreadable(err.to_string()),
        };
        let mut buf = [0_u8; HEADER_SIZE];
        if let Err(err) = stream.read_exact(&mut buf) {
            return HeaderVerdict::Unreadable(err.to_string());
        }
        match IndexHeader::from_bytes(&buf) {
            Ok(header) => header.verdict(encoding, data_size),
            Err(err) => HeaderVerdict::Unreadable(err.to_string()),
        }
    }

    /// True only if the index at `path` exists, carries the right magic and
    /// tag, and was finalized for exactly `data_size` bytes of data.
    pub fn check_header(
        vfs: &dyn Vfs,
        path: &str,
        encoding: OffsetEncoding,
        data_size: u64,
    ) -> bool {
        let verdict = Self::header_verdict(vfs, path, encoding, data_size);
        if !verdict.is_valid() {
            debug!(target: "recdex.index", path, ?verdict, "index header rejected");
        }
        verdict.is_valid()
    }

    #[must_use]
    pub const fn layout(&self) -> OffsetLayout {
        self.layout
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        self.stream.display_name()
    }

    /// Handler identity used in error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        let info = self.stream.info();
        format!(
            "OffsetArray({:?}, {:?})",
            info.display_name,
            info.access_mode.as_str()
        )
    }

    #[must_use]
    pub const fn count(&self) -> u64 {
        self.content_size / self.layout.width()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.content_size == 0
    }

    fn position_of(&self, position: u64) -> u64 {
        self.layout.header_size() + position * self.layout.width()
    }

    fn seek_to(&mut self, pos: u64) -> Result<()> {
        if self.cursor != Some(pos) {
            self.cursor = None;
            self.stream.seek(SeekFrom::Start(pos))?;
        }
        self.cursor = Some(pos);
        Ok(())
    }

    fn read_value_at(&mut self, pos: u64) -> Result<u64> {
        let width = self.layout.encoding.width();
        let mut buf = [0_u8; 8];
        self.seek_to(pos)?;
        self.cursor = None;
        self.stream.read_exact(&mut buf[..width])?;
        self.cursor = Some(pos + width as u64);
        Ok(self.layout.encoding.decode(&buf[..width]))
    }

    fn write_value_at(&mut self, pos: u64, value: u64) -> Result<()> {
        let width = self.layout.encoding.width();
        let mut buf = [0_u8; 8];
        self.layout.encoding.encode(value, &mut buf)?;
        self.seek_to(pos)?;
        self.cursor = None;
        self.stream.write_all(&buf[..width])?;
        self.cursor = Some(pos + width as u64);
        Ok(())
    }

    /// Read the header of this stream.
    pub fn read_header(&mut self) -> Result<IndexHeader> {
        if !self.layout.with_header {
            return Err(RecdexError::invalid_argument(format!(
                "{} has no header",
                self.describe()
            )));
        }
        let mut buf = [0_u8; HEADER_SIZE];
        self.seek_to(0)?;
        self.cursor = None;
        self.stream.read_exact(&mut buf)?;
        self.cursor = Some(HEADER_SIZE as u64);
        IndexHeader::from_bytes(&buf).map_err(|err| match err {
            RecdexError::Format { detail, .. } => RecdexError::Format {
                stream: self.display_name().to_owned(),
                detail,
            },
            other => other,
        })
    }

    /// Write magic, tag and `data_size` at offset 0.
    ///
    /// An intrusive write leaves the stream right after the header; otherwise
    /// the previous position is restored.
    pub fn write_header(&mut self, data_size: u64, intrusive: bool) -> Result<()> {
        if !self.layout.with_header {
            return Err(RecdexError::invalid_argument(format!(
                "{} has no header",
                self.describe()
            )));
        }
        if self.stream.info().access_mode == AccessMode::Append {
            return Err(RecdexError::invalid_argument(format!(
                "{} is append-only, its header cannot be rewritten",
                self.describe()
            )));
        }
        let previous = match self.cursor {
            Some(pos) => pos,
            None => self.stream.stream_position()?,
        };
        let header = IndexHeader::new(self.layout.encoding, data_size);
        self.seek_to(0)?;
        self.cursor = None;
        self.stream.write_all(&header.to_bytes())?;
        self.cursor = Some(HEADER_SIZE as u64);
        if !intrusive {
            self.seek_to(previous)?;
        }
        Ok(())
    }

    /// Offset at `index`; negative indices count from the end.
    pub fn get(&mut self, index: i64) -> Result<u64> {
        let position = normalize_index(index, self.count(), &self.describe())?;
        self.read_value_at(self.position_of(position))
    }

    /// Offset at a non-negative position.
    pub fn get_position(&mut self, position: u64) -> Result<u64> {
        if position >= self.count() {
            return Err(RecdexError::IndexOutOfBounds {
                handler: self.describe(),
                index: i64::try_from(position).unwrap_or(i64::MAX),
                count: self.count(),
            });
        }
        self.read_value_at(self.position_of(position))
    }

    /// Overwrite the offset at an existing `index`.
    pub fn put(&mut self, index: i64, value: u64) -> Result<()> {
        let position = normalize_index(index, self.count(), &self.describe())?;
        self.write_value_at(self.position_of(position), value)
    }

    /// Overwrite several existing offsets. Both sequences must have the same
    /// length; positions before the mismatch are already written.
    pub fn batch_put<I, V>(&mut self, indices: I, values: V) -> Result<()>
    where
        I: IntoIterator<Item = i64>,
        V: IntoIterator<Item = u64>,
    {
        let mut indices = indices.into_iter();
        let mut values = values.into_iter();
        loop {
            match (indices.next(), values.next()) {
                (Some(index), Some(value)) => self.put(index, value)?,
                (None, None) => return Ok(()),
                _ => {
                    return Err(RecdexError::invalid_argument(
                        "batch_put needs as many values as indices",
                    ));
                }
            }
        }
    }

    /// Write `value` at the logical tail, wherever the cursor is.
    pub fn append(&mut self, value: u64) -> Result<()> {
        let tail = self.layout.header_size() + self.content_size;
        self.write_value_at(tail, value)?;
        self.content_size += self.layout.width();
        Ok(())
    }

    /// Lazily iterate every offset with paged sequential reads. Each call
    /// starts over from the first offset.
    pub fn scan(&mut self) -> OffsetBatch<'_> {
        let range = SliceRange::full(self.count());
        self.batch_range(range)
    }

    /// Lazily iterate the offsets selected by `slice`.
    pub fn batch_get(&mut self, slice: &IndexSlice) -> Result<OffsetBatch<'_>> {
        let range = slice.resolve(self.count())?;
        Ok(self.batch_range(range))
    }

    /// Lazily iterate the offsets at the positions of `range`, which must
    /// have been resolved against [`OffsetArray::count`]. Unit-step ranges
    /// are served by one seek followed by paged reads; other steps read one
    /// offset per position.
    pub fn batch_range(&mut self, range: SliceRange) -> OffsetBatch<'_> {
        let state = match range.first() {
            None => BatchState::Done,
            Some(first) if range.is_contiguous() => BatchState::Paged {
                next_read: self.position_of(first),
                remaining: range.len() * self.layout.width(),
                page: Vec::new(),
                consumed: 0,
            },
            Some(_) => BatchState::Strided(range.iter()),
        };
        OffsetBatch { array: self, state }
    }

    /// Flush buffered writes.
    pub fn commit(&mut self) -> Result<()> {
        self.stream.flush()?;
        Ok(())
    }

    /// Flush and release the stream.
    pub fn close(mut self) -> Result<()> {
        self.commit()
    }
}

impl OffsetSink for OffsetArray {
    fn push_offset(&mut self, offset: u64) -> Result<()> {
        self.append(offset)
    }

    fn offset_count(&self) -> u64 {
        self.count()
    }
}

#[derive(Debug)]
enum BatchState {
    Paged {
        next_read: u64,
        remaining: u64,
        page: Vec<u8>,
        consumed: usize,
    },
    Strided(SlicePositions),
    Done,
}

/// Lazy iterator over a range of offsets, see [`OffsetArray::batch_range`].
#[derive(Debug)]
pub struct OffsetBatch<'a> {
    array: &'a mut OffsetArray,
    state: BatchState,
}

impl OffsetBatch<'_> {
    fn next_paged(&mut self) -> Option<Result<u64>> {
        let width = self.array.layout.encoding.width();
        let page_bytes = self.array.layout.page_bytes();
        let BatchState::Paged {
            next_read,
            remaining,
            page,
            consumed,
        } = &mut self.state
        else {
            return None;
        };
        if *consumed + width > page.len() {
            if *remaining == 0 {
                return None;
            }
            let len = (*remaining).min(page_bytes);
            page.resize(len as usize, 0);
            if let Err(err) = self.array.seek_to(*next_read) {
                return Some(Err(err));
            }
            self.array.cursor = None;
            if let Err(err) = self.array.stream.read_exact(page) {
                return Some(Err(err.into()));
            }
            *next_read += len;
            *remaining -= len;
            *consumed = 0;
            self.array.cursor = Some(*next_read);
        }
        let value = self
            .array
            .layout
            .encoding
            .decode(&page[*consumed..*consumed + width]);
        *consumed += width;
        Some(Ok(value))
    }
}

impl Iterator for OffsetBatch<'_> {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Result<u64>> {
        let item = match &mut self.state {
            BatchState::Done => return None,
            BatchState::Strided(positions) => positions
                .next()
                .map(|position| self.array.get_position(position)),
            BatchState::Paged { .. } => self.next_paged(),
        };
        match item {
            Some(Ok(value)) => Some(Ok(value)),
            Some(Err(err)) => {
                self.state = BatchState::Done;
                Some(Err(err))
            }
            None => {
                self.state = BatchState::Done;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recdex_vfs::MemoryVfs;

    fn fresh(vfs: &MemoryVfs, path: &str, layout: OffsetLayout) -> OffsetArray {
        OffsetArray::open(vfs, path, OpenMode::ReadWrite, layout).unwrap()
    }

    #[test]
    fn test_append_get_and_negative_indices() {
        let vfs = MemoryVfs::new();
        let mut array = fresh(&vfs, "a.idx", OffsetLayout::default());
        array.write_header(0, true).unwrap();
        for value in [0, 10, 25, 40] {
            array.append(value).unwrap();
        }
        assert_eq!(array.count(), 4);
        assert_eq!(array.get(0).unwrap(), 0);
        assert_eq!(array.get(2).unwrap(), 25);
        assert_eq!(array.get(-1).unwrap(), 40);
        assert_eq!(array.get(-4).unwrap(), 0);

        let err = array.get(4).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("OffsetArray(\"a.idx\", \"wb+\")"), "{text}");
        assert!(text.contains("valid range: [-4, 4)"), "{text}");
    }

    #[test]
    fn test_append_ignores_physical_cursor() {
        let vfs = MemoryVfs::new();
        let mut array = fresh(&vfs, "a.idx", OffsetLayout::default());
        array.write_header(0, true).unwrap();
        array.append(1).unwrap();
        array.append(2).unwrap();
        // Reading moves the cursor back to the first offset.
        assert_eq!(array.get(0).unwrap(), 1);
        array.append(3).unwrap();
        assert_eq!(array.scan().collect::<Result<Vec<_>>>().unwrap(), vec![1, 2, 3]);
        assert_eq!(vfs.read_file("a.idx").unwrap().len(), HEADER_SIZE + 3 * 8);
    }

    #[test]
    fn test_header_intrusive_and_restoring_writes() {
        let vfs = MemoryVfs::new();
        let mut array = fresh(&vfs, "a.idx", OffsetLayout::default());
        array.write_header(0, true).unwrap();
        array.append(7).unwrap();
        array.write_header(99, false).unwrap();
        array.append(8).unwrap();
        array.commit().unwrap();

        let header = array.read_header().unwrap();
        assert_eq!(header, IndexHeader::new(OffsetEncoding::U64, 99));
        assert_eq!(array.scan().collect::<Result<Vec<_>>>().unwrap(), vec![7, 8]);
        assert!(OffsetArray::check_header(&vfs, "a.idx", OffsetEncoding::U64, 99));
        assert!(!OffsetArray::check_header(&vfs, "a.idx", OffsetEncoding::U64, 98));
        assert!(!OffsetArray::check_header(&vfs, "a.idx", OffsetEncoding::U32, 99));
        assert!(!OffsetArray::check_header(&vfs, "missing.idx", OffsetEncoding::U64, 99));
    }

    #[test]
    fn test_check_header_never_fails() {
        let vfs = MemoryVfs::new();
        vfs.write_file("short.idx", b"IDV".to_vec());
        assert!(matches!(
            OffsetArray::header_verdict(&vfs, "short.idx", OffsetEncoding::U64, 0),
            HeaderVerdict::Unreadable(_)
        ));
        vfs.deny("denied.idx");
        assert!(!OffsetArray::check_header(&vfs, "denied.idx", OffsetEncoding::U64, 0));
        assert_eq!(
            OffsetArray::header_verdict(&vfs, "nothing.idx", OffsetEncoding::U64, 0),
            HeaderVerdict::Missing
        );
    }

    #[test]
    fn test_trailing_bytes_are_format_errors() {
        let vfs = MemoryVfs::new();
        let mut bytes = IndexHeader::new(OffsetEncoding::U64, 0).to_bytes().to_vec();
        bytes.extend_from_slice(&[0_u8; 12]);
        vfs.write_file("bad.idx", bytes);
        let err = OffsetArray::open(&vfs, "bad.idx", OpenMode::Read, OffsetLayout::default())
            .unwrap_err();
        assert!(matches!(err, RecdexError::Format { .. }), "{err}");
        assert!(err.to_string().contains("bad.idx"), "{err}");

        vfs.write_file("tiny.idx", b"IDV1Q".to_vec());
        let err = OffsetArray::open(&vfs, "tiny.idx", OpenMode::Read, OffsetLayout::default())
            .unwrap_err();
        assert!(matches!(err, RecdexError::Format { .. }), "{err}");
    }

    #[test]
    fn test_scan_pages_smaller_than_content() {
        let vfs = MemoryVfs::new();
        // Page sizes round down to whole offsets, never below one.
        for page_size in [1, 5, 8, 64] {
            let layout = OffsetLayout::headerless(OffsetEncoding::U32).with_page_size(page_size);
            let mut array = fresh(&vfs, "raw.bin", layout);
            for value in 0..11_u64 {
                array.append(value * 3).unwrap();
            }
            let scanned: Vec<u64> = array.scan().collect::<Result<_>>().unwrap();
            assert_eq!(scanned, (0..11_u64).map(|v| v * 3).collect::<Vec<_>>());
            // Restartable.
            assert_eq!(array.scan().count(), 11);
        }
    }

    #[test]
    fn test_batch_get_contiguous_and_strided() {
        let vfs = MemoryVfs::new();
        let mut array = fresh(&vfs, "a.idx", OffsetLayout::default().with_page_size(16));
        array.write_header(0, true).unwrap();
        for value in 0..10_u64 {
            array.append(value * 100).unwrap();
        }
        let contiguous: Vec<u64> = array
            .batch_get(&IndexSlice::from(2..5))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(contiguous, vec![200, 300, 400]);

        let reversed: Vec<u64> = array
            .batch_get(&IndexSlice::step_by(-3))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(reversed, vec![900, 600, 300, 0]);

        assert_eq!(array.batch_get(&IndexSlice::from(5..2)).unwrap().count(), 0);
        assert!(array.batch_get(&IndexSlice::step_by(0)).is_err());
    }

    #[test]
    fn test_put_and_batch_put() {
        let vfs = MemoryVfs::new();
        let mut array = fresh(&vfs, "raw.bin", OffsetLayout::headerless(OffsetEncoding::U64Be));
        for value in [1, 2, 3] {
            array.append(value).unwrap();
        }
        array.put(-1, 30).unwrap();
        array.batch_put([0, 1], [10, 20]).unwrap();
        assert_eq!(array.scan().collect::<Result<Vec<_>>>().unwrap(), vec![10, 20, 30]);
        let bytes = vfs.read_file("raw.bin").unwrap();
        assert_eq!(&bytes[..8], &10_u64.to_be_bytes());

        assert!(array.batch_put([0, 1], [5]).is_err());
        assert!(array.put(3, 0).is_err());
    }

    #[test]
    fn test_open_modes() {
        let vfs = MemoryVfs::new();
        let layout = OffsetLayout::headerless(OffsetEncoding::U64);
        {
            let mut array = OffsetArray::open(&vfs, "m.bin", OpenMode::Write, layout).unwrap();
            array.append(1).unwrap();
            array.close().unwrap();
        }
        {
            let mut array = OffsetArray::open(&vfs, "m.bin", OpenMode::Append, layout).unwrap();
            assert_eq!(array.count(), 1);
            array.append(2).unwrap();
        }
        {
            let mut array = OffsetArray::open(&vfs, "m.bin", OpenMode::ReadAppend, layout).unwrap();
            assert_eq!(array.get(-1).unwrap(), 2);
            array.append(3).unwrap();
            assert_eq!(array.scan().collect::<Result<Vec<_>>>().unwrap(), vec![1, 2, 3]);
        }
        {
            let array = OffsetArray::open(&vfs, "m.bin", OpenMode::ReadWrite, layout).unwrap();
            assert!(array.is_empty());
        }
        let mut array = OffsetArray::open(&vfs, "new.bin", OpenMode::ReadAppend, layout).unwrap();
        assert!(array.is_empty());
        array.append(4).unwrap();
        assert_eq!(array.get(0).unwrap(), 4);

        let err = OffsetArray::open(&vfs, "absent.bin", OpenMode::Read, layout).unwrap_err();
        assert!(matches!(err, RecdexError::NotFound { .. }), "{err}");
    }

    #[test]
    fn test_append_only_stream_cannot_rewrite_header() {
        let vfs = MemoryVfs::new();
        let mut array =
            OffsetArray::open(&vfs, "a.idx", OpenMode::Append, OffsetLayout::default()).unwrap();
        assert!(array.write_header(0, true).is_err());
    }

    #[test]
    fn test_vec_sink() {
        let mut sink: Vec<u64> = Vec::new();
        sink.push_offset(3).unwrap();
        sink.push_offset(9).unwrap();
        assert_eq!(sink.offset_count(), 2);
    }
}
