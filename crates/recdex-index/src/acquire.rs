//! Index validation and build protocol.
//!
//! Every open of an existing data stream goes through [`acquire_index`]:
//!
//! 1. Without an index path the offsets are scanned into memory.
//! 2. With a path whose header matches the current data size, the index file
//!    is trusted and opened as is.
//! 3. Otherwise the index is rebuilt: a placeholder header is written, the
//!    data stream is scanned from offset 0 (its position is restored
//!    afterwards), and the header is finalized with the data size measured
//!    before the scan. A rebuild torn before finalization therefore stays
//!    stale and is redone on the next open.
//! 4. If the index path cannot be opened or written (permission denied,
//!    unsupported scheme, missing parent, I/O failure) the offsets are
//!    scanned into memory instead.

use std::io::{BufRead, BufReader, Seek, SeekFrom};

use recdex_error::{RecdexError, Result};
use recdex_vfs::{AccessMode, Vfs, VfsStream};
use tracing::{debug, info, warn};

use crate::offset_array::{OffsetArray, OffsetLayout, OffsetSink};
use crate::slice::normalize_index;

/// One record found while scanning a data stream.
#[derive(Debug, Clone, Copy)]
pub struct ScannedRecord<'a> {
    /// Position of the record in the stream.
    pub index: u64,
    /// Byte offset of the record's first byte.
    pub offset: u64,
    /// The record's raw bytes.
    pub raw: &'a [u8],
}

/// Callback invoked for every record found by a rebuild scan.
pub type ScanObserver<'a> = dyn FnMut(&ScannedRecord<'_>) + 'a;

/// Finds record boundaries in a data stream.
pub trait BoundaryScanner {
    /// Read `data` from its first byte, push the offset of every complete
    /// record into `sink`, and return the offset just past the last one.
    /// A partial trailing record is not indexed.
    fn scan_boundaries(
        &self,
        data: &mut dyn BufRead,
        stream: &str,
        sink: &mut dyn OffsetSink,
        observer: Option<&mut ScanObserver<'_>>,
    ) -> Result<u64>;
}

/// Where and how the index of one data stream lives.
#[derive(Debug, Clone, Copy)]
pub struct IndexRequest<'a> {
    pub vfs: &'a dyn Vfs,
    /// Sidecar path; `None` keeps the index in memory.
    pub index_path: Option<&'a str>,
    pub layout: OffsetLayout,
    /// Reopen a persisted index read-write instead of read-only.
    pub writable: bool,
}

/// Result of a full scan of the data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub records: u64,
    /// Offset just past the last complete record.
    pub end_offset: u64,
}

/// Why offsets are held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EphemeralReason {
    NoIndexPath,
    /// The index path could not be opened or written.
    Unavailable { path: String, detail: String },
}

/// Offsets ready for reading, either backed by an index file or held in
/// memory.
#[derive(Debug)]
pub enum AcquiredIndex {
    Persisted {
        offsets: OffsetArray,
        /// Set when the index was rebuilt by this acquisition.
        rebuilt: Option<ScanSummary>,
    },
    Ephemeral {
        offsets: Vec<u64>,
        scan: ScanSummary,
        reason: EphemeralReason,
    },
}

impl AcquiredIndex {
    #[must_use]
    pub const fn is_persisted(&self) -> bool {
        matches!(self, Self::Persisted { .. })
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        match self {
            Self::Persisted { offsets, .. } => offsets.count(),
            Self::Ephemeral { offsets, .. } => offsets.len() as u64,
        }
    }

    /// End of the last complete record, when this acquisition scanned the
    /// data stream.
    #[must_use]
    pub const fn scan_summary(&self) -> Option<ScanSummary> {
        match self {
            Self::Persisted { rebuilt, .. } => *rebuilt,
            Self::Ephemeral { scan, .. } => Some(*scan),
        }
    }

    #[must_use]
    pub fn into_store(self) -> OffsetStore {
        match self {
            Self::Persisted { offsets, .. } => OffsetStore::Persisted(offsets),
            Self::Ephemeral { offsets, .. } => OffsetStore::Ephemeral(offsets),
        }
    }
}

/// Offsets a reader or writer works against once acquisition is over.
#[derive(Debug)]
pub enum OffsetStore {
    Persisted(OffsetArray),
    Ephemeral(Vec<u64>),
}

impl OffsetStore {
    #[must_use]
    pub fn count(&self) -> u64 {
        match self {
            Self::Persisted(array) => array.count(),
            Self::Ephemeral(offsets) => offsets.len() as u64,
        }
    }

    #[must_use]
    pub const fn is_persisted(&self) -> bool {
        matches!(self, Self::Persisted(_))
    }

    /// Handler identity used in error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Persisted(array) => array.describe(),
            Self::Ephemeral(_) => "OffsetArray(<memory>)".to_owned(),
        }
    }

    /// Offset at a possibly negative index.
    pub fn get(&mut self, index: i64) -> Result<u64> {
        let position = normalize_index(index, self.count(), &self.describe())?;
        self.get_position(position)
    }

    /// Offset at a non-negative position.
    pub fn get_position(&mut self, position: u64) -> Result<u64> {
        match self {
            Self::Persisted(array) => array.get_position(position),
            Self::Ephemeral(offsets) => usize::try_from(position)
                .ok()
                .and_then(|pos| offsets.get(pos).copied())
                .ok_or_else(|| RecdexError::IndexOutOfBounds {
                    handler: "OffsetArray(<memory>)".to_owned(),
                    index: i64::try_from(position).unwrap_or(i64::MAX),
                    count: offsets.len() as u64,
                }),
        }
    }

    /// Offset at `position`, or `None` just past the last one. Used for the
    /// upper bound of a record.
    pub fn bound_after(&mut self, position: u64) -> Result<Option<u64>> {
        let next = position + 1;
        if next >= self.count() {
            return Ok(None);
        }
        self.get_position(next).map(Some)
    }

    pub fn commit(&mut self) -> Result<()> {
        match self {
            Self::Persisted(array) => array.commit(),
            Self::Ephemeral(_) => Ok(()),
        }
    }

    pub fn close(self) -> Result<()> {
        match self {
            Self::Persisted(array) => array.close(),
            Self::Ephemeral(_) => Ok(()),
        }
    }
}

impl OffsetSink for OffsetStore {
    fn push_offset(&mut self, offset: u64) -> Result<()> {
        match self {
            Self::Persisted(array) => array.append(offset),
            Self::Ephemeral(offsets) => offsets.push_offset(offset),
        }
    }

    fn offset_count(&self) -> u64 {
        self.count()
    }
}

/// Scan `data` from offset 0 into `sink`, restoring its position afterwards.
pub fn scan_data<S>(
    data: &mut dyn VfsStream,
    page_size: usize,
    scanner: &S,
    sink: &mut dyn OffsetSink,
    observer: Option<&mut ScanObserver<'_>>,
) -> Result<u64>
where
    S: BoundaryScanner + ?Sized,
{
    let name = data.display_name().to_owned();
    let restore = data.stream_position()?;
    data.seek(SeekFrom::Start(0))?;
    let scanned = {
        let mut reader = BufReader::with_capacity(page_size, &mut *data);
        scanner.scan_boundaries(&mut reader, &name, sink, observer)
    };
    let restored = data.seek(SeekFrom::Start(restore));
    let end_offset = scanned?;
    restored?;
    Ok(end_offset)
}

/// Produce offsets for `data`, trusting, rebuilding or replacing the index
/// file named by `request`. The data stream's position is left unchanged.
pub fn acquire_index<S>(
    request: &IndexRequest<'_>,
    data: &mut dyn VfsStream,
    scanner: &S,
    mut observer: Option<&mut ScanObserver<'_>>,
) -> Result<AcquiredIndex>
where
    S: BoundaryScanner + ?Sized,
{
    let reason = match request.index_path {
        None => EphemeralReason::NoIndexPath,
        Some(path) => {
            match acquire_persisted(request, path, data, scanner, observer.as_deref_mut())? {
                Attempt::Acquired(acquired) => return Ok(acquired),
                Attempt::Fallback(err) => {
                    warn!(
                        target: "recdex.index",
                        path,
                        stream = data.display_name(),
                        error = %err,
                        "index path unavailable, keeping offsets in memory"
                    );
                    EphemeralReason::Unavailable {
                        path: path.to_owned(),
                        detail: err.to_string(),
                    }
                }
            }
        }
    };

    let mut offsets = Vec::new();
    let end_offset = scan_data(data, request.layout.page_size, scanner, &mut offsets, observer)?;
    debug!(
        target: "recdex.index",
        stream = data.display_name(),
        records = offsets.len(),
        end_offset,
        ?reason,
        "built in-memory index"
    );
    Ok(AcquiredIndex::Ephemeral {
        scan: ScanSummary {
            records: offsets.len() as u64,
            end_offset,
        },
        offsets,
        reason,
    })
}

enum Attempt {
    Acquired(AcquiredIndex),
    Fallback(RecdexError),
}

/// Split index-path failures that degrade to memory from those that abort.
fn absorb(err: RecdexError) -> Result<Attempt> {
    if err.is_index_open_fallback() {
        Ok(Attempt::Fallback(err))
    } else {
        Err(err)
    }
}

fn open_existing(request: &IndexRequest<'_>, path: &str) -> Result<OffsetArray> {
    let mode = if request.writable {
        AccessMode::ReadWriteAppend
    } else {
        AccessMode::Read
    };
    let stream = request.vfs.open(path, mode)?;
    OffsetArray::new(stream, request.layout)
}

fn acquire_persisted<S>(
    request: &IndexRequest<'_>,
    path: &str,
    data: &mut dyn VfsStream,
    scanner: &S,
    observer: Option<&mut ScanObserver<'_>>,
) -> Result<Attempt>
where
    S: BoundaryScanner + ?Sized,
{
    let data_size = data.content_size()?;
    let verdict =
        OffsetArray::header_verdict(request.vfs, path, request.layout.encoding, data_size);
    if verdict.is_valid() {
        match open_existing(request, path) {
            Ok(offsets) => {
                debug!(
                    target: "recdex.index",
                    path,
                    records = offsets.count(),
                    data_size,
                    "index header matches, using index file"
                );
                return Ok(Attempt::Acquired(AcquiredIndex::Persisted {
                    offsets,
                    rebuilt: None,
                }));
            }
            Err(RecdexError::Format { detail, .. }) => {
                debug!(target: "recdex.index", path, detail, "malformed index, rebuilding");
            }
            Err(err) => return absorb(err),
        }
    } else {
        debug!(target: "recdex.index", path, ?verdict, "stale index, rebuilding");
    }
    rebuild(request, path, data_size, data, scanner, observer)
}

/// Sink that remembers whether the failure came from the index side.
struct TrackingSink<'a> {
    index: &'a mut OffsetArray,
    failed: bool,
}

impl OffsetSink for TrackingSink<'_> {
    fn push_offset(&mut self, offset: u64) -> Result<()> {
        let pushed = self.index.append(offset);
        self.failed |= pushed.is_err();
        pushed
    }

    fn offset_count(&self) -> u64 {
        self.index.count()
    }
}

fn rebuild<S>(
    request: &IndexRequest<'_>,
    path: &str,
    data_size: u64,
    data: &mut dyn VfsStream,
    scanner: &S,
    observer: Option<&mut ScanObserver<'_>>,
) -> Result<Attempt>
where
    S: BoundaryScanner + ?Sized,
{
    let stream = match request.vfs.open(path, AccessMode::WriteTruncate) {
        Ok(stream) => stream,
        Err(err) => return absorb(err),
    };
    let mut index = OffsetArray::new(stream, request.layout)?;
    if let Err(err) = index.write_header(0, true) {
        return absorb(err);
    }

    let mut sink = TrackingSink {
        index: &mut index,
        failed: false,
    };
    let scanned = scan_data(data, request.layout.page_size, scanner, &mut sink, observer);
    let index_failed = sink.failed;
    let end_offset = match scanned {
        Ok(end_offset) => end_offset,
        Err(err) if index_failed => return absorb(err),
        Err(err) => return Err(err),
    };

    let records = index.count();
    if let Err(err) = index
        .write_header(data_size, false)
        .and_then(|()| index.close())
    {
        return absorb(err);
    }
    let offsets = match open_existing(request, path) {
        Ok(offsets) => offsets,
        Err(err) => return absorb(err),
    };
    info!(
        target: "recdex.index",
        path,
        records,
        data_size,
        end_offset,
        "index rebuilt"
    );
    Ok(Attempt::Acquired(AcquiredIndex::Persisted {
        offsets,
        rebuilt: Some(ScanSummary {
            records,
            end_offset,
        }),
    }))
}
