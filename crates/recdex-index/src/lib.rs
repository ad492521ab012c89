//! Offset index files for recdex.
//!
//! An index file is a 16-byte [`IndexHeader`] followed by one fixed-width
//! offset per record of a data stream. The header records the data stream's
//! size when it was finalized; any mismatch makes the index stale, and
//! [`acquire_index`] rebuilds it before it is read.

pub mod acquire;
pub mod header;
pub mod mode;
pub mod offset_array;
pub mod slice;

pub use acquire::{
    AcquiredIndex, BoundaryScanner, EphemeralReason, IndexRequest, OffsetStore, ScanObserver,
    ScanSummary, ScannedRecord, acquire_index, scan_data,
};
pub use header::{HEADER_SIZE, HeaderVerdict, INDEX_MAGIC, IndexHeader, OffsetEncoding};
pub use mode::OpenMode;
pub use offset_array::{DEFAULT_PAGE_SIZE, OffsetArray, OffsetBatch, OffsetLayout, OffsetSink};
pub use slice::{IndexSlice, SlicePositions, SliceRange, normalize_index};
