//! Random and slice access over append-only record streams.
//!
//! A data stream of JSON lines, text lines or one MessagePack array is paired
//! with a sidecar index of record offsets (`<data-path>.idx` by default). The
//! index records the size of the data stream it describes; when the sizes
//! disagree the index is rebuilt by scanning the data stream, and when the
//! index path cannot be written the offsets are kept in memory.
//!
//! ```no_run
//! use recdex::{IndexSlice, Recdex};
//! use serde_json::{Value, json};
//!
//! # fn main() -> recdex::Result<()> {
//! let store = Recdex::local();
//! let mut writer = store
//!     .open_json_lines::<Value>("events.jsonl", "w")?
//!     .into_writer()
//!     .expect("w opens a writer");
//! writer.extend([json!({"id": 1}), json!({"id": 2}), json!({"id": 3})])?;
//! writer.close()?;
//!
//! let reader = store
//!     .open_json_lines::<Value>("events.jsonl", "r")?
//!     .into_reader()
//!     .expect("r opens a reader");
//! assert_eq!(reader.get(-1)?, json!({"id": 3}));
//! let odd: Vec<Value> = reader.batch_get(IndexSlice::step_by(2))?.to_vec()?;
//! assert_eq!(odd.len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod format;
pub mod handler;
pub mod open;
pub mod reader;
pub mod writer;

pub use config::{DEFAULT_INDEX_SUFFIX, RecdexConfig};
pub use format::{
    ARRAY32_HEADER_SIZE, ARRAY32_MARKER, DecodeContext, JsonLines, PackedArray, RecordFormat,
    SHORT_BYTES_LIMIT, SessionStart, TextErrors, TextLines, short_bytes,
};
pub use handler::PackedArrayHandler;
pub use open::{Opened, OpenedPacked, Recdex, open_json_lines, open_packed, open_text_lines};
pub use reader::{IndexedReader, RecordIter, RecordSlice};
pub use writer::{IndexedWriter, SessionKind};

pub use recdex_error::{RecdexError, Result};
pub use recdex_index::{
    AcquiredIndex, IndexSlice, OffsetArray, OffsetEncoding, OffsetLayout, OpenMode, ScanObserver,
    ScannedRecord, SliceRange,
};
pub use recdex_vfs::{AccessMode, LocalVfs, MemoryVfs, ShadowStream, StreamInfo, Vfs, VfsStream};
