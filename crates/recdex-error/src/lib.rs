//! Error taxonomy shared by every recdex crate.
//!
//! All errors carry the display name of the stream they concern, plus offsets
//! and indices where relevant, so a failure can be diagnosed without the
//! stream object that produced it.

use std::io;

/// Crate-wide result alias.
pub type Result<T, E = RecdexError> = std::result::Result<T, E>;

/// Everything that can go wrong while building, validating, reading or writing
/// an indexed record stream.
#[derive(Debug, thiserror::Error)]
pub enum RecdexError {
    /// Structurally invalid index file (trailing bytes, bad magic or tag).
    ///
    /// When raised for an index consulted during open, callers treat it as a
    /// stale index and rebuild instead of surfacing it.
    #[error("malformed index file: {stream}: {detail}")]
    Format { stream: String, detail: String },

    /// A record's bytes cannot be decoded with the expected codec.
    #[error(
        "failed to decode record: {stream}, offset: {offset}{}, raw: {raw}, because of {detail}",
        .index.map(|i| format!(", lineno: {i}")).unwrap_or_default()
    )]
    Decode {
        stream: String,
        index: Option<u64>,
        offset: u64,
        raw: String,
        detail: String,
    },

    /// The data stream ended where a record was expected.
    ///
    /// Index builders treat this as the normal end of a scan; random-access
    /// reads convert it into [`RecdexError::OutOfRange`].
    #[error("ran past end of stream: {stream}, offset: {offset}")]
    OutOfData { stream: String, offset: u64 },

    /// The index promised a record that the data stream does not contain.
    #[error(
        "out of data: {stream}, index: {index}, offset: {start_offset}{}",
        .end_offset.map(|end| format!(" ~ {end}")).unwrap_or_default()
    )]
    OutOfRange {
        stream: String,
        index: u64,
        start_offset: u64,
        end_offset: Option<u64>,
    },

    /// Positional index outside `[-count, count)`.
    #[error("index out of range: {handler}, index: {index}, valid range: [-{count}, {count})")]
    IndexOutOfBounds {
        handler: String,
        index: i64,
        count: u64,
    },

    /// Array header, index length and end-of-data disagree.
    #[error("inconsistent stream state: {stream}: {detail}")]
    Consistency { stream: String, detail: String },

    /// Caller supplied an unacceptable argument (mode string, slice step, ...).
    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: String },

    /// The stream opener refused access to a path.
    #[error("permission denied: {path}")]
    PermissionDenied { path: String },

    /// The stream opener cannot serve this path (unknown scheme, bad mode).
    #[error("unsupported path: {path}: {detail}")]
    Unsupported { path: String, detail: String },

    /// The path does not exist.
    #[error("no such file: {path}")]
    NotFound { path: String },

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Invariant violation inside recdex itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RecdexError {
    /// Build an [`RecdexError::Internal`] from any message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Build an [`RecdexError::InvalidArgument`] from any message.
    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::InvalidArgument {
            detail: detail.into(),
        }
    }

    /// Whether this is the internal end-of-data signal.
    #[must_use]
    pub const fn is_out_of_data(&self) -> bool {
        matches!(self, Self::OutOfData { .. })
    }

    /// Whether a failure to open an index path should degrade to an in-memory
    /// index rather than fail the whole open.
    #[must_use]
    pub const fn is_index_open_fallback(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. }
                | Self::Unsupported { .. }
                | Self::NotFound { .. }
                | Self::Io(_)
        )
    }

    /// Translate an `io::Error` raised while opening `path` into the matching
    /// variant.
    pub fn from_open(path: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                path: path.to_owned(),
            },
            io::ErrorKind::NotFound => Self::NotFound {
                path: path.to_owned(),
            },
            io::ErrorKind::Unsupported => Self::Unsupported {
                path: path.to_owned(),
                detail: err.to_string(),
            },
            _ => Self::Io(err),
        }
    }
}
