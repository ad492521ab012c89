//! Record formats.
//!
//! A [`RecordFormat`] knows three things about a data stream: where records
//! begin (the [`BoundaryScanner`] supertrait, used to rebuild indexes), how to
//! decode one record from a run of bytes, and how to encode one record for
//! appending. Formats with a stream header also hook the writer session.

mod json_lines;
mod packed;
mod text_lines;

use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};

use recdex_error::Result;
use recdex_index::{BoundaryScanner, OffsetSink, ScanObserver, ScannedRecord};
use recdex_vfs::VfsStream;
use tracing::debug;

pub use json_lines::JsonLines;
pub use packed::{ARRAY32_HEADER_SIZE, ARRAY32_MARKER, PackedArray};
pub use text_lines::{TextErrors, TextLines};

pub(crate) use packed::write_array_header;

/// Position of the record being decoded, for error messages.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    /// Display name of the data stream.
    pub stream: &'a str,
    pub index: u64,
    pub offset: u64,
}

/// Where a writer session starts appending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStart {
    /// Offset the next record will be written at.
    pub tail: u64,
    /// Record count declared by the stream header, for formats that have one.
    pub declared_count: Option<u64>,
}

/// A record codec plus boundary scanner for one data stream layout.
pub trait RecordFormat: BoundaryScanner + Send + Sync {
    /// What reads produce.
    type Record;
    /// What appends accept.
    type Input: ?Sized;

    /// Short format name for logs.
    const NAME: &'static str;
    /// Whether decoding record `i` needs the offset of record `i + 1` as an
    /// upper bound. Line formats find their own end.
    const NEEDS_UPPER_BOUND: bool;

    /// Decode the record starting at the current position of `run`.
    ///
    /// Returns `Ok(None)` if `run` holds no more bytes; a record cut short by
    /// the end of `run` is reported as [`recdex_error::RecdexError::OutOfData`].
    fn decode_next(
        &self,
        run: &mut dyn BufRead,
        ctx: &DecodeContext<'_>,
    ) -> Result<Option<Self::Record>>;

    /// Append the encoded form of `value` to `out`.
    fn encode(&self, value: &Self::Input, out: &mut Vec<u8>) -> Result<()>;

    /// Prepare `data` for appending and leave it positioned at the tail.
    /// `resume` is true when `data` holds a previous session's content.
    ///
    /// The default suits newline-terminated records: a last line without its
    /// newline is terminated before the first appended record.
    fn begin_session(&self, data: &mut dyn VfsStream, resume: bool) -> Result<SessionStart> {
        let mut tail = if resume { data.seek(SeekFrom::End(0))? } else { 0 };
        if tail > 0 {
            data.seek(SeekFrom::Start(tail - 1))?;
            let mut last = [0_u8; 1];
            data.read_exact(&mut last)?;
            if last[0] != b'\n' {
                debug!(
                    target: "recdex.writer",
                    stream = data.display_name(),
                    offset = tail,
                    "terminating the last line before appending"
                );
                data.write_all(b"\n")?;
                tail += 1;
            }
        }
        Ok(SessionStart {
            tail,
            declared_count: None,
        })
    }

    /// Check that the records a resumed session continues from end at
    /// `tail`. `last` is the offset of the last indexed record and
    /// `scanned_end` the end of the records an index rebuild just read.
    /// On success `data` is positioned at `tail`.
    fn verify_resume(
        &self,
        data: &mut dyn VfsStream,
        last: Option<u64>,
        scanned_end: Option<u64>,
        tail: u64,
    ) -> Result<()> {
        let _ = (data, last, scanned_end, tail);
        Ok(())
    }

    /// Bring stream-level metadata up to date with `count` records.
    fn sync_session(&self, data: &mut dyn VfsStream, count: u64) -> Result<()> {
        let _ = (data, count);
        Ok(())
    }
}

/// Default cap for [`short_bytes`].
pub const SHORT_BYTES_LIMIT: usize = 128;

/// Render bytes as a `b'...'` byte literal, abbreviated to `limit`
/// bytes: `b'abc' ... (300 bytes in total)`.
#[must_use]
pub fn short_bytes(data: &[u8], limit: usize) -> String {
    if data.len() > limit {
        let mut literal = byte_literal(&data[..limit]);
        literal.pop();
        format!("{literal} ... ({} bytes in total)", data.len())
    } else {
        byte_literal(data)
    }
}

fn byte_literal(data: &[u8]) -> String {
    let quote = if data.contains(&b'\'') && !data.contains(&b'"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(data.len() + 3);
    out.push('b');
    out.push(quote);
    for &byte in data {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'\t' => out.push_str("\\t"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b if char::from(b) == quote => {
                out.push('\\');
                out.push(quote);
            }
            0x20..=0x7e => out.push(char::from(byte)),
            _ => out.push_str(&format!("\\x{byte:02x}")),
        }
    }
    out.push(quote);
    out
}

/// Reader adapter that counts consumed bytes and can keep a copy of them.
pub(crate) struct CountingReader<R> {
    inner: R,
    consumed: u64,
    captured: Option<Vec<u8>>,
}

impl<R: Read> CountingReader<R> {
    pub(crate) const fn new(inner: R) -> Self {
        Self {
            inner,
            consumed: 0,
            captured: None,
        }
    }

    pub(crate) const fn capturing(inner: R) -> Self {
        Self {
            inner,
            consumed: 0,
            captured: Some(Vec::new()),
        }
    }

    pub(crate) const fn consumed(&self) -> u64 {
        self.consumed
    }

    pub(crate) fn captured(&self) -> &[u8] {
        self.captured.as_deref().unwrap_or_default()
    }

    /// Forget what has been captured so far, keeping the running count.
    pub(crate) fn clear_capture(&mut self) {
        if let Some(captured) = &mut self.captured {
            captured.clear();
        }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed += n as u64;
        if let Some(captured) = &mut self.captured {
            captured.extend_from_slice(&buf[..n]);
        }
        Ok(n)
    }
}

/// Boundary scan shared by the newline-terminated formats. A final line
/// without a newline still counts as a record.
pub(crate) fn scan_lines(
    data: &mut dyn BufRead,
    sink: &mut dyn OffsetSink,
    mut observer: Option<&mut ScanObserver<'_>>,
) -> Result<u64> {
    let mut offset = 0;
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = data.read_until(b'\n', &mut line)?;
        if n == 0 {
            return Ok(offset);
        }
        if let Some(observe) = observer.as_deref_mut() {
            observe(&ScannedRecord {
                index: sink.offset_count(),
                offset,
                raw: &line,
            });
        }
        sink.push_offset(offset)?;
        offset += n as u64;
    }
}

/// Read one line including its newline; `None` at the end of `run`.
pub(crate) fn read_line(run: &mut dyn BufRead) -> io::Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    if run.read_until(b'\n', &mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

/// True if `run` has no bytes left.
pub(crate) fn at_end(run: &mut dyn BufRead) -> io::Result<bool> {
    Ok(run.fill_buf()?.is_empty())
}
