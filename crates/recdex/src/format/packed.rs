//! MessagePack array streams.
//!
//! ```text
//! [0xdd][count: u32 BE][value 0][value 1]...
//! ```
//!
//! Values sit back to back without delimiters, so boundaries are found by
//! decoding. Readers accept any array marker (fixarray, array16, array32);
//! writers always emit array32 so the count can be patched in place.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;

use recdex_error::{RecdexError, Result};
use recdex_index::{BoundaryScanner, OffsetSink, ScanObserver, ScannedRecord};
use recdex_vfs::VfsStream;
use rmp::decode::ValueReadError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{
    CountingReader, DecodeContext, RecordFormat, SHORT_BYTES_LIMIT, SessionStart, at_end,
    short_bytes,
};

/// Marker byte of a MessagePack array with a 32-bit length.
pub const ARRAY32_MARKER: u8 = 0xdd;

/// Bytes taken by an array32 header.
pub const ARRAY32_HEADER_SIZE: u64 = 5;

/// Values inside one MessagePack array.
///
/// `T` is decoded through serde, so it only sees the MessagePack types its
/// `Deserialize` impl accepts. `serde_json::Value` has no binary or
/// extension variant; use `rmpv::Value` to read arbitrary MessagePack.
pub struct PackedArray<T> {
    record: PhantomData<fn() -> T>,
}

impl<T> PackedArray<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            record: PhantomData,
        }
    }
}

impl<T> Default for PackedArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for PackedArray<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PackedArray<T> {}

impl<T> fmt::Debug for PackedArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PackedArray")
    }
}

/// Parsed array header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayHeader {
    pub declared: u64,
    /// Bytes the header occupies.
    pub size: u64,
}

fn invalid_header(stream: &str, raw: &[u8], detail: impl fmt::Display) -> RecdexError {
    RecdexError::Decode {
        stream: stream.to_owned(),
        index: None,
        offset: 0,
        raw: short_bytes(raw, SHORT_BYTES_LIMIT),
        detail: format!("invalid packed array header: {detail}"),
    }
}

/// Read the array header at the current position. `Ok(None)` if the stream
/// is empty.
pub fn read_array_header<R: Read>(reader: R, stream: &str) -> Result<Option<ArrayHeader>> {
    let mut counting = CountingReader::capturing(reader);
    match rmp::decode::read_array_len(&mut counting) {
        Ok(declared) => Ok(Some(ArrayHeader {
            declared: u64::from(declared),
            size: counting.consumed(),
        })),
        Err(ValueReadError::InvalidMarkerRead(err))
            if err.kind() == io::ErrorKind::UnexpectedEof && counting.consumed() == 0 =>
        {
            Ok(None)
        }
        Err(err) => Err(invalid_header(stream, counting.captured(), err)),
    }
}

/// Rewrite the array32 header at offset 0 and return to the end.
pub fn write_array_header(data: &mut dyn VfsStream, count: u64) -> Result<()> {
    let count = u32::try_from(count).map_err(|_| {
        RecdexError::invalid_argument(format!(
            "{}: {count} values exceed the array32 limit",
            data.display_name()
        ))
    })?;
    let mut header = [0_u8; ARRAY32_HEADER_SIZE as usize];
    header[0] = ARRAY32_MARKER;
    header[1..].copy_from_slice(&count.to_be_bytes());
    data.seek(SeekFrom::Start(0))?;
    data.write_all(&header)?;
    data.seek(SeekFrom::End(0))?;
    Ok(())
}

fn is_truncation(err: &rmpv::decode::Error) -> bool {
    match err {
        rmpv::decode::Error::InvalidMarkerRead(io) | rmpv::decode::Error::InvalidDataRead(io) => {
            io.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// Size in bytes of the value at the current position of `reader`, or
/// `None` if the stream ends before the value does.
pub fn skip_value<R: Read>(reader: R, stream: &str, offset: u64) -> Result<Option<u64>> {
    let mut counting = CountingReader::capturing(reader);
    match rmpv::decode::read_value(&mut counting) {
        Ok(_) => Ok(Some(counting.consumed())),
        Err(err) if is_truncation(&err) => Ok(None),
        Err(err) => Err(RecdexError::Decode {
            stream: stream.to_owned(),
            index: None,
            offset,
            raw: short_bytes(counting.captured(), SHORT_BYTES_LIMIT),
            detail: err.to_string(),
        }),
    }
}

impl<T> BoundaryScanner for PackedArray<T> {
    fn scan_boundaries(
        &self,
        data: &mut dyn BufRead,
        stream: &str,
        sink: &mut dyn OffsetSink,
        mut observer: Option<&mut ScanObserver<'_>>,
    ) -> Result<u64> {
        let mut reader = CountingReader::capturing(data);
        let Some(header) = read_array_header(&mut reader, stream)? else {
            return Ok(0);
        };

        let mut offset = reader.consumed();
        let mut index = 0;
        while index < header.declared {
            reader.clear_capture();
            if let Err(err) = rmpv::decode::read_value(&mut reader) {
                let partial = reader.consumed() - offset;
                if !is_truncation(&err) {
                    return Err(RecdexError::Decode {
                        stream: stream.to_owned(),
                        index: Some(index),
                        offset,
                        raw: short_bytes(reader.captured(), SHORT_BYTES_LIMIT),
                        detail: err.to_string(),
                    });
                }
                if partial > 0 {
                    warn!(
                        target: "recdex.index",
                        stream,
                        offset,
                        partial,
                        "packed value cut short at end of stream, not indexed"
                    );
                }
                break;
            }
            if let Some(observe) = observer.as_deref_mut() {
                observe(&ScannedRecord {
                    index,
                    offset,
                    raw: reader.captured(),
                });
            }
            sink.push_offset(offset)?;
            offset = reader.consumed();
            index += 1;
        }
        if index < header.declared {
            debug!(
                target: "recdex.index",
                stream,
                declared = header.declared,
                found = index,
                "array header declares more values than the stream holds"
            );
        }
        Ok(offset)
    }
}

impl<T: Serialize + DeserializeOwned> RecordFormat for PackedArray<T> {
    type Record = T;
    type Input = T;

    const NAME: &'static str = "msgpack";
    const NEEDS_UPPER_BOUND: bool = true;

    fn decode_next(&self, run: &mut dyn BufRead, ctx: &DecodeContext<'_>) -> Result<Option<T>> {
        if at_end(run)? {
            return Ok(None);
        }
        let mut reader = CountingReader::capturing(&mut *run);
        match rmp_serde::from_read(&mut reader) {
            Ok(value) => Ok(Some(value)),
            Err(
                rmp_serde::decode::Error::InvalidMarkerRead(err)
                | rmp_serde::decode::Error::InvalidDataRead(err),
            ) if err.kind() == io::ErrorKind::UnexpectedEof => Err(RecdexError::OutOfData {
                stream: ctx.stream.to_owned(),
                offset: ctx.offset,
            }),
            Err(err) => Err(RecdexError::Decode {
                stream: ctx.stream.to_owned(),
                index: Some(ctx.index),
                offset: ctx.offset,
                raw: short_bytes(reader.captured(), SHORT_BYTES_LIMIT),
                detail: err.to_string(),
            }),
        }
    }

    fn encode(&self, value: &T, out: &mut Vec<u8>) -> Result<()> {
        rmp_serde::encode::write_named(out, value).map_err(|err| {
            RecdexError::invalid_argument(format!("cannot encode as MessagePack: {err}"))
        })
    }

    fn begin_session(&self, data: &mut dyn VfsStream, resume: bool) -> Result<SessionStart> {
        if !resume || data.content_size()? == 0 {
            write_array_header(data, 0)?;
            return Ok(SessionStart {
                tail: ARRAY32_HEADER_SIZE,
                declared_count: Some(0),
            });
        }
        data.seek(SeekFrom::Start(0))?;
        let mut header = [0_u8; ARRAY32_HEADER_SIZE as usize];
        if let Err(err) = data.read_exact(&mut header) {
            return Err(invalid_header(data.display_name(), &[], err));
        }
        if header[0] != ARRAY32_MARKER {
            return Err(invalid_header(
                data.display_name(),
                &header,
                format_args!("appending needs an array32 header, found marker {:#04x}", header[0]),
            ));
        }
        let mut count = [0_u8; 4];
        count.copy_from_slice(&header[1..]);
        let tail = data.seek(SeekFrom::End(0))?;
        Ok(SessionStart {
            tail,
            declared_count: Some(u64::from(u32::from_be_bytes(count))),
        })
    }

    /// Values sit back to back, so appending past bytes that are not
    /// indexed would bury them inside the array. Those streams are refused.
    fn verify_resume(
        &self,
        data: &mut dyn VfsStream,
        last: Option<u64>,
        scanned_end: Option<u64>,
        tail: u64,
    ) -> Result<()> {
        let name = data.display_name().to_owned();
        let values_end = match (last, scanned_end) {
            (None, _) => Some(ARRAY32_HEADER_SIZE),
            (Some(_), Some(end)) => Some(end),
            (Some(last), None) => {
                data.seek(SeekFrom::Start(last))?;
                let size = skip_value(BufReader::new(&mut *data), &name, last)?;
                size.map(|size| last + size)
            }
        };
        data.seek(SeekFrom::Start(tail))?;
        match values_end {
            Some(end) if end == tail => Ok(()),
            Some(end) => Err(RecdexError::Consistency {
                stream: name,
                detail: format!("values end at {end} but the stream ends at {tail}"),
            }),
            None => Err(RecdexError::Consistency {
                stream: name,
                detail: format!("last indexed value runs past the end of the stream at {tail}"),
            }),
        }
    }

    fn sync_session(&self, data: &mut dyn VfsStream, count: u64) -> Result<()> {
        write_array_header(data, count)
    }
}
