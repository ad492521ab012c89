use std::fmt;
use std::io::BufRead;
use std::marker::PhantomData;

use recdex_error::{RecdexError, Result};
use recdex_index::{BoundaryScanner, OffsetSink, ScanObserver};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{DecodeContext, RecordFormat, SHORT_BYTES_LIMIT, read_line, scan_lines, short_bytes};

/// One JSON value per line.
pub struct JsonLines<T> {
    record: PhantomData<fn() -> T>,
}

impl<T> JsonLines<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            record: PhantomData,
        }
    }
}

impl<T> Default for JsonLines<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonLines<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for JsonLines<T> {}

impl<T> fmt::Debug for JsonLines<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonLines")
    }
}

impl<T> BoundaryScanner for JsonLines<T> {
    fn scan_boundaries(
        &self,
        data: &mut dyn BufRead,
        _stream: &str,
        sink: &mut dyn OffsetSink,
        observer: Option<&mut ScanObserver<'_>>,
    ) -> Result<u64> {
        scan_lines(data, sink, observer)
    }
}

impl<T: Serialize + DeserializeOwned> RecordFormat for JsonLines<T> {
    type Record = T;
    type Input = T;

    const NAME: &'static str = "jsonl";
    const NEEDS_UPPER_BOUND: bool = false;

    fn decode_next(&self, run: &mut dyn BufRead, ctx: &DecodeContext<'_>) -> Result<Option<T>> {
        let Some(line) = read_line(run)? else {
            return Ok(None);
        };
        serde_json::from_slice(&line)
            .map(Some)
            .map_err(|err| RecdexError::Decode {
                stream: ctx.stream.to_owned(),
                index: Some(ctx.index),
                offset: ctx.offset,
                raw: short_bytes(&line, SHORT_BYTES_LIMIT),
                detail: err.to_string(),
            })
    }

    fn encode(&self, value: &T, out: &mut Vec<u8>) -> Result<()> {
        serde_json::to_writer(&mut *out, value)
            .map_err(|err| RecdexError::invalid_argument(format!("cannot encode as JSON: {err}")))?;
        out.push(b'\n');
        Ok(())
    }
}
