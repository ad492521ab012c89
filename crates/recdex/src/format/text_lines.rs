use std::io::BufRead;

use recdex_error::{RecdexError, Result};
use recdex_index::{BoundaryScanner, OffsetSink, ScanObserver};
use serde::{Deserialize, Serialize};

use super::{DecodeContext, RecordFormat, SHORT_BYTES_LIMIT, read_line, scan_lines, short_bytes};

/// What to do with bytes that are not valid UTF-8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextErrors {
    /// Fail the read with a decode error.
    #[default]
    Strict,
    /// Substitute U+FFFD for each malformed sequence.
    Replace,
    /// Drop malformed sequences.
    Ignore,
}

impl TextErrors {
    fn decode(self, bytes: &[u8]) -> std::result::Result<String, std::str::Utf8Error> {
        match self {
            Self::Strict => std::str::from_utf8(bytes).map(str::to_owned),
            Self::Replace => Ok(String::from_utf8_lossy(bytes).into_owned()),
            Self::Ignore => Ok(bytes.utf8_chunks().map(|chunk| chunk.valid()).collect()),
        }
    }
}

/// One UTF-8 string per line, without its newline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextLines {
    errors: TextErrors,
}

impl TextLines {
    #[must_use]
    pub const fn new(errors: TextErrors) -> Self {
        Self { errors }
    }

    #[must_use]
    pub const fn errors(&self) -> TextErrors {
        self.errors
    }
}

impl BoundaryScanner for TextLines {
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

impl RecordFormat for TextLines {
    type Record = String;
    type Input = str;

    const NAME: &'static str = "text";
    const NEEDS_UPPER_BOUND: bool = false;

    fn decode_next(
        &self,
        run: &mut dyn BufRead,
        ctx: &DecodeContext<'_>,
    ) -> Result<Option<String>> {
        let Some(line) = read_line(run)? else {
            return Ok(None);
        };
        let content = line.strip_suffix(b"\n").unwrap_or(&line);
        self.errors
            .decode(content)
            .map(Some)
            .map_err(|err| RecdexError::Decode {
                stream: ctx.stream.to_owned(),
                index: Some(ctx.index),
                offset: ctx.offset,
                raw: short_bytes(&line, SHORT_BYTES_LIMIT),
                detail: err.to_string(),
            })
    }

    fn encode(&self, value: &str, out: &mut Vec<u8>) -> Result<()> {
        if value.contains('\n') {
            return Err(RecdexError::invalid_argument(
                "text records cannot contain a newline",
            ));
        }
        out.extend_from_slice(value.as_bytes());
        out.push(b'\n');
        Ok(())
    }
}
