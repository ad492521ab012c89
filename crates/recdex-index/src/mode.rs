//! Caller-facing open modes.

use std::fmt;
use std::str::FromStr;

use recdex_error::RecdexError;
use recdex_vfs::AccessMode;

/// Mode string accepted by the open functions: `r`, `w`, `a`, `w+`, `a+`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    /// `r`: read an existing stream.
    Read,
    /// `w`: create or truncate, write only.
    Write,
    /// `a`: continue an existing stream (or create it), write only.
    Append,
    /// `w+`: create or truncate, read and write.
    ReadWrite,
    /// `a+`: continue an existing stream (or create it), read and write.
    ReadAppend,
}

impl OpenMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::Write => "w",
            Self::Append => "a",
            Self::ReadWrite => "w+",
            Self::ReadAppend => "a+",
        }
    }

    #[must_use]
    pub const fn is_readable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite | Self::ReadAppend)
    }

    #[must_use]
    pub const fn is_writable(self) -> bool {
        !matches!(self, Self::Read)
    }

    /// Whether the mode continues existing content instead of truncating.
    #[must_use]
    pub const fn continues(self) -> bool {
        matches!(self, Self::Append | Self::ReadAppend)
    }

    /// Stream access for a raw file opened in this mode. `exists` tells
    /// whether the file is already present, which decides `a+`.
    #[must_use]
    pub const fn access_mode(self, exists: bool) -> AccessMode {
        match self {
            Self::Read => AccessMode::Read,
            Self::Write => AccessMode::WriteTruncate,
            Self::Append => AccessMode::Append,
            Self::ReadWrite => AccessMode::ReadWriteCreate,
            Self::ReadAppend if exists => AccessMode::ReadWriteAppend,
            Self::ReadAppend => AccessMode::ReadWriteCreate,
        }
    }
}

impl FromStr for OpenMode {
    type Err = RecdexError;

    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        match mode {
            "r" => Ok(Self::Read),
            "w" => Ok(Self::Write),
            "a" => Ok(Self::Append),
            "w+" => Ok(Self::ReadWrite),
            "a+" => Ok(Self::ReadAppend),
            other => Err(RecdexError::invalid_argument(format!(
                "unacceptable mode: {other:?}"
            ))),
        }
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_mode_string() {
        for mode in [
            OpenMode::Read,
            OpenMode::Write,
            OpenMode::Append,
            OpenMode::ReadWrite,
            OpenMode::ReadAppend,
        ] {
            assert_eq!(mode.as_str().parse::<OpenMode>().unwrap(), mode);
        }
    }

    #[test]
    fn unknown_mode_is_named_in_error() {
        let err = "rw".parse::<OpenMode>().unwrap_err();
        assert!(err.to_string().contains("\"rw\""), "{err}");
    }

    #[test]
    fn read_append_depends_on_existence() {
        assert_eq!(
            OpenMode::ReadAppend.access_mode(true),
            AccessMode::ReadWriteAppend
        );
        assert_eq!(
            OpenMode::ReadAppend.access_mode(false),
            AccessMode::ReadWriteCreate
        );
    }
}
