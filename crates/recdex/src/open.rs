//! Mode-string entry points.

use std::fmt;
use std::sync::Arc;

use recdex_error::{RecdexError, Result};
use recdex_index::{OpenMode, ScanObserver};
use recdex_vfs::{LocalVfs, Vfs};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::RecdexConfig;
use crate::format::{JsonLines, PackedArray, RecordFormat, TextLines};
use crate::handler::PackedArrayHandler;
use crate::reader::IndexedReader;
use crate::writer::IndexedWriter;

/// A line-format stream opened by mode string.
#[derive(Debug)]
pub enum Opened<F: RecordFormat> {
    /// `r`
    Reader(IndexedReader<F>),
    /// `w` or `a`
    Writer(IndexedWriter<F>),
}

impl<F: RecordFormat> Opened<F> {
    #[must_use]
    pub fn into_reader(self) -> Option<IndexedReader<F>> {
        match self {
            Self::Reader(reader) => Some(reader),
            Self::Writer(_) => None,
        }
    }

    #[must_use]
    pub fn into_writer(self) -> Option<IndexedWriter<F>> {
        match self {
            Self::Writer(writer) => Some(writer),
            Self::Reader(_) => None,
        }
    }
}

/// A MessagePack array stream opened by mode string.
pub enum OpenedPacked<T: Serialize + DeserializeOwned> {
    /// `r`
    Reader(IndexedReader<PackedArray<T>>),
    /// `w` or `a`
    Writer(IndexedWriter<PackedArray<T>>),
    /// `w+` or `a+`
    Handler(PackedArrayHandler<T>),
}

impl<T: Serialize + DeserializeOwned> OpenedPacked<T> {
    #[must_use]
    pub fn into_reader(self) -> Option<IndexedReader<PackedArray<T>>> {
        match self {
            Self::Reader(reader) => Some(reader),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_writer(self) -> Option<IndexedWriter<PackedArray<T>>> {
        match self {
            Self::Writer(writer) => Some(writer),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_handler(self) -> Option<PackedArrayHandler<T>> {
        match self {
            Self::Handler(handler) => Some(handler),
            _ => None,
        }
    }
}

impl<T: Serialize + DeserializeOwned> fmt::Debug for OpenedPacked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reader(reader) => f.debug_tuple("Reader").field(reader).finish(),
            Self::Writer(writer) => f.debug_tuple("Writer").field(writer).finish(),
            Self::Handler(handler) => f.debug_tuple("Handler").field(handler).finish(),
        }
    }
}

/// Opens indexed streams through one [`Vfs`] with one configuration.
#[derive(Debug, Clone)]
pub struct Recdex {
    vfs: Arc<dyn Vfs>,
    config: RecdexConfig,
}

impl Recdex {
    pub fn new(vfs: Arc<dyn Vfs>, config: RecdexConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { vfs, config })
    }

    /// Local filesystem, default configuration.
    #[must_use]
    pub fn local() -> Self {
        Self {
            vfs: Arc::new(LocalVfs::new()),
            config: RecdexConfig::default(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RecdexConfig {
        &self.config
    }

    #[must_use]
    pub fn vfs(&self) -> &Arc<dyn Vfs> {
        &self.vfs
    }

    /// Open a JSON lines stream with mode `r`, `w` or `a`.
    pub fn open_json_lines<T>(&self, path: &str, mode: &str) -> Result<Opened<JsonLines<T>>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.open_lines(path, mode, JsonLines::new(), None)
    }

    /// [`Self::open_json_lines`], reporting every record an index rebuild
    /// scans to `observer`.
    pub fn open_json_lines_with_observer<T>(
        &self,
        path: &str,
        mode: &str,
        observer: &mut ScanObserver<'_>,
    ) -> Result<Opened<JsonLines<T>>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.open_lines(path, mode, JsonLines::new(), Some(observer))
    }

    /// Open a text lines stream with mode `r`, `w` or `a`.
    pub fn open_text_lines(&self, path: &str, mode: &str) -> Result<Opened<TextLines>> {
        let format = TextLines::new(self.config.text_errors);
        self.open_lines(path, mode, format, None)
    }

    pub fn open_text_lines_with_observer(
        &self,
        path: &str,
        mode: &str,
        observer: &mut ScanObserver<'_>,
    ) -> Result<Opened<TextLines>> {
        let format = TextLines::new(self.config.text_errors);
        self.open_lines(path, mode, format, Some(observer))
    }

    /// Open a MessagePack array stream with mode `r`, `w`, `a`, `w+` or `a+`.
    pub fn open_packed<T>(&self, path: &str, mode: &str) -> Result<OpenedPacked<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.open_packed_inner(path, mode, None)
    }

    pub fn open_packed_with_observer<T>(
        &self,
        path: &str,
        mode: &str,
        observer: &mut ScanObserver<'_>,
    ) -> Result<OpenedPacked<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        self.open_packed_inner(path, mode, Some(observer))
    }

    fn open_packed_inner<T>(
        &self,
        path: &str,
        mode: &str,
        observer: Option<&mut ScanObserver<'_>>,
    ) -> Result<OpenedPacked<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let mode: OpenMode = mode.parse()?;
        let vfs = Arc::clone(&self.vfs);
        Ok(match mode {
            OpenMode::Read => OpenedPacked::Reader(IndexedReader::open(
                vfs,
                path,
                PackedArray::new(),
                &self.config,
                observer,
            )?),
            OpenMode::Write | OpenMode::Append => OpenedPacked::Writer(IndexedWriter::open(
                vfs,
                path,
                mode,
                PackedArray::new(),
                &self.config,
                observer,
            )?),
            OpenMode::ReadWrite | OpenMode::ReadAppend => OpenedPacked::Handler(
                PackedArrayHandler::open(vfs, path, mode, &self.config, observer)?,
            ),
        })
    }

    fn open_lines<F: RecordFormat>(
        &self,
        path: &str,
        mode: &str,
        format: F,
        observer: Option<&mut ScanObserver<'_>>,
    ) -> Result<Opened<F>> {
        let parsed: OpenMode = mode.parse()?;
        let vfs = Arc::clone(&self.vfs);
        match parsed {
            OpenMode::Read => Ok(Opened::Reader(IndexedReader::open(
                vfs,
                path,
                format,
                &self.config,
                observer,
            )?)),
            OpenMode::Write | OpenMode::Append => Ok(Opened::Writer(IndexedWriter::open(
                vfs,
                path,
                parsed,
                format,
                &self.config,
                observer,
            )?)),
            OpenMode::ReadWrite | OpenMode::ReadAppend => Err(RecdexError::invalid_argument(
                format!("unacceptable mode: {mode:?}"),
            )),
        }
    }
}

/// [`Recdex::open_json_lines`] on the local filesystem with default settings.
pub fn open_json_lines<T>(path: &str, mode: &str) -> Result<Opened<JsonLines<T>>>
where
    T: Serialize + DeserializeOwned,
{
    Recdex::local().open_json_lines(path, mode)
}

/// [`Recdex::open_text_lines`] on the local filesystem with default settings.
pub fn open_text_lines(path: &str, mode: &str) -> Result<Opened<TextLines>> {
    Recdex::local().open_text_lines(path, mode)
}

/// [`Recdex::open_packed`] on the local filesystem with default settings.
pub fn open_packed<T>(path: &str, mode: &str) -> Result<OpenedPacked<T>>
where
    T: Serialize + DeserializeOwned,
{
    Recdex::local().open_packed(path, mode)
}
