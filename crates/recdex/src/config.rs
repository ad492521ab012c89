//! Store configuration.

use recdex_error::{RecdexError, Result};
use recdex_index::{DEFAULT_PAGE_SIZE, OffsetEncoding, OffsetLayout};
use serde::{Deserialize, Serialize};

use crate::format::TextErrors;

/// Suffix appended to a data path to name its index file.
pub const DEFAULT_INDEX_SUFFIX: &str = ".idx";

/// Settings shared by every stream a [`crate::Recdex`] opens.
///
/// Every field has a default, so a TOML or JSON document only needs the
/// keys it changes:
///
/// ```toml
/// index_suffix = ".offsets"
/// offset_encoding = "u32"
/// page_size = 4096
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecdexConfig {
    /// Explicit index path. Only meaningful when a single stream is opened
    /// with this config; otherwise leave unset and rely on `index_suffix`.
    pub index_path: Option<String>,
    /// Suffix appended to the data path when `index_path` is unset.
    pub index_suffix: String,
    /// Buffer size for scans and contiguous reads, in bytes.
    pub page_size: usize,
    /// Width and byte order of the stored offsets.
    pub offset_encoding: OffsetEncoding,
    /// Keep the index in a sidecar file. When false offsets live in memory
    /// and are rebuilt on every open.
    pub persist_index: bool,
    /// UTF-8 error policy for text line streams.
    pub text_errors: TextErrors,
}

impl Default for RecdexConfig {
    fn default() -> Self {
        Self {
            index_path: None,
            index_suffix: DEFAULT_INDEX_SUFFIX.to_owned(),
            page_size: DEFAULT_PAGE_SIZE,
            offset_encoding: OffsetEncoding::default(),
            persist_index: true,
            text_errors: TextErrors::default(),
        }
    }
}

impl RecdexConfig {
    #[must_use]
    pub fn with_index_path(mut self, path: impl Into<String>) -> Self {
        self.index_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_index_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.index_suffix = suffix.into();
        self
    }

    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub const fn with_offset_encoding(mut self, encoding: OffsetEncoding) -> Self {
        self.offset_encoding = encoding;
        self
    }

    /// Keep offsets in memory only.
    #[must_use]
    pub const fn in_memory(mut self) -> Self {
        self.persist_index = false;
        self
    }

    #[must_use]
    pub const fn with_text_errors(mut self, errors: TextErrors) -> Self {
        self.text_errors = errors;
        self
    }

    /// Check the settings for internal consistency.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.page_size == 0 {
            errors.push("page_size must be > 0".to_owned());
        }
        if self.persist_index && self.index_path.is_none() && self.index_suffix.is_empty() {
            errors.push("index_suffix must not be empty when index_path is unset".to_owned());
        }
        if self.index_path.as_deref() == Some("") {
            errors.push("index_path must not be empty".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(RecdexError::invalid_argument(format!(
                "invalid config: {}",
                errors.join("; ")
            )))
        }
    }

    /// Index path for the data stream at `data_path`, or `None` when offsets
    /// are kept in memory.
    #[must_use]
    pub fn index_path_for(&self, data_path: &str) -> Option<String> {
        if !self.persist_index {
            return None;
        }
        Some(
            self.index_path
                .clone()
                .unwrap_or_else(|| format!("{data_path}{}", self.index_suffix)),
        )
    }

    /// Offset layout of index files written under this config.
    #[must_use]
    pub const fn layout(&self) -> OffsetLayout {
        OffsetLayout::indexed(self.offset_encoding).with_page_size(self.page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = RecdexConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.page_size, 16 * 1024);
        assert_eq!(config.offset_encoding, OffsetEncoding::U64);
        assert_eq!(
            config.index_path_for("/data/rows.jsonl").as_deref(),
            Some("/data/rows.jsonl.idx")
        );
    }

    #[test]
    fn parses_partial_toml() {
        let config: RecdexConfig = toml::from_str(
            r#"
            index_suffix = ".offsets"
            offset_encoding = "u32_be"
            page_size = 4096
            text_errors = "replace"
            "#,
        )
        .unwrap();
        assert_eq!(config.index_suffix, ".offsets");
        assert_eq!(config.offset_encoding, OffsetEncoding::U32Be);
        assert_eq!(config.text_errors, TextErrors::Replace);
        assert!(config.persist_index);
        assert_eq!(config.layout().page_size, 4096);
    }

    #[test]
    fn parses_json_and_rejects_unknown_keys() {
        let config: RecdexConfig =
            serde_json::from_str(r#"{"persist_index": false, "index_path": "x.idx"}"#).unwrap();
        assert_eq!(config.index_path_for("x"), None);

        let err = serde_json::from_str::<RecdexConfig>(r#"{"page_sise": 1}"#).unwrap_err();
        assert!(err.to_string().contains("page_sise"), "{err}");
    }

    #[test]
    fn validate_collects_every_problem() {
        let config = RecdexConfig::default()
            .with_page_size(0)
            .with_index_suffix("");
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("page_size"), "{err}");
        assert!(err.contains("index_suffix"), "{err}");

        let config = RecdexConfig::default().with_index_path("custom.idx");
        assert_eq!(config.index_path_for("a.jsonl").as_deref(), Some("custom.idx"));
    }
}
