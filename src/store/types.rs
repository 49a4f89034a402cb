//! Backing store types
//!
//! File identifiers, metadata snapshots and the byte stream returned by range reads.

use std::fmt;
use std::pin::Pin;
use std::time::SystemTime;

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Deserializer};

use super::errors::StoreError;

/// Content type used when the backend does not report one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Longest identifier accepted from a URL
const MAX_ID_LEN: usize = 256;

/// Byte stream over a remote object, yielding chunks of arbitrary size
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StoreError>> + Send>>;

/// Opaque identifier naming a remote object
///
/// Issued by the bot layer (typically `<chat>_<message>`) and never
/// interpreted by the streaming core beyond charset validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileId(String);

impl FileId {
    /// Validate a raw path segment as an identifier
    ///
    /// Returns None for empty, overlong, or out-of-charset values.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() || raw.len() > MAX_ID_LEN {
            return None;
        }
        let valid = raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b':'));
        if !valid || raw == "." || raw == ".." {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of a remote object's metadata
///
/// Superseded, never mutated, when the cache refreshes an expired entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub id: FileId,
    pub size: u64,
    pub content_type: String,
    pub file_name: Option<String>,
    pub retrieved_at: SystemTime,
}

impl FileMetadata {
    pub fn new(id: FileId, size: u64, content_type: Option<String>) -> Self {
        Self {
            id,
            size,
            content_type: content_type
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            file_name: None,
            retrieved_at: SystemTime::now(),
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// Name to advertise in `Content-Disposition`
    ///
    /// Falls back to `file_<first 8 chars of id>` when the backend has no name.
    pub fn display_name(&self) -> String {
        match &self.file_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => {
                let prefix: String = self.id.as_str().chars().take(8).collect();
                format!("file_{}", prefix)
            }
        }
    }
}

/// Deserialize a number that might be encoded as a string or null.
/// Bridges built on top of chat APIs tend to pass sizes through as strings.
fn deserialize_flexible_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct FlexibleU64Visitor;

    impl<'de> de::Visitor<'de> for FlexibleU64Visitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a u64, a string containing a u64, or null")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<u64, E> {
            Ok(value)
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<u64, E> {
            u64::try_from(value).map_err(|_| de::Error::custom("negative file size"))
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<u64, E> {
            value.parse::<u64>().map_err(de::Error::custom)
        }

        fn visit_none<E: de::Error>(self) -> Result<u64, E> {
            Ok(0)
        }

        fn visit_unit<E: de::Error>(self) -> Result<u64, E> {
            Ok(0)
        }
    }

    deserializer.deserialize_any(FlexibleU64Visitor)
}

/// File information as reported by the upstream bridge
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFileInfo {
    /// File size in bytes
    #[serde(deserialize_with = "deserialize_flexible_u64")]
    pub file_size: u64,
    /// MIME type, if the chat message carried one
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Original file name, if any
    #[serde(default)]
    pub file_name: Option<String>,
}

impl RemoteFileInfo {
    pub fn into_metadata(self, id: FileId) -> FileMetadata {
        let meta = FileMetadata::new(id, self.file_size, self.mime_type);
        match self.file_name {
            Some(name) => meta.with_file_name(name),
            None => meta,
        }
    }
}
