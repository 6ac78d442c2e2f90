//! Flat file records as returned by the per-device and per-category fetches.
//!
//! A `FileRecord` is the input unit of the namespace builder. Its identity is
//! the triple `(file_path, device_name, source)`: the same logical path can
//! exist independently on several devices and in several source categories.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind tag used by the file service for directories.
pub const DIRECTORY_KIND: &str = "directory";

/// Kind assigned to intermediate nodes created while walking a path.
pub const FOLDER_KIND: &str = "Folder";

/// Source category a record was fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Files indexed on a device (`files-by-path`)
    Files,
    /// Files inside folders registered for synchronization
    Sync,
    /// Files shared with the current user by other users
    Shared,
    /// Objects in the cloud object store
    S3files,
}

impl Source {
    /// All categories in the order their top-level nodes appear.
    pub const ALL: [Source; 4] = [Source::Files, Source::Sync, Source::Shared, Source::S3files];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Files => "files",
            Source::Sync => "sync",
            Source::Shared => "shared",
            Source::S3files => "s3files",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the device serving a file is currently reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Availability {
    Available,
    Unavailable,
}

impl Availability {
    pub fn from_online(online: bool) -> Self {
        if online {
            Availability::Available
        } else {
            Availability::Unavailable
        }
    }
}

/// One file (or directory) as reported by a fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Slash-separated, namespace-relative path
    pub file_path: String,
    pub file_name: String,
    /// Device owning or serving the file
    pub device_name: String,
    /// File-type tag, or `"directory"`
    pub kind: String,
    #[serde(default)]
    pub file_size: u64,
    pub available: Availability,
    pub source: Source,
    #[serde(default)]
    pub original_device: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub is_public: Option<bool>,
    #[serde(default)]
    pub shared_with: Option<Vec<String>>,
}

impl FileRecord {
    /// Minimal record for a file; the file name is derived from the last path segment.
    pub fn new(file_path: &str, device_name: &str, kind: &str, source: Source) -> Self {
        let file_name = file_path
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or_default()
            .to_string();
        Self {
            file_path: file_path.to_string(),
            file_name,
            device_name: device_name.to_string(),
            kind: kind.to_string(),
            file_size: 0,
            available: Availability::Available,
            source,
            original_device: None,
            owner: None,
            is_public: None,
            shared_with: None,
        }
    }

    pub fn with_size(mut self, file_size: u64) -> Self {
        self.file_size = file_size;
        self
    }

    /// Deduplication key.
    pub fn key(&self) -> RecordKey {
        RecordKey {
            file_path: normalize_path(&self.file_path),
            device_name: self.device_name.clone(),
            source: self.source,
        }
    }

    pub fn is_directory(&self) -> bool {
        is_directory_kind(&self.kind)
    }
}

/// Identity of a record: `(file_path, device_name, source)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub file_path: String,
    pub device_name: String,
    pub source: Source,
}

/// Whether a kind tag denotes a node that may hold children.
pub fn is_directory_kind(kind: &str) -> bool {
    kind.eq_ignore_ascii_case(DIRECTORY_KIND) || kind == FOLDER_KIND
}

/// Strip leading/trailing slashes and collapse empty segments.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
