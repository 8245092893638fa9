//! Data structures shared by the map and resolve phases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A file as listed by the remote.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Full remote path, e.g. `/Photos/2019/beach.jpg`.
    pub path: String,
    /// Stable backend identifier used for downloading.
    pub id: String,
    /// Size in bytes.
    pub size: u64,
    /// Server-side modification time.
    pub modified: DateTime<Utc>,
    /// Backend content hash, if the backend reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

/// A folder as listed by the remote.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FolderEntry {
    pub path: String,
    #[serde(default)]
    pub id: String,
}

/// A deletion marker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeletedEntry {
    pub path: String,
}

/// One listed remote object, in listing order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "tag", rename_all = "lowercase")]
pub enum RemoteEntry {
    File(FileEntry),
    Folder(FolderEntry),
    Deleted(DeletedEntry),
    /// Any tag this version does not understand; skipped by resolve.
    #[serde(other)]
    Unknown,
}

impl RemoteEntry {
    pub fn path(&self) -> Option<&str> {
        match self {
            RemoteEntry::File(f) => Some(&f.path),
            RemoteEntry::Folder(f) => Some(&f.path),
            RemoteEntry::Deleted(d) => Some(&d.path),
            RemoteEntry::Unknown => None,
        }
    }

    /// Declared size; zero for everything but files.
    pub fn size(&self) -> u64 {
        match self {
            RemoteEntry::File(f) => f.size,
            _ => 0,
        }
    }
}

/// One page of a remote listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub entries: Vec<RemoteEntry>,
    pub cursor: String,
    pub has_more: bool,
}

/// A flushed index segment covering entries `[start, end)`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct IndexSegment {
    pub start: u64,
    pub end: u64,
    pub filename: String,
}

impl IndexSegment {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, index: u64) -> bool {
        index >= self.start && index < self.end
    }
}

/// An entry the resolve phase could not materialize.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FailedEntry {
    pub index: u64,
    pub path: String,
    pub id: String,
    pub reason: String,
}
