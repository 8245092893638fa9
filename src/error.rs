//! Error types for snapshot operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during snapshot operations.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// Missing or invalid configuration (destination, credential, ...).
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error during file operations.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// The remote could not be reached, or a response body broke off mid-stream.
    #[error("Transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    /// The remote answered with a non-success status.
    #[error("Remote API returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    /// An index segment could not be parsed (truncated or malformed).
    #[error("Corrupt index {source_name}: {reason}")]
    CorruptIndex { source_name: String, reason: String },

    /// A download completed but did not produce the expected file.
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    /// Another live process holds the destination lock.
    #[error("Destination is locked by running process {pid} ({path})")]
    Locked { pid: u32, path: PathBuf },

    /// The run was interrupted; job state was saved before returning.
    #[error("Interrupted, job state saved for resume")]
    Interrupted,

    /// A background task could not be joined.
    #[error("Task failed: {0}")]
    Task(String),
}

impl SnapshotError {
    pub(crate) fn corrupt(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        SnapshotError::CorruptIndex {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }

    /// Errors that only affect a single downloaded entry.
    ///
    /// The resolve phase records these against the entry and moves on; every
    /// other error aborts the run.
    pub fn is_download_failure(&self) -> bool {
        matches!(
            self,
            SnapshotError::Transport(_)
                | SnapshotError::Api { .. }
                | SnapshotError::DownloadFailed(_)
        )
    }

    /// Transport failures are worth retrying, API answers are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, SnapshotError::Transport(_))
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            SnapshotError::Config(_) => 2,
            _ => 1,
        }
    }
}
