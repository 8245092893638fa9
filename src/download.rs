//! Streamed download of a single remote file.

use crate::error::SnapshotError;
use crate::remote::Remote;
use crate::types::FileEntry;
use crate::verify::set_modified;
use futures_util::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_retry2::strategy::FixedInterval;
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, warn};

/// How often a download that failed without a response is retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            delay: Duration::from_secs(10),
        }
    }
}

/// Downloads `entry` to `dest` and stamps it with the remote modification time.
///
/// `on_progress` receives the bytes written so far for this attempt after each
/// chunk. Returns the number of bytes written.
///
/// A body that breaks off mid-stream is a `Transport` error; a body of the
/// wrong length is `DownloadFailed`. Both remove the partial file. Local write
/// errors come back as `IoError`.
pub(crate) async fn download_entry(
    remote: &dyn Remote,
    entry: &FileEntry,
    dest: &Path,
    on_progress: &(dyn Fn(u64) + Sync),
) -> Result<u64, SnapshotError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut stream = remote.download_file(&entry.id).await?;
    // dest may be a hard link into an older snapshot; never write through it
    match tokio::fs::remove_file(dest).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let mut file = BufWriter::new(tokio::fs::File::create(dest).await?);
    let mut written = 0u64;

    while let Some(piece) = stream.next().await {
        let chunk = match piece {
            Ok(chunk) => chunk,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                return Err(e);
            }
        };
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        on_progress(written);
    }
    file.flush().await?;
    drop(file);

    if written != entry.size {
        let _ = tokio::fs::remove_file(dest).await;
        return Err(SnapshotError::DownloadFailed(format!(
            "size mismatch for {}: expected {} bytes, got {} bytes",
            entry.path, entry.size, written
        )));
    }

    set_modified(dest, entry.modified).await?;
    debug!("Downloaded {} ({} bytes)", entry.path, written);
    Ok(written)
}

/// [`download_entry`] with transport failures retried per `policy`.
pub(crate) async fn download_with_retry(
    remote: &dyn Remote,
    entry: &FileEntry,
    dest: &Path,
    policy: RetryPolicy,
    on_progress: &(dyn Fn(u64) + Sync),
) -> Result<u64, SnapshotError> {
    let delay_ms = u64::try_from(policy.delay.as_millis()).unwrap_or(u64::MAX);
    let retry_strategy = FixedInterval::from_millis(delay_ms).take(policy.retries);

    Retry::spawn(retry_strategy, || async move {
        match download_entry(remote, entry, dest, on_progress).await {
            Ok(written) => Ok(written),
            Err(e) if e.is_transient() => {
                warn!("Failed to download {} due to error: {}", entry.path, e);
                RetryError::to_transient(e)
            }
            Err(e) => RetryError::to_permanent(e),
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ByteStream;
    use crate::types::ListPage;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Serves one body. The first `refusals` attempts cannot connect, the
    /// next `breaks` attempts fail mid-stream.
    struct OneFile {
        body: Vec<u8>,
        refusals: usize,
        breaks: usize,
        api_error: bool,
        calls: AtomicUsize,
    }

    impl OneFile {
        fn new(body: &[u8]) -> Self {
            Self {
                body: body.to_vec(),
                refusals: 0,
                breaks: 0,
                api_error: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    /// A real transport error: nothing listens on the port.
    async fn connection_refused() -> SnapshotError {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        SnapshotError::Transport(reqwest::get(&url).await.unwrap_err())
    }

    #[async_trait]
    impl Remote for OneFile {
        fn name(&self) -> &str {
            "one-file"
        }
        async fn list_root(&self, _: &str) -> Result<ListPage, SnapshotError> {
            Ok(ListPage::default())
        }
        async fn list_continue(&self, _: &str) -> Result<ListPage, SnapshotError> {
            Ok(ListPage::default())
        }
        async fn total_remote_bytes_used(&self) -> Result<u64, SnapshotError> {
            Ok(self.body.len() as u64)
        }
        async fn download_file(&self, _: &str) -> Result<ByteStream, SnapshotError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.api_error {
                return Err(SnapshotError::Api {
                    status: 409,
                    body: "path/not_found".to_string(),
                });
            }
            if call < self.refusals {
                return Err(connection_refused().await);
            }
            let (head, tail) = self.body.split_at(self.body.len() / 2);
            let mut pieces: Vec<Result<Bytes, SnapshotError>> =
                vec![Ok(Bytes::from(head.to_vec()))];
            if call < self.refusals + self.breaks {
                pieces.push(Err(connection_refused().await));
            } else {
                pieces.push(Ok(Bytes::from(tail.to_vec())));
            }
            Ok(futures_util::stream::iter(pieces).boxed())
        }
        async fn current_account_label(&self) -> Result<String, SnapshotError> {
            Ok("test".to_string())
        }
    }

    fn entry(size: u64) -> FileEntry {
        FileEntry {
            path: "/docs/a.txt".to_string(),
            id: "id:a".to_string(),
            size,
            modified: Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap(),
            content_hash: None,
        }
    }

    #[tokio::test]
    async fn test_download_creates_parents_and_sets_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("docs/a.txt");
        let remote = OneFile::new(b"hello world");
        let seen = Mutex::new(Vec::new());

        let written = download_entry(&remote, &entry(11), &dest, &|n: u64| {
            seen.lock().unwrap().push(n)
        })
        .await
        .unwrap();

        assert_eq!(written, 11);
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello world");
        assert_eq!(*seen.lock().unwrap(), vec![5, 11]);
        let local = crate::verify::local_file(&dest).await.unwrap().unwrap();
        assert!(local.same_mtime(&entry(11).modified));
    }

    #[tokio::test]
    async fn test_size_mismatch_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.txt");
        let remote = OneFile::new(b"short");

        let err = download_entry(&remote, &entry(100), &dest, &|_: u64| {})
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::DownloadFailed(_)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_api_error_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = OneFile::new(b"abc");
        remote.api_error = true;

        let dest = dir.path().join("a");
        let err = download_with_retry(&remote, &entry(3), &dest, quick(3), &|_: u64| {})
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Api { status: 409, .. }));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broken_stream_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.txt");
        let mut remote = OneFile::new(b"abcdef");
        remote.breaks = 1;

        let err = download_entry(&remote, &entry(6), &dest, &|_: u64| {})
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!dest.exists());
    }

    fn quick(retries: usize) -> RetryPolicy {
        RetryPolicy {
            retries,
            delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.txt");
        let mut remote = OneFile::new(b"third time lucky");
        remote.refusals = 1;
        remote.breaks = 1;

        let written = download_with_retry(&remote, &entry(16), &dest, quick(3), &|_: u64| {})
            .await
            .unwrap();
        assert_eq!(written, 16);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 3);
        assert_eq!(std::fs::read(&dest).unwrap(), b"third time lucky");
    }

    #[tokio::test]
    async fn test_retries_run_out() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.txt");
        let mut remote = OneFile::new(b"abc");
        remote.refusals = 10;

        let err = download_with_retry(&remote, &entry(3), &dest, quick(2), &|_: u64| {})
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Transport(_)));
        assert!(err.is_download_failure());
        assert_eq!(remote.calls.load(Ordering::SeqCst), 3);
        assert!(!dest.exists());
    }
}
