//! Local file checks: size, modification time and content hashing.

use crate::error::SnapshotError;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Block size of the content hash.
pub const HASH_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Size and modification time of an existing local file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalFile {
    pub size: u64,
    pub modified: DateTime<Utc>,
}

impl LocalFile {
    /// Same modification time, to the second.
    pub fn same_mtime(&self, other: &DateTime<Utc>) -> bool {
        self.modified.timestamp() == other.timestamp()
    }
}

/// Stats a regular file, returning `None` when nothing (or a non-file) is there.
pub(crate) async fn local_file(path: &Path) -> Result<Option<LocalFile>, SnapshotError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if !metadata.is_file() {
        return Ok(None);
    }
    let modified = FileTime::from_last_modification_time(&metadata);
    let modified = DateTime::<Utc>::from_timestamp(modified.unix_seconds(), modified.nanoseconds())
        .unwrap_or_default();
    Ok(Some(LocalFile {
        size: metadata.len(),
        modified,
    }))
}

/// Sets a file's modification time to `modified`.
pub(crate) async fn set_modified(
    path: &Path,
    modified: DateTime<Utc>,
) -> Result<(), SnapshotError> {
    let path = path.to_path_buf();
    let mtime = FileTime::from_unix_time(modified.timestamp(), modified.timestamp_subsec_nanos());
    tokio::task::spawn_blocking(move || filetime::set_file_mtime(&path, mtime))
        .await
        .map_err(|e| SnapshotError::Task(format!("set mtime: {}", e)))??;
    Ok(())
}

/// Block-wise content hash over any reader.
///
/// Each 4 MiB block is hashed with SHA-256, the block digests are concatenated
/// and hashed again. The result is lowercase hex.
pub fn content_hash_reader<R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut overall = Sha256::new();
    let mut block = vec![0u8; HASH_BLOCK_SIZE];

    loop {
        let mut filled = 0;
        while filled < HASH_BLOCK_SIZE {
            let n = reader.read(&mut block[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        overall.update(Sha256::digest(&block[..filled]));
        if filled < HASH_BLOCK_SIZE {
            break;
        }
    }

    Ok(format!("{:x}", overall.finalize()))
}

/// Computes the content hash of a local file.
///
/// This function reads the file in blocks to avoid loading large files
/// entirely into memory. It runs in a blocking task to avoid blocking
/// the async runtime.
pub(crate) async fn compute_content_hash(path: &Path) -> Result<String, SnapshotError> {
    let path: PathBuf = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path).map_err(SnapshotError::IoError)?;
        let reader = std::io::BufReader::with_capacity(1024 * 1024, file);
        content_hash_reader(reader).map_err(SnapshotError::IoError)
    })
    .await
    .map_err(|e| SnapshotError::Task(format!("content hash: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reference_hash(data: &[u8]) -> String {
        let mut concatenated = Vec::new();
        for block in data.chunks(HASH_BLOCK_SIZE) {
            concatenated.extend_from_slice(&Sha256::digest(block));
        }
        format!("{:x}", Sha256::digest(&concatenated))
    }

    #[test]
    fn test_empty_content_hash() {
        let hash = content_hash_reader(&b""[..]).unwrap();
        assert_eq!(hash, format!("{:x}", Sha256::digest(b"")));
    }

    #[test]
    fn test_multi_block_content_hash() {
        let data: Vec<u8> = (0..HASH_BLOCK_SIZE * 2 + 123).map(|i| (i % 251) as u8).collect();
        assert_eq!(content_hash_reader(&data[..]).unwrap(), reference_hash(&data));

        let exact: Vec<u8> = vec![7u8; HASH_BLOCK_SIZE];
        assert_eq!(content_hash_reader(&exact[..]).unwrap(), reference_hash(&exact));
    }

    #[tokio::test]
    async fn test_local_file_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        assert!(local_file(&path).await.unwrap().is_none());

        std::fs::write(&path, b"hello").unwrap();
        let when = Utc.with_ymd_and_hms(2019, 5, 1, 10, 0, 0).unwrap();
        set_modified(&path, when).await.unwrap();

        let local = local_file(&path).await.unwrap().unwrap();
        assert_eq!(local.size, 5);
        assert!(local.same_mtime(&when));
        assert!(local_file(dir.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compute_content_hash_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.bin");
        std::fs::write(&path, b"snapshot").unwrap();
        assert_eq!(
            compute_content_hash(&path).await.unwrap(),
            reference_hash(b"snapshot")
        );
    }
}
