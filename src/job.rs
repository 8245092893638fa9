//! Persisted state of one snapshot run.
//!
//! Layout under the destination root, for a run stamped `T`:
//!
//! - `T.job`: the [`JobState`] record, rewritten atomically
//! - `T.map/map.NNN.json`: index segments
//! - `T.incomplete/`: the tree being materialized, renamed to `T/` when done

use crate::error::SnapshotError;
use crate::types::{FailedEntry, IndexSegment};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Run timestamps sort lexicographically in time order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
pub const INCOMPLETE_SUFFIX: &str = ".incomplete";
pub const INDEX_SUFFIX: &str = ".map";
pub const JOB_SUFFIX: &str = ".job";

/// Durable fields of a run. Anything not listed here is not resumable.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JobState {
    pub timestamp: String,
    /// Unix milliseconds.
    pub start_time: i64,
    /// Current folder name under the root: `T.incomplete` or `T`.
    pub folder: String,
    pub remote_path: String,
    #[serde(default)]
    pub previous_snapshot: Option<String>,
    /// Pagination token matching the last committed segment.
    #[serde(default)]
    pub cursor: Option<String>,
    pub bytes_total: u64,
    pub bytes_indexed: u64,
    pub bytes_processed: u64,
    pub map_complete: bool,
    pub map_length: u64,
    pub segments: Vec<IndexSegment>,
    pub process_index: u64,
    #[serde(default)]
    pub failed: Vec<FailedEntry>,
}

/// A run's state bound to its destination root.
#[derive(Debug)]
pub struct SnapshotJob {
    root: PathBuf,
    state: JobState,
}

fn is_timestamp(name: &str) -> bool {
    NaiveDateTime::parse_from_str(name, TIMESTAMP_FORMAT).is_ok()
}

/// Names of completed snapshot folders under `root`, oldest first.
pub fn completed_snapshots(root: &Path) -> Result<Vec<String>, SnapshotError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_timestamp(name) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Timestamps of every job file under `root`, oldest first.
pub fn job_timestamps(root: &Path) -> Result<Vec<String>, SnapshotError> {
    let mut stamps = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(stamp) = name.strip_suffix(JOB_SUFFIX) {
            if is_timestamp(stamp) && entry.file_type()?.is_file() {
                stamps.push(stamp.to_string());
            }
        }
    }
    stamps.sort();
    Ok(stamps)
}

impl SnapshotJob {
    fn require_root(root: &Path) -> Result<(), SnapshotError> {
        if root.is_dir() {
            Ok(())
        } else {
            Err(SnapshotError::Config(format!(
                "destination {} does not exist",
                root.display()
            )))
        }
    }

    /// Starts a run stamped with `now`, or resumes the one that already has that stamp.
    pub fn new_run(
        root: &Path,
        remote_path: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, SnapshotError> {
        Self::require_root(root)?;
        let timestamp = now.format(TIMESTAMP_FORMAT).to_string();
        if root.join(format!("{}{}", timestamp, JOB_SUFFIX)).is_file() {
            return Self::resume(root, &timestamp);
        }

        let previous_snapshot = completed_snapshots(root)?
            .into_iter()
            .filter(|name| name.as_str() < timestamp.as_str())
            .next_back();

        let job = Self {
            root: root.to_path_buf(),
            state: JobState {
                folder: format!("{}{}", timestamp, INCOMPLETE_SUFFIX),
                timestamp,
                start_time: now.timestamp_millis(),
                remote_path: remote_path.to_string(),
                previous_snapshot,
                cursor: None,
                bytes_total: 0,
                bytes_indexed: 0,
                bytes_processed: 0,
                map_complete: false,
                map_length: 0,
                segments: Vec::new(),
                process_index: 0,
                failed: Vec::new(),
            },
        };
        fs::create_dir_all(job.working_dir())?;
        fs::create_dir_all(job.index_dir())?;
        job.write()?;
        info!(
            "Job {} started (previous snapshot: {})",
            job.job_path().display(),
            job.state.previous_snapshot.as_deref().unwrap_or("none")
        );
        Ok(job)
    }

    /// Loads the run stamped `timestamp` from disk.
    pub fn resume(root: &Path, timestamp: &str) -> Result<Self, SnapshotError> {
        Self::require_root(root)?;
        let mut job = Self {
            root: root.to_path_buf(),
            state: JobState {
                timestamp: timestamp.to_string(),
                start_time: 0,
                folder: String::new(),
                remote_path: String::new(),
                previous_snapshot: None,
                cursor: None,
                bytes_total: 0,
                bytes_indexed: 0,
                bytes_processed: 0,
                map_complete: false,
                map_length: 0,
                segments: Vec::new(),
                process_index: 0,
                failed: Vec::new(),
            },
        };
        job.read()?;
        job.reconcile_folder()?;
        fs::create_dir_all(job.index_dir())?;
        if !job.is_finished() {
            fs::create_dir_all(job.working_dir())?;
        }
        info!(
            "Resuming job {} at entry {}/{} ({} bytes processed)",
            job.job_path().display(),
            job.state.process_index,
            job.state.map_length,
            job.state.bytes_processed
        );
        Ok(job)
    }

    /// Latest unfinished run for `remote_path`, if any.
    pub fn find_unfinished(
        root: &Path,
        remote_path: &str,
    ) -> Result<Option<String>, SnapshotError> {
        for stamp in job_timestamps(root)?.into_iter().rev() {
            let job_path = root.join(format!("{}{}", stamp, JOB_SUFFIX));
            let state: JobState = match fs::read(&job_path)
                .map_err(SnapshotError::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(SnapshotError::from))
            {
                Ok(state) => state,
                Err(e) => {
                    warn!("Ignoring unreadable job {}: {}", job_path.display(), e);
                    continue;
                }
            };
            if state.folder.ends_with(INCOMPLETE_SUFFIX)
                && state.remote_path == remote_path
                && !root.join(&state.timestamp).is_dir()
            {
                return Ok(Some(stamp));
            }
        }
        Ok(None)
    }

    /// Resumes the latest unfinished run for `remote_path`, otherwise starts one.
    pub fn open(root: &Path, remote_path: &str, now: DateTime<Utc>) -> Result<Self, SnapshotError> {
        Self::require_root(root)?;
        match Self::find_unfinished(root, remote_path)? {
            Some(stamp) => Self::resume(root, &stamp),
            None => Self::new_run(root, remote_path, now),
        }
    }

    /// A crash between the completion rename and the following write leaves
    /// the state pointing at a folder that no longer exists.
    fn reconcile_folder(&mut self) -> Result<(), SnapshotError> {
        let final_dir = self.root.join(&self.state.timestamp);
        if self.state.folder != self.state.timestamp
            && !self.working_dir().exists()
            && final_dir.is_dir()
        {
            warn!(
                "Job {} was completed but not recorded; fixing state",
                self.state.timestamp
            );
            self.state.folder = self.state.timestamp.clone();
            self.write()?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut JobState {
        &mut self.state
    }

    pub fn timestamp(&self) -> &str {
        &self.state.timestamp
    }

    pub fn job_path(&self) -> PathBuf {
        self.root.join(format!("{}{}", self.state.timestamp, JOB_SUFFIX))
    }

    pub fn index_dir(&self) -> PathBuf {
        self.root.join(format!("{}{}", self.state.timestamp, INDEX_SUFFIX))
    }

    pub fn segment_path(&self, segment: &IndexSegment) -> PathBuf {
        self.index_dir().join(&segment.filename)
    }

    /// Where this run's tree currently lives.
    pub fn working_dir(&self) -> PathBuf {
        self.root.join(&self.state.folder)
    }

    pub fn previous_dir(&self) -> Option<PathBuf> {
        self.state
            .previous_snapshot
            .as_ref()
            .map(|name| self.root.join(name))
    }

    pub fn is_finished(&self) -> bool {
        self.state.folder == self.state.timestamp
    }

    fn tmp_path(&self) -> PathBuf {
        self.root
            .join(format!(".{}{}.tmp", self.state.timestamp, JOB_SUFFIX))
    }

    /// Serializes the state to the job file (temp file + rename).
    pub fn write(&self) -> Result<(), SnapshotError> {
        write_job_file(&self.job_path(), &self.tmp_path(), &self.state)
    }

    /// Replaces in-memory durable fields with what is on disk.
    pub fn read(&mut self) -> Result<(), SnapshotError> {
        let path = self.job_path();
        let bytes = fs::read(&path)?;
        let state: JobState = serde_json::from_slice(&bytes)?;
        if state.timestamp != self.state.timestamp {
            return Err(SnapshotError::Config(format!(
                "{} belongs to run {}, not {}",
                path.display(),
                state.timestamp,
                self.state.timestamp
            )));
        }
        self.state = state;
        Ok(())
    }

    /// File name for the next segment to be flushed.
    pub fn next_segment_filename(&self) -> String {
        format!("map.{:03}.json", self.state.segments.len())
    }

    /// Records a flushed segment of `count` entries together with the
    /// listing position it corresponds to.
    pub fn commit_segment(
        &mut self,
        filename: String,
        count: u64,
        cursor: Option<String>,
        bytes_indexed: u64,
    ) -> IndexSegment {
        let segment = IndexSegment {
            start: self.state.map_length,
            end: self.state.map_length + count,
            filename,
        };
        self.state.map_length = segment.end;
        self.state.segments.push(segment.clone());
        self.state.cursor = cursor;
        self.state.bytes_indexed = bytes_indexed;
        segment
    }

    /// The segment holding entry `index`.
    pub fn segment_for(&self, index: u64) -> Option<&IndexSegment> {
        self.state.segments.iter().find(|s| s.contains(index))
    }

    /// Renames the working folder to its final name. The caller writes the
    /// state afterwards.
    pub fn complete(&mut self) -> Result<PathBuf, SnapshotError> {
        let final_dir = self.root.join(&self.state.timestamp);
        if !self.is_finished() {
            if final_dir.exists() {
                return Err(SnapshotError::IoError(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{} already exists", final_dir.display()),
                )));
            }
            fs::rename(self.working_dir(), &final_dir)?;
            self.state.folder = self.state.timestamp.clone();
        }
        info!("Snapshot complete: {}", final_dir.display());
        Ok(final_dir)
    }
}

fn write_job_file(path: &Path, tmp: &Path, state: &JobState) -> Result<(), SnapshotError> {
    let body = serde_json::to_vec_pretty(state)?;
    {
        let mut file = fs::File::create(tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    fs::rename(tmp, path)?;
    debug!("Wrote {}", path.display());
    Ok(())
}

/// Shared, lock-protected access to a job.
///
/// Map and resolve both mutate the job through this handle. Their writes go
/// through [`JobHandle::save`], which runs one at a time off the executor and
/// always writes the state as of when it got its turn.
#[derive(Debug, Clone)]
pub struct JobHandle {
    job: Arc<Mutex<SnapshotJob>>,
    writer: Arc<tokio::sync::Mutex<()>>,
}

impl JobHandle {
    pub fn new(job: SnapshotJob) -> Self {
        Self {
            job: Arc::new(Mutex::new(job)),
            writer: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SnapshotJob> {
        self.job.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Writes the current state to disk on the blocking pool.
    pub async fn save(&self) -> Result<(), SnapshotError> {
        let _turn = self.writer.lock().await;
        let (path, tmp, state) = {
            let job = self.lock();
            (job.job_path(), job.tmp_path(), job.state().clone())
        };
        tokio::task::spawn_blocking(move || write_job_file(&path, &tmp, &state))
            .await
            .map_err(|e| SnapshotError::Task(format!("job write: {}", e)))?
    }

    /// Copy of the current state.
    pub fn state(&self) -> JobState {
        self.lock().state().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, h, m, 0).unwrap()
    }

    #[test]
    fn test_new_run_layout() {
        let root = tempfile::tempdir().unwrap();
        let job = SnapshotJob::new_run(root.path(), "", at(2, 20)).unwrap();
        assert_eq!(job.timestamp(), "2026-10-16_02-20-00");
        assert!(root.path().join("2026-10-16_02-20-00.incomplete").is_dir());
        assert!(root.path().join("2026-10-16_02-20-00.map").is_dir());
        assert!(root.path().join("2026-10-16_02-20-00.job").is_file());
        assert_eq!(job.state().previous_snapshot, None);
    }

    #[test]
    fn test_missing_root_is_config_error() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("nope");
        assert!(matches!(
            SnapshotJob::new_run(&missing, "", at(1, 0)),
            Err(SnapshotError::Config(_))
        ));
        assert!(!missing.exists());
    }

    #[test]
    fn test_previous_snapshot_is_latest_completed() {
        let root = tempfile::tempdir().unwrap();
        for name in [
            "2026-10-01_00-00-00",
            "2026-10-09_00-00-00",
            "2026-10-12_00-00-00.incomplete",
            "2026-10-09_00-00-00.map",
            "unrelated",
        ] {
            fs::create_dir(root.path().join(name)).unwrap();
        }
        fs::write(root.path().join("2026-10-11_00-00-00"), b"not a dir").unwrap();

        let job = SnapshotJob::new_run(root.path(), "", at(3, 0)).unwrap();
        assert_eq!(
            job.state().previous_snapshot.as_deref(),
            Some("2026-10-09_00-00-00")
        );
        assert_eq!(
            job.previous_dir().unwrap(),
            root.path().join("2026-10-09_00-00-00")
        );
    }

    #[test]
    fn test_write_read_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let mut job = SnapshotJob::new_run(root.path(), "/Docs", at(4, 0)).unwrap();
        job.state_mut().bytes_total = 20480;
        let filename = job.next_segment_filename();
        job.commit_segment(filename, 4, Some("cursor-1".to_string()), 20480);
        job.state_mut().process_index = 2;
        job.write().unwrap();

        let resumed = SnapshotJob::resume(root.path(), job.timestamp()).unwrap();
        assert_eq!(resumed.state(), job.state());
        assert_eq!(resumed.state().segments[0].filename, "map.000.json");
        assert_eq!(resumed.segment_for(3).unwrap().end, 4);
        assert!(resumed.segment_for(4).is_none());
    }

    #[test]
    fn test_job_file_excludes_nothing_unknown() {
        let root = tempfile::tempdir().unwrap();
        let job = SnapshotJob::new_run(root.path(), "", at(5, 0)).unwrap();
        let mut value: serde_json::Value =
            serde_json::from_slice(&fs::read(job.job_path()).unwrap()).unwrap();
        assert!(value.get("bytesProcessed").is_some());
        assert!(value.get("mapBuffer").is_none());

        value["injected"] = serde_json::json!(true);
        fs::write(job.job_path(), serde_json::to_vec(&value).unwrap()).unwrap();
        assert!(SnapshotJob::resume(root.path(), job.timestamp()).is_err());
    }

    #[test]
    fn test_same_stamp_resumes() {
        let root = tempfile::tempdir().unwrap();
        let mut job = SnapshotJob::new_run(root.path(), "", at(6, 0)).unwrap();
        job.state_mut().process_index = 7;
        job.write().unwrap();

        let again = SnapshotJob::new_run(root.path(), "", at(6, 0)).unwrap();
        assert_eq!(again.state().process_index, 7);
    }

    #[test]
    fn test_open_prefers_unfinished_job() {
        let root = tempfile::tempdir().unwrap();
        let first = SnapshotJob::new_run(root.path(), "", at(7, 0)).unwrap();
        let other_path = SnapshotJob::new_run(root.path(), "/Other", at(7, 30)).unwrap();

        let opened = SnapshotJob::open(root.path(), "", at(8, 0)).unwrap();
        assert_eq!(opened.timestamp(), first.timestamp());

        let opened_other = SnapshotJob::open(root.path(), "/Other", at(8, 0)).unwrap();
        assert_eq!(opened_other.timestamp(), other_path.timestamp());
    }

    #[test]
    fn test_finish_renames_and_new_run_links_to_it() {
        let root = tempfile::tempdir().unwrap();
        let mut job = SnapshotJob::new_run(root.path(), "", at(9, 0)).unwrap();
        fs::write(job.working_dir().join("a.txt"), b"a").unwrap();
        let final_dir = job.complete().unwrap();
        job.write().unwrap();

        assert!(final_dir.join("a.txt").is_file());
        assert!(!root.path().join("2026-10-16_09-00-00.incomplete").exists());
        assert!(job.is_finished());
        assert_eq!(SnapshotJob::find_unfinished(root.path(), "").unwrap(), None);

        let next = SnapshotJob::open(root.path(), "", at(10, 0)).unwrap();
        assert_eq!(
            next.state().previous_snapshot.as_deref(),
            Some("2026-10-16_09-00-00")
        );
    }

    #[test]
    fn test_resume_reconciles_unrecorded_completion() {
        let root = tempfile::tempdir().unwrap();
        let job = SnapshotJob::new_run(root.path(), "", at(11, 0)).unwrap();
        fs::rename(job.working_dir(), root.path().join(job.timestamp())).unwrap();

        let resumed = SnapshotJob::resume(root.path(), job.timestamp()).unwrap();
        assert!(resumed.is_finished());
        assert!(!resumed.working_dir().ends_with("2026-10-16_11-00-00.incomplete"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_keep_latest_state() {
        let root = tempfile::tempdir().unwrap();
        let handle = JobHandle::new(SnapshotJob::new_run(root.path(), "", at(13, 0)).unwrap());
        let tasks: Vec<_> = (0..4u64)
            .map(|i| {
                let handle = handle.clone();
                tokio::spawn(async move {
                    for _ in 0..10 {
                        handle.lock().state_mut().process_index += i + 1;
                        handle.save().await.unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        let on_disk = SnapshotJob::resume(root.path(), "2026-10-16_13-00-00").unwrap();
        assert_eq!(on_disk.state().process_index, 10 * (1 + 2 + 3 + 4));
        assert!(!root.path().join(".2026-10-16_13-00-00.job.tmp").exists());
    }

    #[test]
    fn test_handle_serializes_writes() {
        let root = tempfile::tempdir().unwrap();
        let handle = JobHandle::new(SnapshotJob::new_run(root.path(), "", at(12, 0)).unwrap());
        let workers: Vec<_> = (0..4)
            .map(|i| {
                let handle = handle.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let mut job = handle.lock();
                        job.state_mut().bytes_processed += i + 1;
                        job.write().unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let on_disk = SnapshotJob::resume(root.path(), "2026-10-16_12-00-00").unwrap();
        assert_eq!(on_disk.state().bytes_processed, 25 * (1 + 2 + 3 + 4));
    }
}
