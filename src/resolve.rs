//! The resolve phase: walks the committed index and materializes each entry
//! in the working folder.
//!
//! Files are taken, in order of preference, from what is already in place,
//! from a hard link into the previous snapshot, or from a download. Resolve
//! may run while map is still listing; it only ever reads flushed segments
//! and waits when it reaches the end of them.

use crate::arrayio::read_array;
use crate::download::{download_with_retry, RetryPolicy};
use crate::error::SnapshotError;
use crate::job::JobHandle;
use crate::remote::Remote;
use crate::stats::{format_bytes, RateEstimator};
use crate::status::{attach, Phase, StatusSink};
use crate::types::{FailedEntry, FileEntry, IndexSegment, RemoteEntry};
use crate::verify::{compute_content_hash, local_file, set_modified};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ResolveSettings {
    pub read_chunk_bytes: usize,
    /// Entries handled between job writes.
    pub persist_every: u64,
    /// Longest wait for map before the index length is re-checked.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// Wait for map to commit more entries; otherwise stop at the end of the
    /// committed index.
    pub follow_map: bool,
}

impl Default for ResolveSettings {
    fn default() -> Self {
        Self {
            read_chunk_bytes: crate::arrayio::DEFAULT_CHUNK_SIZE,
            persist_every: 100,
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            follow_map: true,
        }
    }
}

/// How one entry was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Folder,
    /// Already present with the right size.
    Existing,
    /// Hard-linked from the previous snapshot on size and mtime.
    Linked,
    /// Hard-linked after a content hash match.
    HashLinked,
    Downloaded,
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveSummary {
    pub folders: u64,
    pub existing: u64,
    pub linked: u64,
    pub hash_linked: u64,
    pub downloaded: u64,
    pub bytes_downloaded: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Whether this run renamed the snapshot into place.
    pub completed: bool,
}

impl ResolveSummary {
    fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Folder => self.folders += 1,
            Outcome::Existing => self.existing += 1,
            Outcome::Linked => self.linked += 1,
            Outcome::HashLinked => self.hash_linked += 1,
            Outcome::Downloaded => self.downloaded += 1,
            Outcome::Skipped => self.skipped += 1,
        }
    }
}

/// Maps a remote path onto `base`, refusing anything that would escape it.
pub fn local_path(base: &Path, remote_path: &str) -> Option<PathBuf> {
    let mut path = base.to_path_buf();
    for component in Path::new(remote_path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(path)
}

/// Replaces whatever is at `dest` with a hard link to `source`.
async fn link_into_place(source: &Path, dest: &Path) -> Result<(), SnapshotError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::remove_file(dest).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::hard_link(source, dest).await?;
    Ok(())
}

pub struct ResolveEngine<'a> {
    remote: &'a dyn Remote,
    job: JobHandle,
    status: Arc<dyn StatusSink>,
    index_ready: Arc<Notify>,
    settings: ResolveSettings,
    cancel: CancellationToken,
    loaded: Option<(IndexSegment, Vec<RemoteEntry>)>,
    summary: ResolveSummary,
}

impl<'a> ResolveEngine<'a> {
    pub fn new(
        remote: &'a dyn Remote,
        job: JobHandle,
        status: Arc<dyn StatusSink>,
        index_ready: Arc<Notify>,
        settings: ResolveSettings,
    ) -> Self {
        Self {
            remote,
            job,
            status,
            index_ready,
            settings,
            cancel: CancellationToken::new(),
            loaded: None,
            summary: ResolveSummary::default(),
        }
    }

    /// Stops before the next entry once `cancel` fires; an entry in flight
    /// is abandoned without advancing the index. `run` then returns
    /// `Interrupted`.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn summary(&self) -> &ResolveSummary {
        &self.summary
    }

    /// Resolves entries until the index is exhausted and, when the listing is
    /// complete, renames the working folder into place.
    ///
    /// Every handled entry, failed ones included, adds its declared size to
    /// `bytesProcessed`, so reaching the end of a complete index also means
    /// every indexed byte is accounted for. `bytesTotal` is account usage and
    /// is larger than what a `remote_path` subtree indexes, so it is not
    /// part of the check.
    pub async fn run(&mut self) -> Result<ResolveSummary, SnapshotError> {
        let (working_dir, previous_dir, start) = {
            let job = self.job.lock();
            (job.working_dir(), job.previous_dir(), job.state().clone())
        };
        if start.folder == start.timestamp {
            info!("Snapshot {} is already complete", start.timestamp);
            self.summary.completed = true;
            return Ok(self.summary.clone());
        }

        let total = Arc::new(AtomicU64::new(start.bytes_total));
        let estimator = {
            let mut estimator = RateEstimator::new(start.bytes_processed);
            attach(&mut estimator, self.status.clone(), Phase::Resolve, total.clone());
            Mutex::new(estimator)
        };
        let mut since_persist = 0u64;

        let cancel = self.cancel.clone();
        loop {
            if cancel.is_cancelled() {
                return Err(SnapshotError::Interrupted);
            }
            let (index, committed, map_complete, processed, bytes_total) = {
                let job = self.job.lock();
                let s = job.state();
                (s.process_index, s.map_length, s.map_complete, s.bytes_processed, s.bytes_total)
            };
            total.store(bytes_total, Ordering::Relaxed);

            if index >= committed {
                if map_complete || !self.settings.follow_map {
                    break;
                }
                if since_persist > 0 {
                    self.job.save().await?;
                    since_persist = 0;
                }
                debug!("Waiting for index beyond entry {}", index);
                let wait =
                    tokio::time::timeout(self.settings.poll_interval, self.index_ready.notified());
                tokio::select! {
                    _ = wait => {}
                    _ = cancel.cancelled() => return Err(SnapshotError::Interrupted),
                }
                continue;
            }

            let entry = self.entry_at(index).await?;
            let on_progress = |written: u64| {
                let mut estimator = estimator.lock().unwrap_or_else(|p| p.into_inner());
                estimator.record(processed + written);
            };
            let handled = {
                let resolving =
                    self.resolve_entry(&entry, &working_dir, previous_dir.as_deref(), &on_progress);
                tokio::select! {
                    handled = resolving => Some(handled),
                    _ = cancel.cancelled() => None,
                }
            };
            let Some(handled) = handled else {
                debug!("Abandoned entry {} on cancel", index);
                return Err(SnapshotError::Interrupted);
            };
            let failure = match handled {
                Ok(outcome) => {
                    self.summary.count(outcome);
                    None
                }
                Err(e) if e.is_download_failure() => Some(e.to_string()),
                Err(e) => return Err(e),
            };

            let (processed, save) = {
                let mut job = self.job.lock();
                let state = job.state_mut();
                if let Some(reason) = failure {
                    let (path, id) = match &entry {
                        RemoteEntry::File(f) => (f.path.clone(), f.id.clone()),
                        other => (other.path().unwrap_or_default().to_string(), String::new()),
                    };
                    warn!("⚠️ Skipping {}: {}", path, reason);
                    state.failed.push(FailedEntry {
                        index,
                        path,
                        id,
                        reason,
                    });
                    self.summary.failed += 1;
                    // failures are rare and worth keeping across a crash
                    since_persist = self.settings.persist_every;
                }
                state.process_index = index + 1;
                state.bytes_processed += entry.size();
                since_persist += 1;
                let save = since_persist >= self.settings.persist_every;
                if save {
                    since_persist = 0;
                }
                (job.state().bytes_processed, save)
            };
            if save {
                self.job.save().await?;
            }
            estimator
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .record(processed);
        }

        self.finish().await
    }

    async fn finish(&mut self) -> Result<ResolveSummary, SnapshotError> {
        let done = {
            let mut job = self.job.lock();
            let state = job.state();
            let done = state.map_complete && state.process_index == state.map_length;
            if done {
                job.complete()?;
            }
            done
        };
        self.job.save().await?;
        self.summary.completed = done;

        let message = format!(
            "{} downloaded ({}), {} linked, {} hash-linked, {} existing, {} folders, {} failed",
            self.summary.downloaded,
            format_bytes(self.summary.bytes_downloaded),
            self.summary.linked,
            self.summary.hash_linked,
            self.summary.existing,
            self.summary.folders,
            self.summary.failed
        );
        if done {
            self.status.finish(Phase::Resolve, &message);
        } else {
            self.status.message(Phase::Resolve, &message);
        }
        Ok(self.summary.clone())
    }

    /// Entry `index` of the committed index, loading its segment if needed.
    async fn entry_at(&mut self, index: u64) -> Result<RemoteEntry, SnapshotError> {
        let cached = matches!(&self.loaded, Some((segment, _)) if segment.contains(index));
        if !cached {
            let (segment, path) = {
                let job = self.job.lock();
                let segment = job.segment_for(index).cloned().ok_or_else(|| {
                    SnapshotError::corrupt(
                        job.job_path().display().to_string(),
                        format!("no segment holds entry {}", index),
                    )
                })?;
                let path = job.segment_path(&segment);
                (segment, path)
            };
            let chunk = self.settings.read_chunk_bytes;
            let name = segment.filename.clone();
            let entries: Vec<RemoteEntry> = tokio::task::spawn_blocking(move || {
                read_array(&path, chunk, move |bytes, entries| {
                    debug!("{}: {} bytes, {} entries read", name, bytes, entries)
                })
            })
            .await
            .map_err(|e| SnapshotError::Task(format!("segment read: {}", e)))??;

            if entries.len() as u64 != segment.len() {
                return Err(SnapshotError::corrupt(
                    segment.filename.clone(),
                    format!("expected {} entries, found {}", segment.len(), entries.len()),
                ));
            }
            self.loaded = Some((segment, entries));
        }

        match &self.loaded {
            Some((segment, entries)) => Ok(entries[(index - segment.start) as usize].clone()),
            None => Err(SnapshotError::Task("segment cache empty".to_string())),
        }
    }

    async fn resolve_entry(
        &mut self,
        entry: &RemoteEntry,
        working_dir: &Path,
        previous_dir: Option<&Path>,
        on_progress: &(dyn Fn(u64) + Sync),
    ) -> Result<Outcome, SnapshotError> {
        match entry {
            RemoteEntry::Folder(folder) => {
                let dest = local_path(working_dir, &folder.path)
                    .ok_or_else(|| unsafe_path(&folder.path))?;
                tokio::fs::create_dir_all(&dest).await?;
                Ok(Outcome::Folder)
            }
            RemoteEntry::File(file) => {
                self.resolve_file(file, working_dir, previous_dir, on_progress)
                    .await
            }
            RemoteEntry::Deleted(_) | RemoteEntry::Unknown => Ok(Outcome::Skipped),
        }
    }

    async fn resolve_file(
        &mut self,
        file: &FileEntry,
        working_dir: &Path,
        previous_dir: Option<&Path>,
        on_progress: &(dyn Fn(u64) + Sync),
    ) -> Result<Outcome, SnapshotError> {
        let dest = local_path(working_dir, &file.path).ok_or_else(|| unsafe_path(&file.path))?;

        if let Some(local) = local_file(&dest).await? {
            if local.size == file.size {
                debug!("Already in place: {}", file.path);
                return Ok(Outcome::Existing);
            }
        }

        if let Some(previous) = previous_dir.and_then(|dir| local_path(dir, &file.path)) {
            if let Some(old) = local_file(&previous).await? {
                if old.size == file.size {
                    if old.same_mtime(&file.modified) {
                        link_into_place(&previous, &dest).await?;
                        debug!("Linked {}", file.path);
                        return Ok(Outcome::Linked);
                    }
                    if let Some(expected) = &file.content_hash {
                        let actual = compute_content_hash(&previous).await?;
                        if actual.eq_ignore_ascii_case(expected) {
                            link_into_place(&previous, &dest).await?;
                            set_modified(&dest, file.modified).await?;
                            debug!("Linked {} after hash match", file.path);
                            return Ok(Outcome::HashLinked);
                        }
                        debug!("Content changed: {}", file.path);
                    }
                }
            }
        }

        let written =
            download_with_retry(self.remote, file, &dest, self.settings.retry, on_progress).await?;
        self.summary.bytes_downloaded += written;
        Ok(Outcome::Downloaded)
    }
}

fn unsafe_path(path: &str) -> SnapshotError {
    SnapshotError::DownloadFailed(format!("refusing unsafe path {:?}", path))
}
