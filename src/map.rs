//! The map phase: pages through the remote listing and spills it to disk as
//! index segments.
//!
//! Entries are buffered in memory until their serialized size reaches the
//! segment threshold, then written out as one `map.NNN.json` array. The
//! listing cursor, `bytesIndexed` and the segment manifest are committed to
//! the job together, so a resumed run always continues from the end of the
//! last flushed segment. When the run is cancelled, whatever is buffered is
//! flushed with the cursor of the last fetched page before it returns.

use crate::arrayio::{serialized_len, write_array};
use crate::error::SnapshotError;
use crate::job::JobHandle;
use crate::remote::Remote;
use crate::stats::{format_bytes, RateEstimator};
use crate::status::{attach, Phase, StatusSink};
use crate::types::{ListPage, RemoteEntry};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Buffered bytes that trigger a segment flush.
pub const DEFAULT_SEGMENT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapState {
    NotStarted,
    Paging,
    Complete,
}

/// Counters for one map run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapSummary {
    pub pages: u64,
    pub entries: u64,
    pub segments: u64,
    pub bytes_indexed: u64,
}

pub struct MapEngine<'a> {
    remote: &'a dyn Remote,
    job: JobHandle,
    status: Arc<dyn StatusSink>,
    index_ready: Arc<Notify>,
    segment_bytes: usize,
    cancel: CancellationToken,
    state: MapState,
    buffer: Vec<RemoteEntry>,
    buffer_bytes: usize,
    summary: MapSummary,
}

impl<'a> MapEngine<'a> {
    pub fn new(
        remote: &'a dyn Remote,
        job: JobHandle,
        status: Arc<dyn StatusSink>,
        index_ready: Arc<Notify>,
    ) -> Self {
        Self {
            remote,
            job,
            status,
            index_ready,
            segment_bytes: DEFAULT_SEGMENT_BYTES,
            cancel: CancellationToken::new(),
            state: MapState::NotStarted,
            buffer: Vec::new(),
            buffer_bytes: 0,
            summary: MapSummary::default(),
        }
    }

    pub fn with_segment_bytes(mut self, segment_bytes: usize) -> Self {
        self.segment_bytes = segment_bytes.max(1);
        self
    }

    /// Stops paging once `cancel` fires; `run` then returns `Interrupted`.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> MapState {
        self.state
    }

    /// Pages the listing to the end.
    ///
    /// A page error is returned as is. Entries from pages fetched before the
    /// failure are flushed first, so the next run resumes after them.
    pub async fn run(&mut self) -> Result<MapSummary, SnapshotError> {
        let state = self.job.state();
        if state.map_complete {
            info!("Index already complete ({} entries)", state.map_length);
            self.state = MapState::Complete;
            self.index_ready.notify_one();
            return Ok(self.summary.clone());
        }

        let remote = self.remote;
        let cancel = self.cancel.clone();
        let mut bytes_total = state.bytes_total;
        if bytes_total == 0 {
            bytes_total = tokio::select! {
                used = remote.total_remote_bytes_used() => used?,
                _ = cancel.cancelled() => return Err(SnapshotError::Interrupted),
            };
            self.job.lock().state_mut().bytes_total = bytes_total;
            self.job.save().await?;
        }
        info!(
            "Indexing {} (account usage {})",
            if state.remote_path.is_empty() { "/" } else { state.remote_path.as_str() },
            format_bytes(bytes_total)
        );

        let mut estimator = RateEstimator::new(state.bytes_indexed);
        attach(
            &mut estimator,
            self.status.clone(),
            Phase::Map,
            Arc::new(AtomicU64::new(bytes_total)),
        );

        let mut cursor = state.cursor.clone();
        let mut bytes_indexed = state.bytes_indexed;
        let mut warned_over_total = false;
        self.state = MapState::Paging;

        loop {
            let fetched = {
                let next = async {
                    match &cursor {
                        None => remote.list_root(&state.remote_path).await,
                        Some(c) => remote.list_continue(c).await,
                    }
                };
                tokio::select! {
                    fetched = next => Some(fetched),
                    _ = cancel.cancelled() => None,
                }
            };
            let page: ListPage = match fetched {
                None => {
                    self.flush(cursor.clone(), bytes_indexed).await?;
                    info!(
                        "Indexing stopped at {} entries ({})",
                        self.job.lock().state().map_length,
                        format_bytes(bytes_indexed)
                    );
                    return Err(SnapshotError::Interrupted);
                }
                Some(Ok(page)) => page,
                Some(Err(e)) => {
                    if !self.buffer.is_empty() {
                        self.flush(cursor.clone(), bytes_indexed).await?;
                    }
                    return Err(e);
                }
            };
            self.summary.pages += 1;
            debug!(
                "Page {}: {} entries, has_more={}",
                self.summary.pages,
                page.entries.len(),
                page.has_more
            );

            for entry in page.entries {
                bytes_indexed += entry.size();
                // ",\n" separator
                self.buffer_bytes += serialized_len(&entry)? + 2;
                self.buffer.push(entry);
            }
            cursor = Some(page.cursor);
            estimator.record(bytes_indexed);

            if bytes_indexed > bytes_total && !warned_over_total && bytes_total > 0 {
                warn!(
                    "Indexed {} exceeds reported account usage {}",
                    format_bytes(bytes_indexed),
                    format_bytes(bytes_total)
                );
                warned_over_total = true;
            }

            if !page.has_more {
                break;
            }
            if self.buffer_bytes >= self.segment_bytes {
                self.flush(cursor.clone(), bytes_indexed).await?;
            }
        }

        self.flush(cursor, bytes_indexed).await?;
        self.summary.bytes_indexed = {
            let mut job = self.job.lock();
            job.state_mut().map_complete = true;
            job.state().bytes_indexed
        };
        self.job.save().await?;
        self.state = MapState::Complete;
        self.index_ready.notify_one();

        self.status.finish(
            Phase::Map,
            &format!(
                "{} entries in {} segment(s), {}",
                self.summary.entries,
                self.summary.segments,
                format_bytes(self.summary.bytes_indexed)
            ),
        );
        Ok(self.summary.clone())
    }

    /// Writes the buffer as a new segment and commits it with `cursor`.
    async fn flush(
        &mut self,
        cursor: Option<String>,
        bytes_indexed: u64,
    ) -> Result<(), SnapshotError> {
        let entries = std::mem::take(&mut self.buffer);
        self.buffer_bytes = 0;

        if entries.is_empty() {
            {
                let mut job = self.job.lock();
                job.state_mut().cursor = cursor;
                job.state_mut().bytes_indexed = bytes_indexed;
            }
            return self.job.save().await;
        }

        let (filename, path) = {
            let job = self.job.lock();
            let filename = job.next_segment_filename();
            let path = job.index_dir().join(&filename);
            (filename, path)
        };
        let count = entries.len() as u64;
        let written = tokio::task::spawn_blocking(move || write_array(&path, &entries))
            .await
            .map_err(|e| SnapshotError::Task(format!("segment write: {}", e)))??;

        let segment = self
            .job
            .lock()
            .commit_segment(filename, count, cursor, bytes_indexed);
        self.job.save().await?;
        self.summary.entries += count;
        self.summary.segments += 1;
        debug!(
            "Flushed {} [{}, {}) ({} bytes)",
            segment.filename, segment.start, segment.end, written
        );
        self.index_ready.notify_one();
        Ok(())
    }
}
