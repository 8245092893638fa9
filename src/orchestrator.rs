//! Ties a run together: lock, job construction or resume, concurrent map and
//! resolve, interruption, and rotation of old snapshots.

use crate::config::RunSettings;
use crate::download::RetryPolicy;
use crate::error::SnapshotError;
use crate::job::{completed_snapshots, JobHandle, JobState, SnapshotJob, INDEX_SUFFIX, JOB_SUFFIX};
use crate::lock::RootLock;
use crate::map::{MapEngine, MapSummary};
use crate::remote::Remote;
use crate::resolve::{ResolveEngine, ResolveSettings, ResolveSummary};
use crate::status::StatusSink;
use crate::types::FailedEntry;
use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Which phases a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Map and resolve concurrently.
    Pull,
    /// Build (or finish) the index only.
    MapOnly,
    /// Resolve what the latest unfinished job has indexed so far.
    ResolveOnly,
}

/// Outcome of [`run_snapshot`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub timestamp: String,
    /// Working folder, or the final snapshot folder once completed.
    pub folder: PathBuf,
    pub map: Option<MapSummary>,
    pub resolve: Option<ResolveSummary>,
    pub failed: Vec<FailedEntry>,
    pub completed: bool,
    /// Snapshots removed by rotation.
    pub rotated: Vec<String>,
}

/// Resolves once SIGINT or SIGTERM arrives.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), saving job state..."),
        _ = terminate => info!("Received SIGTERM, saving job state..."),
    }
}

fn open_job(settings: &RunSettings, mode: RunMode) -> Result<SnapshotJob, SnapshotError> {
    let root = &settings.destination;
    match mode {
        RunMode::ResolveOnly => match SnapshotJob::find_unfinished(root, &settings.remote_path)? {
            Some(stamp) => SnapshotJob::resume(root, &stamp),
            None => Err(SnapshotError::Config(format!(
                "no unfinished snapshot under {} to resolve",
                root.display()
            ))),
        },
        RunMode::Pull | RunMode::MapOnly => {
            SnapshotJob::open(root, &settings.remote_path, Utc::now())
        }
    }
}

/// Keeps the error that stopped the run rather than the `Interrupted` of the
/// phase that was stopped because of it.
fn joined(
    mapped: Result<MapSummary, SnapshotError>,
    resolved: Result<ResolveSummary, SnapshotError>,
) -> Result<(Option<MapSummary>, Option<ResolveSummary>), SnapshotError> {
    match (mapped, resolved) {
        (Ok(m), Ok(r)) => Ok((Some(m), Some(r))),
        (Err(e), _) if !matches!(e, SnapshotError::Interrupted) => Err(e),
        (_, Err(e)) => Err(e),
        (Err(e), Ok(_)) => Err(e),
    }
}

/// Runs one snapshot under `settings.destination`.
///
/// When `shutdown` resolves first, both phases are cancelled: map commits
/// what it has buffered along with the cursor of the last page it fetched,
/// resolve abandons the entry in flight, the job state is written one last
/// time and `SnapshotError::Interrupted` is returned. Any engine error is
/// returned as is, with the job file left at its last durable write.
pub async fn run_snapshot<S>(
    settings: &RunSettings,
    remote: &dyn Remote,
    mode: RunMode,
    status: Arc<dyn StatusSink>,
    shutdown: S,
) -> Result<RunReport, SnapshotError>
where
    S: Future<Output = ()>,
{
    let _lock = RootLock::acquire(&settings.destination)?;
    let job = JobHandle::new(open_job(settings, mode)?);

    if mode != RunMode::ResolveOnly {
        match remote.current_account_label().await {
            Ok(label) => info!("Account: {} ({})", label, remote.name()),
            Err(e) => warn!("Could not read account label: {}", e),
        }
    }

    let cancel = CancellationToken::new();
    let map_stop = cancel.child_token();
    let resolve_stop = cancel.child_token();
    let index_ready = Arc::new(Notify::new());
    let mut map = MapEngine::new(remote, job.clone(), status.clone(), index_ready.clone())
        .with_segment_bytes(settings.segment_bytes)
        .with_cancel(map_stop.clone());
    let mut resolve = ResolveEngine::new(
        remote,
        job.clone(),
        status.clone(),
        index_ready,
        ResolveSettings {
            read_chunk_bytes: settings.read_chunk_bytes,
            persist_every: settings.persist_every,
            poll_interval: settings.poll_interval,
            retry: RetryPolicy {
                retries: settings.download_retries,
                delay: settings.retry_delay,
            },
            follow_map: mode == RunMode::Pull,
        },
    )
    .with_cancel(resolve_stop.clone());

    let work = async {
        match mode {
            RunMode::Pull => {
                // a failing phase stops the other one
                let mapping = async {
                    let result = map.run().await;
                    if result.is_err() {
                        resolve_stop.cancel();
                    }
                    result
                };
                let resolving = async {
                    let result = resolve.run().await;
                    if result.is_err() {
                        map_stop.cancel();
                    }
                    result
                };
                let (mapped, resolved) = tokio::join!(mapping, resolving);
                joined(mapped, resolved)
            }
            RunMode::MapOnly => map.run().await.map(|m| (Some(m), None)),
            RunMode::ResolveOnly => resolve.run().await.map(|r| (None, Some(r))),
        }
    };
    tokio::pin!(work);

    let result = tokio::select! {
        result = &mut work => result,
        _ = shutdown => {
            info!("Stopping, saving job state...");
            cancel.cancel();
            work.await
        }
    };
    let (map_summary, resolve_summary) = match result {
        Err(SnapshotError::Interrupted) => {
            job.save().await?;
            warn!("Interrupted; resume by running again with the same destination");
            return Err(SnapshotError::Interrupted);
        }
        other => other?,
    };

    let state = job.state();
    let completed = state.folder == state.timestamp;
    let folder = settings.destination.join(&state.folder);

    let rotated = match settings.rotations {
        Some(keep) if completed => rotate(&settings.destination, keep, &state.timestamp)?,
        _ => Vec::new(),
    };

    if !state.failed.is_empty() {
        warn!(
            "⚠️ {} entries could not be downloaded; they are listed in {}{}",
            state.failed.len(),
            state.timestamp,
            JOB_SUFFIX
        );
    }

    Ok(RunReport {
        timestamp: state.timestamp,
        folder,
        map: map_summary,
        resolve: resolve_summary,
        failed: state.failed,
        completed,
        rotated,
    })
}

/// Removes completed snapshots beyond the newest `keep`, with their job
/// files and indexes. `current` is never removed.
pub fn rotate(root: &Path, keep: usize, current: &str) -> Result<Vec<String>, SnapshotError> {
    let snapshots = completed_snapshots(root)?;
    let excess = snapshots.len().saturating_sub(keep.max(1));
    let mut removed = Vec::new();

    for name in snapshots.into_iter().take(excess) {
        if name == current {
            continue;
        }
        info!("Rotating out snapshot {}", name);
        std::fs::remove_dir_all(root.join(&name))?;
        let index = root.join(format!("{}{}", name, INDEX_SUFFIX));
        if index.is_dir() {
            std::fs::remove_dir_all(&index)?;
        }
        let job = root.join(format!("{}{}", name, JOB_SUFFIX));
        if job.is_file() {
            std::fs::remove_file(&job)?;
        }
        removed.push(name);
    }
    Ok(removed)
}

/// What `status` reports about an account and a destination.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub account: String,
    pub backend: String,
    pub remote_bytes_used: u64,
    pub snapshots: Vec<String>,
    pub unfinished: Option<JobState>,
}

pub async fn status_report(
    settings: &RunSettings,
    remote: &dyn Remote,
) -> Result<StatusReport, SnapshotError> {
    let account = remote.current_account_label().await?;
    let remote_bytes_used = remote.total_remote_bytes_used().await?;
    let root = &settings.destination;
    let snapshots = completed_snapshots(root)?;
    let unfinished = match SnapshotJob::find_unfinished(root, &settings.remote_path)? {
        Some(stamp) => {
            let job_path = root.join(format!("{}{}", stamp, JOB_SUFFIX));
            let bytes = std::fs::read(&job_path)?;
            Some(serde_json::from_slice(&bytes)?)
        }
        None => None,
    };
    Ok(StatusReport {
        account,
        backend: remote.name().to_string(),
        remote_bytes_used,
        snapshots,
        unfinished,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_keeps_newest() {
        let root = tempfile::tempdir().unwrap();
        for name in ["2026-01-01_00-00-00", "2026-02-01_00-00-00", "2026-03-01_00-00-00"] {
            std::fs::create_dir(root.path().join(name)).unwrap();
            std::fs::create_dir(root.path().join(format!("{}.map", name))).unwrap();
            std::fs::write(root.path().join(format!("{}.job", name)), b"{}").unwrap();
        }
        std::fs::create_dir(root.path().join("2026-04-01_00-00-00.incomplete")).unwrap();

        let removed = rotate(root.path(), 2, "2026-03-01_00-00-00").unwrap();
        assert_eq!(removed, vec!["2026-01-01_00-00-00".to_string()]);
        assert!(!root.path().join("2026-01-01_00-00-00").exists());
        assert!(!root.path().join("2026-01-01_00-00-00.map").exists());
        assert!(!root.path().join("2026-01-01_00-00-00.job").exists());
        assert!(root.path().join("2026-02-01_00-00-00").is_dir());
        assert!(root.path().join("2026-04-01_00-00-00.incomplete").is_dir());
    }

    #[test]
    fn test_joined_reports_the_failing_phase() {
        let listing_failed = joined(
            Err(SnapshotError::Api {
                status: 500,
                body: String::new(),
            }),
            Err(SnapshotError::Interrupted),
        );
        assert!(matches!(listing_failed, Err(SnapshotError::Api { status: 500, .. })));

        let resolve_failed = joined(
            Err(SnapshotError::Interrupted),
            Err(SnapshotError::corrupt("map.000.json", "truncated")),
        );
        assert!(matches!(resolve_failed, Err(SnapshotError::CorruptIndex { .. })));

        let stopped = joined(Err(SnapshotError::Interrupted), Ok(ResolveSummary::default()));
        assert!(matches!(stopped, Err(SnapshotError::Interrupted)));
    }

    #[test]
    fn test_rotate_never_removes_current() {
        let root = tempfile::tempdir().unwrap();
        for name in ["2026-01-01_00-00-00", "2026-02-01_00-00-00"] {
            std::fs::create_dir(root.path().join(name)).unwrap();
        }
        let removed = rotate(root.path(), 1, "2026-01-01_00-00-00").unwrap();
        assert!(removed.is_empty());
        assert!(root.path().join("2026-01-01_00-00-00").is_dir());
    }
}
