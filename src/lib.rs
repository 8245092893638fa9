//! dsnapshot - Resumable, hardlink-deduplicating snapshots of a cloud storage account
//!
//! This library takes point-in-time local copies of a remote file tree. Each
//! run lists the remote into an on-disk index ("map") and materializes that
//! index into a timestamped folder ("resolve"), reusing unchanged files from
//! the previous snapshot via hard links.
//!
//! # Features
//!
//! - **Resumable Runs**: listing cursor and resolve position survive restarts
//! - **Bounded Memory**: the listing is spilled to JSON segments as it arrives
//! - **Hardlink Dedup**: unchanged files cost no bandwidth and no disk
//! - **Concurrent Phases**: resolve follows map as segments are flushed
//! - **Automatic Retry**: transport failures during downloads are retried
//!
//! # Example
//!
//! ```no_run
//! use dsnapshot::{run_snapshot, Config, NullStatus, RemoteRegistry, RunMode};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Config::from_file("dsnapshot.toml".as_ref())?.validate()?;
//! let remote = RemoteRegistry::with_builtin().build(&settings.backend, &settings.remote)?;
//! let report = run_snapshot(
//!     &settings,
//!     remote.as_ref(),
//!     RunMode::Pull,
//!     Arc::new(NullStatus),
//!     std::future::pending(),
//! )
//! .await?;
//! println!("snapshot at {}", report.folder.display());
//! # Ok(())
//! # }
//! ```

pub mod arrayio;
pub mod config;
pub mod download;
pub mod error;
pub mod job;
pub mod lock;
pub mod map;
pub mod orchestrator;
pub mod remote;
pub mod resolve;
pub mod stats;
pub mod status;
pub mod types;
pub mod verify;

pub use config::{Config, RunSettings};
pub use error::SnapshotError;
pub use job::{JobHandle, JobState, SnapshotJob};
pub use map::{MapEngine, MapState, MapSummary};
pub use orchestrator::{
    run_snapshot, shutdown_signal, status_report, RunMode, RunReport, StatusReport,
};
pub use remote::{Remote, RemoteRegistry, RemoteSettings};
pub use resolve::{ResolveEngine, ResolveSettings, ResolveSummary};
pub use stats::RateEstimator;
pub use status::{LogStatus, NullStatus, ProgressBars, StatusSink};
pub use types::{FailedEntry, FileEntry, FolderEntry, IndexSegment, ListPage, RemoteEntry};
