//! Progress reporting for the map and resolve phases.
//!
//! Engines never print. They push [`PhaseProgress`] values into a
//! [`StatusSink`], which renders them as progress bars, throttled log lines,
//! or nothing at all.

use crate::stats::{format_bytes, format_eta, format_speed, RateEstimator};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Map,
    Resolve,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Map => write!(f, "map"),
            Phase::Resolve => write!(f, "resolve"),
        }
    }
}

/// A progress reading for one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseProgress {
    pub phase: Phase,
    pub done: u64,
    pub total: u64,
    pub rate_per_second: f64,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
}

impl PhaseProgress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.done as f64 / self.total as f64
        }
    }
}

/// Receives progress from the engines.
pub trait StatusSink: Send + Sync {
    fn progress(&self, progress: &PhaseProgress) -> anyhow::Result<()>;

    fn message(&self, phase: Phase, message: &str);

    fn finish(&self, phase: Phase, message: &str);
}

/// Forwards every sample the estimator accepts to `sink`.
///
/// `total` is read at each sample so the denominator can be filled in after
/// the estimator is created.
pub fn attach(
    estimator: &mut RateEstimator,
    sink: Arc<dyn StatusSink>,
    phase: Phase,
    total: Arc<AtomicU64>,
) {
    estimator.set_observer(move |snapshot| {
        let total = total.load(Ordering::Relaxed);
        let fraction = if total == 0 {
            0.0
        } else {
            snapshot.value as f64 / total as f64
        };
        sink.progress(&PhaseProgress {
            phase,
            done: snapshot.value,
            total,
            rate_per_second: snapshot.rate_per_second,
            elapsed: snapshot.elapsed,
            eta: crate::stats::eta_from_elapsed(snapshot.elapsed, fraction),
        })
    });
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatus;

impl StatusSink for NullStatus {
    fn progress(&self, _: &PhaseProgress) -> anyhow::Result<()> {
        Ok(())
    }

    fn message(&self, _: Phase, _: &str) {}

    fn finish(&self, _: Phase, _: &str) {}
}

/// Progress as `info!` lines, at most one per phase per interval.
#[derive(Debug)]
pub struct LogStatus {
    interval: Duration,
    last: Mutex<[Option<Instant>; 2]>,
}

impl LogStatus {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new([None, None]),
        }
    }

    fn due(&self, phase: Phase) -> bool {
        let slot = match phase {
            Phase::Map => 0,
            Phase::Resolve => 1,
        };
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        match last[slot] {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                last[slot] = Some(now);
                true
            }
        }
    }
}

impl Default for LogStatus {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl StatusSink for LogStatus {
    fn progress(&self, progress: &PhaseProgress) -> anyhow::Result<()> {
        if self.due(progress.phase) {
            info!(
                "{}: {}/{} ({:.1}%) at {}, ETA {}",
                progress.phase,
                format_bytes(progress.done),
                format_bytes(progress.total),
                progress.fraction() * 100.0,
                format_speed(progress.rate_per_second),
                format_eta(progress.eta)
            );
        }
        Ok(())
    }

    fn message(&self, phase: Phase, message: &str) {
        info!("{}: {}", phase, message);
    }

    fn finish(&self, phase: Phase, message: &str) {
        info!("{} finished: {}", phase, message);
    }
}

/// Two byte bars, one per phase.
#[derive(Debug)]
pub struct ProgressBars {
    _multi: MultiProgress,
    map: ProgressBar,
    resolve: ProgressBar,
}

fn byte_bar(multi: &MultiProgress, prefix: &'static str) -> ProgressBar {
    let style = ProgressStyle::with_template(
        "{spinner:.cyan} {prefix:>8} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▓▒░ ");
    let bar = multi.add(ProgressBar::new(0));
    bar.set_style(style);
    bar.set_prefix(prefix);
    bar
}

impl ProgressBars {
    pub fn new() -> Self {
        let multi = MultiProgress::new();
        let map = byte_bar(&multi, "map");
        let resolve = byte_bar(&multi, "resolve");
        Self {
            _multi: multi,
            map,
            resolve,
        }
    }

    fn bar(&self, phase: Phase) -> &ProgressBar {
        match phase {
            Phase::Map => &self.map,
            Phase::Resolve => &self.resolve,
        }
    }
}

impl Default for ProgressBars {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSink for ProgressBars {
    fn progress(&self, progress: &PhaseProgress) -> anyhow::Result<()> {
        let bar = self.bar(progress.phase);
        bar.set_length(progress.total.max(progress.done));
        bar.set_position(progress.done);
        bar.set_message(format!(
            "| {} | ETA {}",
            format_speed(progress.rate_per_second),
            format_eta(progress.eta)
        ));
        Ok(())
    }

    fn message(&self, phase: Phase, message: &str) {
        self.bar(phase).set_message(format!("| {}", message));
    }

    fn finish(&self, phase: Phase, message: &str) {
        self.bar(phase).finish_with_message(format!("✅ {}", message));
    }
}
