//! Throughput and ETA estimation.
//!
//! A [`RateEstimator`] is fed a cumulative, non-decreasing value (bytes indexed,
//! bytes processed) and keeps two bounded sample rings: one with samples at
//! least a second apart, one with samples at least a minute apart. The rate is
//! taken across the second ring, so it reflects roughly the last minute.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// Maximum number of samples retained per ring.
pub const RING_CAPACITY: usize = 61;

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

/// One `(time, value)` observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub time: Instant,
    pub value: u64,
}

/// What an observer sees each time a new sample is accepted.
#[derive(Debug, Clone, Copy)]
pub struct RateSnapshot {
    pub value: u64,
    pub rate_per_second: f64,
    pub elapsed: Duration,
}

type Observer = Box<dyn Fn(&RateSnapshot) -> anyhow::Result<()> + Send + Sync>;

/// Sliding-window throughput estimator.
pub struct RateEstimator {
    start: Instant,
    seconds: VecDeque<Sample>,
    minutes: VecDeque<Sample>,
    observer: Option<Observer>,
}

impl std::fmt::Debug for RateEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateEstimator")
            .field("start", &self.start)
            .field("seconds", &self.seconds.len())
            .field("minutes", &self.minutes.len())
            .finish()
    }
}

impl RateEstimator {
    /// Starts an estimator now, with an initial sample of `initial`.
    pub fn new(initial: u64) -> Self {
        Self::starting_at(Instant::now(), initial)
    }

    /// Starts an estimator at an explicit instant.
    pub fn starting_at(start: Instant, initial: u64) -> Self {
        let first = Sample {
            time: start,
            value: initial,
        };
        Self {
            start,
            seconds: VecDeque::from([first]),
            minutes: VecDeque::from([first]),
            observer: None,
        }
    }

    /// Registers a callback invoked whenever a sample enters the second ring.
    ///
    /// Observer errors are logged at debug level and otherwise ignored.
    pub fn set_observer<F>(&mut self, observer: F)
    where
        F: Fn(&RateSnapshot) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.observer = Some(Box::new(observer));
    }

    /// Records a cumulative value at the current time.
    pub fn record(&mut self, value: u64) -> bool {
        self.record_at(value, Instant::now())
    }

    /// Records a cumulative value at `time`. Returns whether the sample was kept.
    ///
    /// Values below the newest sample are ignored, as are samples less than a
    /// second after the newest one.
    pub fn record_at(&mut self, value: u64, time: Instant) -> bool {
        let newest = self.newest();
        if value < newest.value || time < newest.time + SECOND {
            return false;
        }
        let sample = Sample { time, value };

        self.seconds.push_front(sample);
        self.seconds.truncate(RING_CAPACITY);

        let minute_head = self.minutes.front().map(|s| s.time).unwrap_or(self.start);
        if time >= minute_head + MINUTE {
            self.minutes.push_front(sample);
            self.minutes.truncate(RING_CAPACITY);
        }

        self.notify(sample);
        true
    }

    fn notify(&self, sample: Sample) {
        if let Some(observer) = &self.observer {
            let snapshot = RateSnapshot {
                value: sample.value,
                rate_per_second: self.current_rate_per_second(),
                elapsed: sample.time.saturating_duration_since(self.start),
            };
            if let Err(e) = observer(&snapshot) {
                debug!("Status observer failed: {:#}", e);
            }
        }
    }

    fn newest(&self) -> Sample {
        self.seconds.front().copied().unwrap_or(Sample {
            time: self.start,
            value: 0,
        })
    }

    /// Value of the newest accepted sample.
    pub fn value(&self) -> u64 {
        self.newest().value
    }

    /// Throughput across the second ring, in units per second.
    pub fn current_rate_per_second(&self) -> f64 {
        let (Some(newest), Some(oldest)) = (self.seconds.front(), self.seconds.back()) else {
            return 0.0;
        };
        if self.seconds.len() < 2 {
            return 0.0;
        }
        let span_ms = newest.time.duration_since(oldest.time).as_millis() as f64;
        if span_ms == 0.0 {
            return 0.0;
        }
        let delta = (newest.value - oldest.value) as f64;
        delta * 60_000.0 / span_ms / 60.0
    }

    /// Throughput across the minute ring, for long-running averages.
    pub fn long_rate_per_second(&self) -> f64 {
        let (Some(newest), Some(oldest)) = (self.minutes.front(), self.minutes.back()) else {
            return 0.0;
        };
        let span = newest.time.duration_since(oldest.time).as_secs_f64();
        if self.minutes.len() < 2 || span == 0.0 {
            return 0.0;
        }
        (newest.value - oldest.value) as f64 / span
    }

    /// Time since the estimator started.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Estimated time left for `progress` (0.0..=1.0), measured from now.
    pub fn estimated_time_remaining(&self, progress: f64) -> Option<Duration> {
        self.estimated_time_remaining_at(progress, Instant::now())
    }

    pub fn estimated_time_remaining_at(&self, progress: f64, now: Instant) -> Option<Duration> {
        eta_from_elapsed(now.saturating_duration_since(self.start), progress)
    }

    /// Number of samples in the (second, minute) rings.
    pub fn ring_lengths(&self) -> (usize, usize) {
        (self.seconds.len(), self.minutes.len())
    }
}

/// `elapsed / progress - elapsed`, or `None` when progress is zero or invalid.
pub fn eta_from_elapsed(elapsed: Duration, progress: f64) -> Option<Duration> {
    if progress.is_nan() || progress <= 0.0 || progress.is_infinite() {
        return None;
    }
    let progress = progress.min(1.0);
    let elapsed_ms = elapsed.as_millis() as f64;
    let remaining = elapsed_ms / progress - elapsed_ms;
    Some(Duration::from_millis(remaining.max(0.0).round() as u64))
}

/// Renders the ETA for display, `"unknown"` when it can't be estimated.
pub fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        Some(eta) => human_duration(eta),
        None => "unknown".to_string(),
    }
}

/// Renders a duration using its two largest non-zero units.
///
/// Units are days, hours, minutes, seconds and milliseconds.
pub fn human_duration(duration: Duration) -> String {
    const UNITS: &[(&str, &str, u128)] = &[
        ("day", "days", 24 * 60 * 60 * 1000),
        ("hour", "hours", 60 * 60 * 1000),
        ("min", "min", 60 * 1000),
        ("sec", "sec", 1000),
        ("ms", "ms", 1),
    ];

    let mut left = duration.as_millis();
    let mut parts = Vec::with_capacity(2);
    for &(singular, plural, unit_ms) in UNITS {
        if parts.len() == 2 {
            break;
        }
        if left >= unit_ms {
            let whole = left / unit_ms;
            left -= whole * unit_ms;
            let name = if whole == 1 { singular } else { plural };
            parts.push(format!("{} {}", whole, name));
        }
    }

    if parts.is_empty() {
        "0 ms".to_string()
    } else {
        parts.join(" ")
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second.max(0.0) as u64))
}
