//! # Rolling Latency Histograms
//!
//! A [`RollingHistogram`] records `u64` observations (typically latencies in
//! some fixed unit) and summarises recent ones as a [`HistogramSnapshot`].
//! Bucket math is delegated to [`hdrhistogram`]; this module supplies the
//! concurrency and the retention.
//!
//! ## Retention
//! - [`Retention::Uniform`]: everything ever recorded.
//! - [`Retention::ResetOnSnapshot`]: everything since the previous snapshot.
//! - [`Retention::ResetPeriodically`]: the current period.
//! - [`Retention::ResetPeriodicallyByChunks`]: the last `chunks` chunks of
//!   the rolling window. Chunks count in full until they expire, so the
//!   covered span moves between `rolling_window - chunk` and `rolling_window`.
//!
//! ## History
//! With [`HistogramConfig::with_history_chunks`], each chunk that rotates out
//! of the window is archived for `history_chunks` more chunk durations. The
//! effective window therefore becomes roughly
//! `rolling_window * (1 + history_chunks / chunks)`.
//!
//! ## Concurrency
//! Recording never waits for a snapshot. Writers take a per-stripe lock
//! that only other writers mapped to the same stripe contend on. Snapshots
//! are serialized among themselves.

mod chunked;
mod history;
mod snapshot;
mod striped;

use std::sync::Arc;
use std::time::Duration;

use hdrhistogram::Histogram;
use smallvec::SmallVec;
use tracing::debug;

use self::chunked::{ChunkedEngine, HistogramShape, ResetOnSnapshotEngine, UniformEngine};
use self::snapshot::{Percentiles, SnapshotKind};
use crate::cache::SnapshotCache;
use crate::clock::{Clock, SystemClock};
use crate::core::backoff::BackoffConfig;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::retention::{Decay, Plan, Retention, MAX_HISTORY_CHUNKS};

pub use self::snapshot::{
    FullSnapshot, HistogramSnapshot, SmartSnapshot, Summary, DEFAULT_PERCENTILES,
};
pub use self::striped::DEFAULT_STRIPES;

/// Default number of significant decimal digits kept by every bucket.
pub const DEFAULT_SIGNIFICANT_DIGITS: u8 = 2;

/// What to do with a value above the highest trackable value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the value.
    #[default]
    Skip,
    /// Record the value as is; the histogram grows to fit it.
    PassThru,
    /// Record the highest trackable value instead.
    ReduceToHighestTrackable,
}

/// Builder for [`RollingHistogram`].
///
/// ```
/// use std::time::Duration;
/// use rolling_aggregates::{HistogramConfig, Retention};
///
/// let histogram = HistogramConfig::new()
///     .with_retention(Retention::ResetPeriodicallyByChunks {
///         rolling_window: Duration::from_secs(60),
///         chunks: 6,
///     })
///     .with_predefined_percentiles(&[0.5, 0.99])
///     .build()
///     .unwrap();
///
/// histogram.update(42);
/// assert_eq!(histogram.snapshot().count(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct HistogramConfig {
    retention: Retention,
    history_chunks: usize,
    lowest_discernible_value: u64,
    highest_trackable_value: Option<(u64, OverflowPolicy)>,
    significant_digits: u8,
    expected_interval: Option<u64>,
    snapshot: SnapshotKind,
    caching: Option<Duration>,
    stripes: usize,
    backoff: BackoffConfig,
    clock: Option<Arc<dyn Clock>>,
    executor: Option<Arc<dyn Executor>>,
}

impl Default for HistogramConfig {
    fn default() -> Self {
        Self {
            retention: Retention::Uniform,
            history_chunks: 0,
            lowest_discernible_value: 1,
            highest_trackable_value: None,
            significant_digits: DEFAULT_SIGNIFICANT_DIGITS,
            expected_interval: None,
            snapshot: SnapshotKind::Smart(DEFAULT_PERCENTILES.iter().copied().collect()),
            caching: None,
            stripes: DEFAULT_STRIPES,
            backoff: BackoffConfig::default(),
            clock: None,
            executor: None,
        }
    }
}

impl HistogramConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    /// Archives each retired chunk for `history_chunks` more chunk durations.
    /// Only valid with [`Retention::ResetPeriodicallyByChunks`].
    pub fn with_history_chunks(mut self, history_chunks: usize) -> Self {
        self.history_chunks = history_chunks;
        self
    }

    pub fn with_lowest_discernible_value(mut self, value: u64) -> Self {
        self.lowest_discernible_value = value;
        self
    }

    /// Values above `value` are handled according to `policy`.
    pub fn with_highest_trackable_value(mut self, value: u64, policy: OverflowPolicy) -> Self {
        self.highest_trackable_value = Some((value, policy));
        self
    }

    /// Decimal digits of precision, `0..=5`.
    pub fn with_significant_digits(mut self, digits: u8) -> Self {
        self.significant_digits = digits;
        self
    }

    /// Back-fills samples missed by a recorder that stalled for longer than
    /// `interval` (coordinated omission correction).
    pub fn with_expected_interval_between_samples(mut self, interval: u64) -> Self {
        self.expected_interval = Some(interval);
        self
    }

    /// Snapshots keep only these percentiles plus the summary statistics.
    pub fn with_predefined_percentiles(mut self, percentiles: &[f64]) -> Self {
        self.snapshot = SnapshotKind::Smart(percentiles.iter().copied().collect());
        self
    }

    /// Snapshots keep every distinct value.
    pub fn with_full_snapshots(mut self) -> Self {
        self.snapshot = SnapshotKind::Full;
        self
    }

    /// Reuses a snapshot for `duration` before computing a new one.
    pub fn with_snapshot_caching(mut self, duration: Duration) -> Self {
        self.caching = Some(duration);
        self
    }

    /// Writer-side stripes per buffer, rounded up to a power of two.
    pub fn with_stripes(mut self, stripes: usize) -> Self {
        self.stripes = stripes;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Moves archiving of retired chunks off the writer that rotated them.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> Result<RollingHistogram> {
        let plan = self.retention.plan(Decay::Discrete)?;

        if self.history_chunks > 0 {
            if self.retention.chunks().is_none() {
                return Err(Error::HistoryWithoutChunks);
            }
            if self.history_chunks > MAX_HISTORY_CHUNKS {
                return Err(Error::HistoryTooLong {
                    history: self.history_chunks,
                    max: MAX_HISTORY_CHUNKS,
                });
            }
        }

        if self.expected_interval == Some(0) {
            return Err(Error::NonPositiveDuration {
                name: "expected interval between samples",
            });
        }

        let prototype = self.prototype()?;
        let snapshot = match self.snapshot {
            SnapshotKind::Full => SnapshotKind::Full,
            SnapshotKind::Smart(percentiles) => SnapshotKind::Smart(checked_percentiles(percentiles)?),
        };

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let cache = self
            .caching
            .map(|ttl| SnapshotCache::new(ttl, Arc::clone(&clock)))
            .transpose()?;

        let shape = HistogramShape {
            prototype,
            stripes: self.stripes,
            expected_interval: self.expected_interval,
            backoff: self.backoff,
        };

        let engine = match plan {
            Plan::Uniform => Engine::Uniform(UniformEngine::new(&shape)),
            Plan::ResetOnSnapshot => Engine::ResetOnSnapshot(ResetOnSnapshotEngine::new(&shape)),
            Plan::Ring(layout) => Engine::Chunked(ChunkedEngine::new(
                &shape,
                layout,
                self.history_chunks,
                self.executor,
                clock,
            )),
        };

        debug!(
            retention = ?self.retention,
            history_chunks = self.history_chunks,
            "histogram created"
        );

        Ok(RollingHistogram {
            engine,
            overflow: self.highest_trackable_value,
            snapshot,
            cache,
        })
    }

    fn prototype(&self) -> Result<Histogram<u64>> {
        let low = self.lowest_discernible_value;
        let high = match self.highest_trackable_value {
            Some((high, _)) => high,
            None => low.saturating_mul(2),
        };

        let mut prototype = Histogram::new_with_bounds(low, high, self.significant_digits)?;
        prototype.auto(true);
        Ok(prototype)
    }
}

/// Sorts and deduplicates, rejecting empty lists and values outside `[0, 1]`.
fn checked_percentiles(mut percentiles: Percentiles) -> Result<Percentiles> {
    if percentiles.is_empty() {
        return Err(Error::EmptyPercentiles);
    }

    if let Some(&invalid) = percentiles
        .iter()
        .find(|p| !p.is_finite() || !(0.0..=1.0).contains(*p))
    {
        return Err(Error::InvalidPercentile(invalid));
    }

    percentiles.sort_by(f64::total_cmp);
    percentiles.dedup();
    Ok(percentiles)
}

#[derive(Debug)]
enum Engine {
    Uniform(UniformEngine),
    ResetOnSnapshot(ResetOnSnapshotEngine),
    Chunked(ChunkedEngine),
}

/// A concurrent histogram over a window of recent observations.
///
/// Built through [`HistogramConfig`].
#[derive(Debug)]
pub struct RollingHistogram {
    engine: Engine,
    overflow: Option<(u64, OverflowPolicy)>,
    snapshot: SnapshotKind,
    cache: Option<SnapshotCache<HistogramSnapshot>>,
}

impl RollingHistogram {
    /// Records one observation.
    ///
    /// # Concurrency
    /// Safe to call from any number of threads; never waits for a snapshot.
    #[inline]
    pub fn update(&self, value: u64) {
        let value = match self.overflow {
            Some((highest, policy)) if value > highest => match policy {
                OverflowPolicy::Skip => return,
                OverflowPolicy::PassThru => value,
                OverflowPolicy::ReduceToHighestTrackable => highest,
            },
            _ => value,
        };

        match &self.engine {
            Engine::Uniform(engine) => engine.record(value),
            Engine::ResetOnSnapshot(engine) => engine.record(value),
            Engine::Chunked(engine) => engine.record(value),
        }
    }

    /// Records a duration as whole nanoseconds, saturating at `u64::MAX`.
    #[inline]
    pub fn update_duration(&self, duration: Duration) {
        self.update(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX));
    }

    /// Summarises the current window.
    ///
    /// With snapshot caching enabled, calls within the caching duration
    /// return the same `Arc`.
    pub fn snapshot(&self) -> Arc<HistogramSnapshot> {
        match &self.cache {
            Some(cache) => cache.get_or_refresh(|| self.compute_snapshot()),
            None => self.compute_snapshot(),
        }
    }

    /// Discards everything recorded so far, including archived history.
    ///
    /// Safe to call while other threads record; their concurrent updates
    /// may or may not survive the reset.
    pub fn reset(&self) {
        match &self.engine {
            Engine::Uniform(engine) => engine.reset(),
            Engine::ResetOnSnapshot(engine) => engine.reset(),
            Engine::Chunked(engine) => engine.reset(),
        }

        if let Some(cache) = &self.cache {
            cache.invalidate();
        }
    }

    fn compute_snapshot(&self) -> Arc<HistogramSnapshot> {
        let snapshot = match &self.engine {
            Engine::Uniform(engine) => engine.snapshot(&self.snapshot),
            Engine::ResetOnSnapshot(engine) => engine.snapshot(&self.snapshot),
            Engine::Chunked(engine) => engine.snapshot(&self.snapshot),
        };
        Arc::new(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::executor::BackgroundExecutor;
    use std::sync::Barrier;
    use std::thread;

    fn overflowing(policy: OverflowPolicy) -> RollingHistogram {
        HistogramConfig::new()
            .with_highest_trackable_value(100, policy)
            .with_full_snapshots()
            .build()
            .unwrap()
    }

    #[test]
    fn overflow_skip_drops_value() {
        let histogram = overflowing(OverflowPolicy::Skip);
        histogram.update(101);

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.count(), 0);
        assert_eq!(snapshot.max(), 0);
    }

    #[test]
    fn overflow_reduce_records_highest_trackable() {
        let histogram = overflowing(OverflowPolicy::ReduceToHighestTrackable);
        histogram.update(101);
        assert_eq!(histogram.snapshot().max(), 100);
    }

    #[test]
    fn overflow_pass_thru_records_value() {
        let histogram = overflowing(OverflowPolicy::PassThru);
        histogram.update(101);
        assert_eq!(histogram.snapshot().max(), 101);
    }

    #[test]
    fn rejects_invalid_configuration() {
        let by_chunks = Retention::ResetPeriodicallyByChunks {
            rolling_window: Duration::from_secs(10),
            chunks: 10,
        };

        assert!(matches!(
            HistogramConfig::new().with_history_chunks(3).build(),
            Err(Error::HistoryWithoutChunks)
        ));
        assert!(matches!(
            HistogramConfig::new()
                .with_retention(by_chunks)
                .with_history_chunks(MAX_HISTORY_CHUNKS + 1)
                .build(),
            Err(Error::HistoryTooLong { .. })
        ));
        assert!(matches!(
            HistogramConfig::new().with_predefined_percentiles(&[]).build(),
            Err(Error::EmptyPercentiles)
        ));
        assert!(matches!(
            HistogramConfig::new().with_predefined_percentiles(&[0.5, 1.5]).build(),
            Err(Error::InvalidPercentile(p)) if p == 1.5
        ));
        assert!(matches!(
            HistogramConfig::new().with_predefined_percentiles(&[f64::NAN]).build(),
            Err(Error::InvalidPercentile(_))
        ));
        assert!(matches!(
            HistogramConfig::new().with_significant_digits(6).build(),
            Err(Error::Histogram(_))
        ));
        assert!(matches!(
            HistogramConfig::new().with_expected_interval_between_samples(0).build(),
            Err(Error::NonPositiveDuration { .. })
        ));
        assert!(matches!(
            HistogramConfig::new().with_snapshot_caching(Duration::ZERO).build(),
            Err(Error::NonPositiveDuration { .. })
        ));
    }

    #[test]
    fn predefined_percentiles_are_sorted_and_deduplicated() {
        let histogram = HistogramConfig::new()
            .with_predefined_percentiles(&[0.9, 0.5, 0.9])
            .build()
            .unwrap();
        for value in 1..=100 {
            histogram.update(value);
        }

        let snapshot = histogram.snapshot();
        let HistogramSnapshot::Smart(smart) = &*snapshot else {
            panic!("expected a smart snapshot");
        };
        assert_eq!(smart.percentiles().count(), 2);
        assert_eq!(snapshot.value_at_quantile(0.7), 90);
        assert_eq!(snapshot.value_at_quantile(0.95), 100);
    }

    #[test]
    fn snapshot_cache_returns_same_snapshot_within_interval() {
        let clock = Arc::new(ManualClock::new(0));
        let histogram = HistogramConfig::new()
            .with_snapshot_caching(Duration::from_secs(1))
            .with_clock(clock.clone())
            .build()
            .unwrap();

        histogram.update(1);
        let first = histogram.snapshot();
        histogram.update(2);
        assert!(Arc::ptr_eq(&first, &histogram.snapshot()));

        clock.advance(Duration::from_secs(1));
        let refreshed = histogram.snapshot();
        assert!(!Arc::ptr_eq(&first, &refreshed));
        assert_eq!(refreshed.count(), 2);
    }

    #[test]
    fn repeated_snapshots_without_writes_are_equal() {
        let clock = Arc::new(ManualClock::new(0));
        let histogram = HistogramConfig::new()
            .with_retention(Retention::ResetPeriodicallyByChunks {
                rolling_window: Duration::from_secs(3),
                chunks: 3,
            })
            .with_clock(clock.clone())
            .build()
            .unwrap();

        for value in [3, 1, 4, 1, 5, 9, 2, 6] {
            histogram.update(value);
            clock.advance_millis(200);
        }

        assert_eq!(histogram.snapshot(), histogram.snapshot());
    }

    #[test]
    fn periodic_histogram_resets_at_period_boundary() {
        let clock = Arc::new(ManualClock::new(0));
        let histogram = HistogramConfig::new()
            .with_retention(Retention::ResetPeriodically(Duration::from_secs(1)))
            .with_clock(clock.clone())
            .build()
            .unwrap();

        histogram.update(10);
        clock.set_millis(999);
        assert_eq!(histogram.snapshot().count(), 1);

        clock.set_millis(1_000);
        assert_eq!(histogram.snapshot().count(), 0);
    }

    #[test]
    fn background_executor_archives_history() {
        let clock = Arc::new(ManualClock::new(0));
        let executor = Arc::new(BackgroundExecutor::new("histogram-history").unwrap());
        let histogram = HistogramConfig::new()
            .with_retention(Retention::ResetPeriodicallyByChunks {
                rolling_window: Duration::from_secs(2),
                chunks: 2,
            })
            .with_history_chunks(2)
            .with_executor(executor)
            .with_clock(clock.clone())
            .build()
            .unwrap();

        histogram.update(10);
        clock.set_millis(2_000);
        histogram.update(20);

        // Whether or not the worker got there first, the read folds the rest.
        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.count(), 2);
        assert_eq!(snapshot.min(), 10);
    }

    #[test]
    fn reset_discards_recorded_values() {
        let clock = Arc::new(ManualClock::new(0));
        let histogram = HistogramConfig::new()
            .with_snapshot_caching(Duration::from_secs(10))
            .with_clock(clock)
            .build()
            .unwrap();

        histogram.update(5);
        assert_eq!(histogram.snapshot().count(), 1);

        histogram.reset();
        assert_eq!(histogram.snapshot().count(), 0);

        histogram.update(6);
        histogram.reset();
        histogram.update(7);
        histogram.reset();
        assert_eq!(histogram.snapshot().count(), 0);
    }

    #[test]
    fn duration_updates_record_nanoseconds() {
        let histogram = HistogramConfig::new()
            .with_significant_digits(3)
            .with_full_snapshots()
            .build()
            .unwrap();
        histogram.update_duration(Duration::from_micros(1));
        assert_eq!(histogram.snapshot().max(), 1_000);
    }

    #[test]
    fn concurrent_writers_with_reader_lose_nothing() {
        let histogram = HistogramConfig::new().build().unwrap();
        let threads = 8;
        let per_thread = 5_000u64;
        let barrier = Barrier::new(threads + 1);
        let mut seen = 0;

        thread::scope(|s| {
            for _ in 0..threads {
                s.spawn(|| {
                    barrier.wait();
                    for value in 1..=per_thread {
                        histogram.update(value);
                    }
                });
            }

            barrier.wait();
            for _ in 0..100 {
                seen = histogram.snapshot().count();
            }
        });

        assert!(seen <= threads as u64 * per_thread);
        assert_eq!(histogram.snapshot().count(), threads as u64 * per_thread);
    }
}
