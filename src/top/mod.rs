//! # Top-K Latency Rankings
//!
//! A [`Ranking`] keeps the `size` slowest observations of a window together
//! with a description of each (a query text, a request path). Descriptions
//! are produced by a closure that runs only when the observation actually
//! enters the ranking, so the fast path of an uninteresting call costs a
//! comparison.
//!
//! Retention mirrors the counters: with chunked retention each chunk keeps
//! its own top `size`, and a read merges the live chunks. The oldest chunk is
//! dropped as soon as it starts to expire; a ranking cannot be partially
//! weighted.

mod collector;

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use tracing::debug;

use self::collector::{Collector, Offer, Ranked};
use crate::cache::SnapshotCache;
use crate::clock::{Clock, SystemClock};
use crate::core::backoff::BackoffConfig;
use crate::core::recorder::Recorder;
use crate::core::ring::{ChunkRing, Weight};
use crate::error::{Error, Result};
use crate::retention::{Decay, Plan, Retention};

/// Largest accepted ranking size.
pub const MAX_RANKING_SIZE: usize = 4096;

/// Shortest accepted description length limit, in bytes.
pub const MIN_DESCRIPTION_LENGTH: usize = 10;

/// Description length limit used unless configured otherwise, in bytes.
pub const DEFAULT_DESCRIPTION_LENGTH: usize = 1000;

/// One ranked observation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Position {
    timestamp: u64,
    latency: Duration,
    description: String,
}

impl Position {
    /// Clock milliseconds at which the observation was recorded.
    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[inline]
    pub fn latency(&self) -> Duration {
        self.latency
    }

    #[inline]
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Cuts `text` to at most `max` bytes without splitting a character.
fn truncate_description(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

/// Builder for [`Ranking`].
#[derive(Debug, Clone)]
pub struct TopConfig {
    size: usize,
    retention: Retention,
    slow_threshold: Duration,
    max_description_length: usize,
    caching: Option<Duration>,
    backoff: BackoffConfig,
    clock: Option<Arc<dyn Clock>>,
}

impl TopConfig {
    /// A ranking of the `size` slowest observations, never reset, with no
    /// threshold.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            retention: Retention::Uniform,
            slow_threshold: Duration::ZERO,
            max_description_length: DEFAULT_DESCRIPTION_LENGTH,
            caching: None,
            backoff: BackoffConfig::default(),
            clock: None,
        }
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    /// Observations faster than `threshold` are ignored.
    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    /// Longer descriptions are truncated to `length` bytes.
    pub fn with_max_description_length(mut self, length: usize) -> Self {
        self.max_description_length = length;
        self
    }

    pub fn with_snapshot_caching(mut self, duration: Duration) -> Self {
        self.caching = Some(duration);
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

    pub fn build(self) -> Result<Ranking> {
        if self.size == 0 || self.size > MAX_RANKING_SIZE {
            return Err(Error::RankingSize {
                size: self.size,
                max: MAX_RANKING_SIZE,
            });
        }
        if self.max_description_length < MIN_DESCRIPTION_LENGTH {
            return Err(Error::DescriptionLength {
                length: self.max_description_length,
                min: MIN_DESCRIPTION_LENGTH,
            });
        }

        let plan = self.retention.plan(Decay::Smooth)?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let cache = self
            .caching
            .map(|ttl| SnapshotCache::new(ttl, Arc::clone(&clock)))
            .transpose()?;

        let size = self.size;
        let engine = match plan {
            Plan::Uniform => Engine::Uniform(Collector::new(size)),
            Plan::ResetOnSnapshot => {
                Engine::ResetOnSnapshot(Recorder::new(move || Collector::new(size), self.backoff))
            }
            Plan::Ring(layout) => Engine::Chunked(ChunkRing::new(
                layout,
                clock.now_millis(),
                move || Collector::new(size),
            )),
        };

        debug!(size, retention = ?self.retention, "ranking created");

        Ok(Ranking {
            engine,
            size,
            slow_threshold: self.slow_threshold,
            max_description_length: self.max_description_length,
            seq: CachePadded::new(AtomicU64::new(0)),
            clock,
            cache,
        })
    }
}

enum Engine {
    Uniform(Collector),
    ResetOnSnapshot(Recorder<Collector>),
    Chunked(ChunkRing<Collector>),
}

/// The slowest observations of a window.
///
/// Built through [`TopConfig`].
pub struct Ranking {
    engine: Engine,
    size: usize,
    slow_threshold: Duration,
    max_description_length: usize,
    seq: CachePadded<AtomicU64>,
    clock: Arc<dyn Clock>,
    cache: Option<SnapshotCache<[Position]>>,
}

impl Ranking {
    /// Offers an observation stamped with the current clock time.
    ///
    /// `describe` runs at most once, and only if the observation enters the
    /// ranking.
    #[inline]
    pub fn update(&self, latency: Duration, describe: impl FnOnce() -> String) {
        if latency < self.slow_threshold {
            return;
        }
        self.offer(self.clock.now_millis(), latency, describe);
    }

    /// Offers an observation that happened at `timestamp` clock millis.
    #[inline]
    pub fn update_at(&self, timestamp: u64, latency: Duration, describe: impl FnOnce() -> String) {
        if latency < self.slow_threshold {
            return;
        }
        self.offer(timestamp, latency, describe);
    }

    fn offer(&self, timestamp: u64, latency: Duration, describe: impl FnOnce() -> String) {
        let max = self.max_description_length;
        let offer = Offer {
            timestamp,
            latency,
            seq: self.seq.fetch_add(1, Relaxed),
            describe: move || truncate_description(describe(), max),
        };

        match &self.engine {
            Engine::Uniform(collector) => collector.offer(offer),
            Engine::ResetOnSnapshot(recorder) => recorder.record(|collector| collector.offer(offer)),
            Engine::Chunked(ring) => {
                let now = self.clock.now_millis();
                ring.update(now, |collector| collector.offer(offer));
            }
        }
    }

    /// The ranked observations, slowest first. Ties are ordered most recent
    /// first.
    pub fn descending_ranking(&self) -> Arc<[Position]> {
        match &self.cache {
            Some(cache) => cache.get_or_refresh(|| self.compute_ranking()),
            None => self.compute_ranking(),
        }
    }

    /// Configured ranking size.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    fn compute_ranking(&self) -> Arc<[Position]> {
        let mut ranked = Vec::new();

        match &self.engine {
            Engine::Uniform(collector) => collector.collect_into(&mut ranked),
            Engine::ResetOnSnapshot(recorder) => recorder.drain().collect_into(&mut ranked),
            Engine::Chunked(ring) => {
                let now = self.clock.now_millis();
                ranked = ring.fold(now, ranked, |mut ranked, collector, weight| {
                    if weight == Weight::Full {
                        collector.collect_into(&mut ranked);
                    }
                    ranked
                });
            }
        }

        merge(ranked, self.size)
    }
}

/// Keeps the `size` highest-ranked entries, highest first.
fn merge(mut ranked: Vec<Ranked>, size: usize) -> Arc<[Position]> {
    ranked.sort_unstable_by(|a, b| b.rank.cmp(&a.rank));
    ranked.truncate(size);
    ranked.into_iter().map(|r| r.position).collect()
}

impl std::fmt::Debug for Ranking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ranking")
            .field("size", &self.size)
            .field("slow_threshold", &self.slow_threshold)
            .field("max_description_length", &self.max_description_length)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use fake::faker::lorem::en::{Sentence, Word};
    use fake::Fake;
    use std::cell::Cell;
    use std::sync::Barrier;
    use std::thread;

    fn millis(ranking: &[Position]) -> Vec<u64> {
        ranking
            .iter()
            .map(|p| p.latency().as_millis() as u64)
            .collect()
    }

    fn record(ranking: &Ranking, values: &[u64]) {
        for &value in values {
            let word: String = Word().fake();
            ranking.update(Duration::from_millis(value), || word);
        }
    }

    fn chunked(size: usize, clock: &Arc<ManualClock>) -> Ranking {
        TopConfig::new(size)
            .with_retention(Retention::ResetPeriodicallyByChunks {
                rolling_window: Duration::from_secs(3),
                chunks: 3,
            })
            .with_clock(clock.clone())
            .build()
            .unwrap()
    }

    #[test]
    fn keeps_slowest_observations() {
        let ranking = TopConfig::new(2).build().unwrap();
        record(&ranking, &[5, 1, 9, 3]);
        assert_eq!(millis(&ranking.descending_ranking()), [9, 5]);

        record(&ranking, &[2]);
        assert_eq!(millis(&ranking.descending_ranking()), [9, 5]);
    }

    #[test]
    fn single_slot_ranking_keeps_maximum() {
        let ranking = TopConfig::new(1).build().unwrap();
        record(&ranking, &[5, 1, 9, 3]);
        assert_eq!(millis(&ranking.descending_ranking()), [9]);
    }

    #[test]
    fn threshold_filters_before_description() {
        let described = Cell::new(false);
        let ranking = TopConfig::new(3)
            .with_slow_threshold(Duration::from_millis(10))
            .build()
            .unwrap();

        ranking.update(Duration::from_millis(9), || {
            described.set(true);
            String::from("fast")
        });

        assert!(!described.get());
        assert!(ranking.descending_ranking().is_empty());
    }

    #[test]
    fn descriptions_are_truncated_on_char_boundary() {
        let ranking = TopConfig::new(1)
            .with_max_description_length(11)
            .build()
            .unwrap();

        // 'é' takes two bytes, so byte 11 falls inside the sixth one.
        ranking.update(Duration::from_millis(1), || "ééééééé".to_string());
        assert_eq!(ranking.descending_ranking()[0].description(), "ééééé");

        let sentence: String = Sentence(20..30).fake();
        let ranking = TopConfig::new(1)
            .with_max_description_length(MIN_DESCRIPTION_LENGTH)
            .build()
            .unwrap();
        ranking.update(Duration::from_millis(1), || sentence.clone());
        assert!(ranking.descending_ranking()[0].description().len() <= MIN_DESCRIPTION_LENGTH);
    }

    #[test]
    fn positions_carry_timestamp() {
        let clock = Arc::new(ManualClock::new(1_234));
        let ranking = TopConfig::new(2).with_clock(clock.clone()).build().unwrap();

        ranking.update(Duration::from_millis(5), || "now".into());
        ranking.update_at(99, Duration::from_millis(7), || "then".into());

        let positions = ranking.descending_ranking();
        assert_eq!(positions[0].timestamp(), 99);
        assert_eq!(positions[0].description(), "then");
        assert_eq!(positions[1].timestamp(), 1_234);
    }

    #[test]
    fn rejects_invalid_configuration() {
        assert!(matches!(
            TopConfig::new(0).build(),
            Err(Error::RankingSize { size: 0, .. })
        ));
        assert!(matches!(
            TopConfig::new(MAX_RANKING_SIZE + 1).build(),
            Err(Error::RankingSize { .. })
        ));
        assert!(matches!(
            TopConfig::new(3).with_max_description_length(9).build(),
            Err(Error::DescriptionLength { length: 9, .. })
        ));
        assert!(matches!(
            TopConfig::new(3)
                .with_retention(Retention::ResetPeriodically(Duration::from_millis(10)))
                .build(),
            Err(Error::ChunkTooShort { .. })
        ));
    }

    #[test]
    fn reset_on_snapshot_ranking_starts_over() {
        let ranking = TopConfig::new(3)
            .with_retention(Retention::ResetOnSnapshot)
            .build()
            .unwrap();

        record(&ranking, &[4, 8]);
        assert_eq!(millis(&ranking.descending_ranking()), [8, 4]);
        assert!(ranking.descending_ranking().is_empty());

        record(&ranking, &[1]);
        assert_eq!(millis(&ranking.descending_ranking()), [1]);
    }

    #[test]
    fn chunked_ranking_merges_live_chunks() {
        let clock = Arc::new(ManualClock::new(0));
        let ranking = chunked(2, &clock);

        record(&ranking, &[50]);
        clock.set_millis(1_000);
        record(&ranking, &[30, 40]);
        clock.set_millis(2_000);
        record(&ranking, &[10]);

        assert_eq!(millis(&ranking.descending_ranking()), [50, 40]);
    }

    #[test]
    fn chunked_ranking_drops_expiring_chunk_entirely() {
        let clock = Arc::new(ManualClock::new(0));
        let ranking = chunked(2, &clock);

        record(&ranking, &[50]);
        clock.set_millis(1_000);
        record(&ranking, &[30]);

        // The first chunk lives until 4000 and starts to fade after 3000.
        clock.set_millis(3_000);
        assert_eq!(millis(&ranking.descending_ranking()), [50, 30]);

        clock.set_millis(3_001);
        assert_eq!(millis(&ranking.descending_ranking()), [30]);
    }

    #[test]
    fn snapshot_cache_returns_same_ranking_within_interval() {
        let clock = Arc::new(ManualClock::new(0));
        let ranking = TopConfig::new(2)
            .with_snapshot_caching(Duration::from_millis(500))
            .with_clock(clock.clone())
            .build()
            .unwrap();

        record(&ranking, &[3]);
        let first = ranking.descending_ranking();
        record(&ranking, &[4]);
        assert!(Arc::ptr_eq(&first, &ranking.descending_ranking()));

        clock.advance_millis(500);
        assert_eq!(millis(&ranking.descending_ranking()), [4, 3]);
    }

    #[test]
    fn concurrent_updates_keep_global_top() {
        let ranking = TopConfig::new(4).build().unwrap();
        let threads = 4;
        let barrier = Barrier::new(threads);

        thread::scope(|s| {
            for t in 0..threads as u64 {
                let ranking = &ranking;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    for i in 0..500u64 {
                        let latency = Duration::from_micros(i * threads as u64 + t);
                        ranking.update(latency, || format!("{t}:{i}"));
                        if i % 50 == 0 {
                            assert!(ranking.descending_ranking().len() <= 4);
                        }
                    }
                });
            }
        });

        let top: Vec<u128> = ranking
            .descending_ranking()
            .iter()
            .map(|p| p.latency().as_micros())
            .collect();
        assert_eq!(top, [1_999, 1_998, 1_997, 1_996]);
    }
}
