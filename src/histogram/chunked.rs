//! Histogram engines, one per retention plan.
//!
//! Every engine records through a [`Recorder`] of striped histograms, so
//! writers never wait on a reader. The engines differ only in what a read
//! folds together:
//!
//! - [`UniformEngine`] drains into a running total that is never reset;
//! - [`ResetOnSnapshotEngine`] drains into an emptied scratch histogram;
//! - [`ChunkedEngine`] keeps a discrete [`ChunkRing`] of chunks, each with its
//!   own recorder and accumulated total, plus an optional [`History`].

use std::fmt;
use std::sync::Arc;

use hdrhistogram::Histogram;
use parking_lot::Mutex;

use super::history::History;
use super::snapshot::{HistogramSnapshot, SnapshotKind};
use super::striped::StripedHistogram;
use crate::clock::Clock;
use crate::core::backoff::BackoffConfig;
use crate::core::recorder::Recorder;
use crate::core::ring::{ChunkRing, RingLayout};
use crate::executor::Executor;

/// What every histogram buffer of one rolling histogram looks like.
#[derive(Debug, Clone)]
pub(crate) struct HistogramShape {
    /// Empty, auto-resizing histogram with the configured bounds.
    pub(crate) prototype: Histogram<u64>,
    pub(crate) stripes: usize,
    pub(crate) expected_interval: Option<u64>,
    pub(crate) backoff: BackoffConfig,
}

impl HistogramShape {
    fn recorder(&self) -> Recorder<StripedHistogram> {
        let prototype = self.prototype.clone();
        let stripes = self.stripes;
        Recorder::new(
            move || StripedHistogram::new(&prototype, stripes),
            self.backoff,
        )
    }

    #[inline]
    fn empty(&self) -> Histogram<u64> {
        self.prototype.clone()
    }
}

#[inline]
fn record_into(recorder: &Recorder<StripedHistogram>, value: u64, expected_interval: Option<u64>) {
    recorder.record(|buffer| buffer.record(value, expected_interval));
}

/// Never forgets.
#[derive(Debug)]
pub(crate) struct UniformEngine {
    recorder: Recorder<StripedHistogram>,
    total: Mutex<Histogram<u64>>,
    expected_interval: Option<u64>,
}

impl UniformEngine {
    pub(crate) fn new(shape: &HistogramShape) -> Self {
        Self {
            recorder: shape.recorder(),
            total: Mutex::new(shape.empty()),
            expected_interval: shape.expected_interval,
        }
    }

    #[inline]
    pub(crate) fn record(&self, value: u64) {
        record_into(&self.recorder, value, self.expected_interval);
    }

    pub(crate) fn snapshot(&self, kind: &SnapshotKind) -> HistogramSnapshot {
        let mut total = self.total.lock();
        self.recorder.drain().drain_into(&mut total);
        HistogramSnapshot::capture(&total, kind)
    }

    pub(crate) fn reset(&self) {
        let mut total = self.total.lock();
        self.recorder.reset();
        total.reset();
    }
}

/// Forgets on every read.
#[derive(Debug)]
pub(crate) struct ResetOnSnapshotEngine {
    recorder: Recorder<StripedHistogram>,
    scratch: Mutex<Histogram<u64>>,
    expected_interval: Option<u64>,
}

impl ResetOnSnapshotEngine {
    pub(crate) fn new(shape: &HistogramShape) -> Self {
        Self {
            recorder: shape.recorder(),
            scratch: Mutex::new(shape.empty()),
            expected_interval: shape.expected_interval,
        }
    }

    #[inline]
    pub(crate) fn record(&self, value: u64) {
        record_into(&self.recorder, value, self.expected_interval);
    }

    pub(crate) fn snapshot(&self, kind: &SnapshotKind) -> HistogramSnapshot {
        let mut scratch = self.scratch.lock();
        scratch.reset();
        self.recorder.drain().drain_into(&mut scratch);
        HistogramSnapshot::capture(&scratch, kind)
    }

    pub(crate) fn reset(&self) {
        let _scratch = self.scratch.lock();
        self.recorder.reset();
    }
}

/// One slice of the rolling window.
pub(crate) struct HistogramChunk {
    recorder: Recorder<StripedHistogram>,
    /// Everything drained from `recorder` so far.
    accumulated: Mutex<Histogram<u64>>,
    expected_interval: Option<u64>,
}

impl HistogramChunk {
    pub(crate) fn new(shape: &HistogramShape) -> Self {
        Self {
            recorder: shape.recorder(),
            accumulated: Mutex::new(shape.empty()),
            expected_interval: shape.expected_interval,
        }
    }

    #[inline]
    pub(crate) fn record(&self, value: u64) {
        record_into(&self.recorder, value, self.expected_interval);
    }

    /// Adds everything recorded into this chunk to `target`.
    pub(crate) fn add_into(&self, target: &mut Histogram<u64>) {
        let mut accumulated = self.accumulated.lock();
        self.recorder.drain().drain_into(&mut accumulated);
        // Targets auto-resize.
        let _ = target.add(&*accumulated);
    }

    /// Moves outstanding writes into the accumulated total.
    pub(crate) fn settle(&self) {
        let mut accumulated = self.accumulated.lock();
        self.recorder.drain().drain_into(&mut accumulated);
    }
}

impl fmt::Debug for HistogramChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistogramChunk")
            .field("accumulated", &self.accumulated.lock().len())
            .finish_non_exhaustive()
    }
}

/// Forgets one chunk at a time, or the whole period at once for a
/// single-slot layout.
///
/// Lock order: `scratch`, then the history archive, then one chunk's
/// `accumulated` at a time. Reads release each ring chunk before touching
/// the archive.
pub(crate) struct ChunkedEngine {
    ring: ChunkRing<Arc<HistogramChunk>>,
    history: Option<Arc<History>>,
    executor: Option<Arc<dyn Executor>>,
    clock: Arc<dyn Clock>,
    scratch: Mutex<Histogram<u64>>,
}

impl ChunkedEngine {
    pub(crate) fn new(
        shape: &HistogramShape,
        layout: RingLayout,
        history_chunks: usize,
        executor: Option<Arc<dyn Executor>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let factory_shape = shape.clone();
        let ring = ChunkRing::new(layout, clock.now_millis(), move || {
            Arc::new(HistogramChunk::new(&factory_shape))
        });

        let history = (history_chunks > 0)
            .then(|| Arc::new(History::new(history_chunks, layout.chunk_millis())));

        Self {
            ring,
            history,
            executor,
            clock,
            scratch: Mutex::new(shape.empty()),
        }
    }

    pub(crate) fn record(&self, value: u64) {
        let now = self.clock.now_millis();
        self.ring.update_with(
            now,
            |retired| self.archive(retired.value(), retired.invalidates_at()),
            |chunk| chunk.record(value),
        );
    }

    /// Runs on the writer whose CAS retired `chunk`.
    fn archive(&self, chunk: &Arc<HistogramChunk>, retired_at: u64) {
        let Some(history) = &self.history else {
            return;
        };

        history.retire(Arc::clone(chunk), retired_at);

        match &self.executor {
            Some(executor) if !history.is_backlogged() => {
                let history = Arc::clone(history);
                executor.execute(Box::new(move || history.fold_pending()));
            }
            // No executor, or it is not keeping up: fold here.
            _ => history.fold_pending(),
        }
    }

    pub(crate) fn snapshot(&self, kind: &SnapshotKind) -> HistogramSnapshot {
        let mut scratch = self.scratch.lock();
        scratch.reset();

        let now = self.clock.now_millis();
        if self.history.is_some() {
            // A chunk whose slot sees no writes would otherwise never reach
            // the archive.
            self.ring.retire_expired(now, |retired| {
                self.archive(retired.value(), retired.invalidates_at())
            });
        }

        self.ring.fold(now, (), |(), chunk, _| chunk.add_into(&mut scratch));

        if let Some(history) = &self.history {
            history.add_live_into(now, &mut scratch);
        }

        HistogramSnapshot::capture(&scratch, kind)
    }

    /// Drops every chunk in the ring, expired or not, and the archive.
    pub(crate) fn reset(&self) {
        let _scratch = self.scratch.lock();

        self.ring.clear();

        if let Some(history) = &self.history {
            history.clear();
        }
    }
}

impl fmt::Debug for ChunkedEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedEngine")
            .field("ring", &self.ring)
            .field("history", &self.history.is_some())
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::executor::InlineExecutor;

    fn shape() -> HistogramShape {
        let mut prototype = Histogram::new_with_bounds(1, 2, 3).unwrap();
        prototype.auto(true);
        HistogramShape {
            prototype,
            stripes: 4,
            expected_interval: None,
            backoff: BackoffConfig::default(),
        }
    }

    fn chunked(
        chunks: usize,
        history: usize,
        executor: Option<Arc<dyn Executor>>,
        clock: &Arc<ManualClock>,
    ) -> ChunkedEngine {
        ChunkedEngine::new(
            &shape(),
            RingLayout::discrete(1_000, chunks),
            history,
            executor,
            clock.clone(),
        )
    }

    #[test]
    fn uniform_engine_accumulates_across_reads() {
        let engine = UniformEngine::new(&shape());
        engine.record(5);
        assert_eq!(engine.snapshot(&SnapshotKind::Full).count(), 1);

        engine.record(6);
        let snapshot = engine.snapshot(&SnapshotKind::Full);
        assert_eq!(snapshot.count(), 2);
        assert_eq!(snapshot.max(), 6);
    }

    #[test]
    fn reset_on_snapshot_engine_forgets_after_read() {
        let engine = ResetOnSnapshotEngine::new(&shape());
        engine.record(5);
        engine.record(6);
        assert_eq!(engine.snapshot(&SnapshotKind::Full).count(), 2);
        assert_eq!(engine.snapshot(&SnapshotKind::Full).count(), 0);
    }

    #[test]
    fn chunked_engine_keeps_chunk_until_it_expires() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = chunked(3, 0, None, &clock);

        engine.record(10);
        clock.set_millis(1_500);
        engine.record(20);

        // Repeated reads must not lose what earlier reads drained.
        assert_eq!(engine.snapshot(&SnapshotKind::Full).count(), 2);
        assert_eq!(engine.snapshot(&SnapshotKind::Full).count(), 2);

        clock.set_millis(2_999);
        assert_eq!(engine.snapshot(&SnapshotKind::Full).count(), 2);

        clock.set_millis(3_000);
        let snapshot = engine.snapshot(&SnapshotKind::Full);
        assert_eq!(snapshot.count(), 1);
        assert_eq!(snapshot.min(), 20);

        clock.set_millis(4_000);
        assert_eq!(engine.snapshot(&SnapshotKind::Full).count(), 0);
    }

    #[test]
    fn reset_empties_every_engine() {
        let uniform = UniformEngine::new(&shape());
        uniform.record(1);
        uniform.snapshot(&SnapshotKind::Full);
        uniform.record(2);
        uniform.reset();
        assert_eq!(uniform.snapshot(&SnapshotKind::Full).count(), 0);

        let clock = Arc::new(ManualClock::new(0));
        let engine = chunked(2, 1, None, &clock);
        engine.record(1);
        clock.set_millis(2_000);
        engine.record(2);
        engine.reset();
        assert_eq!(engine.snapshot(&SnapshotKind::Full).count(), 0);

        engine.record(3);
        assert_eq!(engine.snapshot(&SnapshotKind::Full).count(), 1);
    }

    #[test]
    fn history_extends_the_window() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = chunked(2, 1, None, &clock);

        engine.record(10);

        // The first chunk expires at 2000. The next write into its slot
        // retires it into the archive, where it lives one chunk more.
        clock.set_millis(2_100);
        engine.record(30);
        assert_eq!(engine.snapshot(&SnapshotKind::Full).count(), 2);

        clock.set_millis(2_999);
        assert_eq!(engine.snapshot(&SnapshotKind::Full).count(), 2);

        clock.set_millis(3_000);
        let snapshot = engine.snapshot(&SnapshotKind::Full);
        assert_eq!(snapshot.count(), 1);
        assert_eq!(snapshot.max(), 30);
    }

    #[test]
    fn history_keeps_chunk_whose_slot_sees_no_writes() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = chunked(2, 2, None, &clock);

        engine.record(10);
        clock.set_millis(1_000);
        engine.record(20);

        // The first chunk expired at 2000 and its slot was never written
        // again; the archive still holds it until 4000.
        clock.set_millis(2_500);
        assert_eq!(engine.snapshot(&SnapshotKind::Full).count(), 2);

        clock.set_millis(3_100);
        engine.record(30);
        let snapshot = engine.snapshot(&SnapshotKind::Full);
        assert_eq!(snapshot.count(), 3);
        assert_eq!(snapshot.min(), 10);

        clock.set_millis(4_000);
        assert_eq!(engine.snapshot(&SnapshotKind::Full).count(), 2);
    }

    #[test]
    fn reset_discards_expired_chunk_before_it_rotates() {
        let clock = Arc::new(ManualClock::new(0));
        let engine = chunked(2, 2, None, &clock);

        engine.record(10);
        clock.set_millis(2_500);
        engine.reset();

        // This write rotates the slot that held the pre-reset chunk.
        clock.set_millis(2_600);
        engine.record(20);
        let snapshot = engine.snapshot(&SnapshotKind::Full);
        assert_eq!(snapshot.count(), 1);
        assert_eq!(snapshot.min(), 20);
    }

    #[test]
    fn executor_folds_retired_chunks() {
        let clock = Arc::new(ManualClock::new(0));
        let executor: Arc<dyn Executor> = Arc::new(InlineExecutor);
        let engine = chunked(2, 1, Some(executor), &clock);

        engine.record(10);
        clock.set_millis(2_000);
        engine.record(20);

        let history = engine.history.as_ref().unwrap();
        assert_eq!(history.archived(), 1);
        assert_eq!(engine.snapshot(&SnapshotKind::Full).count(), 2);
    }
}
