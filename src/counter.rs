//! Windowed counters.
//!
//! [`Counter`] picks one of three engines from its [`Retention`]:
//!
//! - uniform: a single atomic sum that never resets;
//! - reset-on-snapshot: every [`sum`](WindowCounter::sum) swaps the total to
//!   zero;
//! - periodic and chunked: a [`ChunkRing`] of atomic sums. With chunks, the
//!   oldest live chunk fades out linearly over its last chunk of lifetime,
//!   so the reported sum approximates the true trailing-window total within
//!   `1 / chunks` and never drops in steps.

use std::fmt::Debug;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::core::ring::ChunkRing;
use crate::error::Result;
use crate::retention::{Decay, Plan, Retention};

/// A counter over some window of recent activity.
pub trait WindowCounter: Send + Sync + Debug {
    /// Adds `delta` to the current window. Never blocks.
    fn add(&self, delta: u64);

    /// Returns the (possibly decayed) sum of the current window.
    fn sum(&self) -> u64;
}

/// Sums everything ever added.
#[derive(Debug, Default)]
pub struct UniformCounter {
    sum: CachePadded<AtomicU64>,
}

impl WindowCounter for UniformCounter {
    #[inline]
    fn add(&self, delta: u64) {
        self.sum.fetch_add(delta, Relaxed);
    }

    #[inline]
    fn sum(&self) -> u64 {
        self.sum.load(Acquire)
    }
}

/// Sums what was added since the previous read.
#[derive(Debug, Default)]
pub struct ResetOnSnapshotCounter {
    sum: CachePadded<AtomicU64>,
}

impl WindowCounter for ResetOnSnapshotCounter {
    #[inline]
    fn add(&self, delta: u64) {
        self.sum.fetch_add(delta, Relaxed);
    }

    #[inline]
    fn sum(&self) -> u64 {
        self.sum.swap(0, AcqRel)
    }
}

/// Sums the current period, or the rolling window split into chunks.
#[derive(Debug)]
pub struct ChunkedCounter {
    ring: ChunkRing<AtomicU64>,
    clock: Arc<dyn Clock>,
}

impl WindowCounter for ChunkedCounter {
    #[inline]
    fn add(&self, delta: u64) {
        let now = self.clock.now_millis();
        self.ring.update(now, |sum| sum.fetch_add(delta, Relaxed));
    }

    fn sum(&self) -> u64 {
        let now = self.clock.now_millis();
        self.ring.fold(now, 0u64, |total, sum, weight| {
            total.saturating_add(weight.scale(sum.load(Acquire)))
        })
    }
}

/// A windowed counter with its retention chosen at construction.
#[derive(Debug)]
pub enum Counter {
    Uniform(UniformCounter),
    ResetOnSnapshot(ResetOnSnapshotCounter),
    Chunked(ChunkedCounter),
}

impl Counter {
    /// Builds a counter reading time from a [`SystemClock`].
    pub fn new(retention: Retention) -> Result<Self> {
        Self::with_clock(retention, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(retention: Retention, clock: Arc<dyn Clock>) -> Result<Self> {
        let counter = match retention.plan(Decay::Smooth)? {
            Plan::Uniform => Self::Uniform(UniformCounter::default()),
            Plan::ResetOnSnapshot => Self::ResetOnSnapshot(ResetOnSnapshotCounter::default()),
            Plan::Ring(layout) => Self::Chunked(ChunkedCounter {
                ring: ChunkRing::new(layout, clock.now_millis(), AtomicU64::default),
                clock,
            }),
        };

        debug!(?retention, "counter created");
        Ok(counter)
    }
}

impl WindowCounter for Counter {
    #[inline]
    fn add(&self, delta: u64) {
        match self {
            Self::Uniform(counter) => counter.add(delta),
            Self::ResetOnSnapshot(counter) => counter.add(delta),
            Self::Chunked(counter) => counter.add(delta),
        }
    }

    #[inline]
    fn sum(&self) -> u64 {
        match self {
            Self::Uniform(counter) => counter.sum(),
            Self::ResetOnSnapshot(counter) => counter.sum(),
            Self::Chunked(counter) => counter.sum(),
        }
    }
}
