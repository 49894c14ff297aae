//! Time sources.
//!
//! Every aggregate reads time through a [`Clock`] handed to it at
//! construction, so tests can drive rotation with a [`ManualClock`] instead
//! of sleeping.

use std::fmt::Debug;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{Acquire, Release};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A monotonic time source.
pub trait Clock: Send + Sync + Debug {
    /// Milliseconds on a monotonic timeline. Chunk invalidation timestamps
    /// and ranking positions are expressed on this timeline.
    fn now_millis(&self) -> u64;

    /// Nanoseconds on a monotonic timeline.
    fn now_nanos(&self) -> u64;
}

/// The default clock.
///
/// Milliseconds are anchored to the Unix epoch at creation and then advance
/// with [`Instant`], so wall-clock adjustments never move time backwards.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
    origin_millis: u64,
}

impl SystemClock {
    pub fn new() -> Self {
        let origin_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(saturating_millis)
            .unwrap_or_default();

        Self {
            origin: Instant::now(),
            origin_millis,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now_millis(&self) -> u64 {
        self.origin_millis
            .saturating_add(saturating_millis(self.origin.elapsed()))
    }

    #[inline]
    fn now_nanos(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// A clock that only moves when told to.
///
/// Shared between the aggregate under test and the test body through an
/// `Arc`; all mutation goes through atomics.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `millis`.
    pub fn new(millis: u64) -> Self {
        Self {
            nanos: AtomicU64::new(millis.saturating_mul(1_000_000)),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        let _ = self
            .nanos
            .fetch_update(Release, Acquire, |current| Some(current.saturating_add(nanos)));
    }

    /// Moves the clock forward by `millis` milliseconds.
    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }

    /// Sets the clock to an absolute reading.
    pub fn set_millis(&self, millis: u64) {
        self.nanos.store(millis.saturating_mul(1_000_000), Release);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now_millis(&self) -> u64 {
        self.nanos.load(Acquire) / 1_000_000
    }

    #[inline]
    fn now_nanos(&self) -> u64 {
        self.nanos.load(Acquire)
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
