//! Windowed hit ratios.
//!
//! Hits and totals are packed into a single `u64` (hits in the high half,
//! total in the low half) and updated together with one CAS, so a reader
//! never sees a hit count from one update paired with a total from another.
//! When the total would overflow 32 bits both halves are halved first, which
//! keeps the ratio while forgetting some history.

use std::fmt::Debug;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{AcqRel, Acquire};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::core::ring::ChunkRing;
use crate::error::{Error, Result};
use crate::retention::{Decay, Plan, Retention};

#[inline]
const fn pack(hits: u32, total: u32) -> u64 {
    ((hits as u64) << 32) | total as u64
}

#[inline]
const fn unpack(composite: u64) -> (u32, u32) {
    ((composite >> 32) as u32, composite as u32)
}

/// Adds an observation to a packed pair, halving the stored pair until the
/// sum fits.
#[inline]
fn accumulate(composite: u64, hits: u32, total: u32) -> u64 {
    let (mut stored_hits, mut stored_total) = unpack(composite);

    while u64::from(stored_total) + u64::from(total) > u64::from(u32::MAX) {
        stored_hits /= 2;
        stored_total /= 2;
    }

    pack(stored_hits + hits, stored_total + total)
}

#[inline]
fn add_to(cell: &AtomicU64, hits: u32, total: u32) {
    // The closure always returns `Some`, so the update cannot fail.
    let _ = cell.fetch_update(AcqRel, Acquire, |composite| {
        Some(accumulate(composite, hits, total))
    });
}

#[inline]
fn ratio(hits: f64, total: f64) -> f64 {
    if total > 0.0 {
        (hits / total).clamp(0.0, 1.0)
    } else {
        f64::NAN
    }
}

fn check(hits: u32, total: u32) -> Result<()> {
    if total == 0 || hits > total {
        return Err(Error::InvalidHitRatio { hits, total });
    }
    Ok(())
}

/// A hit ratio over some window of recent activity.
pub trait WindowHitRatio: Send + Sync + Debug {
    /// Records `hits` out of `total` lookups. Requires `1 <= total` and
    /// `hits <= total`.
    fn update(&self, hits: u32, total: u32) -> Result<()>;

    /// Returns `hits / total` for the current window, or `NaN` when the
    /// window holds no observations.
    fn hit_ratio(&self) -> f64;

    /// Records a single lookup.
    #[inline]
    fn record(&self, hit: bool) {
        // `hits <= total == 1` always holds here.
        let _ = self.update(u32::from(hit), 1);
    }
}

#[derive(Debug, Default)]
pub struct UniformHitRatio {
    composite: CachePadded<AtomicU64>,
}

impl WindowHitRatio for UniformHitRatio {
    fn update(&self, hits: u32, total: u32) -> Result<()> {
        check(hits, total)?;
        add_to(&self.composite, hits, total);
        Ok(())
    }

    fn hit_ratio(&self) -> f64 {
        let (hits, total) = unpack(self.composite.load(Acquire));
        ratio(f64::from(hits), f64::from(total))
    }
}

#[derive(Debug, Default)]
pub struct ResetOnSnapshotHitRatio {
    composite: CachePadded<AtomicU64>,
}

impl WindowHitRatio for ResetOnSnapshotHitRatio {
    fn update(&self, hits: u32, total: u32) -> Result<()> {
        check(hits, total)?;
        add_to(&self.composite, hits, total);
        Ok(())
    }

    fn hit_ratio(&self) -> f64 {
        let (hits, total) = unpack(self.composite.swap(0, AcqRel));
        ratio(f64::from(hits), f64::from(total))
    }
}

#[derive(Debug)]
pub struct ChunkedHitRatio {
    ring: ChunkRing<AtomicU64>,
    clock: Arc<dyn Clock>,
}

impl WindowHitRatio for ChunkedHitRatio {
    fn update(&self, hits: u32, total: u32) -> Result<()> {
        check(hits, total)?;
        let now = self.clock.now_millis();
        self.ring.update(now, |composite| add_to(composite, hits, total));
        Ok(())
    }

    fn hit_ratio(&self) -> f64 {
        let now = self.clock.now_millis();
        let (hits, total) = self.ring.fold(now, (0.0, 0.0), |(hits, total), composite, weight| {
            let (chunk_hits, chunk_total) = unpack(composite.load(Acquire));
            let factor = weight.factor();
            (
                hits + f64::from(chunk_hits) * factor,
                total + f64::from(chunk_total) * factor,
            )
        });
        ratio(hits, total)
    }
}

/// A windowed hit ratio with its retention chosen at construction.
#[derive(Debug)]
pub enum HitRatio {
    Uniform(UniformHitRatio),
    ResetOnSnapshot(ResetOnSnapshotHitRatio),
    Chunked(ChunkedHitRatio),
}

impl HitRatio {
    pub fn new(retention: Retention) -> Result<Self> {
        Self::with_clock(retention, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(retention: Retention, clock: Arc<dyn Clock>) -> Result<Self> {
        let ratio = match retention.plan(Decay::Smooth)? {
            Plan::Uniform => Self::Uniform(UniformHitRatio::default()),
            Plan::ResetOnSnapshot => Self::ResetOnSnapshot(ResetOnSnapshotHitRatio::default()),
            Plan::Ring(layout) => Self::Chunked(ChunkedHitRatio {
                ring: ChunkRing::new(layout, clock.now_millis(), AtomicU64::default),
                clock,
            }),
        };

        debug!(?retention, "hit ratio created");
        Ok(ratio)
    }
}

impl WindowHitRatio for HitRatio {
    #[inline]
    fn update(&self, hits: u32, total: u32) -> Result<()> {
        match self {
            Self::Uniform(ratio) => ratio.update(hits, total),
            Self::ResetOnSnapshot(ratio) => ratio.update(hits, total),
            Self::Chunked(ratio) => ratio.update(hits, total),
        }
    }

    #[inline]
    fn hit_ratio(&self) -> f64 {
        match self {
            Self::Uniform(ratio) => ratio.hit_ratio(),
            Self::ResetOnSnapshot(ratio) => ratio.hit_ratio(),
            Self::Chunked(ratio) => ratio.hit_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn packs_hits_high_and_total_low() {
        let composite = pack(3, 7);
        assert_eq!(composite, (3 << 32) | 7);
        assert_eq!(unpack(composite), (3, 7));
        assert_eq!(unpack(pack(u32::MAX, u32::MAX)), (u32::MAX, u32::MAX));
    }

    #[test]
    fn overflow_halves_both_halves() {
        let near_full = pack(u32::MAX / 2, u32::MAX - 1);
        let (hits, total) = unpack(accumulate(near_full, 2, 2));

        assert_eq!(total, (u32::MAX - 1) / 2 + 2);
        assert_eq!(hits, u32::MAX / 2 / 2 + 2);
        assert!(hits <= total);
    }

    #[test]
    fn rejects_invalid_observations() {
        let ratio = HitRatio::new(Retention::Uniform).unwrap();
        assert!(matches!(
            ratio.update(2, 1),
            Err(Error::InvalidHitRatio { hits: 2, total: 1 })
        ));
        assert!(matches!(ratio.update(0, 0), Err(Error::InvalidHitRatio { .. })));
        assert!(ratio.hit_ratio().is_nan());
    }

    #[test]
    fn ratio_stays_within_unit_interval() {
        let ratio = HitRatio::new(Retention::Uniform).unwrap();
        for total in 1..200u32 {
            ratio.update(total / 3, total).unwrap();
            let value = ratio.hit_ratio();
            assert!((0.0..=1.0).contains(&value), "ratio {value} out of range");
        }

        let saturated = HitRatio::new(Retention::Uniform).unwrap();
        for _ in 0..8 {
            saturated.update(u32::MAX, u32::MAX).unwrap();
        }
        assert_eq!(saturated.hit_ratio(), 1.0);
    }

    #[test]
    fn record_counts_single_lookups() {
        let ratio = HitRatio::new(Retention::ResetOnSnapshot).unwrap();
        for i in 0..10 {
            ratio.record(i % 4 != 0);
        }
        assert!((ratio.hit_ratio() - 0.7).abs() < 1e-9);
        assert!(ratio.hit_ratio().is_nan(), "snapshot drained the pair");
    }

    #[test]
    fn concurrent_updates_keep_pair_consistent() {
        let ratio = HitRatio::new(Retention::Uniform).unwrap();

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..10_000 {
                        ratio.update(1, 4).unwrap();
                    }
                });
            }
        });

        assert!((ratio.hit_ratio() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn chunked_ratio_forgets_old_chunks() {
        let clock = Arc::new(ManualClock::new(0));
        let retention = Retention::ResetPeriodicallyByChunks {
            rolling_window: Duration::from_secs(1),
            chunks: 4,
        };
        let ratio = HitRatio::with_clock(retention, clock.clone()).unwrap();

        ratio.update(10, 10).unwrap();
        clock.set_millis(900);
        ratio.update(0, 10).unwrap();
        assert!((ratio.hit_ratio() - 0.5).abs() < 1e-9);

        // The all-hits chunk (expiring at 1250) is halfway through its decay.
        clock.set_millis(1_125);
        assert!((ratio.hit_ratio() - 5.0 / 15.0).abs() < 1e-9);

        clock.set_millis(1_250);
        assert_eq!(ratio.hit_ratio(), 0.0);

        clock.set_millis(5_000);
        assert!(ratio.hit_ratio().is_nan());
    }
}
