//! Bounded collections of the slowest observations.
//!
//! Entries are ordered by `(latency, seq)` where `seq` grows with every
//! admitted update, so between equal latencies the most recent one ranks
//! higher and displaces the older one when the collection is full.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::time::Duration;

use crossbeam::epoch::{pin, Atomic, Owned};
use crossbeam_epoch::Shared;
use parking_lot::Mutex;

use super::Position;
use crate::core::recorder::Buffer;

/// Ordering key of a ranked entry.
pub(crate) type Rank = (Duration, u64);

/// A position together with its ordering key.
#[derive(Debug, Clone)]
pub(crate) struct Ranked {
    pub(crate) rank: Rank,
    pub(crate) position: Position,
}

/// The observation offered to a collector. The description is produced
/// only once the observation is known to be admitted.
pub(crate) struct Offer<F> {
    pub(crate) timestamp: u64,
    pub(crate) latency: Duration,
    pub(crate) seq: u64,
    pub(crate) describe: F,
}

impl<F: FnOnce() -> String> Offer<F> {
    fn into_ranked(self) -> Ranked {
        Ranked {
            rank: (self.latency, self.seq),
            position: Position {
                timestamp: self.timestamp,
                latency: self.latency,
                description: (self.describe)(),
            },
        }
    }
}

pub(crate) enum Collector {
    /// Size one: a single CAS cell.
    Single(Atomic<Ranked>),
    /// Size above one.
    Multi {
        size: usize,
        /// Lowest ranked latency in nanos once full, zero before. Lets slower
        /// observations be turned away without touching the lock.
        floor: AtomicU64,
        entries: Mutex<BTreeMap<Rank, Position>>,
    },
}

#[inline]
fn nanos(latency: Duration) -> u64 {
    u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX)
}

impl Collector {
    pub(crate) fn new(size: usize) -> Self {
        if size == 1 {
            Self::Single(Atomic::null())
        } else {
            Self::Multi {
                size,
                floor: AtomicU64::new(0),
                entries: Mutex::new(BTreeMap::new()),
            }
        }
    }

    /// Admits `offer` if it ranks among the collected entries.
    pub(crate) fn offer<F: FnOnce() -> String>(&self, offer: Offer<F>) {
        match self {
            Self::Single(cell) => offer_single(cell, offer),
            Self::Multi {
                size,
                floor,
                entries,
            } => {
                if nanos(offer.latency) < floor.load(Acquire) {
                    return;
                }

                // Described outside the lock; the floor may have risen by the
                // time the entry is inserted, in which case it is evicted.
                let ranked = offer.into_ranked();
                let mut entries = entries.lock();
                entries.insert(ranked.rank, ranked.position);

                while entries.len() > *size {
                    entries.pop_first();
                }
                if entries.len() == *size {
                    if let Some(((lowest, _), _)) = entries.first_key_value() {
                        floor.store(nanos(*lowest), Release);
                    }
                }
            }
        }
    }

    /// Copies out the collected entries, in no particular order.
    pub(crate) fn collect_into(&self, out: &mut Vec<Ranked>) {
        match self {
            Self::Single(cell) => {
                let guard = pin();
                // SAFETY: entries are only freed through the collector.
                if let Some(ranked) = unsafe { cell.load(Acquire, &guard).as_ref() } {
                    out.push(ranked.clone());
                }
            }
            Self::Multi { entries, .. } => {
                out.extend(entries.lock().iter().map(|(rank, position)| Ranked {
                    rank: *rank,
                    position: position.clone(),
                }))
            }
        }
    }
}

fn offer_single<F: FnOnce() -> String>(cell: &Atomic<Ranked>, offer: Offer<F>) {
    let guard = pin();
    let mut current = cell.load(Acquire, &guard);
    let mut offer = Some(offer);
    let mut candidate: Option<Owned<Ranked>> = None;

    loop {
        // SAFETY: see `collect_into`.
        if let Some(existing) = unsafe { current.as_ref() } {
            let rank = match (&candidate, &offer) {
                (Some(candidate), _) => candidate.rank,
                (None, Some(offer)) => (offer.latency, offer.seq),
                (None, None) => return,
            };
            if rank < existing.rank {
                return;
            }
        }

        let next = match (candidate.take(), offer.take()) {
            (Some(candidate), _) => candidate,
            (None, Some(offer)) => Owned::new(offer.into_ranked()),
            (None, None) => return,
        };

        match cell.compare_exchange(current, next, AcqRel, Acquire, &guard) {
            Ok(_) => {
                if !current.is_null() {
                    // SAFETY: the replaced entry is unreachable from the cell.
                    unsafe { guard.defer_destroy(current) };
                }
                return;
            }
            Err(lost) => {
                current = lost.current;
                candidate = Some(lost.new);
            }
        }
    }
}

fn clear_single(cell: &Atomic<Ranked>) {
    let guard = pin();
    let old = cell.swap(Shared::null(), AcqRel, &guard);
    if !old.is_null() {
        // SAFETY: the entry is unreachable from the cell.
        unsafe { guard.defer_destroy(old) };
    }
}

impl Buffer for Collector {
    fn clear(&mut self) {
        match self {
            Self::Single(cell) => clear_single(cell),
            Self::Multi { floor, entries, .. } => {
                *floor.get_mut() = 0;
                entries.get_mut().clear();
            }
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        if let Self::Single(cell) = self {
            clear_single(cell);
        }
    }
}
