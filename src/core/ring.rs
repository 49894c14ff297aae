//! The rotating chunk ring shared by every chunked aggregate.
//!
//! Time since creation is cut into intervals of `chunk_millis`. Interval `k`
//! writes into slot `k % slots`. Each slot holds one [`Phase`]: an
//! accumulation unit plus the timestamp at which it stops counting. A phase
//! is never reset in place; when a writer finds its slot's phase invalidated
//! it installs a fresh one with a CAS. Exactly one writer wins and gets to
//! retire the old phase, losers record into the winner's phase. Retired
//! phases are reclaimed through the epoch collector once no reader or late
//! writer still holds them.

use crossbeam::epoch::{pin, Atomic, Owned};
use crossbeam::utils::CachePadded;
use crossbeam_epoch::Shared;
use std::fmt;
use std::sync::atomic::Ordering::{AcqRel, Acquire};

/// Slot count and timing of a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RingLayout {
    slots: usize,
    chunk_millis: u64,
    /// Intervals a phase stays live after its own interval ends.
    lag: u64,
    smooth: bool,
}

impl RingLayout {
    /// One slot, hard reset at the end of every period.
    pub(crate) fn periodic(period_millis: u64) -> Self {
        Self {
            slots: 1,
            chunk_millis: period_millis,
            lag: 0,
            smooth: false,
        }
    }

    /// `chunks + 1` slots; the oldest live phase fades out linearly.
    pub(crate) fn smooth(chunk_millis: u64, chunks: usize) -> Self {
        Self {
            slots: chunks + 1,
            chunk_millis,
            lag: chunks as u64,
            smooth: true,
        }
    }

    /// `chunks` slots; phases count in full until they expire.
    pub(crate) fn discrete(chunk_millis: u64, chunks: usize) -> Self {
        Self {
            slots: chunks,
            chunk_millis,
            lag: chunks as u64 - 1,
            smooth: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn slots(&self) -> usize {
        self.slots
    }

    pub(crate) fn chunk_millis(&self) -> u64 {
        self.chunk_millis
    }
}

/// How much a live phase counts towards a read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Weight {
    Full,
    /// The oldest live phase of a smooth ring, with the fraction of a chunk
    /// it has left to live.
    Decaying(f64),
}

impl Weight {
    #[inline]
    pub(crate) fn factor(self) -> f64 {
        match self {
            Self::Full => 1.0,
            Self::Decaying(factor) => factor,
        }
    }

    /// Scales an integral value, exact for full weight.
    #[inline]
    pub(crate) fn scale(self, value: u64) -> u64 {
        match self {
            Self::Full => value,
            Self::Decaying(factor) => (value as f64 * factor).round() as u64,
        }
    }
}

pub(crate) struct Phase<P> {
    value: P,
    invalidates_at: u64,
}

impl<P> Phase<P> {
    #[inline]
    pub(crate) fn value(&self) -> &P {
        &self.value
    }

    #[inline]
    pub(crate) fn invalidates_at(&self) -> u64 {
        self.invalidates_at
    }
}

pub(crate) struct ChunkRing<P> {
    slots: Box<[CachePadded<Atomic<Phase<P>>>]>,
    layout: RingLayout,
    created_at: u64,
    factory: Box<dyn Fn() -> P + Send + Sync>,
}

impl<P> ChunkRing<P>
where
    P: Send + Sync + 'static,
{
    /// Pre-allocates one already-invalidated phase per slot.
    pub(crate) fn new(
        layout: RingLayout,
        created_at: u64,
        factory: impl Fn() -> P + Send + Sync + 'static,
    ) -> Self {
        let slots = (0..layout.slots)
            .map(|_| {
                CachePadded::new(Atomic::new(Phase {
                    value: factory(),
                    invalidates_at: 0,
                }))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            layout,
            created_at,
            factory: Box::new(factory),
        }
    }

    /// Records into the phase current at `now`.
    #[inline]
    pub(crate) fn update<R>(&self, now: u64, record: impl FnOnce(&P) -> R) -> R {
        self.update_with(now, |_| {}, record)
    }

    /// Records into the phase current at `now`, rotating the slot first if its
    /// phase is invalidated. `on_retire` runs only on the thread whose CAS
    /// installed the replacement, before the old phase is handed to the
    /// collector. The placeholders a ring is created with are retired
    /// silently.
    pub(crate) fn update_with<R>(
        &self,
        now: u64,
        on_retire: impl FnOnce(&Phase<P>),
        record: impl FnOnce(&P) -> R,
    ) -> R {
        let guard = pin();
        let slot = &self.slots[self.slot_index(now)];
        let mut on_retire = Some(on_retire);
        let mut current = slot.load(Acquire, &guard);

        loop {
            // SAFETY: slots are never null while the ring is alive, and the
            // guard keeps a concurrently retired phase from being freed.
            let phase = unsafe { current.deref() };

            if now < phase.invalidates_at {
                return record(&phase.value);
            }

            let next = Owned::new(Phase {
                value: (self.factory)(),
                invalidates_at: self.invalidation_for(now),
            });

            match slot.compare_exchange(current, next, AcqRel, Acquire, &guard) {
                Ok(installed) => {
                    tracing::trace!(
                        slot = self.slot_index(now),
                        retired_at = phase.invalidates_at,
                        "rotated chunk"
                    );
                    if phase.invalidates_at > 0 {
                        if let Some(on_retire) = on_retire.take() {
                            on_retire(phase);
                        }
                    }
                    // SAFETY: the phase is unreachable from the ring now; the
                    // collector frees it after every pinned holder is done.
                    unsafe { guard.defer_destroy(current) };
                    current = installed;
                }
                Err(lost) => current = lost.current,
            }
        }
    }

    /// Replaces every expired phase with a placeholder, running `on_retire`
    /// for each one this call retired. Slots a writer rotates concurrently
    /// are retired by exactly one of the two.
    pub(crate) fn retire_expired(&self, now: u64, mut on_retire: impl FnMut(&Phase<P>)) {
        let guard = pin();

        for slot in self.slots.iter() {
            let current = slot.load(Acquire, &guard);
            // SAFETY: see `update_with`.
            let Some(phase) = (unsafe { current.as_ref() }) else {
                continue;
            };

            if phase.invalidates_at == 0 || now < phase.invalidates_at {
                continue;
            }

            let placeholder = Owned::new(Phase {
                value: (self.factory)(),
                invalidates_at: 0,
            });

            if slot
                .compare_exchange(current, placeholder, AcqRel, Acquire, &guard)
                .is_ok()
            {
                on_retire(phase);
                // SAFETY: the phase is unreachable from the ring now.
                unsafe { guard.defer_destroy(current) };
            }
        }
    }

    /// Replaces every phase, live or expired, with a placeholder. Nothing is
    /// retired.
    pub(crate) fn clear(&self) {
        let guard = pin();

        for slot in self.slots.iter() {
            let placeholder = Owned::new(Phase {
                value: (self.factory)(),
                invalidates_at: 0,
            });
            let old = slot.swap(placeholder, AcqRel, &guard);
            if !old.is_null() {
                // SAFETY: the phase is unreachable from the ring now.
                unsafe { guard.defer_destroy(old) };
            }
        }
    }

    /// Folds every live phase, oldest first.
    pub(crate) fn fold<A>(&self, now: u64, init: A, mut f: impl FnMut(A, &P, Weight) -> A) -> A {
        let guard = pin();
        let newest = self.slot_index(now);
        let len = self.slots.len();
        let mut acc = init;

        for offset in 1..=len {
            let shared = self.slots[(newest + offset) % len].load(Acquire, &guard);
            // SAFETY: see `update_with`.
            let Some(phase) = (unsafe { shared.as_ref() }) else {
                continue;
            };

            if let Some(weight) = self.weight(phase.invalidates_at, now) {
                acc = f(acc, &phase.value, weight);
            }
        }

        acc
    }

    #[inline]
    fn interval(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at) / self.layout.chunk_millis
    }

    #[inline]
    fn slot_index(&self, now: u64) -> usize {
        (self.interval(now) % self.layout.slots as u64) as usize
    }

    /// A phase opened during interval `k` lives until the end of interval
    /// `k + lag`.
    #[inline]
    fn invalidation_for(&self, now: u64) -> u64 {
        let intervals = self.interval(now) + 1 + self.layout.lag;
        self.created_at
            .saturating_add(intervals.saturating_mul(self.layout.chunk_millis))
    }

    #[inline]
    fn weight(&self, invalidates_at: u64, now: u64) -> Option<Weight> {
        if now >= invalidates_at {
            return None;
        }

        let remaining = invalidates_at - now;
        if self.layout.smooth && remaining < self.layout.chunk_millis {
            Some(Weight::Decaying(
                remaining as f64 / self.layout.chunk_millis as f64,
            ))
        } else {
            Some(Weight::Full)
        }
    }
}

impl<P> fmt::Debug for ChunkRing<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkRing")
            .field("layout", &self.layout)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl<P> Drop for ChunkRing<P> {
    fn drop(&mut self) {
        let guard = pin();

        for slot in self.slots.iter() {
            let old = slot.swap(Shared::null(), AcqRel, &guard);

            if !old.is_null() {
                // SAFETY: the slot is null now and the ring is going away;
                // pinned readers still holding the phase keep it alive.
                unsafe { guard.defer_destroy(old) }
            }
        }

        guard.flush();
    }
}
