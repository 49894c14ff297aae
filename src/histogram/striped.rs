//! The writer-side histogram buffer.
//!
//! `hdrhistogram` records through `&mut`, so concurrent writers need some
//! exclusion. Instead of one lock per buffer, writers are spread over a
//! power-of-two number of stripes by a per-thread id, each stripe on its own
//! cache line. Two writers contend only when they share a stripe. The reader
//! side never locks: it reaches the stripes through `&mut` once the recorder
//! has quiesced the buffer.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;

use crossbeam::utils::CachePadded;
use hdrhistogram::Histogram;
use parking_lot::Mutex;

use crate::core::recorder::Buffer;

/// Default number of stripes per buffer.
pub const DEFAULT_STRIPES: usize = 4;

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Assigned on a thread's first recording, fixes its stripe affinity.
    static THREAD_ID: usize = NEXT_ID.fetch_add(1, Relaxed);
}

/// Requires `mask + 1` to be a power of two.
#[inline]
fn stripe_index(mask: usize) -> usize {
    THREAD_ID.with(|id| *id) & mask
}

#[derive(Debug)]
pub(crate) struct StripedHistogram {
    stripes: Box<[CachePadded<Mutex<Histogram<u64>>>]>,
    mask: usize,
}

impl StripedHistogram {
    /// `stripes` is rounded up to the next power of two.
    pub(crate) fn new(prototype: &Histogram<u64>, stripes: usize) -> Self {
        let len = stripes.max(1).next_power_of_two();
        let stripes = (0..len)
            .map(|_| CachePadded::new(Mutex::new(prototype.clone())))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            stripes,
            mask: len - 1,
        }
    }

    #[inline]
    pub(crate) fn record(&self, value: u64, expected_interval: Option<u64>) {
        let mut histogram = self.stripes[stripe_index(self.mask)].lock();
        // Buffers auto-resize, so recording cannot go out of range.
        let _ = match expected_interval {
            Some(interval) => histogram.record_correct(value, interval),
            None => histogram.record(value),
        };
    }

    /// Adds every stripe into `target`.
    pub(crate) fn drain_into(&mut self, target: &mut Histogram<u64>) {
        for stripe in self.stripes.iter_mut() {
            let histogram = stripe.get_mut();
            if !histogram.is_empty() {
                let _ = target.add(&*histogram);
            }
        }
    }
}

impl Buffer for StripedHistogram {
    fn clear(&mut self) {
        for stripe in self.stripes.iter_mut() {
            stripe.get_mut().reset();
        }
    }
}
