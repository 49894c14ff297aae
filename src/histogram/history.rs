//! Archive of retired histogram chunks.
//!
//! When a chunk of a rolling histogram rotates out of the ring its final
//! contents can be kept for `history_chunks` more chunk durations. Retired
//! chunks are first queued without taking any lock (the rotating writer
//! only pushes), then folded into the archive either by an [`Executor`] or
//! inline by the next reader. A retired chunk may still receive a few late
//! writes from threads that picked it up just before rotation, so archived
//! chunks keep their recorder and every read drains it again.

use std::collections::VecDeque;
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use tracing::trace;

use super::chunked::HistogramChunk;

#[derive(Debug)]
struct Retired {
    chunk: Arc<HistogramChunk>,
    expires_at: u64,
}

#[derive(Debug)]
pub(crate) struct History {
    pending: SegQueue<Retired>,
    archive: Mutex<VecDeque<Retired>>,
    capacity: usize,
    /// How long an archived chunk outlives its retirement.
    retention_millis: u64,
}

impl History {
    pub(crate) fn new(capacity: usize, chunk_millis: u64) -> Self {
        Self {
            pending: SegQueue::new(),
            archive: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            retention_millis: chunk_millis.saturating_mul(capacity as u64),
        }
    }

    /// Queues a chunk retired at `retired_at` for archiving.
    pub(crate) fn retire(&self, chunk: Arc<HistogramChunk>, retired_at: u64) {
        self.pending.push(Retired {
            chunk,
            expires_at: retired_at.saturating_add(self.retention_millis),
        });
    }

    /// More retired chunks are queued than the archive can hold, so whatever
    /// was meant to fold them has fallen behind.
    pub(crate) fn is_backlogged(&self) -> bool {
        self.pending.len() > self.capacity
    }

    /// Settles every queued chunk and moves it into the archive, evicting
    /// the oldest entries beyond capacity.
    pub(crate) fn fold_pending(&self) {
        let mut archive = self.archive.lock();
        let mut folded = 0usize;

        while let Some(retired) = self.pending.pop() {
            retired.chunk.settle();
            archive.push_back(retired);
            folded += 1;
        }

        while archive.len() > self.capacity {
            archive.pop_front();
        }

        if folded > 0 {
            trace!(folded, archived = archive.len(), "archived retired chunks");
        }
    }

    /// Folds pending chunks, drops expired entries and adds the rest into
    /// `target`.
    pub(crate) fn add_live_into(&self, now: u64, target: &mut Histogram<u64>) {
        self.fold_pending();

        let mut archive = self.archive.lock();
        archive.retain(|entry| now < entry.expires_at);

        for entry in archive.iter() {
            entry.chunk.add_into(target);
        }
    }

    /// Forgets every queued and archived chunk.
    pub(crate) fn clear(&self) {
        let mut archive = self.archive.lock();
        while self.pending.pop().is_some() {}
        archive.clear();
    }

    #[cfg(test)]
    pub(crate) fn archived(&self) -> usize {
        self.archive.lock().len()
    }
}
