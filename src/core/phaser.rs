//! Writer/reader phase tracking.
//!
//! Writers bracket every access to the active buffer with
//! [`Phaser::enter`]; a reader that has just swapped buffers calls
//! [`Phaser::flip`] and returns only once every writer that entered before the
//! swap has left. Writers never wait on each other or on the reader.
//!
//! The start epoch counts writer entries. Its sign encodes the phase: even
//! phases count up from `0`, odd phases from `i64::MIN`. Each phase has its
//! own end epoch counting exits, so the reader can tell when the phase it just
//! closed has drained.

use crossbeam::utils::CachePadded;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering::SeqCst;

use crate::core::backoff::BackoffConfig;

#[derive(Debug)]
pub(crate) struct Phaser {
    start_epoch: CachePadded<AtomicI64>,
    even_end_epoch: CachePadded<AtomicI64>,
    odd_end_epoch: CachePadded<AtomicI64>,
    backoff: BackoffConfig,
}

/// Marks a writer inside its critical section; leaving is tied to drop.
#[must_use]
pub(crate) struct WriterGuard<'a> {
    phaser: &'a Phaser,
    entered_at: i64,
}

impl Phaser {
    pub(crate) fn new(backoff: BackoffConfig) -> Self {
        Self {
            start_epoch: CachePadded::new(AtomicI64::new(0)),
            even_end_epoch: CachePadded::new(AtomicI64::new(0)),
            odd_end_epoch: CachePadded::new(AtomicI64::new(i64::MIN)),
            backoff,
        }
    }

    /// Enters a writer critical section. Wait-free.
    #[inline]
    pub(crate) fn enter(&self) -> WriterGuard<'_> {
        WriterGuard {
            phaser: self,
            entered_at: self.start_epoch.fetch_add(1, SeqCst),
        }
    }

    #[inline]
    fn exit(&self, entered_at: i64) {
        if entered_at < 0 {
            self.odd_end_epoch.fetch_add(1, SeqCst);
        } else {
            self.even_end_epoch.fetch_add(1, SeqCst);
        }
    }

    /// Closes the current phase and waits for its writers to leave.
    ///
    /// Callers must serialize flips among themselves; the [`Recorder`]
    /// does so with its reader lock.
    ///
    /// [`Recorder`]: crate::core::recorder::Recorder
    pub(crate) fn flip(&self) {
        let next_is_even = self.start_epoch.load(SeqCst) < 0;
        let initial = if next_is_even { 0 } else { i64::MIN };

        if next_is_even {
            self.even_end_epoch.store(initial, SeqCst);
        } else {
            self.odd_end_epoch.store(initial, SeqCst);
        }

        let closed_at = self.start_epoch.swap(initial, SeqCst);
        let closed_end = if next_is_even {
            &self.odd_end_epoch
        } else {
            &self.even_end_epoch
        };

        let mut backoff = self.backoff.build();
        while closed_end.load(SeqCst) != closed_at {
            backoff.snooze();
        }
    }
}

impl Drop for WriterGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.phaser.exit(self.entered_at);
    }
}
