//! Double-buffered recording.
//!
//! A [`Recorder`] owns two instances of the same buffer. Writers always go
//! to the active one through a shared reference; [`Recorder::drain`] swaps
//! the roles and, after the phaser confirms that no writer is still touching
//! the retired instance, hands it to the caller mutably. Writers are never
//! blocked by a drain in progress.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;

use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};

use crate::core::backoff::BackoffConfig;
use crate::core::phaser::Phaser;

/// A recording target that can be emptied for reuse.
///
/// Writers reach the buffer through `&self`, so implementations record with
/// interior mutability. [`clear`](Buffer::clear) takes `&mut self` and runs
/// only while no writer can observe the buffer.
pub(crate) trait Buffer: Send + Sync {
    fn clear(&mut self);
}

pub(crate) struct Recorder<T> {
    buffers: [CachePadded<UnsafeCell<T>>; 2],
    active: CachePadded<AtomicUsize>,
    phaser: Phaser,
    reader: Mutex<()>,
}

// SAFETY: writers only ever obtain `&T` to the active buffer, and the single
// reader (serialized by `reader`) only obtains `&mut T` to the inactive one
// after the phaser has drained every writer that could still see it.
unsafe impl<T: Send + Sync> Sync for Recorder<T> {}
unsafe impl<T: Send> Send for Recorder<T> {}

/// The quiesced buffer returned by [`Recorder::drain`].
///
/// Holds the recorder's reader lock: other drains wait until it is dropped,
/// writers do not.
pub(crate) struct Drained<'a, T> {
    _reader: MutexGuard<'a, ()>,
    buffer: &'a mut T,
}

impl<T: Buffer> Recorder<T> {
    pub(crate) fn new(make: impl Fn() -> T, backoff: BackoffConfig) -> Self {
        Self {
            buffers: [
                CachePadded::new(UnsafeCell::new(make())),
                CachePadded::new(UnsafeCell::new(make())),
            ],
            active: CachePadded::new(AtomicUsize::new(0)),
            phaser: Phaser::new(backoff),
            reader: Mutex::new(()),
        }
    }

    /// Runs `f` against the active buffer inside a writer critical section.
    #[inline]
    pub(crate) fn record<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let _writer = self.phaser.enter();
        let index = self.active.load(SeqCst);
        // SAFETY: the reader never takes `&mut` to the buffer a writer could
        // have selected while that writer is inside its critical section.
        let buffer = unsafe { &*self.buffers[index].get() };
        f(buffer)
    }

    /// Swaps in a cleared buffer and returns the retired one once every
    /// writer has left it.
    pub(crate) fn drain(&self) -> Drained<'_, T> {
        let reader = self.reader.lock();
        let retiring = self.active.load(SeqCst);
        let incoming = retiring ^ 1;

        // SAFETY: `incoming` is inactive and we hold the reader lock; writers
        // that used it in an earlier phase were drained by the previous flip.
        unsafe { (*self.buffers[incoming].get()).clear() };

        self.active.store(incoming, SeqCst);
        self.phaser.flip();

        Drained {
            _reader: reader,
            // SAFETY: after the flip no writer can reach `retiring` until the
            // next drain re-activates it, which needs the lock we hold.
            buffer: unsafe { &mut *self.buffers[retiring].get() },
        }
    }

    /// Discards everything recorded so far.
    pub(crate) fn reset(&self) {
        drop(self.drain());
        self.drain().clear();
    }
}

impl<T> fmt::Debug for Recorder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("active", &self.active.load(SeqCst))
            .field("phaser", &self.phaser)
            .finish_non_exhaustive()
    }
}

impl<T> Deref for Drained<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.buffer
    }
}

impl<T> DerefMut for Drained<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.buffer
    }
}
