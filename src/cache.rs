//! Throttled snapshot recomputation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::error::{Error, Result};

/// Remembers the last snapshot of an aggregate for a fixed duration.
///
/// Readers arriving within the caching duration get the very same `Arc` the
/// previous reader got. Recomputation is serialized by one lock held only by
/// readers; writers of the wrapped aggregate never see it.
pub struct SnapshotCache<S: ?Sized> {
    ttl_millis: u64,
    clock: Arc<dyn Clock>,
    cached: Mutex<Option<Cached<S>>>,
}

struct Cached<S: ?Sized> {
    taken_at: u64,
    snapshot: Arc<S>,
}

impl<S: ?Sized> SnapshotCache<S> {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        if ttl.is_zero() {
            return Err(Error::NonPositiveDuration {
                name: "snapshot caching duration",
            });
        }

        Ok(Self {
            ttl_millis: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            clock,
            cached: Mutex::new(None),
        })
    }

    /// Returns the cached snapshot while it is fresh, otherwise runs `compute`
    /// and caches its result.
    pub fn get_or_refresh(&self, compute: impl FnOnce() -> Arc<S>) -> Arc<S> {
        let mut cached = self.cached.lock();
        let now = self.clock.now_millis();

        if let Some(hit) = cached.as_ref() {
            if now.saturating_sub(hit.taken_at) < self.ttl_millis {
                return Arc::clone(&hit.snapshot);
            }
        }

        let snapshot = compute();
        *cached = Some(Cached {
            taken_at: now,
            snapshot: Arc::clone(&snapshot),
        });
        snapshot
    }

    /// Forgets the cached snapshot so the next read recomputes.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}

impl<S: ?Sized> fmt::Debug for SnapshotCache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotCache")
            .field("ttl_millis", &self.ttl_millis)
            .field("cached", &self.cached.lock().as_ref().map(|c| c.taken_at))
            .finish()
    }
}
