use std::hint::spin_loop;
use std::thread;

/// Default spin limit used by the writer-quiescence wait.
pub const DEFAULT_SPIN_LIMIT: usize = 64;

/// A stateful wait strategy for the short, bounded waits in this crate.
///
/// While the current limit is below the configured ceiling the backoff spins
/// a random ("full jitter") number of times; once the ceiling is reached it
/// yields the thread instead, so a reader waiting for a slow writer does not
/// burn a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Grows the spin ceiling by one per step.
    Linear {
        /// The current maximum number of spins for the next jitter calculation.
        current: usize,
        /// The ceiling after which the backoff yields.
        limit: usize,
    },
    /// Doubles the spin ceiling per step.
    Exponential {
        /// The current maximum number of spins for the next jitter calculation.
        current: usize,
        /// The ceiling after which the backoff yields.
        limit: usize,
    },
}

impl Backoff {
    #[inline]
    pub fn linear(limit: usize) -> Self {
        Self::Linear { current: 1, limit }
    }

    #[inline]
    pub fn exponential(limit: usize) -> Self {
        Self::Exponential { current: 1, limit }
    }

    #[inline]
    fn current_limit(&self) -> usize {
        match *self {
            Self::Linear { current, .. } | Self::Exponential { current, .. } => current,
        }
    }

    /// Returns `true` once spinning has been exhausted and every further
    /// [`snooze`](Self::snooze) yields the thread.
    #[inline]
    pub fn is_completed(&self) -> bool {
        match *self {
            Self::Linear { current, limit } | Self::Exponential { current, limit } => {
                current >= limit
            }
        }
    }

    #[inline]
    fn step(&mut self) {
        match self {
            Self::Linear { current, limit } => {
                *current = current.saturating_add(1).min(*limit);
            }
            Self::Exponential { current, limit } => {
                *current = current.saturating_mul(2).min(*limit);
            }
        }
    }

    /// Waits a little.
    ///
    /// Spins `0..=current` times and grows `current`; after the ceiling is hit
    /// the call yields to the scheduler.
    pub fn snooze(&mut self) {
        if self.is_completed() {
            thread::yield_now();
            return;
        }

        let jitter = fastrand::usize(..=self.current_limit());

        for _ in 0..jitter {
            spin_loop();
        }

        self.step();
    }
}

/// Factory for [`Backoff`] states, stored in aggregate configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub policy: BackoffPolicy,
    /// Spin ceiling before the wait degrades to yielding.
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPolicy {
    Linear,
    Exponential,
}

impl BackoffConfig {
    #[must_use]
    pub fn build(&self) -> Backoff {
        match self.policy {
            BackoffPolicy::Linear => Backoff::linear(self.limit),
            BackoffPolicy::Exponential => Backoff::exponential(self.limit),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            policy: BackoffPolicy::Exponential,
            limit: DEFAULT_SPIN_LIMIT,
        }
    }
}
