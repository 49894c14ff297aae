//! Retention policies.
//!
//! A [`Retention`] decides when recorded data stops counting. It is chosen
//! once per aggregate and validated at construction.

use std::time::Duration;

use crate::core::ring::RingLayout;
use crate::error::{Error, Result};

/// Largest number of chunks a rolling window can be split into.
pub const MAX_CHUNKS: usize = 1000;

/// Shortest chunk a rolling window may be split into.
pub const MIN_CHUNK_DURATION: Duration = Duration::from_millis(100);

/// Largest number of archived chunks a rolling histogram may keep.
pub const MAX_HISTORY_CHUNKS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Retention {
    /// Data is never discarded.
    #[default]
    Uniform,
    /// Every read consumes what was recorded since the previous read.
    ResetOnSnapshot,
    /// All data is discarded at once when each period ends.
    ResetPeriodically(Duration),
    /// The rolling window is split into `chunks` slices that expire one at a
    /// time, so at most `1 / chunks` of the window is discarded at once.
    ResetPeriodicallyByChunks {
        rolling_window: Duration,
        chunks: usize,
    },
}

/// How chunked retention treats the oldest live chunk on reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decay {
    /// The oldest chunk fades out linearly; the ring carries one extra slot.
    Smooth,
    /// Chunks count in full until they expire.
    Discrete,
}

/// A validated retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Plan {
    Uniform,
    ResetOnSnapshot,
    Ring(RingLayout),
}

impl Retention {
    /// Checks the policy against the crate limits.
    pub fn validate(&self) -> Result<()> {
        self.plan(Decay::Smooth).map(|_| ())
    }

    /// Number of chunks for chunked retention.
    pub fn chunks(&self) -> Option<usize> {
        match *self {
            Self::ResetPeriodicallyByChunks { chunks, .. } => Some(chunks),
            _ => None,
        }
    }

    pub(crate) fn plan(&self, decay: Decay) -> Result<Plan> {
        match *self {
            Self::Uniform => Ok(Plan::Uniform),
            Self::ResetOnSnapshot => Ok(Plan::ResetOnSnapshot),
            Self::ResetPeriodically(period) => {
                let period = checked_chunk(period, "reset period")?;
                Ok(Plan::Ring(RingLayout::periodic(millis(period))))
            }
            Self::ResetPeriodicallyByChunks {
                rolling_window,
                chunks,
            } => {
                if rolling_window.is_zero() {
                    return Err(Error::NonPositiveDuration {
                        name: "rolling window",
                    });
                }
                if chunks == 0 || chunks > MAX_CHUNKS {
                    return Err(Error::ChunkCount {
                        chunks,
                        max: MAX_CHUNKS,
                    });
                }

                // `chunks <= MAX_CHUNKS` fits in u32.
                let chunk = checked_chunk(rolling_window / chunks as u32, "chunk duration")?;
                let chunk_millis = millis(chunk);

                Ok(Plan::Ring(match decay {
                    Decay::Smooth => RingLayout::smooth(chunk_millis, chunks),
                    Decay::Discrete => RingLayout::discrete(chunk_millis, chunks),
                }))
            }
        }
    }
}

fn checked_chunk(chunk: Duration, name: &'static str) -> Result<Duration> {
    if chunk.is_zero() {
        return Err(Error::NonPositiveDuration { name });
    }
    if chunk < MIN_CHUNK_DURATION {
        return Err(Error::ChunkTooShort {
            chunk,
            min: MIN_CHUNK_DURATION,
        });
    }
    Ok(chunk)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
