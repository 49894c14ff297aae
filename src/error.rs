//! Construction-time errors.
//!
//! Every aggregate validates its configuration in `build()` and fails fast
//! with one of these variants. Recording paths never return errors, with the
//! single exception of [`HitRatio::update`](crate::HitRatio::update) whose
//! `hits <= total` contract is checked per call.

use std::time::Duration;

use thiserror::Error;

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported while configuring or feeding an aggregate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A duration argument was zero.
    #[error("{name} must be positive")]
    NonPositiveDuration {
        /// Name of the offending argument.
        name: &'static str,
    },

    /// The number of chunks is outside `1..=max`.
    #[error("number of chunks must be in 1..={max}, got {chunks}")]
    ChunkCount {
        /// Requested number of chunks.
        chunks: usize,
        /// Largest accepted number of chunks.
        max: usize,
    },

    /// Splitting the rolling window produced chunks that are too short.
    #[error("chunk duration {chunk:?} is shorter than the minimum {min:?}")]
    ChunkTooShort {
        /// Resulting chunk duration.
        chunk: Duration,
        /// Smallest accepted chunk duration.
        min: Duration,
    },

    /// Too many archived history chunks were requested.
    #[error("history chunks must not exceed {max}, got {history}")]
    HistoryTooLong {
        /// Requested number of history chunks.
        history: usize,
        /// Largest accepted number of history chunks.
        max: usize,
    },

    /// History chunks only make sense for chunked retention.
    #[error("history chunks require reset-periodically-by-chunks retention")]
    HistoryWithoutChunks,

    /// The predefined percentile list is empty.
    #[error("predefined percentile list must not be empty")]
    EmptyPercentiles,

    /// A predefined percentile is not a finite value within `[0, 1]`.
    #[error("percentile {0} must be within [0, 1]")]
    InvalidPercentile(f64),

    /// The histogram bounds or precision were rejected.
    #[error("invalid histogram configuration: {0}")]
    Histogram(#[from] hdrhistogram::CreationError),

    /// The ranking size is outside `1..=max`.
    #[error("ranking size must be in 1..={max}, got {size}")]
    RankingSize {
        /// Requested ranking size.
        size: usize,
        /// Largest accepted ranking size.
        max: usize,
    },

    /// The description length limit is too small to be useful.
    #[error("max description length must be at least {min}, got {length}")]
    DescriptionLength {
        /// Requested limit.
        length: usize,
        /// Smallest accepted limit.
        min: usize,
    },

    /// A hit-ratio observation violated `0 <= hits <= total`, `total >= 1`.
    #[error("invalid hit ratio observation: {hits} hits out of {total}")]
    InvalidHitRatio {
        /// Reported hits.
        hits: u32,
        /// Reported total.
        total: u32,
    },

    /// The background worker thread could not be started.
    #[error("failed to spawn background worker: {0}")]
    Spawn(#[from] std::io::Error),
}
