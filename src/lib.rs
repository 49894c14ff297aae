//! Rolling time-window aggregates for hot concurrent paths.
//!
//! Four kinds of aggregate share one set of retention policies:
//!
//! | aggregate        | write                         | read                                  |
//! |------------------|-------------------------------|---------------------------------------|
//! | [`Counter`]      | [`add`](WindowCounter::add)   | [`sum`](WindowCounter::sum)           |
//! | [`HitRatio`]     | [`update`](WindowHitRatio::update) | [`hit_ratio`](WindowHitRatio::hit_ratio) |
//! | [`RollingHistogram`] | [`update`](RollingHistogram::update) | [`snapshot`](RollingHistogram::snapshot) |
//! | [`Ranking`]      | [`update`](Ranking::update)   | [`descending_ranking`](Ranking::descending_ranking) |
//!
//! Writers never block on readers. Readers of one aggregate are serialized
//! among themselves where a read has to drain or merge state.
//!
//! ```
//! use std::time::Duration;
//! use rolling_aggregates::{Counter, Retention, WindowCounter};
//!
//! let requests = Counter::new(Retention::ResetPeriodicallyByChunks {
//!     rolling_window: Duration::from_secs(60),
//!     chunks: 10,
//! })
//! .unwrap();
//!
//! requests.add(1);
//! assert_eq!(requests.sum(), 1);
//! ```
//!
//! Time comes from a [`Clock`]; tests can substitute a [`ManualClock`].

mod cache;
mod clock;
mod core;
mod counter;
mod error;
mod executor;
mod histogram;
mod ratio;
mod retention;
mod top;

pub use crate::cache::SnapshotCache;
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::core::backoff::{Backoff, BackoffConfig, BackoffPolicy, DEFAULT_SPIN_LIMIT};
pub use crate::counter::{
    ChunkedCounter, Counter, ResetOnSnapshotCounter, UniformCounter, WindowCounter,
};
pub use crate::error::{Error, Result};
pub use crate::executor::{BackgroundExecutor, Executor, InlineExecutor, Task};
pub use crate::histogram::{
    FullSnapshot, HistogramConfig, HistogramSnapshot, OverflowPolicy, RollingHistogram,
    SmartSnapshot, Summary, DEFAULT_PERCENTILES, DEFAULT_SIGNIFICANT_DIGITS, DEFAULT_STRIPES,
};
pub use crate::ratio::{
    ChunkedHitRatio, HitRatio, ResetOnSnapshotHitRatio, UniformHitRatio, WindowHitRatio,
};
pub use crate::retention::{Retention, MAX_CHUNKS, MAX_HISTORY_CHUNKS, MIN_CHUNK_DURATION};
pub use crate::top::{
    Position, Ranking, TopConfig, DEFAULT_DESCRIPTION_LENGTH, MAX_RANKING_SIZE,
    MIN_DESCRIPTION_LENGTH,
};
