//! Immutable histogram summaries.
//!
//! The representation is chosen once per histogram:
//!
//! - [`FullSnapshot`] keeps every distinct recorded value with its count and
//!   answers any quantile exactly (to histogram precision). Memory grows with
//!   the number of distinct values.
//! - [`SmartSnapshot`] keeps only a fixed list of predeclared percentiles
//!   plus the summary statistics. A query for an undeclared quantile rounds
//!   *up* to the nearest declared one, and a query above the highest declared
//!   percentile returns the maximum.

use hdrhistogram::Histogram;
use smallvec::SmallVec;

/// Percentiles captured by smart snapshots unless configured otherwise.
pub const DEFAULT_PERCENTILES: [f64; 7] = [0.5, 0.75, 0.9, 0.95, 0.98, 0.99, 0.999];

pub(crate) type Percentiles = SmallVec<[f64; 8]>;

/// Which snapshot representation a histogram produces.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SnapshotKind {
    Full,
    /// Sorted, deduplicated quantiles in `[0, 1]`.
    Smart(Percentiles),
}

/// Summary statistics shared by both representations.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Summary {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub stddev: f64,
}

impl Summary {
    fn of(histogram: &Histogram<u64>) -> Self {
        if histogram.is_empty() {
            return Self::default();
        }

        Self {
            count: histogram.len(),
            min: histogram.min(),
            max: histogram.max(),
            mean: histogram.mean(),
            stddev: histogram.stdev(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FullSnapshot {
    summary: Summary,
    /// Distinct values in ascending order, paired with `counts`.
    values: Vec<u64>,
    counts: Vec<u64>,
}

impl FullSnapshot {
    fn capture(histogram: &Histogram<u64>) -> Self {
        let (values, counts) = histogram
            .iter_recorded()
            .map(|step| (step.value_iterated_to(), step.count_at_value()))
            .unzip();

        Self {
            summary: Summary::of(histogram),
            values,
            counts,
        }
    }

    /// Recorded values and their counts, ascending by value.
    pub fn values(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.values.iter().copied().zip(self.counts.iter().copied())
    }

    fn value_at_quantile(&self, quantile: f64) -> u64 {
        let count = self.summary.count;
        if count == 0 {
            return 0;
        }

        let quantile = quantile.clamp(0.0, 1.0);
        let rank = ((quantile * count as f64).ceil() as u64).clamp(1, count);

        let mut seen = 0;
        for (value, value_count) in self.values() {
            seen += value_count;
            if seen >= rank {
                return value;
            }
        }

        self.summary.max
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmartSnapshot {
    summary: Summary,
    percentiles: Percentiles,
    values: SmallVec<[u64; 8]>,
}

impl SmartSnapshot {
    fn capture(histogram: &Histogram<u64>, percentiles: &Percentiles) -> Self {
        let values = percentiles
            .iter()
            .map(|&p| {
                if histogram.is_empty() {
                    0
                } else {
                    histogram.value_at_quantile(p)
                }
            })
            .collect();

        Self {
            summary: Summary::of(histogram),
            percentiles: percentiles.clone(),
            values,
        }
    }

    /// The declared percentiles with their captured values.
    pub fn percentiles(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
        self.percentiles.iter().copied().zip(self.values.iter().copied())
    }

    fn value_at_quantile(&self, quantile: f64) -> u64 {
        match self.percentiles.iter().position(|&declared| declared >= quantile) {
            Some(index) => self.values[index],
            None => self.summary.max,
        }
    }
}

/// A point-in-time view of a rolling histogram.
#[derive(Debug, Clone, PartialEq)]
pub enum HistogramSnapshot {
    Full(FullSnapshot),
    Smart(SmartSnapshot),
}

impl HistogramSnapshot {
    pub(crate) fn capture(histogram: &Histogram<u64>, kind: &SnapshotKind) -> Self {
        match kind {
            SnapshotKind::Full => Self::Full(FullSnapshot::capture(histogram)),
            SnapshotKind::Smart(percentiles) => {
                Self::Smart(SmartSnapshot::capture(histogram, percentiles))
            }
        }
    }

    #[inline]
    pub fn summary(&self) -> &Summary {
        match self {
            Self::Full(full) => &full.summary,
            Self::Smart(smart) => &smart.summary,
        }
    }

    pub fn count(&self) -> u64 {
        self.summary().count
    }

    pub fn min(&self) -> u64 {
        self.summary().min
    }

    pub fn max(&self) -> u64 {
        self.summary().max
    }

    pub fn mean(&self) -> f64 {
        self.summary().mean
    }

    pub fn stddev(&self) -> f64 {
        self.summary().stddev
    }

    /// Value at `quantile` in `[0, 1]`; `0` for an empty snapshot.
    pub fn value_at_quantile(&self, quantile: f64) -> u64 {
        match self {
            Self::Full(full) => full.value_at_quantile(quantile),
            Self::Smart(smart) => smart.value_at_quantile(quantile),
        }
    }

    pub fn median(&self) -> u64 {
        self.value_at_quantile(0.5)
    }

    pub fn p75(&self) -> u64 {
        self.value_at_quantile(0.75)
    }

    pub fn p95(&self) -> u64 {
        self.value_at_quantile(0.95)
    }

    pub fn p98(&self) -> u64 {
        self.value_at_quantile(0.98)
    }

    pub fn p99(&self) -> u64 {
        self.value_at_quantile(0.99)
    }

    pub fn p999(&self) -> u64 {
        self.value_at_quantile(0.999)
    }
}
