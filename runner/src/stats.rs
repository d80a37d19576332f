//! Summary statistics over the samples of one metric stream
use serde::{Deserialize, Serialize};

/// Percentile ranks that are reported for every stream
pub const RANKS: [f64; 5] = [0.50, 0.75, 0.90, 0.95, 0.99];

/// Reduced form of a sample stream, every value is truncated to two decimals
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Growing stream of samples with a running total
#[derive(Debug, Clone, Default)]
pub struct SampleSeries {
    values: Vec<f64>,
    total: f64,
}

impl SampleSeries {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
            total: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.values.push(value);
        self.total += value;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// samples in capture order
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// # Panics
    /// if the series is empty
    pub fn summary(&self) -> Summary {
        summarize_with_total(&self.values, self.total)
    }
}

/// Drop everything after the second decimal, `3.14159` becomes `3.14` and never `3.15`
pub fn truncate(value: f64) -> f64 {
    (value * 100.0).trunc() / 100.0
}

/// Nearest rank percentile on an ascending sorted slice, index `floor(len * rank)`
fn percentile(sorted: &[f64], rank: f64) -> f64 {
    let index = (sorted.len() as f64 * rank) as usize;

    sorted[index.min(sorted.len() - 1)]
}

/// Summarize a non-empty set of samples, the input order is irrelevant and left untouched
///
/// # Panics
/// if `samples` is empty
pub fn summarize(samples: &[f64]) -> Summary {
    summarize_with_total(samples, samples.iter().sum())
}

fn summarize_with_total(samples: &[f64], total: f64) -> Summary {
    assert!(!samples.is_empty(), "cannot summarize an empty sample set");

    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);

    let [p50, p75, p90, p95, p99] = RANKS.map(|rank| truncate(percentile(&sorted, rank)));

    Summary {
        min: truncate(sorted[0]),
        max: truncate(sorted[sorted.len() - 1]),
        mean: truncate(total / samples.len() as f64),
        p50,
        p75,
        p90,
        p95,
        p99,
    }
}
