//! Performance samples reported by nodes

use serde::{Deserialize, Serialize};

/// Execution statistics of one completed dispatch on one node.
///
/// Immutable once built: the number of tasks covered and their average
/// per-task execution time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    sample_count: usize,
    mean_time: f64,
}

impl PerformanceSample {
    /// Build a sample; `None` when the count is zero or the mean is negative or not finite
    pub fn new(sample_count: usize, mean_time: f64) -> Option<Self> {
        if sample_count == 0 || !mean_time.is_finite() || mean_time < 0.0 {
            return None;
        }
        Some(Self {
            sample_count,
            mean_time,
        })
    }

    /// Build a sample from the total execution time of `sample_count` tasks
    pub fn from_total(sample_count: usize, total_time: f64) -> Option<Self> {
        if sample_count == 0 {
            return None;
        }
        Self::new(sample_count, total_time / sample_count as f64)
    }

    /// Number of tasks covered by this sample
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Mean per-task execution time
    pub fn mean_time(&self) -> f64 {
        self.mean_time
    }

    /// Total execution time of the covered tasks
    pub fn total_time(&self) -> f64 {
        self.mean_time * self.sample_count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_degenerate_samples() {
        assert!(PerformanceSample::new(0, 1.0).is_none());
        assert!(PerformanceSample::new(3, f64::NAN).is_none());
        assert!(PerformanceSample::new(3, -1.0).is_none());
        assert!(PerformanceSample::from_total(0, 10.0).is_none());
    }

    #[test]
    fn test_from_total() {
        let sample = PerformanceSample::from_total(4, 10.0).unwrap();
        assert_eq!(sample.sample_count(), 4);
        assert_eq!(sample.mean_time(), 2.5);
        assert_eq!(sample.total_time(), 10.0);
    }
}
