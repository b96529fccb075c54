//! Bounded moving-average window over performance samples
//!
//! The window capacity is expressed in tasks, not samples. Adding a sample
//! evicts the oldest ones until the new sample fits; an oversized sample is
//! kept alone rather than leaving the window empty.

use crate::balancer::sample::PerformanceSample;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Moving-average statistics for one node channel.
///
/// Single writer per channel; no internal locking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleDataHolder {
    samples: VecDeque<PerformanceSample>,
    total_time: f64,
    sample_count_sum: usize,
    moving_average_length: usize,
    mean: f64,
    previous_mean: f64,
    bundle_size: usize,
}

impl BundleDataHolder {
    /// Create an empty window holding at most `moving_average_length` tasks
    pub fn new(moving_average_length: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            total_time: 0.0,
            sample_count_sum: 0,
            moving_average_length: moving_average_length.max(1),
            mean: 0.0,
            previous_mean: 0.0,
            bundle_size: 1,
        }
    }

    /// Set the mean reported before any sample arrives
    pub fn with_initial_mean(mut self, mean: f64) -> Self {
        self.mean = mean;
        self.previous_mean = mean;
        self
    }

    /// Set the initial bundle size (at least 1)
    pub fn with_bundle_size(mut self, size: usize) -> Self {
        self.bundle_size = size.max(1);
        self
    }

    /// Add a sample, evicting the oldest ones until it fits.
    ///
    /// Returns `true` when the statistics base shifted enough to recompute
    /// the bundle size right away: an eviction happened or the window just
    /// went from empty to non-empty.
    pub fn add_sample(&mut self, sample: PerformanceSample) -> bool {
        let was_empty = self.samples.is_empty();
        let mut evicted = false;

        while !self.samples.is_empty()
            && self.sample_count_sum + sample.sample_count() > self.moving_average_length
        {
            if let Some(oldest) = self.samples.pop_front() {
                self.sample_count_sum -= oldest.sample_count();
                evicted = true;
            }
        }
        if evicted {
            // recompute instead of subtracting to avoid drift
            self.total_time = self.samples.iter().map(PerformanceSample::total_time).sum();
        }

        self.samples.push_back(sample);
        self.total_time += sample.total_time();
        self.sample_count_sum += sample.sample_count();

        self.previous_mean = self.mean;
        if self.sample_count_sum > 0 {
            self.mean = self.total_time / self.sample_count_sum as f64;
        }

        evicted || was_empty
    }

    /// Current mean per-task execution time over the window
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Mean before the most recent sample was added
    pub fn previous_mean(&self) -> f64 {
        self.previous_mean
    }

    /// Current bundle size
    pub fn bundle_size(&self) -> usize {
        self.bundle_size
    }

    /// Replace the current bundle size (at least 1)
    pub fn set_bundle_size(&mut self, size: usize) {
        self.bundle_size = size.max(1);
    }

    /// Total execution time over the window
    pub fn total_time(&self) -> f64 {
        self.total_time
    }

    /// Number of tasks covered by the window
    pub fn sample_count_sum(&self) -> usize {
        self.sample_count_sum
    }

    /// Window capacity in tasks
    pub fn moving_average_length(&self) -> usize {
        self.moving_average_length
    }

    /// Number of samples held
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether no sample has been retained yet
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Retained samples, oldest first
    pub fn samples(&self) -> impl Iterator<Item = &PerformanceSample> {
        self.samples.iter()
    }
}
