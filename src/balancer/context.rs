//! Shared state consulted by bundlers
//!
//! The driver context publishes the system-wide bundle size ceiling. The
//! performance board holds the current mean time of every proportional
//! bundler, so each one can normalize its share across all nodes.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Ceiling applied when no context is attached
pub const DEFAULT_MAX_BUNDLE_SIZE: usize = 300;

/// Source of cross-node bounds for bundlers
pub trait GridContext: Send + Sync + fmt::Debug {
    /// System-wide maximum bundle size, never below 1
    fn max_bundle_size(&self) -> usize;
}

/// Driver-side context whose ceiling the dispatch layer updates
#[derive(Debug)]
pub struct DriverContext {
    max_bundle_size: AtomicUsize,
}

impl DriverContext {
    /// Context with the given ceiling
    pub fn new(max_bundle_size: usize) -> Self {
        Self {
            max_bundle_size: AtomicUsize::new(max_bundle_size.max(1)),
        }
    }

    /// Publish a new ceiling (at least 1)
    pub fn set_max_bundle_size(&self, size: usize) {
        self.max_bundle_size.store(size.max(1), Ordering::Release);
    }
}

impl Default for DriverContext {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUNDLE_SIZE)
    }
}

impl GridContext for DriverContext {
    fn max_bundle_size(&self) -> usize {
        self.max_bundle_size.load(Ordering::Acquire)
    }
}

/// Latest mean execution time of every registered bundler, keyed by bundler number.
///
/// Readers tolerate slightly stale entries from other channels.
#[derive(Debug, Default)]
pub struct PerformanceBoard {
    means: DashMap<u64, f64>,
}

impl PerformanceBoard {
    /// Empty board
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a bundler's mean
    pub fn publish(&self, bundler_number: u64, mean: f64) {
        self.means.insert(bundler_number, mean);
    }

    /// Remove a bundler's entry
    pub fn withdraw(&self, bundler_number: u64) {
        self.means.remove(&bundler_number);
    }

    /// Whether a bundler is registered
    pub fn contains(&self, bundler_number: u64) -> bool {
        self.means.contains_key(&bundler_number)
    }

    /// Number of registered bundlers
    pub fn len(&self) -> usize {
        self.means.len()
    }

    /// Whether no bundler is registered
    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }

    /// Sum of `(mean / mean_j)^k` over every other registered bundler `j`.
    /// Two zero means count as equal performance.
    pub fn relative_weight_of_others(&self, bundler_number: u64, mean: f64, k: f64) -> f64 {
        self.means
            .iter()
            .filter(|entry| *entry.key() != bundler_number)
            .map(|entry| {
                let other = *entry.value();
                if mean == 0.0 && other == 0.0 {
                    1.0
                } else {
                    (mean / other).powf(k)
                }
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_context_never_below_one() {
        let context = DriverContext::new(0);
        assert_eq!(context.max_bundle_size(), 1);
        context.set_max_bundle_size(42);
        assert_eq!(context.max_bundle_size(), 42);
        context.set_max_bundle_size(0);
        assert_eq!(context.max_bundle_size(), 1);
    }

    #[test]
    fn test_board_relative_weights() {
        let board = PerformanceBoard::new();
        board.publish(1, 10.0);
        board.publish(2, 20.0);
        board.publish(3, 5.0);

        // (10/20)^2 + (10/5)^2 = 0.25 + 4
        assert_eq!(board.relative_weight_of_others(1, 10.0, 2.0), 4.25);

        board.withdraw(3);
        assert_eq!(board.len(), 2);
        assert!(!board.contains(3));
        assert_eq!(board.relative_weight_of_others(1, 10.0, 2.0), 0.25);
    }

    #[test]
    fn test_board_zero_means_weigh_as_equals() {
        let board = PerformanceBoard::new();
        board.publish(1, 0.0);
        board.publish(2, 0.0);
        board.publish(3, 4.0);

        // 1 for the other zero mean, (0/4)^2 for the non-zero one
        assert_eq!(board.relative_weight_of_others(1, 0.0, 2.0), 1.0);
        assert!(board.relative_weight_of_others(3, 4.0, 2.0).is_infinite());
    }
}
