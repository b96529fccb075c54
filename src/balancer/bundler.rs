//! The bundler abstraction
//!
//! A bundler decides how many tasks to send to one node at a time. Every
//! node channel owns its own bundler, obtained with [`Bundler::copy`] from a
//! configured prototype.

use crate::balancer::context::{GridContext, DEFAULT_MAX_BUNDLE_SIZE};
use crate::balancer::data_holder::BundleDataHolder;
use crate::balancer::persistence::BundlerState;
use crate::balancer::profile::LoadBalancingProfile;
use crate::core::types::NodeInfo;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static BUNDLER_COUNT: AtomicU64 = AtomicU64::new(0);

/// Next diagnostic sequence number for a bundler
pub fn next_bundler_number() -> u64 {
    BUNDLER_COUNT.fetch_add(1, Ordering::Relaxed) + 1
}

/// Strategy computing the next bundle size for one node
pub trait Bundler: Send + Sync + fmt::Debug {
    /// Name of the algorithm
    fn algorithm(&self) -> &'static str;

    /// Recommended number of tasks for the next dispatch, within `[1, max_size()]`
    fn bundle_size(&self) -> usize;

    /// Apply the statistics of a completed dispatch of `sample_count` tasks
    /// that took `total_time` nanoseconds in total
    fn feedback(&mut self, sample_count: usize, total_time: f64);

    /// Independent bundler with the same profile and current size, for another channel
    fn copy(&self) -> Box<dyn Bundler>;

    /// Current ceiling, [`DEFAULT_MAX_BUNDLE_SIZE`] without a context
    fn max_size(&self) -> usize;

    /// Profile this bundler was built from
    fn profile(&self) -> LoadBalancingProfile;

    /// Diagnostic sequence number
    fn bundler_number(&self) -> u64;

    /// Called when the bundler is attached to a channel
    fn setup(&mut self) {}

    /// Called when the bundler is released with its channel
    fn dispose(&mut self) {}

    /// Called when the node reports its capabilities
    fn on_node_info(&mut self, _info: &NodeInfo) {}

    /// Moving-average statistics, for bundlers that keep them
    fn data_holder(&self) -> Option<&BundleDataHolder> {
        None
    }

    /// What the bundler learned about its node, for bundlers that learn
    fn state(&self) -> Option<BundlerState> {
        None
    }

    /// Resume from a stored state. Returns `false`, leaving the bundler
    /// untouched, when the state belongs to another algorithm.
    fn restore(&mut self, _state: BundlerState) -> bool {
        false
    }

    /// Serializable view of the bundler state
    fn snapshot(&self) -> BundlerSnapshot {
        let holder = self.data_holder();
        BundlerSnapshot {
            algorithm: self.algorithm().to_string(),
            bundler_number: self.bundler_number(),
            bundle_size: self.bundle_size(),
            max_size: self.max_size(),
            mean_time: holder.filter(|h| !h.is_empty()).map(BundleDataHolder::mean),
            window_tasks: holder.map(BundleDataHolder::sample_count_sum).unwrap_or(0),
        }
    }
}

/// Point-in-time statistics of a bundler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundlerSnapshot {
    /// Algorithm name
    pub algorithm: String,
    /// Diagnostic sequence number
    pub bundler_number: u64,
    /// Current bundle size
    pub bundle_size: usize,
    /// Current ceiling
    pub max_size: usize,
    /// Windowed mean time, once a sample was received
    pub mean_time: Option<f64>,
    /// Tasks covered by the window
    pub window_tasks: usize,
}

/// State every bundler carries: its number and an optional context
#[derive(Debug, Clone)]
pub(crate) struct BundlerBase {
    pub(crate) number: u64,
    context: Option<Arc<dyn GridContext>>,
}

impl BundlerBase {
    pub(crate) fn new(context: Option<Arc<dyn GridContext>>) -> Self {
        Self {
            number: next_bundler_number(),
            context,
        }
    }

    /// Fresh number, same context
    pub(crate) fn renumbered(&self) -> Self {
        Self::new(self.context.clone())
    }

    pub(crate) fn max_size(&self) -> usize {
        self.context
            .as_ref()
            .map(|c| c.max_bundle_size())
            .unwrap_or(DEFAULT_MAX_BUNDLE_SIZE)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::context::DriverContext;

    #[test]
    fn test_bundler_numbers_are_unique() {
        let a = next_bundler_number();
        let b = next_bundler_number();
        assert!(b > a);
    }

    #[test]
    fn test_base_max_size() {
        let base = BundlerBase::new(None);
        assert_eq!(base.max_size(), DEFAULT_MAX_BUNDLE_SIZE);

        let context = Arc::new(DriverContext::new(17));
        let base = BundlerBase::new(Some(context.clone()));
        let copy = base.renumbered();
        context.set_max_bundle_size(9);
        assert_eq!(copy.max_size(), 9);
        assert_ne!(copy.number, base.number);
    }
}
