//! Proportional bundler
//!
//! Each node receives a share of the ceiling proportional to `(1/mean)^k`,
//! normalized over every registered proportional bundler. Faster nodes get
//! more tasks; `k` sharpens the skew. Shares are computed when read, from the
//! latest means on the shared board.

use crate::balancer::bundler::{Bundler, BundlerBase};
use crate::balancer::context::{GridContext, PerformanceBoard};
use crate::balancer::data_holder::BundleDataHolder;
use crate::balancer::persistence::BundlerState;
use crate::balancer::profile::{LoadBalancingProfile, ProportionalProfile};
use crate::balancer::sample::PerformanceSample;
use crate::core::utils::clamp_size;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Bundler sizing its node relative to all other nodes
#[derive(Debug)]
pub struct ProportionalBundler {
    base: BundlerBase,
    profile: ProportionalProfile,
    board: Arc<PerformanceBoard>,
    data_holder: BundleDataHolder,
    last_good_size: AtomicUsize,
    registered: bool,
}

impl ProportionalBundler {
    /// Create a bundler publishing its statistics on `board`
    pub fn new(
        profile: ProportionalProfile,
        board: Arc<PerformanceBoard>,
        context: Option<Arc<dyn GridContext>>,
    ) -> Self {
        let initial_size = profile.initial_size;
        Self::with_initial_size(profile, board, BundlerBase::new(context), initial_size)
    }

    fn with_initial_size(
        profile: ProportionalProfile,
        board: Arc<PerformanceBoard>,
        base: BundlerBase,
        initial_size: usize,
    ) -> Self {
        let data_holder = BundleDataHolder::new(profile.performance_cache_size)
            .with_initial_mean(profile.initial_mean_time)
            .with_bundle_size(initial_size);
        Self {
            base,
            board,
            last_good_size: AtomicUsize::new(data_holder.bundle_size()),
            data_holder,
            profile,
            registered: false,
        }
    }

    fn fallback_size(&self, max: usize) -> usize {
        clamp_size(self.last_good_size.load(Ordering::Relaxed), max)
    }

    /// Share of the ceiling for this node, `None` when the statistics are degenerate
    fn proportional_size(&self, max: usize) -> Option<usize> {
        let mean = self.data_holder.mean();
        let k = self.profile.proportionality_factor;
        // own term is (mean/mean)^k = 1
        let weight = 1.0 + self.board.relative_weight_of_others(self.base.number, mean, k);
        let raw = max as f64 / weight;
        if !raw.is_finite() || raw <= 0.0 {
            return None;
        }
        Some(clamp_size(raw.round() as usize, max))
    }
}

impl Bundler for ProportionalBundler {
    fn algorithm(&self) -> &'static str {
        "proportional"
    }

    fn bundle_size(&self) -> usize {
        let max = self.max_size();
        if self.data_holder.is_empty() {
            return self.fallback_size(max);
        }
        match self.proportional_size(max) {
            Some(size) => {
                self.last_good_size.store(size, Ordering::Relaxed);
                size
            }
            None => self.fallback_size(max),
        }
    }

    fn feedback(&mut self, sample_count: usize, total_time: f64) {
        let Some(sample) = PerformanceSample::from_total(sample_count, total_time) else {
            return;
        };
        self.data_holder.add_sample(sample);
        if self.registered {
            self.board.publish(self.base.number, self.data_holder.mean());
        }
        debug!(
            "Bundler#{}: mean={:.3}, window={} tasks",
            self.base.number,
            self.data_holder.mean(),
            self.data_holder.sample_count_sum()
        );
    }

    fn copy(&self) -> Box<dyn Bundler> {
        Box::new(Self::with_initial_size(
            self.profile.clone(),
            self.board.clone(),
            self.base.renumbered(),
            self.bundle_size(),
        ))
    }

    fn max_size(&self) -> usize {
        self.base.max_size()
    }

    fn profile(&self) -> LoadBalancingProfile {
        LoadBalancingProfile::Proportional(self.profile.clone())
    }

    fn bundler_number(&self) -> u64 {
        self.base.number
    }

    fn setup(&mut self) {
        self.board.publish(self.base.number, self.data_holder.mean());
        self.registered = true;
    }

    fn dispose(&mut self) {
        self.board.withdraw(self.base.number);
        self.registered = false;
    }

    fn data_holder(&self) -> Option<&BundleDataHolder> {
        Some(&self.data_holder)
    }

    fn state(&self) -> Option<BundlerState> {
        Some(BundlerState::Proportional {
            bundle_size: self.last_good_size.load(Ordering::Relaxed),
            data_holder: self.data_holder.clone(),
        })
    }

    fn restore(&mut self, state: BundlerState) -> bool {
        let BundlerState::Proportional {
            bundle_size,
            data_holder,
        } = state
        else {
            return false;
        };
        self.data_holder = data_holder;
        self.last_good_size.store(bundle_size.max(1), Ordering::Relaxed);
        if self.registered {
            self.board.publish(self.base.number, self.data_holder.mean());
        }
        true
    }
}

impl Drop for ProportionalBundler {
    fn drop(&mut self) {
        if self.registered {
            self.board.withdraw(self.base.number);
        }
    }
}
