//! Step-search bundler
//!
//! Moves the bundle size by an "action" after each feedback, depending on how
//! the windowed mean time evolved: a rising mean grows the action by one step
//! in its current direction, a falling mean reverses and halves it.

use crate::balancer::bundler::{Bundler, BundlerBase};
use crate::balancer::context::{GridContext, PerformanceBoard};
use crate::balancer::data_holder::BundleDataHolder;
use crate::balancer::persistence::BundlerState;
use crate::balancer::profile::{LoadBalancingProfile, RlProfile};
use crate::balancer::sample::PerformanceSample;
use crate::core::utils::clamp_size;
use std::sync::Arc;
use tracing::debug;

const STEP: i64 = 1;

/// Bundler performing a bounded step search on the moving mean
#[derive(Debug)]
pub struct RlBundler {
    base: BundlerBase,
    profile: RlProfile,
    board: Arc<PerformanceBoard>,
    data_holder: BundleDataHolder,
    action: i64,
    bundle_size: usize,
    registered: bool,
}

impl RlBundler {
    /// Create a bundler starting at size 1
    pub fn new(
        profile: RlProfile,
        board: Arc<PerformanceBoard>,
        context: Option<Arc<dyn GridContext>>,
    ) -> Self {
        Self::with_size(profile, board, BundlerBase::new(context), 1)
    }

    fn with_size(
        profile: RlProfile,
        board: Arc<PerformanceBoard>,
        base: BundlerBase,
        bundle_size: usize,
    ) -> Self {
        Self {
            base,
            data_holder: BundleDataHolder::new(profile.performance_cache_size),
            action: profile.max_action_range as i64,
            bundle_size: bundle_size.max(1),
            profile,
            board,
            registered: false,
        }
    }

    /// Last applied action
    pub fn action(&self) -> i64 {
        self.action
    }

    fn next_action(&self) -> i64 {
        let previous = self.data_holder.previous_mean();
        let d = previous - self.data_holder.mean();
        let variation = if previous > 0.0 {
            d.abs() / previous
        } else if d != 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let mut action = self.action;
        if variation > self.profile.performance_variation_threshold {
            let direction = if action < 0 { -1 } else { 1 };
            if d < 0.0 {
                action += direction * STEP;
            } else if d > 0.0 {
                action = -direction * STEP.max(action.abs() / 2);
            }
        }
        let range = self.profile.max_action_range as i64;
        action.clamp(-range, range)
    }
}

impl Bundler for RlBundler {
    fn algorithm(&self) -> &'static str {
        "rl"
    }

    fn bundle_size(&self) -> usize {
        clamp_size(self.bundle_size, self.max_size())
    }

    fn feedback(&mut self, sample_count: usize, total_time: f64) {
        let Some(sample) = PerformanceSample::from_total(sample_count, total_time) else {
            return;
        };
        self.data_holder.add_sample(sample);
        if self.registered {
            self.board.publish(self.base.number, self.data_holder.mean());
        }

        self.action = self.next_action();
        let next = (self.bundle_size as i64 + self.action).max(1) as usize;
        self.bundle_size = clamp_size(next, self.max_size());
        self.data_holder.set_bundle_size(self.bundle_size);

        debug!(
            "Bundler#{}: size={}, action={}, mean={:.3}",
            self.base.number, self.bundle_size, self.action, self.data_holder.mean()
        );
    }

    fn copy(&self) -> Box<dyn Bundler> {
        Box::new(Self::with_size(
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
        LoadBalancingProfile::Rl(self.profile.clone())
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
        Some(BundlerState::Rl {
            bundle_size: self.bundle_size,
            action: self.action,
            data_holder: self.data_holder.clone(),
        })
    }

    fn restore(&mut self, state: BundlerState) -> bool {
        let BundlerState::Rl {
            bundle_size,
            action,
            data_holder,
        } = state
        else {
            return false;
        };
        let range = self.profile.max_action_range as i64;
        self.bundle_size = bundle_size.max(1);
        self.action = action.clamp(-range, range);
        self.data_holder = data_holder;
        if self.registered {
            self.board.publish(self.base.number, self.data_holder.mean());
        }
        true
    }
}

impl Drop for RlBundler {
    fn drop(&mut self) {
        if self.registered {
            self.board.withdraw(self.base.number);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::context::DriverContext;

    fn bundler(context: Option<Arc<dyn GridContext>>) -> RlBundler {
        // a one-task window makes the mean follow the latest sample
        let profile = RlProfile {
            performance_cache_size: 1,
            performance_variation_threshold: 0.0001,
            max_action_range: 10,
        };
        RlBundler::new(profile, Arc::new(PerformanceBoard::new()), context)
    }

    #[test]
    fn test_step_search_sequence() {
        let mut b = bundler(None);
        assert_eq!(b.bundle_size(), 1);

        b.feedback(5, 50.0); // first mean: moves by the full range
        assert_eq!((b.action(), b.bundle_size()), (10, 11));

        b.feedback(5, 50.0); // unchanged mean keeps the action
        assert_eq!((b.action(), b.bundle_size()), (10, 21));

        b.feedback(5, 100.0); // slower: one more step, capped at the range
        assert_eq!((b.action(), b.bundle_size()), (10, 31));

        b.feedback(5, 50.0); // faster: reverse and halve
        assert_eq!((b.action(), b.bundle_size()), (-5, 26));

        b.feedback(5, 25.0); // faster again: reverse and halve
        assert_eq!((b.action(), b.bundle_size()), (2, 28));
    }

    #[test]
    fn test_size_stays_within_bounds() {
        let context = Arc::new(DriverContext::new(15));
        let mut b = bundler(Some(context));
        for i in 0..50 {
            b.feedback(3, if i % 3 == 0 { 90.0 } else { 30.0 });
            assert!(b.bundle_size() >= 1 && b.bundle_size() <= 15);
        }
    }

    #[test]
    fn test_restore_continues_the_search() {
        let mut b = bundler(None);
        b.feedback(5, 50.0);
        b.feedback(5, 50.0);
        let state = b.state().unwrap();

        let mut resumed = bundler(None);
        assert!(resumed.restore(state));
        assert_eq!((resumed.action(), resumed.bundle_size()), (10, 21));

        // same next step as the original would take
        b.feedback(5, 100.0);
        resumed.feedback(5, 100.0);
        assert_eq!((resumed.action(), resumed.bundle_size()), (b.action(), b.bundle_size()));
    }

    #[test]
    fn test_zero_count_feedback_is_ignored() {
        let mut b = bundler(None);
        b.feedback(0, 10.0);
        assert_eq!(b.bundle_size(), 1);
        assert!(b.data_holder().unwrap().is_empty());
    }
}
