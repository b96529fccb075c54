//! Fixed-size bundler

use crate::balancer::bundler::{Bundler, BundlerBase};
use crate::balancer::context::GridContext;
use crate::balancer::profile::{FixedSizeProfile, LoadBalancingProfile};
use crate::core::utils::clamp_size;
use std::sync::Arc;

/// Always recommends the configured size, clipped to the current ceiling
#[derive(Debug, Clone)]
pub struct FixedSizeBundler {
    base: BundlerBase,
    profile: FixedSizeProfile,
}

impl FixedSizeBundler {
    /// Create a bundler from its profile
    pub fn new(profile: FixedSizeProfile, context: Option<Arc<dyn GridContext>>) -> Self {
        Self {
            base: BundlerBase::new(context),
            profile,
        }
    }

    /// Size 1 bundler used when nothing else is configured
    pub fn fallback(context: Option<Arc<dyn GridContext>>) -> Self {
        Self::new(FixedSizeProfile::default(), context)
    }
}

impl Bundler for FixedSizeBundler {
    fn algorithm(&self) -> &'static str {
        "manual"
    }

    fn bundle_size(&self) -> usize {
        clamp_size(self.profile.size, self.max_size())
    }

    fn feedback(&mut self, _sample_count: usize, _total_time: f64) {}

    fn copy(&self) -> Box<dyn Bundler> {
        Box::new(Self {
            base: self.base.renumbered(),
            profile: self.profile.clone(),
        })
    }

    fn max_size(&self) -> usize {
        self.base.max_size()
    }

    fn profile(&self) -> LoadBalancingProfile {
        LoadBalancingProfile::Manual(self.profile.clone())
    }

    fn bundler_number(&self) -> u64 {
        self.base.number
    }
}
