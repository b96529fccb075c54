//! Bundler factory for creating bundlers based on configuration

use crate::balancer::autotuned::AutoTunedBundler;
use crate::balancer::bundler::Bundler;
use crate::balancer::context::{GridContext, PerformanceBoard};
use crate::balancer::fixed::FixedSizeBundler;
use crate::balancer::node_threads::NodeThreadsBundler;
use crate::balancer::profile::LoadBalancingProfile;
use crate::balancer::proportional::ProportionalBundler;
use crate::balancer::rl::RlBundler;
use crate::core::config::{BalancingConfig, TypedProperties};
use crate::core::error::BalancerError;
use std::sync::Arc;
use tracing::info;

/// Creates bundlers wired to a shared context and performance board
#[derive(Debug, Clone)]
pub struct BundlerFactory {
    context: Arc<dyn GridContext>,
    board: Arc<PerformanceBoard>,
}

impl BundlerFactory {
    /// Factory handing `context` and `board` to every bundler it creates
    pub fn new(context: Arc<dyn GridContext>, board: Arc<PerformanceBoard>) -> Self {
        Self { context, board }
    }

    /// Names of the available algorithms
    pub fn algorithm_names() -> &'static [&'static str] {
        LoadBalancingProfile::ALGORITHMS
    }

    /// Shared performance board
    pub fn board(&self) -> &Arc<PerformanceBoard> {
        &self.board
    }

    /// Build and validate the profile of `algorithm`
    pub fn create_profile(
        &self,
        algorithm: &str,
        props: &TypedProperties,
    ) -> Result<LoadBalancingProfile, BalancerError> {
        LoadBalancingProfile::from_properties(algorithm, props)
    }

    /// Create a bundler from a validated profile
    pub fn create_bundler(&self, profile: LoadBalancingProfile) -> Box<dyn Bundler> {
        let context = Some(self.context.clone());
        match profile {
            LoadBalancingProfile::Manual(p) => Box::new(FixedSizeBundler::new(p, context)),
            LoadBalancingProfile::NodeThreads(p) => Box::new(NodeThreadsBundler::new(p, context)),
            LoadBalancingProfile::Proportional(p) => {
                Box::new(ProportionalBundler::new(p, self.board.clone(), context))
            }
            LoadBalancingProfile::AutoTuned(p) => Box::new(AutoTunedBundler::new(p, context)),
            LoadBalancingProfile::Rl(p) => Box::new(RlBundler::new(p, self.board.clone(), context)),
        }
    }

    /// Create the bundler described by a balancing configuration
    pub fn create_from_config(
        &self,
        config: &BalancingConfig,
    ) -> Result<Box<dyn Bundler>, BalancerError> {
        let profile = self.create_profile(&config.algorithm, &config.active_profile())?;
        info!(
            "Load balancing: algorithm '{}', profile '{}': {:?}",
            config.algorithm, config.profile, profile
        );
        Ok(self.create_bundler(profile))
    }

    /// Size 1 bundler, always available
    pub fn fallback_bundler(&self) -> Box<dyn Bundler> {
        Box::new(FixedSizeBundler::fallback(Some(self.context.clone())))
    }
}
