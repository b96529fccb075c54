//! Bundler sized after the node's processing threads

use crate::balancer::bundler::{Bundler, BundlerBase};
use crate::balancer::context::GridContext;
use crate::balancer::profile::{LoadBalancingProfile, NodeThreadsProfile};
use crate::core::types::NodeInfo;
use crate::core::utils::clamp_size;
use std::sync::Arc;
use tracing::debug;

/// Recommends `multiplicator × threads`, clipped to `[1, max_size()]`.
///
/// Purely reactive to node capabilities; feedback is ignored.
#[derive(Debug, Clone)]
pub struct NodeThreadsBundler {
    base: BundlerBase,
    profile: NodeThreadsProfile,
    threads: usize,
}

impl NodeThreadsBundler {
    /// Create a bundler assuming a single-threaded node until told otherwise
    pub fn new(profile: NodeThreadsProfile, context: Option<Arc<dyn GridContext>>) -> Self {
        Self {
            base: BundlerBase::new(context),
            profile,
            threads: 1,
        }
    }

    /// Processing threads currently assumed for the node
    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl Bundler for NodeThreadsBundler {
    fn algorithm(&self) -> &'static str {
        "nodethreads"
    }

    fn bundle_size(&self) -> usize {
        clamp_size(
            self.profile.multiplicator.saturating_mul(self.threads),
            self.max_size(),
        )
    }

    fn feedback(&mut self, _sample_count: usize, _total_time: f64) {}

    fn copy(&self) -> Box<dyn Bundler> {
        Box::new(Self {
            base: self.base.renumbered(),
            profile: self.profile.clone(),
            threads: self.threads,
        })
    }

    fn max_size(&self) -> usize {
        self.base.max_size()
    }

    fn profile(&self) -> LoadBalancingProfile {
        LoadBalancingProfile::NodeThreads(self.profile.clone())
    }

    fn bundler_number(&self) -> u64 {
        self.base.number
    }

    fn on_node_info(&mut self, info: &NodeInfo) {
        self.threads = info.processing_threads.max(1);
        debug!(
            "Bundler#{}: node has {} threads, size={}",
            self.base.number,
            self.threads,
            self.bundle_size()
        );
    }
}
