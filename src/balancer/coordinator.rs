//! Load-balancing coordinator
//!
//! Owns one bundler per connected node channel, copied from a configured
//! prototype, and routes node statistics to it. All shared state (context,
//! performance board, channel map) lives here rather than in globals, so
//! independent coordinators can coexist.
//!
//! With a [`LoadBalancerPersistence`], a bundler's learned state is stored
//! when its node disconnects and restored when the node connects again.

use crate::balancer::bundler::{Bundler, BundlerSnapshot};
use crate::balancer::context::{DriverContext, GridContext, PerformanceBoard};
use crate::balancer::factory::BundlerFactory;
use crate::balancer::persistence::{
    algorithm_id, FileLoadBalancerPersistence, LoadBalancerPersistence,
};
use crate::core::config::BalancingConfig;
use crate::core::error::BalancerError;
use crate::core::types::{ChannelId, NodeInfo};
use crate::system::events::{EventBus, GridEvent};
use crate::system::metrics::{self, Timer};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

type BalancerResult<T> = std::result::Result<T, BalancerError>;

#[derive(Debug)]
struct AttachedBundler {
    bundler: Box<dyn Bundler>,
    node_info: NodeInfo,
}

/// Statistics of one node channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    /// Node channel
    pub channel: ChannelId,
    /// Processing threads reported by the node
    pub processing_threads: usize,
    /// Bundler statistics
    pub bundler: BundlerSnapshot,
}

/// Statistics of every attached channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancerSnapshot {
    /// Algorithm of the prototype bundler
    pub algorithm: String,
    /// Current system-wide ceiling
    pub max_bundle_size: usize,
    /// Per-channel statistics, ordered by channel id
    pub channels: Vec<ChannelSnapshot>,
}

/// Per-node bundle sizing for the driver
#[derive(Debug)]
pub struct LoadBalancer {
    context: Arc<DriverContext>,
    factory: BundlerFactory,
    prototype: RwLock<Box<dyn Bundler>>,
    bundlers: DashMap<ChannelId, AttachedBundler>,
    events: EventBus,
    persistence: Option<Arc<dyn LoadBalancerPersistence>>,
}

impl LoadBalancer {
    /// Create a coordinator for the configured algorithm and profile.
    ///
    /// States are persisted under `persistence_dir` when it is set.
    pub fn new(config: &BalancingConfig, events: EventBus) -> BalancerResult<Self> {
        let context = Arc::new(DriverContext::new(config.max_bundle_size));
        let factory = BundlerFactory::new(
            context.clone() as Arc<dyn GridContext>,
            Arc::new(PerformanceBoard::new()),
        );
        let prototype = factory.create_from_config(config)?;
        Ok(Self {
            context,
            factory,
            prototype: RwLock::new(prototype),
            bundlers: DashMap::new(),
            events,
            persistence: config.persistence_dir.as_ref().map(|dir| {
                Arc::new(FileLoadBalancerPersistence::new(dir)) as Arc<dyn LoadBalancerPersistence>
            }),
        })
    }

    /// Store and restore bundler states with `persistence`
    pub fn with_persistence(mut self, persistence: Arc<dyn LoadBalancerPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Persistence in use, if any
    pub fn persistence(&self) -> Option<&Arc<dyn LoadBalancerPersistence>> {
        self.persistence.as_ref()
    }

    /// Event bus the coordinator publishes on
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Attach a bundler to a newly connected node and return its first bundle size
    pub fn node_connected(&self, channel: ChannelId, info: NodeInfo) -> BalancerResult<usize> {
        let mut bundler = self.prototype.read().copy();
        bundler.setup();
        self.restore_state(&info.persistence_key(channel), bundler.as_mut());
        bundler.on_node_info(&info);
        let size = bundler.bundle_size();
        let number = bundler.bundler_number();
        let algorithm = bundler.algorithm().to_string();
        let threads = info.processing_threads;

        match self.bundlers.entry(channel) {
            Entry::Occupied(_) => {
                bundler.dispose();
                return Err(BalancerError::ChannelAlreadyAttached(channel));
            }
            Entry::Vacant(slot) => {
                slot.insert(AttachedBundler {
                    bundler,
                    node_info: info,
                });
            }
        }

        info!(
            "Node channel {} connected ({} threads), bundler#{} size={}",
            channel, threads, number, size
        );
        metrics::record(|m| m.balancer.bundlers_active.inc());
        self.events.publish(GridEvent::BundlerAttached {
            channel,
            algorithm,
            bundle_size: size,
        });
        Ok(size)
    }

    /// Release the bundler of a disconnected node
    pub fn node_disconnected(&self, channel: ChannelId) -> BalancerResult<()> {
        let (_, mut attached) = self
            .bundlers
            .remove(&channel)
            .ok_or(BalancerError::UnknownChannel(channel))?;
        self.store_state(&attached.node_info.persistence_key(channel), attached.bundler.as_ref());
        attached.bundler.dispose();

        info!("Node channel {} disconnected", channel);
        metrics::record(|m| m.balancer.bundlers_active.dec());
        self.events.publish(GridEvent::BundlerDetached { channel });
        Ok(())
    }

    /// Forward updated node capabilities and return the resulting bundle size
    pub fn node_info_changed(&self, channel: ChannelId, info: NodeInfo) -> BalancerResult<usize> {
        let mut attached = self
            .bundlers
            .get_mut(&channel)
            .ok_or(BalancerError::UnknownChannel(channel))?;
        attached.bundler.on_node_info(&info);
        attached.node_info = info;
        Ok(attached.bundler.bundle_size())
    }

    /// Apply the statistics of a completed dispatch and return the next bundle size
    pub fn feedback(
        &self,
        channel: ChannelId,
        task_count: usize,
        total_time_nanos: u64,
    ) -> BalancerResult<usize> {
        let timer = metrics::Metrics::global()
            .map(|m| Timer::start(m.balancer.feedback_duration.clone()));

        let (previous, current) = {
            let mut attached = self
                .bundlers
                .get_mut(&channel)
                .ok_or(BalancerError::UnknownChannel(channel))?;
            let previous = attached.bundler.bundle_size();
            attached.bundler.feedback(task_count, total_time_nanos as f64);
            (previous, attached.bundler.bundle_size())
        };

        debug!(
            "Feedback on {}: {} tasks in {}ns, size {} -> {}",
            channel, task_count, total_time_nanos, previous, current
        );
        metrics::record(|m| {
            m.balancer.feedback_events.inc();
            m.balancer.feedback_tasks.inc_by(task_count as u64);
            if previous != current {
                m.balancer.size_changes.inc();
            }
        });
        if previous != current {
            self.events.publish(GridEvent::BundleSizeChanged {
                channel,
                previous,
                current,
            });
        }
        if let Some(timer) = timer {
            timer.finish();
        }
        Ok(current)
    }

    /// Current bundle size for a channel
    pub fn bundle_size(&self, channel: ChannelId) -> BalancerResult<usize> {
        self.bundlers
            .get(&channel)
            .map(|attached| attached.bundler.bundle_size())
            .ok_or(BalancerError::UnknownChannel(channel))
    }

    /// Switch to another algorithm or profile.
    ///
    /// The new profile is validated first; on success every attached channel
    /// gets a fresh copy of the new prototype.
    pub fn reconfigure(&self, config: &BalancingConfig) -> BalancerResult<()> {
        let prototype = self.factory.create_from_config(config)?;
        self.context.set_max_bundle_size(config.max_bundle_size);

        let mut current = self.prototype.write();
        for mut entry in self.bundlers.iter_mut() {
            let key = entry.node_info.persistence_key(*entry.key());
            self.store_state(&key, entry.bundler.as_ref());
            entry.bundler.dispose();
            let mut bundler = prototype.copy();
            bundler.setup();
            self.restore_state(&key, bundler.as_mut());
            bundler.on_node_info(&entry.node_info);
            entry.bundler = bundler;
        }
        *current = prototype;

        info!(
            "Load balancing reconfigured to '{}' for {} channels",
            config.algorithm,
            self.bundlers.len()
        );
        Ok(())
    }

    /// Serializable statistics of every attached channel
    pub fn snapshot(&self) -> BalancerSnapshot {
        let mut channels: Vec<ChannelSnapshot> = self
            .bundlers
            .iter()
            .map(|entry| ChannelSnapshot {
                channel: *entry.key(),
                processing_threads: entry.node_info.processing_threads,
                bundler: entry.bundler.snapshot(),
            })
            .collect();
        channels.sort_by_key(|c| c.channel);

        BalancerSnapshot {
            algorithm: self.prototype.read().algorithm().to_string(),
            max_bundle_size: self.context.max_bundle_size(),
            channels,
        }
    }

    /// Publish a new system-wide ceiling
    pub fn set_max_bundle_size(&self, size: usize) {
        self.context.set_max_bundle_size(size);
    }

    /// Current system-wide ceiling
    pub fn max_bundle_size(&self) -> usize {
        self.context.max_bundle_size()
    }

    /// Number of attached channels
    pub fn channel_count(&self) -> usize {
        self.bundlers.len()
    }

    /// Resume `bundler` from the state stored for `node`. Persistence
    /// failures are logged, the bundler then starts fresh.
    fn restore_state(&self, node: &str, bundler: &mut dyn Bundler) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let algorithm = algorithm_id(&bundler.profile());
        match persistence.load(node, &algorithm) {
            Ok(Some(state)) => {
                if bundler.restore(state) {
                    debug!("Bundler#{} resumed state of node {}", bundler.bundler_number(), node);
                    metrics::record(|m| m.balancer.states_restored.inc());
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Could not load bundler state of node {}: {}", node, e),
        }
    }

    /// Store what `bundler` learned about `node`
    fn store_state(&self, node: &str, bundler: &dyn Bundler) {
        let (Some(persistence), Some(state)) = (&self.persistence, bundler.state()) else {
            return;
        };
        let algorithm = algorithm_id(&bundler.profile());
        match persistence.store(node, &algorithm, &state) {
            Ok(()) => metrics::record(|m| m.balancer.states_stored.inc()),
            Err(e) => warn!("Could not store bundler state of node {}: {}", node, e),
        }
    }
}

impl Drop for LoadBalancer {
    fn drop(&mut self) {
        for mut entry in self.bundlers.iter_mut() {
            entry.bundler.dispose();
        }
    }
}
