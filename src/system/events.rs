//! Grid event notifications
//!
//! A small observer channel for management tooling. Publishing never blocks
//! and never fails the caller; events sent while nobody listens are dropped.

use crate::core::types::ChannelId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Default capacity of the event channel
const DEFAULT_CAPACITY: usize = 1024;

/// Notification emitted by the balancer and channel subsystems
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GridEvent {
    /// A bundler was attached to a newly connected node channel
    BundlerAttached {
        /// Node channel
        channel: ChannelId,
        /// Algorithm name of the bundler
        algorithm: String,
        /// Initial bundle size
        bundle_size: usize,
    },
    /// Feedback moved a channel's bundle size
    BundleSizeChanged {
        /// Node channel
        channel: ChannelId,
        /// Size before the feedback
        previous: usize,
        /// Size after the feedback
        current: usize,
    },
    /// A bundler was released with its channel
    BundlerDetached {
        /// Node channel
        channel: ChannelId,
    },
    /// A class provider connection failed and its pending requests were failed
    ProviderFailed {
        /// Provider uuid
        provider: String,
        /// Number of requests resolved with a failure state
        failed_requests: usize,
    },
}

/// Broadcast bus for [`GridEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GridEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<GridEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to current subscribers
    pub fn publish(&self, event: GridEvent) {
        if self.sender.send(event).is_err() {
            debug!("No subscribers for grid event");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
