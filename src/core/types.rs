//! Core identifier and descriptor types shared by every subsystem

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifies one node connection on the driver.
///
/// Every accepted channel gets a fresh id; bundlers and statistics are keyed by
/// it and die with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub Uuid);

impl ChannelId {
    /// Generate a random channel id
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing uuid
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capabilities a node reports when it connects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Number of processing threads on the node
    pub processing_threads: usize,
    /// Node uuid, stable across reconnections
    pub uuid: Option<Uuid>,
}

impl NodeInfo {
    /// Node info with the given thread count and no uuid
    pub fn with_threads(processing_threads: usize) -> Self {
        Self {
            processing_threads,
            uuid: None,
        }
    }

    /// Key under which the node's bundler state is persisted: its uuid, or
    /// the channel when the node did not report one
    pub fn persistence_key(&self, channel: ChannelId) -> String {
        match self.uuid {
            Some(uuid) => uuid.to_string(),
            None => channel.to_string(),
        }
    }
}

impl Default for NodeInfo {
    fn default() -> Self {
        Self::with_threads(1)
    }
}
