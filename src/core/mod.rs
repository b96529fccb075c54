//! Core system types and foundations
//!
//! This module contains the fundamental building blocks shared by the
//! balancer, channel and schedule subsystems: identifiers, error handling,
//! configuration and small helpers.

pub mod types;
pub mod error;
pub mod config;
pub mod utils;

// Re-export commonly used items
pub use types::{ChannelId, NodeInfo};
pub use error::{Error, Result};
pub use config::Config;
