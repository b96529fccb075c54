//! Adaptive bundle sizing
//!
//! Decides, for each connected node, how many tasks to send at a time. Node
//! statistics flow in through [`LoadBalancer::feedback`]; each channel's
//! [`Bundler`] turns them into the next bundle size.

pub mod sample;
pub mod data_holder;
pub mod profile;
pub mod context;
pub mod bundler;
pub mod fixed;
pub mod node_threads;
pub mod proportional;
pub mod autotuned;
pub mod rl;
pub mod factory;
pub mod persistence;
pub mod coordinator;

// Re-export commonly used items
pub use bundler::{Bundler, BundlerSnapshot};
pub use context::{DriverContext, GridContext, PerformanceBoard, DEFAULT_MAX_BUNDLE_SIZE};
pub use coordinator::{BalancerSnapshot, ChannelSnapshot, LoadBalancer};
pub use data_holder::BundleDataHolder;
pub use factory::BundlerFactory;
pub use persistence::{
    AsyncLoadBalancerPersistence, BundlerState, FileLoadBalancerPersistence,
    LoadBalancerPersistence, MemoryLoadBalancerPersistence,
};
pub use profile::LoadBalancingProfile;
pub use sample::PerformanceSample;
