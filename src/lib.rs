//! Task Grid - driver core of a distributed task grid
//!
//! The driver sends bundles of tasks to worker nodes and serves the classes
//! those tasks need. This crate holds the parts of the driver that decide how
//! many tasks each node gets, relay class definitions between nodes and
//! client applications, and fire deferred job actions.
#![warn(missing_docs)]

// Configure global allocator
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

// Core foundational modules
pub mod core;

// Main functional modules
pub mod balancer;
pub mod channel;
pub mod schedule;
pub mod system;

// Re-export commonly used items for convenience
pub use balancer::{Bundler, LoadBalancer};
pub use channel::{AsyncChannelContext, ProviderRegistry};
pub use core::{ChannelId, Config, Error, NodeInfo, Result};
pub use schedule::{JobSchedule, ScheduleHandler};
pub use system::EventBus;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize tracing and the metrics registry.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init(logging: &core::config::LoggingConfig) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| Error::config(format!("Invalid log level '{}': {}", logging.level, e)))?;

    let installed = match logging.format.as_str() {
        "compact" => tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(filter)
            .try_init(),
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }

    tracing::info!("Initializing {} v{}", NAME, VERSION);

    // Initialize metrics registry
    system::metrics::init_registry();

    Ok(())
}
