//! System utilities and monitoring
//!
//! Prometheus metrics and the grid event bus.

pub mod events;
pub mod metrics;

pub use events::{EventBus, GridEvent};
pub use metrics::Metrics;
