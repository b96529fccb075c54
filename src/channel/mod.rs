//! Asynchronous class-loading channel
//!
//! Nodes fetch task classes from the driver, which forwards the requests to
//! the client that provides them. Each provider connection gets an
//! [`AsyncChannelContext`] correlating requests with responses.

pub mod resource;
pub mod cache;
pub mod message;
pub mod context;
pub mod io;
pub mod registry;

// Re-export commonly used items
pub use cache::{MemoryResourceCache, ResourceCache};
pub use context::{AsyncChannelContext, Dispatch};
pub use message::ClassMessage;
pub use registry::ProviderRegistry;
pub use resource::{
    PendingResource, RequestFactory, RequestId, RequestOutcome, RequestState, ResourceDescriptor,
    ResourceKey, ResourceRequest,
};
