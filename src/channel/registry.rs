//! Provider connections by uuid
//!
//! A provider may hold several connections to the driver. Requests go to the
//! least loaded open connection of the resource's provider.

use crate::channel::context::{AsyncChannelContext, Dispatch};
use crate::channel::resource::ResourceRequest;
use crate::core::error::{ChannelError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Open provider connections, keyed by provider uuid
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, Vec<Arc<AsyncChannelContext>>>,
}

impl ProviderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its provider uuid
    pub fn add_connection(&self, ctx: Arc<AsyncChannelContext>) {
        info!(
            "Provider {} connected on {}",
            ctx.provider_uuid(),
            ctx.channel()
        );
        self.providers
            .entry(ctx.provider_uuid().to_string())
            .or_default()
            .push(ctx);
    }

    /// Unregister a connection and fail its pending requests.
    ///
    /// Returns the number of failed requests, or `None` if the connection was
    /// not registered.
    pub fn remove_connection(&self, ctx: &Arc<AsyncChannelContext>) -> Option<usize> {
        let removed = {
            let mut connections = self.providers.get_mut(ctx.provider_uuid())?;
            let position = connections.iter().position(|c| Arc::ptr_eq(c, ctx))?;
            connections.remove(position)
        };
        self.providers
            .remove_if(ctx.provider_uuid(), |_, connections| connections.is_empty());
        info!(
            "Provider {} disconnected from {}",
            removed.provider_uuid(),
            removed.channel()
        );
        Some(removed.handle_provider_error())
    }

    /// Open connection of `provider_uuid` with the fewest pending requests
    pub fn find_connection(&self, provider_uuid: &str) -> Option<Arc<AsyncChannelContext>> {
        self.providers.get(provider_uuid).and_then(|connections| {
            connections
                .iter()
                .filter(|c| !c.is_closed())
                .min_by_key(|c| c.pending_count())
                .cloned()
        })
    }

    /// Route a request to its provider
    pub fn submit(&self, request: Arc<ResourceRequest>) -> Result<Dispatch> {
        let ctx = self
            .find_connection(&request.key().provider_uuid)
            .ok_or_else(|| ChannelError::NoProvider(request.key().provider_uuid.clone()))?;
        ctx.add_request(request)
    }

    /// Number of registered connections of a provider
    pub fn connection_count(&self, provider_uuid: &str) -> usize {
        self.providers
            .get(provider_uuid)
            .map(|connections| connections.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::cache::MemoryResourceCache;
    use crate::channel::resource::{RequestFactory, RequestOutcome, ResourceKey};
    use crate::core::config::ChannelConfig;
    use crate::core::error::Error;

    fn connection(provider: &str) -> Arc<AsyncChannelContext> {
        Arc::new(AsyncChannelContext::new(
            provider,
            Arc::new(MemoryResourceCache::new()),
            &ChannelConfig::default(),
        ))
    }

    #[test]
    fn test_least_loaded_connection_is_chosen() {
        let registry = ProviderRegistry::new();
        let busy = connection("p");
        let idle = connection("p");
        registry.add_connection(busy.clone());
        registry.add_connection(idle.clone());

        let factory = RequestFactory::random();
        for i in 0..3 {
            let (request, _) = factory.request(ResourceKey::new("p", format!("B{}.class", i)));
            busy.add_request(request).unwrap();
        }

        let chosen = registry.find_connection("p").unwrap();
        assert!(Arc::ptr_eq(&chosen, &idle));
    }

    #[test]
    fn test_unknown_provider() {
        let registry = ProviderRegistry::new();
        let (request, _) = RequestFactory::random().request(ResourceKey::new("ghost", "A.class"));
        assert!(matches!(
            registry.submit(request),
            Err(Error::Channel(ChannelError::NoProvider(ref p))) if p == "ghost"
        ));
    }

    #[test]
    fn test_removing_connection_fails_its_requests() {
        let registry = ProviderRegistry::new();
        let ctx = connection("p");
        registry.add_connection(ctx.clone());

        let (request, mut pending) = RequestFactory::random().request(ResourceKey::new("p", "A.class"));
        assert_eq!(registry.submit(request).unwrap(), Dispatch::Sent);

        assert_eq!(registry.remove_connection(&ctx), Some(1));
        assert_eq!(pending.try_outcome(), Some(RequestOutcome::ProviderError));
        assert_eq!(registry.connection_count("p"), 0);
        assert!(registry.find_connection("p").is_none());
        assert_eq!(registry.remove_connection(&ctx), None);
    }
}
