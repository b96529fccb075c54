//! Request/response correlation over one provider connection
//!
//! Every request sent to the provider stays in the request map until its
//! response arrives or the connection fails. On failure the context closes
//! once, and every pending request is resolved with a provider error; no
//! request is left waiting on a dead peer.

use crate::channel::cache::ResourceCache;
use crate::channel::message::ClassMessage;
use crate::channel::resource::{RequestId, RequestOutcome, ResourceKey, ResourceRequest};
use crate::core::config::ChannelConfig;
use crate::core::error::{ChannelError, Result};
use crate::core::types::ChannelId;
use crate::system::events::{EventBus, GridEvent};
use crate::system::metrics;
use bytes::Bytes;
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// How [`AsyncChannelContext::add_request`] handled a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Resolved from the cache, nothing sent
    Cached,
    /// Registered and queued for the provider
    Sent,
    /// Registered behind a request for the same resource already sent
    Joined,
    /// Resolved with a provider error because the context is closed
    Rejected,
}

/// Requests waiting on one resource, answered by a single response
#[derive(Debug)]
struct Waiting {
    /// Id carried by the frame sent for this resource
    sent: RequestId,
    requests: Vec<Arc<ResourceRequest>>,
}

impl Waiting {
    fn matches(&self, id: RequestId) -> bool {
        self.sent == id || self.requests.iter().any(|r| r.id() == id)
    }
}

/// Class-loading context of one provider connection
pub struct AsyncChannelContext {
    channel: ChannelId,
    provider_uuid: String,
    cache: Arc<dyn ResourceCache>,
    request_map: Mutex<HashMap<ResourceKey, Waiting>>,
    closed: AtomicBool,
    send_queue: SegQueue<Bytes>,
    output_ready: Notify,
    max_message_size: usize,
    pending_warning_threshold: usize,
    events: Option<EventBus>,
}

impl AsyncChannelContext {
    /// Context for a new connection to `provider_uuid`
    pub fn new(
        provider_uuid: impl Into<String>,
        cache: Arc<dyn ResourceCache>,
        config: &ChannelConfig,
    ) -> Self {
        Self {
            channel: ChannelId::random(),
            provider_uuid: provider_uuid.into(),
            cache,
            request_map: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            send_queue: SegQueue::new(),
            output_ready: Notify::new(),
            max_message_size: config.max_message_size,
            pending_warning_threshold: config.pending_warning_threshold,
            events: None,
        }
    }

    /// Publish provider failures on `events`
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Connection id
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Uuid of the provider at the other end
    pub fn provider_uuid(&self) -> &str {
        &self.provider_uuid
    }

    /// Maximum frame payload size on this connection
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Whether the context was closed after a failure
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Submit a request.
    ///
    /// A cached definition resolves it immediately. Otherwise it is registered
    /// under its resource key. Only the first request on a key queues a frame
    /// for the writer; later ones join it and share its response.
    /// An encoding failure resolves the request with a provider error and is
    /// returned to the caller.
    pub fn add_request(&self, request: Arc<ResourceRequest>) -> Result<Dispatch> {
        if let Some(definition) = self.cache.get(request.key()) {
            debug!("{} served from cache for {}", request.key(), request.id());
            request.resolve(RequestOutcome::Resolved(definition));
            metrics::record(|m| m.channel.cache_hits.inc());
            return Ok(Dispatch::Cached);
        }

        let frame = ClassMessage::Request {
            key: request.key().clone(),
            id: request.id(),
        }
        .encode_frame(self.max_message_size);
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                request.resolve(RequestOutcome::ProviderError);
                metrics::record(|m| m.channel.requests_failed.inc());
                return Err(e);
            }
        };

        let (dispatch, pending) = {
            let mut map = self.request_map.lock();
            // checked under the lock so a concurrent close cannot miss this request
            if self.is_closed() {
                drop(map);
                request.resolve(RequestOutcome::ProviderError);
                metrics::record(|m| m.channel.requests_failed.inc());
                return Ok(Dispatch::Rejected);
            }
            let dispatch = match map.get_mut(request.key()) {
                Some(waiting) => {
                    waiting.requests.push(request.clone());
                    Dispatch::Joined
                }
                None => {
                    map.insert(
                        request.key().clone(),
                        Waiting {
                            sent: request.id(),
                            requests: vec![request.clone()],
                        },
                    );
                    self.send_queue.push(frame);
                    Dispatch::Sent
                }
            };
            (dispatch, map.values().map(|w| w.requests.len()).sum::<usize>())
        };

        if pending > self.pending_warning_threshold {
            warn!(
                "{} pending requests on provider connection {}",
                pending, self.channel
            );
        }
        metrics::record(|m| m.channel.requests_added.inc());
        if dispatch == Dispatch::Sent {
            debug!("Request {} for {} queued", request.id(), request.key());
            self.output_ready.notify_one();
        } else {
            debug!("Request {} joined pending {}", request.id(), request.key());
        }
        Ok(dispatch)
    }

    /// Remove the request with the given id waiting on `key`
    pub fn remove_request(&self, key: &ResourceKey, id: RequestId) -> Option<Arc<ResourceRequest>> {
        let mut map = self.request_map.lock();
        let waiting = map.get_mut(key)?;
        let position = waiting.requests.iter().position(|r| r.id() == id)?;
        let request = waiting.requests.remove(position);
        if waiting.requests.is_empty() {
            map.remove(key);
        }
        Some(request)
    }

    /// Every request currently waiting on `key`
    pub fn get_requests(&self, key: &ResourceKey) -> Vec<Arc<ResourceRequest>> {
        self.request_map
            .lock()
            .get(key)
            .map(|waiting| waiting.requests.clone())
            .unwrap_or_default()
    }

    /// Total number of pending requests
    pub fn pending_count(&self) -> usize {
        self.request_map.lock().values().map(|w| w.requests.len()).sum()
    }

    /// Handle a provider response.
    ///
    /// `id` must be the id of the frame sent for `key` or of a request still
    /// waiting on it, otherwise the response is unexpected. A found definition
    /// is cached and fanned out to every request waiting on the same resource.
    /// Returns the number of requests resolved.
    pub fn deliver_response(
        &self,
        key: &ResourceKey,
        id: RequestId,
        definition: Option<Bytes>,
    ) -> std::result::Result<usize, ChannelError> {
        let waiting = {
            let mut map = self.request_map.lock();
            let matched = map.get(key).is_some_and(|waiting| waiting.matches(id));
            if !matched {
                return Err(ChannelError::UnexpectedResponse {
                    name: key.name.clone(),
                    id: id.to_string(),
                });
            }
            map.remove(key).map(|w| w.requests).unwrap_or_default()
        };

        let outcome = match definition {
            Some(definition) => {
                self.cache.put(key.clone(), definition.clone());
                RequestOutcome::Resolved(definition)
            }
            None => RequestOutcome::NotFound,
        };
        let resolved = waiting
            .iter()
            .filter(|request| request.resolve(outcome.clone()))
            .count();

        debug!("Response {} for {} resolved {} requests", id, key, resolved);
        metrics::record(|m| m.channel.requests_resolved.inc_by(resolved as u64));
        Ok(resolved)
    }

    /// Transport failure: close the context and fail every pending request
    pub fn handle_exception(&self, error: &dyn fmt::Display) -> usize {
        warn!(
            "Provider connection {} ({}) failed: {}",
            self.channel, self.provider_uuid, error
        );
        self.handle_provider_error()
    }

    /// Close the context once and resolve every pending request with a
    /// provider error. Later calls do nothing and return 0.
    pub fn handle_provider_error(&self) -> usize {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }

        let drained: Vec<Arc<ResourceRequest>> = {
            let mut map = self.request_map.lock();
            map.drain().flat_map(|(_, waiting)| waiting.requests).collect()
        };
        while self.send_queue.pop().is_some() {}

        let failed = drained
            .iter()
            .filter(|request| request.resolve(RequestOutcome::ProviderError))
            .count();
        // wake the writer so it sees the close
        self.output_ready.notify_one();

        if failed > 0 {
            warn!(
                "Provider {}: {} pending requests failed with the connection",
                self.provider_uuid, failed
            );
        }
        metrics::record(|m| m.channel.requests_failed.inc_by(failed as u64));
        if let Some(events) = &self.events {
            events.publish(GridEvent::ProviderFailed {
                provider: self.provider_uuid.clone(),
                failed_requests: failed,
            });
        }
        failed
    }

    /// Next queued outgoing frame
    pub fn next_outgoing(&self) -> Option<Bytes> {
        self.send_queue.pop()
    }

    /// Whether frames are waiting to be written
    pub fn has_pending_output(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// Wait until output is queued or the context closes
    pub async fn output_ready(&self) {
        self.output_ready.notified().await;
    }
}

impl fmt::Debug for AsyncChannelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncChannelContext")
            .field("channel", &self.channel)
            .field("provider_uuid", &self.provider_uuid)
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::cache::MemoryResourceCache;
    use crate::channel::resource::{PendingResource, RequestFactory, RequestState};

    fn context() -> (AsyncChannelContext, Arc<MemoryResourceCache>) {
        let cache = Arc::new(MemoryResourceCache::new());
        let ctx = AsyncChannelContext::new("provider", cache.clone(), &ChannelConfig::default());
        (ctx, cache)
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("provider", name)
    }

    #[test]
    fn test_add_then_remove_returns_same_request() {
        let (ctx, _) = context();
        let factory = RequestFactory::random();
        let (request, _pending) = factory.request(key("A.class"));

        assert_eq!(ctx.add_request(request.clone()).unwrap(), Dispatch::Sent);
        assert!(ctx.has_pending_output());

        let other = factory.next_id();
        assert!(ctx.remove_request(&key("A.class"), other).is_none());

        let removed = ctx.remove_request(&key("A.class"), request.id()).unwrap();
        assert!(Arc::ptr_eq(&removed, &request));
        assert_eq!(ctx.pending_count(), 0);
    }

    #[test]
    fn test_multiple_requests_for_same_resource() {
        let (ctx, _) = context();
        let node_a = RequestFactory::random();
        let node_b = RequestFactory::random();
        let (a, _pa) = node_a.request(key("Shared.class"));
        let (b, _pb) = node_b.request(key("Shared.class"));
        assert_eq!(ctx.add_request(a.clone()).unwrap(), Dispatch::Sent);
        assert_eq!(ctx.add_request(b.clone()).unwrap(), Dispatch::Joined);

        assert_eq!(ctx.get_requests(&key("Shared.class")).len(), 2);
        ctx.remove_request(&key("Shared.class"), a.id()).unwrap();
        let remaining = ctx.get_requests(&key("Shared.class"));
        assert_eq!(remaining.len(), 1);
        assert!(Arc::ptr_eq(&remaining[0], &b));
    }

    #[test]
    fn test_response_fans_out_and_caches() {
        let (ctx, cache) = context();
        let factory = RequestFactory::random();
        let (a, mut pa) = factory.request(key("Shared.class"));
        let (b, mut pb) = factory.request(key("Shared.class"));
        ctx.add_request(a.clone()).unwrap();
        ctx.add_request(b).unwrap();

        let definition = Bytes::from_static(b"\xca\xfe\xba\xbe");
        let resolved = ctx
            .deliver_response(&key("Shared.class"), a.id(), Some(definition.clone()))
            .unwrap();
        assert_eq!(resolved, 2);
        assert_eq!(pa.try_outcome(), Some(RequestOutcome::Resolved(definition.clone())));
        assert_eq!(pb.try_outcome(), Some(RequestOutcome::Resolved(definition.clone())));
        assert_eq!(cache.get(&key("Shared.class")), Some(definition.clone()));

        // later requests for the same resource never reach the network
        let (c, mut pc) = factory.request(key("Shared.class"));
        assert_eq!(ctx.add_request(c).unwrap(), Dispatch::Cached);
        assert_eq!(pc.try_outcome(), Some(RequestOutcome::Resolved(definition)));
    }

    #[test]
    fn test_one_frame_per_pending_resource() {
        let (ctx, _) = context();
        let node_a = RequestFactory::random();
        let node_b = RequestFactory::random();
        let (a, mut pa) = node_a.request(key("p/Shared.class"));
        let (b, mut pb) = node_b.request(key("p/Shared.class"));
        ctx.add_request(a.clone()).unwrap();
        ctx.add_request(b).unwrap();

        assert!(ctx.next_outgoing().is_some());
        assert!(ctx.next_outgoing().is_none());

        let definition = Bytes::from_static(b"shared");
        let resolved = ctx
            .deliver_response(&key("p/Shared.class"), a.id(), Some(definition.clone()))
            .unwrap();
        assert_eq!(resolved, 2);
        assert_eq!(pa.try_outcome(), Some(RequestOutcome::Resolved(definition.clone())));
        assert_eq!(pb.try_outcome(), Some(RequestOutcome::Resolved(definition)));
        assert_eq!(ctx.pending_count(), 0);
    }

    #[test]
    fn test_response_reaches_joined_requests_after_first_is_removed() {
        let (ctx, _) = context();
        let factory = RequestFactory::random();
        let (a, _pa) = factory.request(key("Late.class"));
        let (b, mut pb) = factory.request(key("Late.class"));
        ctx.add_request(a.clone()).unwrap();
        ctx.add_request(b).unwrap();
        ctx.remove_request(&key("Late.class"), a.id()).unwrap();

        // the provider still answers with the id of the frame it received
        let resolved = ctx.deliver_response(&key("Late.class"), a.id(), None).unwrap();
        assert_eq!(resolved, 1);
        assert_eq!(pb.try_outcome(), Some(RequestOutcome::NotFound));
    }

    #[test]
    fn test_unexpected_response() {
        let (ctx, _) = context();
        let factory = RequestFactory::random();
        let err = ctx
            .deliver_response(&key("Nope.class"), factory.next_id(), None)
            .unwrap_err();
        assert!(matches!(err, ChannelError::UnexpectedResponse { .. }));
    }

    #[test]
    fn test_missing_resource_resolves_not_found() {
        let (ctx, cache) = context();
        let factory = RequestFactory::random();
        let (request, mut pending) = factory.request(key("Missing.class"));
        ctx.add_request(request.clone()).unwrap();
        ctx.deliver_response(&key("Missing.class"), request.id(), None).unwrap();
        assert_eq!(pending.try_outcome(), Some(RequestOutcome::NotFound));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_exception_fails_every_pending_request_once() {
        let (ctx, _) = context();
        let factory = RequestFactory::random();
        let mut handles: Vec<(Arc<ResourceRequest>, PendingResource)> = (0..5)
            .map(|i| factory.request(key(&format!("C{}.class", i % 2))))
            .collect();
        for (request, _) in &handles {
            ctx.add_request(request.clone()).unwrap();
        }
        // one request answered before the failure
        let (answered, _) = &handles[0];
        ctx.remove_request(answered.key(), answered.id()).unwrap();
        answered.resolve(RequestOutcome::Resolved(Bytes::from_static(b"ok")));

        let failed = ctx.handle_exception(&"connection reset");
        assert_eq!(failed, 4);
        assert!(ctx.is_closed());
        assert_eq!(ctx.pending_count(), 0);
        assert!(!ctx.has_pending_output());

        for (request, pending) in handles.iter_mut().skip(1) {
            assert_eq!(request.state(), RequestState::ProviderError);
            assert_eq!(pending.try_outcome(), Some(RequestOutcome::ProviderError));
        }

        // second failure callback is a no-op
        assert_eq!(ctx.handle_provider_error(), 0);
    }

    #[test]
    fn test_closed_context_rejects_requests() {
        let (ctx, _) = context();
        ctx.handle_provider_error();
        let (request, mut pending) = RequestFactory::random().request(key("Late.class"));
        assert_eq!(ctx.add_request(request).unwrap(), Dispatch::Rejected);
        assert_eq!(pending.try_outcome(), Some(RequestOutcome::ProviderError));
    }

    #[test]
    fn test_concurrent_failure_callbacks_close_once() {
        let (ctx, _) = context();
        let ctx = Arc::new(ctx);
        let factory = RequestFactory::random();
        for i in 0..50 {
            let (request, _) = factory.request(key(&format!("R{}.class", i)));
            ctx.add_request(request).unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ctx = ctx.clone();
                std::thread::spawn(move || ctx.handle_provider_error())
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
    }

    #[test]
    fn test_failure_event_published() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let (ctx, _) = context();
        let ctx = ctx.with_events(events);
        let (request, _) = RequestFactory::random().request(key("E.class"));
        ctx.add_request(request).unwrap();
        ctx.handle_provider_error();

        assert_eq!(
            rx.try_recv().unwrap(),
            GridEvent::ProviderFailed {
                provider: "provider".to_string(),
                failed_requests: 1,
            }
        );
    }
}
